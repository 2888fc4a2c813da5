use shared::domain::Identity;

/// Seam to the external identity/session collaborator. The subsystem
/// trusts whatever identity the provider yields for a handshake.
pub trait SessionProvider: Send + Sync {
    /// Resolve the identity for an upgrade request, or reject it.
    fn authenticate(&self, identity: &str, token: Option<&str>) -> Option<Identity>;
}

/// Accepts any non-empty identity, optionally gated on a shared secret
/// carried as the `token` query parameter. Stands in for a real session
/// collaborator in single-process deployments and tests.
pub struct SharedSecretSessions {
    secret: Option<String>,
}

impl SharedSecretSessions {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}

impl SessionProvider for SharedSecretSessions {
    fn authenticate(&self, identity: &str, token: Option<&str>) -> Option<Identity> {
        if identity.trim().is_empty() {
            return None;
        }
        if let Some(expected) = &self.secret {
            if token != Some(expected.as_str()) {
                return None;
            }
        }
        Some(Identity::new(identity))
    }
}
