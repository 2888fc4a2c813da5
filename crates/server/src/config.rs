use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    /// Shared secret required on websocket handshakes. None disables the
    /// check (trusted-frontend deployments).
    pub auth_token: Option<String>,
    /// Depth of each connection's outbound frame queue. Writes beyond this
    /// are failed writes, which evict the connection.
    pub channel_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8090".into(),
            auth_token: None,
            channel_queue_depth: 64,
        }
    }
}

/// Subset of `Settings` that may appear in `server.toml`. Every field is
/// optional; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    auth_token: Option<String>,
    channel_queue_depth: Option<usize>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = std::fs::read_to_string("server.toml") {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, &file_cfg),
            Err(err) => warn!(%err, "server.toml is malformed; using defaults"),
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.bind_addr = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Ok(v) = std::env::var("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Ok(v) = std::env::var("APP__CHANNEL_QUEUE_DEPTH") {
        if let Ok(parsed) = v.parse::<usize>() {
            if parsed > 0 {
                settings.channel_queue_depth = parsed;
            }
        }
    }

    settings
}

fn apply_overrides(settings: &mut Settings, file_cfg: &FileSettings) {
    if let Some(v) = &file_cfg.bind_addr {
        settings.bind_addr = v.clone();
    }
    if let Some(v) = &file_cfg.auth_token {
        settings.auth_token = Some(v.clone());
    }
    if let Some(depth) = file_cfg.channel_queue_depth {
        if depth > 0 {
            settings.channel_queue_depth = depth;
        }
    }
}
