use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use shared::{
    domain::Identity,
    protocol::{ContactRequest, ContactSummary, MessagePayload, NotificationPayload, UnreadCount},
};
use url::Url;

/// The persistence collaborator: sole source of truth the reconciliation
/// layer polls. Everything real-time delivery might have dropped is
/// re-derivable through these reads.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    async fn unread_count(&self) -> Result<u64>;
    async fn last_message(&self, contact: &Identity) -> Result<Option<MessagePayload>>;
    async fn notifications(&self) -> Result<Vec<NotificationPayload>>;
    async fn contact_list(&self) -> Result<Vec<ContactSummary>>;
    async fn pending_contact_requests(&self) -> Result<Vec<ContactRequest>>;
}

/// REST-backed store client. Paths follow the collaborator's message,
/// notification and contact endpoints.
pub struct HttpStore {
    http: Client,
    base_url: Url,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid store url: {base_url}"))?;
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path: {path}"))
    }
}

#[async_trait]
impl AuthoritativeStore for HttpStore {
    async fn unread_count(&self) -> Result<u64> {
        let url = self.endpoint("/api/messages/unread/count")?;
        let body: UnreadCount = self
            .http
            .get(url)
            .send()
            .await
            .context("unread count request failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.count)
    }

    async fn last_message(&self, contact: &Identity) -> Result<Option<MessagePayload>> {
        let url = self.endpoint("/api/messages/last")?;
        let response = self
            .http
            .get(url)
            .query(&[("contactId", contact.as_str())])
            .send()
            .await
            .context("last message request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let message: MessagePayload = response.error_for_status()?.json().await?;
        Ok(Some(message))
    }

    async fn notifications(&self) -> Result<Vec<NotificationPayload>> {
        let url = self.endpoint("/api/notifications")?;
        let feed = self
            .http
            .get(url)
            .send()
            .await
            .context("notifications request failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(feed)
    }

    async fn contact_list(&self) -> Result<Vec<ContactSummary>> {
        let url = self.endpoint("/api/contacts")?;
        let contacts = self
            .http
            .get(url)
            .send()
            .await
            .context("contacts request failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(contacts)
    }

    async fn pending_contact_requests(&self) -> Result<Vec<ContactRequest>> {
        let url = self.endpoint("/api/contacts/requests")?;
        let requests = self
            .http
            .get(url)
            .send()
            .await
            .context("contact requests request failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(requests)
    }
}
