//! Transport seam between the sync session and the remote endpoint.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Network collaborator used by [`SyncSession`](crate::session::SyncSession).
///
/// Implementations own timeouts and connection handling; anything that goes
/// wrong on the wire is reported as [`SyncError::Transport`](crate::SyncError).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate against `url`. `Ok(false)` means the remote rejected the
    /// credentials; `Err` means it could not be asked.
    async fn authenticate(&self, url: &str, username: &str, password: &str) -> Result<bool>;

    /// Send one encoded payload and return the raw response body.
    async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>>;

    /// End the remote session.
    async fn logout(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn authenticate(&self, url: &str, username: &str, password: &str) -> Result<bool> {
        (**self).authenticate(url, username, password).await
    }

    async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        (**self).send(payload).await
    }

    async fn logout(&self) -> Result<()> {
        (**self).logout().await
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};
    use tokio::sync::RwLock;
    use tracing::{debug, info, warn};

    use super::Transport;
    use crate::error::{Result, SyncError};
    use crate::protocol::LoginResponse;

    /// Form-encoded HTTP transport with a cookie-backed session.
    ///
    /// Every request is a POST to the endpoint carrying a `cmd` field:
    /// `login` (with `uname` and `pword`), `sync` (with the JSON payload in
    /// `data`) and `logout`.
    #[derive(Debug)]
    pub struct HttpTransport {
        client: Client,
        endpoint: RwLock<Option<String>>,
    }

    impl HttpTransport {
        pub fn new(timeout: Duration) -> Result<Self> {
            let client = Client::builder()
                .cookie_store(true)
                .timeout(timeout)
                .build()?;
            Ok(Self {
                client,
                endpoint: RwLock::new(None),
            })
        }

        async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<(StatusCode, Vec<u8>)> {
            let response = self.client.post(url).form(form).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok((status, body.to_vec()))
        }

        async fn endpoint(&self) -> Result<String> {
            self.endpoint
                .read()
                .await
                .clone()
                .ok_or_else(|| SyncError::Transport("No authenticated endpoint".to_string()))
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn authenticate(&self, url: &str, username: &str, password: &str) -> Result<bool> {
            debug!("Sending login request to {}", url);
            let (status, body) = self
                .post_form(url, &[("cmd", "login"), ("uname", username), ("pword", password)])
                .await?;

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!("Login to {} refused with {}", url, status);
                return Ok(false);
            }
            if !status.is_success() {
                return Err(SyncError::Transport(format!(
                    "Login request to {} failed with {}",
                    url, status
                )));
            }

            let (login,): LoginResponse = serde_json::from_slice(&body)
                .map_err(|e| SyncError::MalformedPayload(format!("Invalid login response: {}", e)))?;
            if let Some(error) = login.sync_error {
                warn!("Login to {} rejected: {}", url, error);
                return Ok(false);
            }

            *self.endpoint.write().await = Some(url.to_string());
            info!("Logged in to {}", url);
            Ok(true)
        }

        async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
            let url = self.endpoint().await?;
            let data = String::from_utf8(payload)
                .map_err(|e| SyncError::MalformedPayload(format!("Payload is not UTF-8: {}", e)))?;

            let (status, body) = self
                .post_form(&url, &[("cmd", "sync"), ("data", &data)])
                .await?;
            if !status.is_success() {
                return Err(SyncError::Transport(format!(
                    "Sync request to {} failed with {}",
                    url, status
                )));
            }
            Ok(body)
        }

        async fn logout(&self) -> Result<()> {
            let Some(url) = self.endpoint.write().await.take() else {
                return Ok(());
            };
            let (status, _) = self.post_form(&url, &[("cmd", "logout")]).await?;
            if !status.is_success() {
                return Err(SyncError::Transport(format!(
                    "Unable to logout from {}: {}",
                    url, status
                )));
            }
            info!("Logged out of {}", url);
            Ok(())
        }
    }

}
