//! Dead-drop relay used by one-way sessions.
//!
//! The offerer embeds a random address in its (sealed) offer; the responder
//! uploads its answer token to that address and the offerer polls for it.
//! The relay itself is an anonymous key/value store reached over plain HTTP.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "https://10kb.site";
pub const ADDRESS_LEN: usize = 100;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay request failed: {0}")]
    Transport(String),
    #[error("relay returned http status {0}")]
    HttpStatus(StatusCode),
    #[error("no answer appeared at relay address within {waited:?}")]
    Timeout { waited: Duration },
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

/// A fresh unguessable slug for one offer.
pub fn generate_address() -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(ADDRESS_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
pub trait RelayBackend: Send + Sync {
    async fn put(&self, address: &str, body: &str) -> Result<(), RelayError>;

    /// `Ok(None)` while nothing has been stored at `address`.
    async fn get(&self, address: &str) -> Result<Option<String>, RelayError>;
}

pub struct HttpRelay {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let mut base = base_url.trim().to_string();
        if base.is_empty() {
            return Err(RelayError::InvalidUrl("relay url cannot be empty".into()));
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|err| RelayError::InvalidUrl(err.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, address: &str) -> Result<Url, RelayError> {
        self.base_url
            .join(address)
            .map_err(|err| RelayError::InvalidUrl(format!("address {address}: {err}")))
    }
}

#[async_trait]
impl RelayBackend for HttpRelay {
    async fn put(&self, address: &str, body: &str) -> Result<(), RelayError> {
        let endpoint = self.endpoint(address)?;
        let response = self
            .client
            .put(endpoint)
            .body(body.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn get(&self, address: &str) -> Result<Option<String>, RelayError> {
        let endpoint = self.endpoint(address)?;
        let response = self.client.get(endpoint).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status()));
        }
        let body = response.text().await?;
        let body = body.trim();
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(body.to_string()))
        }
    }
}

/// In-process relay; one value per address, last write wins.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    slots: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayBackend for MemoryRelay {
    async fn put(&self, address: &str, body: &str) -> Result<(), RelayError> {
        self.slots
            .lock()
            .insert(address.to_string(), body.to_string());
        Ok(())
    }

    async fn get(&self, address: &str) -> Result<Option<String>, RelayError> {
        Ok(self.slots.lock().get(address).cloned())
    }
}

#[derive(Clone)]
pub struct RelayTransport {
    backend: Arc<dyn RelayBackend>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RelayTransport {
    pub fn new(backend: Arc<dyn RelayBackend>) -> Self {
        Self {
            backend,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn http(base_url: &str) -> Result<Self, RelayError> {
        Ok(Self::new(Arc::new(HttpRelay::new(base_url)?)))
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub async fn upload(&self, address: &str, token: &str) -> Result<(), RelayError> {
        debug!(target = "webtty::relay", address_len = address.len(), "uploading token");
        self.backend.put(address, token).await
    }

    /// Polls `address` with exponential backoff until a value appears or
    /// `deadline` elapses. Backend errors while polling are retried. A
    /// deadline too large to represent never expires.
    pub async fn poll(&self, address: &str, deadline: Duration) -> Result<String, RelayError> {
        let started = Instant::now();
        let expires = started.checked_add(deadline);
        let mut delay = self.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.backend.get(address).await {
                Ok(Some(body)) => {
                    debug!(
                        target = "webtty::relay",
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "relay returned token"
                    );
                    return Ok(body);
                }
                Ok(None) => {
                    trace!(target = "webtty::relay", attempt, "relay slot still empty");
                }
                Err(err) => {
                    warn!(target = "webtty::relay", attempt, error = %err, "relay poll failed; retrying");
                }
            }

            let pause = match expires {
                Some(expires) => {
                    let now = Instant::now();
                    if now >= expires {
                        return Err(RelayError::Timeout {
                            waited: started.elapsed(),
                        });
                    }
                    delay.min(expires - now)
                }
                None => delay,
            };
            sleep(pause).await;
            delay = (delay * 2).min(self.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(backend: Arc<dyn RelayBackend>) -> RelayTransport {
        RelayTransport::new(backend)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    #[test]
    fn addresses_are_long_random_slugs() {
        let a = generate_address();
        let b = generate_address();
        assert_eq!(a.len(), ADDRESS_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn poll_returns_token_uploaded_before_deadline() {
        let relay = fast(Arc::new(MemoryRelay::new()));
        let address = generate_address();

        let uploader = relay.clone();
        let upload_address = address.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            uploader.upload(&upload_address, "answer-token").await.unwrap();
        });

        let token = relay.poll(&address, Duration::from_secs(5)).await.unwrap();
        assert_eq!(token, "answer-token");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn poll_times_out_when_nothing_is_uploaded() {
        let relay = fast(Arc::new(MemoryRelay::new()));
        let err = relay
            .poll(&generate_address(), Duration::from_millis(80))
            .await
            .unwrap_err();
        match err {
            RelayError::Timeout { waited } => assert!(waited >= Duration::from_millis(80)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn poll_accepts_unbounded_deadline() {
        let relay = fast(Arc::new(MemoryRelay::new()));
        let address = generate_address();

        let uploader = relay.clone();
        let upload_address = address.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(40)).await;
            uploader.upload(&upload_address, "late").await.unwrap();
        });

        let token = relay.poll(&address, Duration::MAX).await.unwrap();
        assert_eq!(token, "late");
        let token = relay
            .poll(&address, Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(token, "late");
    }

    struct FlakyRelay {
        failures_left: Mutex<u32>,
        inner: MemoryRelay,
    }

    #[async_trait]
    impl RelayBackend for FlakyRelay {
        async fn put(&self, address: &str, body: &str) -> Result<(), RelayError> {
            self.inner.put(address, body).await
        }

        async fn get(&self, address: &str) -> Result<Option<String>, RelayError> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(RelayError::Transport("connection reset".into()));
                }
            }
            self.inner.get(address).await
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn poll_retries_through_transient_errors() {
        let inner = MemoryRelay::new();
        inner.put("slot", "late-token").await.unwrap();
        let relay = fast(Arc::new(FlakyRelay {
            failures_left: Mutex::new(3),
            inner,
        }));
        assert_eq!(
            relay.poll("slot", Duration::from_secs(5)).await.unwrap(),
            "late-token"
        );
    }

    #[test]
    fn http_relay_rejects_empty_base() {
        assert!(matches!(
            HttpRelay::new("  ").err(),
            Some(RelayError::InvalidUrl(_))
        ));
    }
}
