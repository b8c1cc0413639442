use base64::Engine;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Fetches identity tokens from the pod-local workload API.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, audience: &str) -> anyhow::Result<String>;
}

/// Persists plain-text material (the identity token, broker credentials) at
/// one of the chain's well-known paths.
#[async_trait::async_trait]
pub trait TokenSink: Send + Sync {
    async fn store(&self, token: &str) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not a JWT")]
    Malformed,

    #[error("token payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("token does not carry a `sub` claim")]
    MissingSubject,
}

/// Exponential backoff with a ceiling, reset on success.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    failures: u32,
}

/// Continuously holds a valid identity token.
///
/// The rotator fetches a token, writes it to the token path, then sleeps
/// until the refresh interval elapses. Provider unavailability is retried
/// with backoff forever; the rotator surfaces readiness through a watch
/// channel instead of ever exiting.
pub struct TokenRotator<P, S> {
    source: P,
    sink: S,
    audience: String,
    refresh: Duration,
    backoff: Backoff,
    ready: watch::Sender<bool>,
}

// === impl Backoff ===

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        let exp = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let delay = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.ceiling);
        delay.min(self.ceiling)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

// === impl TokenRotator ===

impl<P: TokenSource, S: TokenSink> TokenRotator<P, S> {
    pub fn new(source: P, sink: S, audience: String, refresh: Duration) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            source,
            sink,
            audience,
            refresh,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
            ready,
        }
    }

    /// Subscribe to the rotator's readiness: `true` once a token has been
    /// fetched and stored, `false` while the provider is unavailable.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub async fn run(mut self) {
        loop {
            match self.rotate_once().await {
                Ok(()) => {
                    self.backoff.reset();
                    self.ready.send_replace(true);
                    tokio::time::sleep(self.refresh).await;
                }
                Err(error) => {
                    let delay = self.backoff.fail();
                    self.ready.send_replace(false);
                    warn!(%error, ?delay, "Failed to rotate identity token; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn rotate_once(&mut self) -> anyhow::Result<()> {
        let token = self.source.fetch(&self.audience).await?;
        self.sink.store(&token).await?;
        info!(audience = %self.audience, "Rotated identity token");
        Ok(())
    }
}

/// Extracts the subject claim from a JWT without verifying its signature;
/// verification is the identity provider's responsibility.
pub fn subject_of(token: &str) -> Result<String, TokenError> {
    let payload = token.split('.').nth(1).ok_or(TokenError::Malformed)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes)?;
    claims
        .get("sub")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
        .ok_or(TokenError::MissingSubject)
}
