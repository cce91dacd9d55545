//! Reloading the local dev server after a changelog is applied.

use std::time::Duration;

use tracing::debug;

use crate::config::PreviewSettings;
use crate::error::FlushError;

/// Something that can make the running dev server pick up new files.
///
/// Called from blocking context, once per applied changelog.
pub trait Flusher: Send + Sync {
    fn reload(&self) -> Result<(), FlushError>;
}

/// Flushes by POSTing to the dev server's flush endpoint.
#[derive(Debug, Clone)]
pub struct HttpFlusher {
    url: String,
    agent: ureq::Agent,
}

impl HttpFlusher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        HttpFlusher {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn from_settings(settings: &PreviewSettings) -> Self {
        Self::new(settings.flush_url(), Duration::from_secs(10))
    }
}

impl Flusher for HttpFlusher {
    fn reload(&self) -> Result<(), FlushError> {
        debug!(url = %self.url, "Flushing dev server");
        self.agent
            .post(&self.url)
            .set("User-Agent", "driftline")
            .call()
            .map(|_| ())
            .map_err(|e| FlushError {
                target: self.url.clone(),
                reason: e.to_string(),
            })
    }
}

/// Used when no dev server is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFlush;

impl Flusher for NoFlush {
    fn reload(&self) -> Result<(), FlushError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_dev_server_is_flush_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let flusher = HttpFlusher::new(
            format!("http://127.0.0.1:{port}/flush"),
            Duration::from_secs(2),
        );
        let err = flusher.reload().unwrap_err();
        assert!(err.target.ends_with("/flush"));
    }

    #[test]
    fn test_no_flush() {
        assert!(NoFlush.reload().is_ok());
    }
}
