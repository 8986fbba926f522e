//! Peer query capability
//!
//! Fetches one remote node's live (unflushed) counter for a domain over the
//! inter-node protocol:
//!
//! ```text
//! GET http://{host}/stats/{domain}  ->  {"domain": "...", "total": n}
//! ```
//!
//! A negative `total` is the peer saying it holds an unflushed bounce.

use crate::model::StatsQuery;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug)]
pub enum PeerError {
    /// Connection failed, timed out, or the body could not be read
    Unreachable(String),
    /// The peer answered with something that is not a stats payload
    Malformed(String),
}

impl From<reqwest::Error> for PeerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PeerError::Malformed(err.to_string())
        } else {
            PeerError::Unreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Malformed(err.to_string())
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Unreachable(e) => write!(f, "Peer unreachable: {}", e),
            PeerError::Malformed(e) => write!(f, "Malformed peer response: {}", e),
        }
    }
}

impl std::error::Error for PeerError {}

/// Read one peer's live counter for `domain`
#[async_trait]
pub trait PeerQuery: Send + Sync {
    async fn stats(&self, host: &str, domain: &str) -> Result<i64, PeerError>;
}

/// HTTP implementation of [`PeerQuery`] with a per-call timeout
pub struct HttpPeerQuery {
    client: reqwest::Client,
}

impl HttpPeerQuery {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// `http://{host}/stats/{domain}` with the domain percent-encoded as a
    /// single path segment, so the peer decodes exactly the same key
    pub fn stats_url(host: &str, domain: &str) -> Result<reqwest::Url, PeerError> {
        let mut url = reqwest::Url::parse(&format!("http://{}/", host))
            .map_err(|e| PeerError::Unreachable(format!("invalid peer host '{}': {}", host, e)))?;
        url.path_segments_mut()
            .map_err(|_| PeerError::Unreachable(format!("invalid peer host '{}'", host)))?
            .clear()
            .push("stats")
            .push(domain);
        Ok(url)
    }
}

#[async_trait]
impl PeerQuery for HttpPeerQuery {
    async fn stats(&self, host: &str, domain: &str) -> Result<i64, PeerError> {
        let url = Self::stats_url(host, domain)?;
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(PeerError::Malformed(format!("{} answered {}", url, response.status())));
        }

        let body = response.bytes().await?;
        let stats: StatsQuery = serde_json::from_slice(&body)?;
        Ok(stats.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::get, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_reads_total_from_peer() {
        let app = Router::new().route(
            "/stats/{domain}",
            get(|Path(domain): Path<String>| async move {
                Json(StatsQuery { domain, total: 17 })
            }),
        );
        let host = serve(app).await;

        let peers = HttpPeerQuery::new(Duration::from_secs(2)).unwrap();
        assert_eq!(peers.stats(&host, "a.com").await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_negative_total_passes_through() {
        let app = Router::new().route(
            "/stats/{domain}",
            get(|Path(domain): Path<String>| async move {
                Json(StatsQuery { domain, total: -1 })
            }),
        );
        let host = serve(app).await;

        let peers = HttpPeerQuery::new(Duration::from_secs(2)).unwrap();
        assert_eq!(peers.stats(&host, "b.com").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_bad_json_is_malformed() {
        let app = Router::new().route(
            "/stats/{domain}",
            get(|| async { r#"{"domain":"widgetville.com", total: 5}"# }),
        );
        let host = serve(app).await;

        let peers = HttpPeerQuery::new(Duration::from_secs(2)).unwrap();
        let err = peers.stats(&host, "widgetville.com").await.unwrap_err();
        assert!(matches!(err, PeerError::Malformed(_)), "got {}", err);
    }

    #[test]
    fn test_stats_url_encodes_domain_as_one_segment() {
        let url = HttpPeerQuery::stats_url("10.0.0.1:8080", "a.com#x").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/stats/a.com%23x");

        let url = HttpPeerQuery::stats_url("10.0.0.1:8080", "a.com?x/y").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/stats/a.com%3Fx%2Fy");

        let url = HttpPeerQuery::stats_url("10.0.0.1:8080", "widgetville.com").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/stats/widgetville.com");
    }

    #[tokio::test]
    async fn test_peer_sees_exact_domain_key() {
        let app = Router::new().route(
            "/stats/{domain}",
            get(|Path(domain): Path<String>| async move {
                let total = if domain == "a.com" { -1 } else { 7 };
                Json(StatsQuery { domain, total })
            }),
        );
        let host = serve(app).await;

        let peers = HttpPeerQuery::new(Duration::from_secs(2)).unwrap();
        assert_eq!(peers.stats(&host, "a.com#x").await.unwrap(), 7);
        assert_eq!(peers.stats(&host, "a.com?x").await.unwrap(), 7);
        assert_eq!(peers.stats(&host, "a.com").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let peers = HttpPeerQuery::new(Duration::from_millis(500)).unwrap();
        let err = peers.stats(&host, "c.com").await.unwrap_err();
        assert!(matches!(err, PeerError::Unreachable(_)), "got {}", err);
    }

    #[tokio::test]
    async fn test_slow_peer_times_out() {
        let app = Router::new().route(
            "/stats/{domain}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let host = serve(app).await;

        let peers = HttpPeerQuery::new(Duration::from_millis(100)).unwrap();
        let err = peers.stats(&host, "slow.com").await.unwrap_err();
        assert!(matches!(err, PeerError::Unreachable(_)), "got {}", err);
    }
}
