//! HTTP surface of a node
//!
//! | method | path                          | action                       |
//! |--------|-------------------------------|------------------------------|
//! | PUT    | `/events/{domain}/delivered`  | `WriteBackCache::send`       |
//! | PUT    | `/events/{domain}/bounced`    | `WriteBackCache::send`       |
//! | GET    | `/stats/{domain}`             | `WriteBackCache::peek`       |
//! | GET    | `/domains/{domain}`           | `AggregatingReader::get`     |
//!
//! `/stats` doubles as the inter-node protocol read by peers. Everything
//! else, including a known path with the wrong method, answers 404.

use crate::aggregator::AggregatingReader;
use crate::cache::WriteBackCache;
use crate::model::{ClassificationStatus, DomainEntry, DomainStatus, StatsQuery};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<WriteBackCache>,
    pub reader: Arc<AggregatingReader>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events/{domain}/delivered", put(handle_delivered))
        .route("/events/{domain}/bounced", put(handle_bounced))
        .route("/stats/{domain}", get(handle_stats))
        .route("/domains/{domain}", get(handle_query))
        .fallback(handle_not_found)
        .method_not_allowed_fallback(handle_not_found)
        .with_state(state)
}

async fn ingest(state: &AppState, entry: DomainEntry) -> Response {
    // Detached: a client hanging up mid-flush must not leave the domain marked in flight
    let cache = state.cache.clone();
    let event = entry.clone();
    match tokio::spawn(async move { cache.send(&event).await }).await {
        Ok(outcome) => log::debug!("{} -> {:?}", entry, outcome),
        Err(e) => log::error!("Ingestion task for {} failed: {}", entry, e),
    }
    (StatusCode::OK, Json(entry)).into_response()
}

async fn handle_delivered(State(state): State<AppState>, Path(domain): Path<String>) -> Response {
    ingest(&state, DomainEntry::delivered(domain)).await
}

async fn handle_bounced(State(state): State<AppState>, Path(domain): Path<String>) -> Response {
    ingest(&state, DomainEntry::bounced(domain)).await
}

async fn handle_stats(State(state): State<AppState>, Path(domain): Path<String>) -> Response {
    let total = state.cache.peek(&domain).await;
    let stats = StatsQuery { domain, total };
    log::debug!("{}:{}", StatusCode::OK.as_u16(), stats);
    (StatusCode::OK, Json(stats)).into_response()
}

async fn handle_query(State(state): State<AppState>, Path(domain): Path<String>) -> Response {
    let reader = state.reader.clone();
    let key = domain.clone();
    let result = match tokio::spawn(async move { reader.get(&key).await }).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("Query task for {} failed: {}", domain, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if result.is_unseen() {
        log::info!("{}:{}", StatusCode::NOT_FOUND.as_u16(), domain);
        return StatusCode::NOT_FOUND.into_response();
    }

    let status = DomainStatus {
        status: ClassificationStatus::classify(&result, state.cache.threshold()),
        domain,
    };
    log::info!("{}:{}", StatusCode::OK.as_u16(), status);
    (StatusCode::OK, Json(status)).into_response()
}

async fn handle_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::model::QueryResponse;
    use crate::peer::{PeerError, PeerQuery};
    use crate::store::{DurableStore, MemoryStore};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Peer that answers with this node's own cache, like a one-node cluster
    struct LoopbackPeer {
        cache: Arc<WriteBackCache>,
    }

    #[async_trait]
    impl PeerQuery for LoopbackPeer {
        async fn stats(&self, _host: &str, domain: &str) -> Result<i64, PeerError> {
            Ok(self.cache.peek(domain).await)
        }
    }

    /// Peer whose stats call dies mid-query
    struct CrashingPeer;

    #[async_trait]
    impl PeerQuery for CrashingPeer {
        async fn stats(&self, host: &str, _domain: &str) -> Result<i64, PeerError> {
            panic!("stats handler for {} crashed", host);
        }
    }

    fn app(store: Arc<MemoryStore>, threshold: u64) -> Router {
        let cache = Arc::new(WriteBackCache::new(
            store.clone(),
            CacheConfig { threshold, ..CacheConfig::default() },
        ));
        let reader = Arc::new(
            AggregatingReader::new(
                vec!["self:8080".to_string()],
                store,
                Arc::new(LoopbackPeer { cache: cache.clone() }),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        router(AppState { cache, reader })
    }

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_ingestion_echoes_entry() {
        let app = app(Arc::new(MemoryStore::new()), 1000);

        let (status, body) = call(&app, Method::PUT, "/events/a.com/delivered").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "a.com");
        assert_eq!(body["bounced"], false);

        let (status, body) = call(&app, Method::PUT, "/events/a.com/bounced").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bounced"], true);
    }

    #[tokio::test]
    async fn test_ingestion_acknowledges_while_store_fails() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_inserts(10);
        let app = app(store, 1000);

        let (status, _) = call(&app, Method::PUT, "/events/a.com/bounced").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_reports_live_counter() {
        let app = app(Arc::new(MemoryStore::new()), 1000);
        for _ in 0..3 {
            call(&app, Method::PUT, "/events/a.com/delivered").await;
        }

        let (status, body) = call(&app, Method::GET, "/stats/a.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"domain": "a.com", "total": 3}));

        let (_, body) = call(&app, Method::GET, "/stats/other.com").await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_stats_wire_signal_for_bounce() {
        let app = app(Arc::new(MemoryStore::new()), 1000);
        call(&app, Method::PUT, "/events/b.com/bounced").await;

        let (_, body) = call(&app, Method::GET, "/stats/b.com").await;
        assert_eq!(body["total"], -1);
    }

    #[tokio::test]
    async fn test_query_classification() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone(), 5);

        for _ in 0..3 {
            call(&app, Method::PUT, "/events/slow.com/delivered").await;
        }
        let (status, body) = call(&app, Method::GET, "/domains/slow.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"domain": "slow.com", "status": "unknown"}));

        for _ in 0..5 {
            call(&app, Method::PUT, "/events/busy.com/delivered").await;
        }
        let (_, body) = call(&app, Method::GET, "/domains/busy.com").await;
        assert_eq!(body["status"], "catch-all");

        call(&app, Method::PUT, "/events/busy.com/bounced").await;
        let (_, body) = call(&app, Method::GET, "/domains/busy.com").await;
        assert_eq!(body["status"], "not catch-all");
        assert_eq!(
            store.get("busy.com").await.unwrap(),
            QueryResponse { domain: "busy.com".into(), bounced: true, total: 5 }
        );
    }

    #[tokio::test]
    async fn test_query_unseen_domain_is_404() {
        let app = app(Arc::new(MemoryStore::new()), 1000);
        let (status, _) = call(&app, Method::GET, "/domains/never.seen").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_internal_failure_is_500() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(WriteBackCache::new(store.clone(), CacheConfig::default()));
        let reader = Arc::new(
            AggregatingReader::new(
                vec!["self:8080".to_string()],
                store,
                Arc::new(CrashingPeer),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let app = router(AppState { cache, reader });

        let (status, _) = call(&app, Method::GET, "/domains/a.com").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        // The node keeps serving afterwards
        let (status, _) = call(&app, Method::PUT, "/events/a.com/delivered").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unmatched_routes_are_404() {
        let app = app(Arc::new(MemoryStore::new()), 1000);

        let (status, _) = call(&app, Method::GET, "/nothing/here").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/events/a.com/delivered").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::PUT, "/events/a.com/opened").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
