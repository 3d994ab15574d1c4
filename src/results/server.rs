use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use warp::http::{header::CONTENT_TYPE, StatusCode};
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use super::aggregate::Aggregator;

pub const DEFAULT_PORT: u16 = 8888;

async fn health_check() -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "status": "healthy",
        "service": "kafka-scale-results"
    })))
}

async fn get_results(agg: Arc<Aggregator>) -> Result<Response, Infallible> {
    debug!("results requested");
    match agg.to_json() {
        Ok(body) => {
            Ok(warp::reply::with_header(body, CONTENT_TYPE, "application/json").into_response())
        }
        Err(e) => {
            error!(error = %e, "serializing results");
            Ok(warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response())
        }
    }
}

/// `GET /results` and `GET /health`.
pub fn routes(
    agg: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(health_check);

    let results = warp::path("results")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || agg.clone()))
        .and_then(get_results);

    health.or(results)
}

/// Binds the query server. The returned future runs until `cancel` fires.
pub fn bind(
    agg: Arc<Aggregator>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let (bound, server) = warp::serve(routes(agg))
        .try_bind_with_graceful_shutdown(addr, async move { cancel.cancelled().await })
        .with_context(|| format!("binding results server to {}", addr))?;
    info!(addr = %bound, "results server listening");
    Ok((bound, server))
}

/// Serves on `0.0.0.0:port` until cancelled.
pub async fn serve(agg: Arc<Aggregator>, port: u16, cancel: CancellationToken) -> Result<()> {
    let (_, server) = bind(agg, SocketAddr::from(([0, 0, 0, 0], port)), cancel)?;
    server.await;
    info!("results server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::CodeCatalog;

    fn aggregator() -> Arc<Aggregator> {
        Arc::new(Aggregator::new(Arc::new(CodeCatalog::housing_unit_types())))
    }

    #[tokio::test]
    async fn results_route_returns_json_table() {
        let agg = aggregator();
        agg.apply_wire("2019:1,1,3,7");

        let resp = warp::test::request()
            .method("GET")
            .path("/results")
            .reply(&routes(agg))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        let v: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(v["2019"]["1"]["Count"], 2);
        assert_eq!(v["2019"]["3"]["Description"], "HU PERMANENT IN TRANSIENT HOTEL, MOTEL");
    }

    #[tokio::test]
    async fn snapshots_grow_between_requests() {
        let agg = aggregator();
        let filter = routes(agg.clone());
        let count = |body: &[u8]| -> u64 {
            let v: serde_json::Value = serde_json::from_slice(body).unwrap();
            v["2020"]["1"]["Count"].as_u64().unwrap_or(0)
        };

        agg.apply_wire("2020:1");
        let first = warp::test::request().path("/results").reply(&filter).await;
        agg.apply_wire("2020:1,1");
        let second = warp::test::request().path("/results").reply(&filter).await;
        assert_eq!(count(first.body()), 1);
        assert_eq!(count(second.body()), 3);
    }

    #[tokio::test]
    async fn health_route() {
        let resp = warp::test::request()
            .path("/health")
            .reply(&routes(aggregator()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(v["status"], "healthy");
    }

    #[tokio::test]
    async fn unknown_paths_and_methods_are_rejected() {
        let filter = routes(aggregator());
        let resp = warp::test::request().path("/nope").reply(&filter).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = warp::test::request()
            .method("POST")
            .path("/results")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn server_stops_on_cancel() {
        let agg = aggregator();
        agg.apply_wire("2021:2");
        let cancel = CancellationToken::new();
        let (addr, server) = bind(agg, ([127, 0, 0, 1], 0).into(), cancel.clone()).unwrap();
        let handle = tokio::spawn(server);

        let body = reqwest::get(format!("http://{}/results", addr))
            .await
            .unwrap()
            .error_for_status()
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("\"2021\""));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server shuts down")
            .unwrap();
    }
}
