//! End-to-end: real proxy, real V2 client, mock inference server

use axum::{extract::Path, routing::post, Router};
use quay_agent::{
    CacheManager, ModelRegistry, ProxyConfig, ReverseProxy, V2Client, INTERNAL_MODEL_HEADER,
};
use quay_types::{Model, ModelVersionDetails};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn start_mock_inference_server() -> SocketAddr {
    let app = Router::new()
        .route(
            "/v2/models/:model_name/infer",
            post(|Path(name): Path<String>| async move { format!("Model inference: {name}") }),
        )
        .route(
            "/v2/repository/models/:model_name/load",
            post(|Path(name): Path<String>| async move { format!("Model load: {name}") }),
        )
        .route(
            "/v2/repository/models/:model_name/unload",
            post(|Path(name): Path<String>| async move { format!("Model unload: {name}") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn register(registry: &ModelRegistry, name: &str) -> String {
    registry.register(ModelVersionDetails {
        model: Model::new(name),
        version: 1,
    })
}

async fn setup_proxy() -> (ReverseProxy, Arc<ModelRegistry>) {
    let backend_addr = start_mock_inference_server().await;
    let backend_url = format!("http://{backend_addr}");

    let client = V2Client::new(&backend_url, Duration::from_secs(5)).unwrap();
    let registry = Arc::new(ModelRegistry::new());
    let cache = CacheManager::new(Arc::new(client), registry.clone(), 3);

    // One other model already resident
    let other = register(&registry, "bar");
    cache.load(&other).await.unwrap();

    let config = ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        backend_url,
        request_timeout_secs: 5,
        ..Default::default()
    };
    (ReverseProxy::new(config, cache).unwrap(), registry)
}

async fn infer(addr: SocketAddr, model: Option<&str>) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("http://{addr}/v2/models/RANDOM/infer"))
        .header("content-type", "application/json");
    if let Some(model) = model {
        request = request.header(INTERNAL_MODEL_HEADER, model);
    }
    request.send().await.unwrap()
}

#[tokio::test]
async fn test_reverse_proxy_smoke() {
    let (proxy, registry) = setup_proxy().await;
    assert!(!proxy.ready());

    let addr = proxy.start().await.unwrap();
    assert!(proxy.ready());
    register(&registry, "foo");

    let response = infer(addr, Some("foo")).await;
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("foo"), "unexpected body: {body}");
    assert!(proxy.cache().contains("foo_1").await);

    let response = infer(addr, Some("foo2")).await;
    assert_eq!(response.status().as_u16(), 404);

    let response = infer(addr, None).await;
    assert_eq!(response.status().as_u16(), 404);

    assert!(proxy.ready());
    proxy.stop().await.unwrap();
    assert!(!proxy.ready());
}

#[tokio::test]
async fn test_start_twice_is_rejected_and_restart_works() {
    let (proxy, _registry) = setup_proxy().await;

    proxy.start().await.unwrap();
    assert!(proxy.start().await.is_err());

    proxy.stop().await.unwrap();
    assert!(proxy.local_addr().await.is_none());

    proxy.start().await.unwrap();
    assert!(proxy.ready());
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_cache_evicts_for_new_model() {
    let (proxy, registry) = setup_proxy().await;
    let addr = proxy.start().await.unwrap();

    for name in ["m1", "m2", "m3"] {
        register(&registry, name);
        let response = infer(addr, Some(name)).await;
        assert_eq!(response.status().as_u16(), 200);
    }

    // Capacity 3: bar was least recently used
    let cache = proxy.cache();
    assert_eq!(cache.len().await, 3);
    assert!(!cache.contains("bar_1").await);
    assert!(cache.contains("m1_1").await);

    proxy.stop().await.unwrap();
}
