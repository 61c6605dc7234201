use hyper::{Body, Client, Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use waypoint::balancer::{notification_url, NodeAction, Notification};
use waypoint::config::Config;
use waypoint::proxy::ProxyServer;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "integration-secret";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn gateway_config(port: u16) -> Config {
    let content = format!(
        r#"
[server]
bind_host = "127.0.0.1"

[http_client]
connect_timeout_secs = 2
request_timeout_secs = 5

[[balancer.clusters]]
name = "shop"

[[interceptors]]
type = "cluster_notification"
validate_signature = true
key = "{KEY}"
replay_window_secs = 60

[[rules]]
name = "shop"
port = {port}
path_regex = "/shop/.*"

[rules.balancing]
cluster = "shop"

[[rules.interceptors]]
type = "headers"
name = "via"
response = {{ "Via" = "waypoint" }}
"#
    );
    Config::from_toml_str(&content).unwrap()
}

async fn start(config: &Config) -> (Arc<ProxyServer>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let router = config.build_router().unwrap();
    let server = Arc::new(ProxyServer::new(router, config.server.bind_host));
    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    (server, running)
}

async fn get(url: &str) -> (StatusCode, hyper::HeaderMap, String) {
    let req = Request::builder().uri(url).body(Body::empty()).unwrap();
    let response = Client::new().request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_node_registered_by_notification_receives_traffic() {
    let backend = MockServer::start().await;
    Mock::given(path("/shop/cart"))
        .respond_with(ResponseTemplate::new(200).set_body_string("cart"))
        .mount(&backend)
        .await;

    let port = free_port();
    let config = gateway_config(port);
    let (server, running) = start(&config).await;
    let base = format!("http://127.0.0.1:{}", port);

    // Empty cluster: nothing to dispatch to
    let (status, _, _) = get(&format!("{}/shop/cart", base)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let notification = Notification::new("shop", "127.0.0.1", backend.address().port());
    let url = notification_url(&base, NodeAction::Up, &notification, Some(KEY.as_bytes())).unwrap();
    let (status, _, _) = get(&url).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, headers, body) = get(&format!("{}/shop/cart", base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "cart");
    assert_eq!(headers.get("via").unwrap(), "waypoint");

    // Replaying the same signed request is refused
    let (status, _, _) = get(&url).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let notification = Notification::new("shop", "127.0.0.1", backend.address().port());
    let url = notification_url(&base, NodeAction::Down, &notification, Some(KEY.as_bytes())).unwrap();
    assert_eq!(get(&url).await.0, StatusCode::NO_CONTENT);
    assert_eq!(
        get(&format!("{}/shop/cart", base)).await.0,
        StatusCode::SERVICE_UNAVAILABLE
    );

    server.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_forged_notification_is_rejected() {
    let port = free_port();
    let config = gateway_config(port);
    let router = config.build_router().unwrap();
    let clusters = Arc::clone(router.clusters());
    let server = Arc::new(ProxyServer::new(router, config.server.bind_host));
    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let base = format!("http://127.0.0.1:{}", port);

    let notification = Notification::new("shop", "10.9.9.9", 80);
    let forged =
        notification_url(&base, NodeAction::Up, &notification, Some(b"not-the-key")).unwrap();
    let (status, _, body) = get(&forged).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("signature"));

    let unsigned = notification_url(&base, NodeAction::Up, &notification, None).unwrap();
    assert_eq!(get(&unsigned).await.0, StatusCode::FORBIDDEN);

    assert!(clusters.get_all_nodes("shop", Duration::ZERO).is_empty());

    server.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unmatched_request_gets_json_404() {
    let port = free_port();
    let config = gateway_config(port);
    let (server, running) = start(&config).await;

    let (status, headers, body) = get(&format!("http://127.0.0.1:{}/other", port)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(json.get("error").is_some());

    server.shutdown();
    running.await.unwrap().unwrap();
}
