use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Body, Client, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::HttpClientConfig;
use crate::error::{WaypointError, WaypointResult};

type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

struct SharedClient {
    client: HttpsClient,
    request_timeout: Duration,
}

/// Shared hyper client with connection pooling (HTTP/HTTPS via rustls)
///
/// - Single client instance reused across requests to enable pooling
/// - Request-level timeout taken from configuration
static SHARED_CLIENT: Lazy<RwLock<Arc<SharedClient>>> =
    Lazy::new(|| RwLock::new(Arc::new(build_client(None))));

/// Initialize or reinitialize the shared HTTP client with optional configuration.
/// Safe to call multiple times; later calls replace the client.
pub fn init(config: Option<&HttpClientConfig>) {
    let new_client = Arc::new(build_client(config));
    if let Ok(mut guard) = SHARED_CLIENT.write() {
        *guard = new_client;
    }
}

fn get_client() -> Arc<SharedClient> {
    SHARED_CLIENT
        .read()
        .ok()
        .map(|g| Arc::clone(&*g))
        .unwrap_or_else(|| Arc::new(build_client(None)))
}

fn build_client(config: Option<&HttpClientConfig>) -> SharedClient {
    let defaults = HttpClientConfig::default();
    let config = config.unwrap_or(&defaults);

    let mut http = HttpConnector::new();
    http.enforce_http(false); // allow https URIs through the rustls wrapper
    http.set_nodelay(true);
    http.set_connect_timeout(Some(config.get_connect_timeout()));

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    let client = Client::builder()
        .pool_idle_timeout(config.get_pool_idle_timeout())
        .pool_max_idle_per_host(config.get_pool_max_idle_per_host())
        .build::<_, Body>(https);

    SharedClient {
        client,
        request_timeout: config.get_request_timeout(),
    }
}

/// Send a request to an absolute destination URL using the shared client.
///
/// The body is streamed, hop-by-hop headers are stripped in both directions.
pub async fn forward(
    req: Request<Body>,
    destination: &str,
    remote_addr: Option<SocketAddr>,
) -> WaypointResult<Response<Body>> {
    let upstream_req = build_upstream_request(req, destination, remote_addr)?;
    let shared = get_client();
    let upstream_res = tokio::time::timeout(shared.request_timeout, shared.client.request(upstream_req))
        .await
        .map_err(|_| WaypointError::timeout(shared.request_timeout, format!("request to {}", destination)))??;
    Ok(build_downstream_response(upstream_res))
}

/// Lightweight GET that returns only the status code
pub async fn get_status(url: &str, timeout: Duration) -> WaypointResult<hyper::StatusCode> {
    let uri: Uri = url.parse()?;
    let req = Request::builder()
        .method(hyper::Method::GET)
        .uri(uri)
        .body(Body::empty())?;

    let shared = get_client();
    let resp = tokio::time::timeout(timeout, shared.client.request(req))
        .await
        .map_err(|_| WaypointError::timeout(timeout, format!("GET {}", url)))??;
    Ok(resp.status())
}

fn build_upstream_request(
    req: Request<Body>,
    destination: &str,
    remote_addr: Option<SocketAddr>,
) -> WaypointResult<Request<Body>> {
    let uri: Uri = destination.parse()?;
    let authority = uri
        .authority()
        .ok_or_else(|| WaypointError::config(format!("destination missing authority: {}", destination)))?
        .clone();
    let inbound_https = req.uri().scheme_str() == Some("https");

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;

    strip_hop_by_hop_headers(&mut parts.headers);
    parts
        .headers
        .insert(HOST, HeaderValue::from_str(authority.as_str()).map_err(|e| WaypointError::internal(e.to_string()))?);

    parts.headers.entry("x-forwarded-proto").or_insert_with(|| {
        if inbound_https {
            HeaderValue::from_static("https")
        } else {
            HeaderValue::from_static("http")
        }
    });
    if let Some(addr) = remote_addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            parts.headers.entry("x-forwarded-for").or_insert(value);
        }
    }

    Ok(Request::from_parts(parts, body))
}

fn build_downstream_response(upstream: Response<Body>) -> Response<Body> {
    let (mut parts, body) = upstream.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body)
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    const HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];

    // Headers named by Connection are hop-by-hop too
    let extra: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    for h in HOP_HEADERS {
        headers.remove(*h);
    }
    for name in extra {
        headers.remove(name.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_request_rewrites_uri_and_host() {
        let req = Request::builder()
            .uri("/service?x=1")
            .header("host", "gateway.local")
            .header("connection", "keep-alive, x-trace")
            .header("x-trace", "1")
            .header("x-keep", "1")
            .body(Body::empty())
            .unwrap();

        let upstream = build_upstream_request(
            req,
            "http://10.0.0.2:9001/service?x=1",
            Some("192.168.1.5:5555".parse().unwrap()),
        )
        .unwrap();

        assert_eq!(upstream.uri().to_string(), "http://10.0.0.2:9001/service?x=1");
        assert_eq!(upstream.headers().get(HOST).unwrap(), "10.0.0.2:9001");
        assert!(upstream.headers().get("connection").is_none());
        assert!(upstream.headers().get("x-trace").is_none());
        assert!(upstream.headers().get("x-keep").is_some());
        assert_eq!(
            upstream.headers().get("x-forwarded-for").unwrap(),
            "192.168.1.5"
        );
    }

    #[test]
    fn test_destination_without_authority_rejected() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert!(build_upstream_request(req, "/relative", None).is_err());
    }
}
