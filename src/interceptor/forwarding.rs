use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Request};
use tracing::{debug, warn};

use super::{Flow, Interceptor, Outcome};
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::{AttemptOutcome, Exchange};
use crate::proxy::http_client;

/// Terminal backbone interceptor that performs the backend call
///
/// Destinations are tried in order. Connection-level failures move on to the
/// next destination, as do 5xx answers when `fail_over_on_5xx` is set. The
/// request body is buffered only when more than one attempt is possible or
/// the rule asks for it.
#[derive(Debug, Default)]
pub struct HttpClientInterceptor {
    fail_over_on_5xx: bool,
}

impl HttpClientInterceptor {
    pub const PRIORITY: i32 = 10_000;

    pub fn new(fail_over_on_5xx: bool) -> Self {
        Self { fail_over_on_5xx }
    }
}

fn copy_request(original: &Request<Body>, body: Body) -> Request<Body> {
    let mut request = Request::new(body);
    *request.method_mut() = original.method().clone();
    *request.uri_mut() = original.uri().clone();
    *request.version_mut() = original.version();
    *request.headers_mut() = original.headers().clone();
    request
}

#[async_trait]
impl Interceptor for HttpClientInterceptor {
    fn name(&self) -> &str {
        "http-client"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn flow(&self) -> Flow {
        Flow::Request
    }

    async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        let destinations = exc.destinations().to_vec();
        if destinations.is_empty() {
            let rule = exc.rule().map(|r| r.name().to_string()).unwrap_or_default();
            return Err(WaypointError::internal(format!(
                "no destination set for rule '{}'",
                rule
            )));
        }

        let (block_request, block_response) = exc
            .rule()
            .map(|r| (r.block_request(), r.block_response()))
            .unwrap_or((false, false));

        let buffered: Option<Bytes> = if destinations.len() > 1 || block_request {
            Some(exc.request_body_bytes().await?)
        } else {
            None
        };

        let cancellation = exc.cancellation();
        let remote_addr = exc.remote_addr();
        let last = destinations.len() - 1;

        for (attempt, destination) in destinations.iter().enumerate() {
            let body = match &buffered {
                Some(bytes) => Body::from(bytes.clone()),
                None => std::mem::take(exc.request_mut().body_mut()),
            };
            let request = copy_request(exc.request(), body);

            debug!(destination = %destination, attempt, "Forwarding request");
            let result = tokio::select! {
                result = http_client::forward(request, destination, remote_addr) => result,
                _ = cancellation.cancelled() => {
                    return Err(WaypointError::cancelled("client went away during the backend call"));
                }
            };

            let outcome = match &result {
                Ok(response) => AttemptOutcome::Status(response.status().as_u16()),
                Err(_) => AttemptOutcome::Failed,
            };
            exc.record_attempt(destination.as_str(), outcome);

            match result {
                Ok(response)
                    if self.fail_over_on_5xx
                        && response.status().is_server_error()
                        && attempt < last =>
                {
                    warn!(
                        destination = %destination,
                        status = %response.status(),
                        "Backend answered with a server error, failing over"
                    );
                }
                Ok(response) => {
                    exc.set_response(response);
                    exc.set_served_destination(destination.clone());
                    if block_response {
                        exc.response_body_bytes().await?;
                    }
                    return Ok(Outcome::Return);
                }
                Err(e) if attempt < last && e.is_retryable() => {
                    warn!(destination = %destination, error = %e, "Backend call failed, failing over");
                }
                Err(e) => return Err(e),
            }
        }

        Err(WaypointError::network("all destinations failed"))
    }
}
