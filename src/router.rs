use hyper::{Body, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::balancer::ClusterManager;
use crate::error::WaypointError;
use crate::exchange::{Cancellation, Exchange, ExchangeState};
use crate::interceptor::{
    DispatchingInterceptor, HttpClientInterceptor, Interceptor, Pipeline, RuleMatchingInterceptor,
};
use crate::rules::RuleTable;

/// Entry point that turns an inbound request into an exchange and runs it
/// through the pipeline
#[derive(Clone)]
pub struct Router {
    rules: Arc<RuleTable>,
    clusters: Arc<ClusterManager>,
    pipeline: Arc<Pipeline>,
}

impl Router {
    /// Router with the standard backbone: rule matching, dispatching and the
    /// outbound HTTP client
    pub fn new(rules: Arc<RuleTable>, clusters: Arc<ClusterManager>, fail_over_on_5xx: bool) -> Self {
        let pipeline = Pipeline::new(Self::default_backbone(&rules, fail_over_on_5xx));
        Self::with_pipeline(rules, clusters, Arc::new(pipeline))
    }

    pub fn with_pipeline(
        rules: Arc<RuleTable>,
        clusters: Arc<ClusterManager>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            rules,
            clusters,
            pipeline,
        }
    }

    pub fn default_backbone(rules: &Arc<RuleTable>, fail_over_on_5xx: bool) -> Vec<Arc<dyn Interceptor>> {
        vec![
            Arc::new(RuleMatchingInterceptor::new(Arc::clone(rules))),
            Arc::new(DispatchingInterceptor::new()),
            Arc::new(HttpClientInterceptor::new(fail_over_on_5xx)),
        ]
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run an exchange through both pipeline passes
    pub async fn handle(&self, exc: &mut Exchange) {
        self.pipeline.run(exc).await;
    }

    /// Handle one inbound request and produce the client response
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        cancellation: Arc<Cancellation>,
    ) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut exc = Exchange::new(req, local_addr).with_cancellation(cancellation);
        if let Some(remote) = remote_addr {
            exc = exc.with_remote_addr(remote);
        }
        debug!(exchange = %exc.id(), method = %method, path = %path, "Exchange started");

        self.handle(&mut exc).await;

        let elapsed_ms = exc.elapsed().as_millis() as u64;
        let rule = exc.rule().map(|r| r.name().to_string()).unwrap_or_default();
        let response = match exc.take_response() {
            Some(response) => response,
            None => WaypointError::internal("exchange finished without a response").to_response(),
        };

        match exc.state() {
            ExchangeState::Failed => warn!(
                exchange = %exc.id(),
                method = %method,
                path = %path,
                rule = %rule,
                status = response.status().as_u16(),
                elapsed_ms,
                "Exchange failed"
            ),
            _ => info!(
                exchange = %exc.id(),
                method = %method,
                path = %path,
                rule = %rule,
                status = response.status().as_u16(),
                elapsed_ms,
                "Exchange completed"
            ),
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, RuleKey};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_routes_to_rule_target() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/service"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&backend)
            .await;
        let backend_addr = *backend.address();

        let rules = Arc::new(RuleTable::new());
        rules
            .add(Arc::new(
                Rule::new("svc", RuleKey::new(9000).with_path("/service"))
                    .with_target(backend_addr.ip().to_string(), backend_addr.port()),
            ))
            .unwrap();
        let router = Router::new(rules, Arc::new(ClusterManager::default()), false);

        let req = Request::builder().uri("/service").body(Body::empty()).unwrap();
        let response = router
            .handle_request(req, local(9000), None, Arc::new(Cancellation::new()))
            .await;
        assert_eq!(response.status(), 200);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let router = Router::new(
            Arc::new(RuleTable::new()),
            Arc::new(ClusterManager::default()),
            false,
        );

        let req = Request::builder().uri("/nothing").body(Body::empty()).unwrap();
        let response = router
            .handle_request(req, local(9000), None, Arc::new(Cancellation::new()))
            .await;
        assert_eq!(response.status(), 404);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
