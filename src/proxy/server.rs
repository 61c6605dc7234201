use anyhow::Result;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::WaypointError;
use crate::exchange::Cancellation;
use crate::router::Router;
use crate::rules::{Rule, RuleListener};

/// Forwards the port of every rule added at runtime to the server loop
struct PortWatcher {
    ports: mpsc::UnboundedSender<u16>,
}

impl RuleListener for PortWatcher {
    fn rule_added(&self, rule: &Arc<Rule>) {
        if self.ports.send(rule.key().port()).is_err() {
            debug!(rule = %rule.name(), "Server loop gone, ignoring new rule port");
        }
    }
}

/// HTTP front end: one hyper listener per distinct rule port
pub struct ProxyServer {
    router: Router,
    bind_host: IpAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyServer {
    pub fn new(router: Router, bind_host: IpAddr) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            router,
            bind_host,
            shutdown_tx,
        }
    }

    /// Handle that stops every listener when signalled
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("No listener running");
        }
    }

    /// Serve until shutdown is signalled, opening listeners for rule ports as
    /// they appear
    pub async fn run(&self) -> Result<()> {
        let (port_tx, mut port_rx) = mpsc::unbounded_channel();
        self.router
            .rules()
            .add_listener(Arc::new(PortWatcher { ports: port_tx }));

        let mut listeners: HashMap<u16, JoinHandle<()>> = HashMap::new();
        for port in self.router.rules().ports() {
            let handle = self.listen(port)?;
            listeners.insert(port, handle);
        }

        for rule in self.router.rules().snapshot().iter() {
            if rule.inbound_tls() {
                warn!(
                    rule = %rule.name(),
                    port = rule.key().port(),
                    "Inbound TLS is not terminated here, serving plain HTTP"
                );
            }
        }

        if listeners.is_empty() {
            warn!("No rules configured, waiting for rules to be added");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while !*shutdown_rx.borrow_and_update() {
            tokio::select! {
                Some(port) = port_rx.recv() => {
                    if listeners.contains_key(&port) {
                        continue;
                    }
                    match self.listen(port) {
                        Ok(handle) => {
                            listeners.insert(port, handle);
                        }
                        Err(e) => error!(port, "Failed to open listener: {}", e),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down {} listener(s)", listeners.len());
        for (port, handle) in listeners {
            if let Err(e) = handle.await {
                error!(port, "Listener task failed: {}", e);
            }
        }
        Ok(())
    }

    fn listen(&self, port: u16) -> Result<JoinHandle<()>> {
        let addr = SocketAddr::new(self.bind_host, port);
        let builder = Server::try_bind(&addr)
            .map_err(|e| anyhow::anyhow!("cannot bind {}: {}", addr, e))?;

        let router = self.router.clone();
        let make_service = make_service_fn(move |conn: &AddrStream| {
            let router = router.clone();
            let remote = conn.remote_addr();
            let local = conn.local_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(serve(router, req, local, remote).await) }
                }))
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let server = builder
            .serve(make_service)
            .with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow_and_update() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            });

        info!("Listening on {}", addr);
        Ok(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("HTTP server error on {}: {}", addr, e);
            }
        }))
    }
}

/// Run the exchange on its own task; if hyper drops this future because the
/// client disconnected, the guard cancels the exchange so it can unwind
async fn serve(
    router: Router,
    req: Request<Body>,
    local: SocketAddr,
    remote: SocketAddr,
) -> Response<Body> {
    let cancellation = Arc::new(Cancellation::new());
    let _guard = cancellation.guard();

    let task = tokio::spawn(async move {
        router
            .handle_request(req, local, Some(remote), cancellation)
            .await
    });

    match task.await {
        Ok(response) => response,
        Err(e) => {
            error!("Exchange task failed: {}", e);
            WaypointError::internal("exchange task failed").to_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::ClusterManager;
    use crate::rules::{RuleKey, RuleTable};
    use tokio::time::{sleep, Duration};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn get(port: u16, uri: &str) -> hyper::Result<Response<Body>> {
        let url: hyper::Uri = format!("http://127.0.0.1:{}{}", port, uri).parse().unwrap();
        hyper::Client::new().get(url).await
    }

    #[tokio::test]
    async fn test_serves_rule_ports_and_shuts_down() {
        let backend = MockServer::start().await;
        Mock::given(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
            .mount(&backend)
            .await;

        let port = free_port();
        let rules = Arc::new(RuleTable::new());
        rules
            .add(Arc::new(
                Rule::new("hello", RuleKey::new(port))
                    .with_target("127.0.0.1", backend.address().port()),
            ))
            .unwrap();

        let router = Router::new(rules, Arc::new(ClusterManager::default()), false);
        let server = Arc::new(ProxyServer::new(router, "127.0.0.1".parse().unwrap()));
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        sleep(Duration::from_millis(100)).await;

        let response = get(port, "/hello").await.unwrap();
        assert_eq!(response.status(), 200);

        server.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_opens_listener_for_rule_added_at_runtime() {
        let backend = MockServer::start().await;
        Mock::given(path("/late"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&backend)
            .await;

        let rules = Arc::new(RuleTable::new());
        let router = Router::new(Arc::clone(&rules), Arc::new(ClusterManager::default()), false);
        let server = Arc::new(ProxyServer::new(router, "127.0.0.1".parse().unwrap()));
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        sleep(Duration::from_millis(50)).await;

        let port = free_port();
        rules
            .add(Arc::new(
                Rule::new("late", RuleKey::new(port))
                    .with_target("127.0.0.1", backend.address().port()),
            ))
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let response = get(port, "/late").await.unwrap();
        assert_eq!(response.status(), 202);

        server.shutdown();
        running.await.unwrap().unwrap();
    }
}
