use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{Interceptor, Outcome, RULE_STAGE_PRIORITY};
use crate::error::{ErrorSeverity, WaypointError};
use crate::exchange::Exchange;

/// Why the pipeline stopped early
struct Failure {
    error: WaypointError,
    /// Keep a response the failing interceptor wrote itself
    keep_response: bool,
}

impl Failure {
    fn raised(error: WaypointError) -> Self {
        Self {
            error,
            keep_response: false,
        }
    }
}

/// Runs backbone and rule interceptors over an exchange
///
/// Request pass: backbone interceptors below [`RULE_STAGE_PRIORITY`], then the
/// matched rule's chain, then the remaining backbone. Every interceptor that
/// returns `Continue` is pushed on a stack which the response pass unwinds in
/// reverse. Exactly one response is left on the exchange when `run` returns.
pub struct Pipeline {
    backbone: ArcSwap<Vec<Arc<dyn Interceptor>>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Pipeline {
    pub fn new(mut backbone: Vec<Arc<dyn Interceptor>>) -> Self {
        backbone.sort_by_key(|i| i.priority());
        Self {
            backbone: ArcSwap::from_pointee(backbone),
        }
    }

    pub fn backbone(&self) -> Arc<Vec<Arc<dyn Interceptor>>> {
        self.backbone.load_full()
    }

    pub fn add_backbone(&self, interceptor: Arc<dyn Interceptor>) {
        self.backbone.rcu(|current| {
            let mut next: Vec<Arc<dyn Interceptor>> = current.iter().cloned().collect();
            next.push(Arc::clone(&interceptor));
            next.sort_by_key(|i| i.priority());
            next
        });
    }

    pub fn remove_backbone(&self, name: &str) -> bool {
        let previous = self.backbone.rcu(|current| {
            current
                .iter()
                .filter(|i| i.name() != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|i| i.name() == name)
    }

    /// Process an exchange through both passes
    pub async fn run(&self, exc: &mut Exchange) {
        let backbone = self.backbone.load_full();
        let mut stack: Vec<Arc<dyn Interceptor>> = Vec::new();

        if let Err(failure) = self.request_pass(&backbone, exc, &mut stack).await {
            self.abort(exc, stack, failure).await;
            return;
        }

        if exc.response().is_none() {
            let failure = Failure::raised(WaypointError::internal(
                "request pass finished without a response",
            ));
            self.abort(exc, stack, failure).await;
            return;
        }

        while let Some(interceptor) = stack.pop() {
            if !interceptor.flow().handles_response() {
                continue;
            }

            let failure = match interceptor.handle_response(exc).await {
                Ok(Outcome::Continue) | Ok(Outcome::Return) => continue,
                Ok(Outcome::Abort) => Failure::raised(WaypointError::pipeline_abort(
                    interceptor.name(),
                    "aborted while handling the response",
                )),
                Err(e) => Failure::raised(e),
            };
            self.abort(exc, stack, failure).await;
            return;
        }

        exc.complete();
    }

    async fn request_pass(
        &self,
        backbone: &[Arc<dyn Interceptor>],
        exc: &mut Exchange,
        stack: &mut Vec<Arc<dyn Interceptor>>,
    ) -> Result<(), Failure> {
        let split = backbone.partition_point(|i| i.priority() < RULE_STAGE_PRIORITY);
        let (before_rule, after_rule) = backbone.split_at(split);

        for interceptor in before_rule {
            if invoke_request(interceptor, exc, stack).await? == Outcome::Return {
                return Ok(());
            }
        }

        if let Some(rule) = exc.rule().cloned() {
            for interceptor in rule.interceptors().iter() {
                if invoke_request(interceptor, exc, stack).await? == Outcome::Return {
                    return Ok(());
                }
            }
        }

        for interceptor in after_rule {
            if invoke_request(interceptor, exc, stack).await? == Outcome::Return {
                return Ok(());
            }
        }

        Ok(())
    }

    async fn abort(
        &self,
        exc: &mut Exchange,
        stack: Vec<Arc<dyn Interceptor>>,
        failure: Failure,
    ) {
        let Failure {
            error: err,
            keep_response,
        } = failure;

        match err.severity() {
            ErrorSeverity::High | ErrorSeverity::Critical => error!(
                exchange = %exc.id(),
                kind = err.kind(),
                severity = %err.severity(),
                "Exchange aborted: {}",
                err
            ),
            _ => warn!(
                exchange = %exc.id(),
                kind = err.kind(),
                "Exchange aborted: {}",
                err
            ),
        }

        exc.fail(err.clone());
        for interceptor in stack.iter().rev() {
            debug!(interceptor = %interceptor.name(), "Notifying abort");
            interceptor.handle_abort(exc).await;
        }

        if !(keep_response && exc.response().is_some()) {
            exc.set_response(err.to_response());
        }
    }
}

async fn invoke_request(
    interceptor: &Arc<dyn Interceptor>,
    exc: &mut Exchange,
    stack: &mut Vec<Arc<dyn Interceptor>>,
) -> Result<Outcome, Failure> {
    if interceptor.once_per_rule() {
        if let Some(rule) = exc.rule() {
            if !rule.mark_once(interceptor.name()) {
                return Ok(Outcome::Continue);
            }
        }
    }

    if !interceptor.flow().handles_request() {
        stack.push(Arc::clone(interceptor));
        return Ok(Outcome::Continue);
    }

    if exc.is_cancelled() {
        return Err(Failure::raised(WaypointError::cancelled(
            "client went away during the request pass",
        )));
    }

    let had_response = exc.response().is_some();
    match interceptor.handle_request(exc).await {
        Ok(Outcome::Continue) => {
            stack.push(Arc::clone(interceptor));
            Ok(Outcome::Continue)
        }
        Ok(Outcome::Return) => {
            debug!(interceptor = %interceptor.name(), "Interceptor returned a response");
            Ok(Outcome::Return)
        }
        Ok(Outcome::Abort) => Err(Failure {
            error: WaypointError::pipeline_abort(interceptor.name(), "aborted the request"),
            keep_response: !had_response,
        }),
        Err(e) => Err(Failure::raised(e)),
    }
}
