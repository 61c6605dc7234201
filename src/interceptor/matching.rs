use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Flow, Interceptor, Outcome};
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::Exchange;
use crate::rules::{key::strip_port, MatchInput, RuleTable};

/// Backbone interceptor that binds the exchange to its rule
pub struct RuleMatchingInterceptor {
    rules: Arc<RuleTable>,
}

impl RuleMatchingInterceptor {
    pub const PRIORITY: i32 = 100;

    pub fn new(rules: Arc<RuleTable>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl Interceptor for RuleMatchingInterceptor {
    fn name(&self) -> &str {
        "rule-matching"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn flow(&self) -> Flow {
        Flow::Request
    }

    async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        if exc.rule().is_some() {
            return Ok(Outcome::Continue);
        }

        let input = MatchInput::from_exchange(exc);
        let Some(rule) = self.rules.match_rule(&input) else {
            warn!(
                host = %input.host,
                method = %input.method,
                path = %input.path_and_query,
                port = input.port,
                "No rule matches request"
            );
            return Err(WaypointError::no_route(
                strip_port(input.host),
                input.method,
                input.path_and_query,
                input.port,
            ));
        };

        debug!(rule = %rule.name(), exchange = %exc.id(), "Rule matched");
        let block_request = rule.block_request();
        exc.set_rule(rule);

        if block_request {
            exc.request_body_bytes().await?;
        }
        Ok(Outcome::Continue)
    }
}
