use async_trait::async_trait;
use tracing::debug;

use super::{Flow, Interceptor, Outcome};
use crate::error::WaypointResult;
use crate::exchange::Exchange;

/// Backbone interceptor that points the exchange at its rule's target
///
/// Balancing rules have no fixed target; their destination is chosen later by
/// the load-balancing interceptor in the rule chain.
#[derive(Debug, Default)]
pub struct DispatchingInterceptor;

impl DispatchingInterceptor {
    pub const PRIORITY: i32 = 200;

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for DispatchingInterceptor {
    fn name(&self) -> &str {
        "dispatching"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn flow(&self) -> Flow {
        Flow::Request
    }

    async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        if !exc.destinations().is_empty() {
            return Ok(Outcome::Continue);
        }

        let Some(base) = exc.rule().and_then(|r| r.target_url()) else {
            return Ok(Outcome::Continue);
        };

        let destination = format!("{}{}", base, exc.path_and_query());
        debug!(destination = %destination, "Dispatching to rule target");
        exc.set_destination(destination);
        Ok(Outcome::Continue)
    }
}
