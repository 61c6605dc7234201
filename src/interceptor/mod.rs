//! # Interceptor pipeline
//!
//! Interceptors are the participants of the request/response pipeline. Each
//! one returns an [`Outcome`] that drives the [`Pipeline`]:
//!
//! - `Continue`: proceed with the next interceptor
//! - `Return`: a response exists, stop the request pass and unwind
//! - `Abort`: stop both passes and fail the exchange
//!
//! Backbone interceptors are installed on the pipeline itself; rule
//! interceptors are attached to a [`Rule`](crate::rules::Rule) and only run
//! once the rule has been matched.
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use waypoint::error::WaypointResult;
//! use waypoint::exchange::Exchange;
//! use waypoint::interceptor::{Interceptor, Outcome};
//!
//! struct Tagger;
//!
//! #[async_trait]
//! impl Interceptor for Tagger {
//!     fn name(&self) -> &str {
//!         "tagger"
//!     }
//!
//!     async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
//!         exc.set_property("tagged", true);
//!         Ok(Outcome::Continue)
//!     }
//! }
//! ```

pub mod dispatching; // rule target -> destination
pub mod forwarding; // outbound HTTP call with fail-over
pub mod headers; // static header manipulation
pub mod matching; // rule lookup
pub mod pipeline; // pipeline engine

use async_trait::async_trait;

use crate::error::WaypointResult;
use crate::exchange::Exchange;

pub use dispatching::DispatchingInterceptor;
pub use forwarding::HttpClientInterceptor;
pub use headers::HeaderInterceptor;
pub use matching::RuleMatchingInterceptor;
pub use pipeline::Pipeline;

/// Priority used when an interceptor does not declare one
pub const DEFAULT_PRIORITY: i32 = 1000;

/// Backbone interceptors below this priority run before the rule's own chain,
/// the remaining ones after it
pub const RULE_STAGE_PRIORITY: i32 = 1000;

/// Control signal returned by every interceptor call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Return,
    Abort,
}

/// Which passes an interceptor takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Request,
    Response,
    Both,
}

impl Flow {
    pub fn handles_request(self) -> bool {
        matches!(self, Flow::Request | Flow::Both)
    }

    pub fn handles_response(self) -> bool {
        matches!(self, Flow::Response | Flow::Both)
    }
}

/// A pipeline participant
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Ordering key, ascending
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    fn flow(&self) -> Flow {
        Flow::Both
    }

    /// Run only for the first exchange of each rule
    fn once_per_rule(&self) -> bool {
        false
    }

    async fn handle_request(&self, _exc: &mut Exchange) -> WaypointResult<Outcome> {
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, _exc: &mut Exchange) -> WaypointResult<Outcome> {
        Ok(Outcome::Continue)
    }

    /// Called in reverse entry order when the exchange aborts after this
    /// interceptor's request handler completed. Release resources only.
    async fn handle_abort(&self, _exc: &mut Exchange) {}
}
