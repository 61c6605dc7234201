use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use tracing::warn;

use super::{Interceptor, Outcome, DEFAULT_PRIORITY};
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::Exchange;

/// Sets and removes fixed headers on requests and responses
#[derive(Debug, Clone)]
pub struct HeaderInterceptor {
    name: String,
    priority: i32,
    set_request: Vec<(HeaderName, HeaderValue)>,
    set_response: Vec<(HeaderName, HeaderValue)>,
    remove_request: Vec<HeaderName>,
    remove_response: Vec<HeaderName>,
}

impl HeaderInterceptor {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            set_request: Vec::new(),
            set_response: Vec::new(),
            remove_request: Vec::new(),
            remove_response: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Build from name/value maps, rejecting invalid header names or values
    pub fn from_maps(
        name: &str,
        request_headers: &BTreeMap<String, String>,
        response_headers: &BTreeMap<String, String>,
    ) -> WaypointResult<Self> {
        let mut interceptor = Self::new(name);
        interceptor.set_request = parse_pairs(request_headers)?;
        interceptor.set_response = parse_pairs(response_headers)?;
        Ok(interceptor)
    }

    pub fn remove_from_request(mut self, names: &[String]) -> WaypointResult<Self> {
        self.remove_request = parse_names(names)?;
        Ok(self)
    }

    pub fn remove_from_response(mut self, names: &[String]) -> WaypointResult<Self> {
        self.remove_response = parse_names(names)?;
        Ok(self)
    }
}

fn parse_pairs(map: &BTreeMap<String, String>) -> WaypointResult<Vec<(HeaderName, HeaderValue)>> {
    map.iter()
        .map(|(k, v)| {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| WaypointError::config(format!("Invalid header name '{}'", k)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| WaypointError::config(format!("Invalid value for header '{}'", k)))?;
            Ok((name, value))
        })
        .collect()
}

fn parse_names(names: &[String]) -> WaypointResult<Vec<HeaderName>> {
    names
        .iter()
        .map(|k| {
            HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| WaypointError::config(format!("Invalid header name '{}'", k)))
        })
        .collect()
}

fn apply(headers: &mut HeaderMap, set: &[(HeaderName, HeaderValue)], remove: &[HeaderName]) {
    for name in remove {
        headers.remove(name);
    }
    for (name, value) in set {
        headers.insert(name.clone(), value.clone());
    }
}

#[async_trait]
impl Interceptor for HeaderInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        apply(
            exc.request_mut().headers_mut(),
            &self.set_request,
            &self.remove_request,
        );
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        match exc.response_mut() {
            Some(response) => apply(
                response.headers_mut(),
                &self.set_response,
                &self.remove_response,
            ),
            None => warn!(interceptor = %self.name, "No response to decorate"),
        }
        Ok(Outcome::Continue)
    }
}
