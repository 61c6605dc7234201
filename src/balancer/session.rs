use hyper::header::{COOKIE, SET_COOKIE};
use hyper::HeaderMap;
use regex::Regex;

use crate::error::WaypointResult;

/// Which message a session id is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSide {
    Request,
    Response,
}

/// Reads a session identifier out of a message
pub trait SessionIdExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `extract` needs the materialised body
    fn needs_body(&self) -> bool {
        false
    }

    fn extract(&self, side: MessageSide, headers: &HeaderMap, body: Option<&[u8]>)
        -> Option<String>;
}

/// Default cookie carrying the session id
pub const DEFAULT_SESSION_COOKIE: &str = "JSESSIONID";

/// Session id from a cookie: `Cookie` on requests, `Set-Cookie` on responses
#[derive(Debug, Clone)]
pub struct CookieSessionIdExtractor {
    cookie: String,
}

impl Default for CookieSessionIdExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_COOKIE)
    }
}

impl CookieSessionIdExtractor {
    pub fn new<S: Into<String>>(cookie: S) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    fn find_in_pairs<'a>(&self, pairs: impl Iterator<Item = &'a str>) -> Option<String> {
        pairs
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| name.trim() == self.cookie)
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
            .filter(|value| !value.is_empty())
    }
}

impl SessionIdExtractor for CookieSessionIdExtractor {
    fn name(&self) -> &str {
        "cookie"
    }

    fn extract(&self, side: MessageSide, headers: &HeaderMap, _body: Option<&[u8]>) -> Option<String> {
        match side {
            MessageSide::Request => headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(|v| self.find_in_pairs(v.split(';'))),
            // Only the leading name=value pair of Set-Cookie is the cookie itself
            MessageSide::Response => headers
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(|v| self.find_in_pairs(v.split(';').take(1))),
        }
    }
}

/// Session id taken from the text of an XML element identified by namespace and local name
///
/// Namespace prefixes are resolved against the declarations in scope at the
/// element, walking the start and end tags that precede it. This is a light
/// scan rather than a full XML parser: markup inside comments or CDATA
/// sections is not recognised as such.
#[derive(Debug, Clone)]
pub struct XmlElementSessionIdExtractor {
    namespace: String,
    local_name: String,
    element: Regex,
    tag: Regex,
    xmlns: Regex,
}

/// Namespace declarations of one element: `(prefix, uri)`, `None` for the default namespace
type Declarations = Vec<(Option<String>, String)>;

impl XmlElementSessionIdExtractor {
    pub fn new<N: Into<String>, L: Into<String>>(namespace: N, local_name: L) -> WaypointResult<Self> {
        let namespace = namespace.into();
        let local_name = local_name.into();
        let name = regex::escape(&local_name);
        let element = Regex::new(&format!(
            r"<(?:([A-Za-z_][\w.\-]*):)?{name}(\s[^>]*)?>\s*([^<]*?)\s*</(?:[A-Za-z_][\w.\-]*:)?{name}\s*>"
        ))?;
        let tag = Regex::new(r"<(/?)[A-Za-z_][^\s>/]*([^>]*?)(/?)>")?;
        let xmlns = Regex::new(r#"xmlns(?::([A-Za-z_][\w.\-]*))?\s*=\s*["']([^"']*)["']"#)?;
        Ok(Self {
            namespace,
            local_name,
            element,
            tag,
            xmlns,
        })
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    fn declarations(&self, attributes: &str) -> Declarations {
        self.xmlns
            .captures_iter(attributes)
            .filter_map(|c| {
                let uri = c.get(2)?.as_str().to_string();
                Some((c.get(1).map(|p| p.as_str().to_string()), uri))
            })
            .collect()
    }

    /// Namespace bound to `prefix` (or the default namespace) for the element
    /// starting at `offset` whose own attributes are `attributes`
    fn namespace_in_scope(
        &self,
        document: &str,
        offset: usize,
        attributes: &str,
        prefix: Option<&str>,
    ) -> Option<String> {
        let mut scopes: Vec<Declarations> = Vec::new();
        for tag in self.tag.captures_iter(&document[..offset]) {
            let closing = tag.get(1).is_some_and(|m| !m.as_str().is_empty());
            let self_closing = tag.get(3).is_some_and(|m| !m.as_str().is_empty());
            if closing {
                scopes.pop();
            } else if !self_closing {
                let attributes = tag.get(2).map_or("", |m| m.as_str());
                scopes.push(self.declarations(attributes));
            }
        }
        scopes.push(self.declarations(attributes));

        scopes.iter().rev().find_map(|declarations| {
            declarations
                .iter()
                .find(|(p, _)| p.as_deref() == prefix)
                .map(|(_, uri)| uri.clone())
        })
    }
}

impl SessionIdExtractor for XmlElementSessionIdExtractor {
    fn name(&self) -> &str {
        "xml_element"
    }

    fn needs_body(&self) -> bool {
        true
    }

    fn extract(&self, _side: MessageSide, _headers: &HeaderMap, body: Option<&[u8]>) -> Option<String> {
        let document = std::str::from_utf8(body?).ok()?;

        self.element.captures_iter(document).find_map(|caps| {
            let start = caps.get(0)?.start();
            let prefix = caps.get(1).map(|m| m.as_str());
            let attributes = caps.get(2).map_or("", |m| m.as_str());
            let namespace = self
                .namespace_in_scope(document, start, attributes, prefix)
                .unwrap_or_default();
            if namespace != self.namespace {
                return None;
            }
            caps.get(3)
                .map(|m| m.as_str().to_string())
                .filter(|id| !id.is_empty())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_cookie_from_request() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; JSESSIONID=abc123; lang=en"),
        );

        let extractor = CookieSessionIdExtractor::default();
        assert_eq!(
            extractor.extract(MessageSide::Request, &headers, None),
            Some("abc123".to_string())
        );
        assert_eq!(extractor.extract(MessageSide::Response, &headers, None), None);
    }

    #[test]
    fn test_cookie_from_set_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("JSESSIONID=xyz; Path=/; HttpOnly"),
        );

        let extractor = CookieSessionIdExtractor::default();
        assert_eq!(
            extractor.extract(MessageSide::Response, &headers, None),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn test_xml_element_with_prefix() {
        let body = br#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:s="urn:session">
  <soap:Header><s:session>sid-42</s:session></soap:Header>
</soap:Envelope>"#;

        let extractor = XmlElementSessionIdExtractor::new("urn:session", "session").unwrap();
        assert_eq!(
            extractor.extract(MessageSide::Request, &HeaderMap::new(), Some(body)),
            Some("sid-42".to_string())
        );
    }

    #[test]
    fn test_xml_element_namespace_must_match() {
        let body = br#"<root xmlns:x="urn:other"><x:session>nope</x:session></root>"#;
        let extractor = XmlElementSessionIdExtractor::new("urn:session", "session").unwrap();
        assert_eq!(
            extractor.extract(MessageSide::Request, &HeaderMap::new(), Some(body)),
            None
        );

        let body = br#"<root xmlns="urn:session"><session>default-ns</session></root>"#;
        assert_eq!(
            extractor.extract(MessageSide::Request, &HeaderMap::new(), Some(body)),
            Some("default-ns".to_string())
        );
    }

    #[test]
    fn test_xml_prefix_resolved_in_scope() {
        let extractor = XmlElementSessionIdExtractor::new("urn:session", "session").unwrap();

        let body = br#"<root xmlns:s="urn:other"><a xmlns:s="urn:session"><s:session>inner</s:session></a><s:session>outer</s:session></root>"#;
        assert_eq!(
            extractor.extract(MessageSide::Request, &HeaderMap::new(), Some(body)),
            Some("inner".to_string())
        );

        // The inner redeclaration goes out of scope with </a>
        let body = br#"<root xmlns:s="urn:session"><a xmlns:s="urn:other"><s:session>inner</s:session></a><br/><s:session>outer</s:session></root>"#;
        assert_eq!(
            extractor.extract(MessageSide::Request, &HeaderMap::new(), Some(body)),
            Some("outer".to_string())
        );

        let body = br#"<?xml version="1.0"?><session xmlns="urn:session">own</session>"#;
        assert_eq!(
            extractor.extract(MessageSide::Request, &HeaderMap::new(), Some(body)),
            Some("own".to_string())
        );
    }
}
