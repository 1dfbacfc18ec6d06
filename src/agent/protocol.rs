//! Request description in, decision out.

use std::collections::HashMap;

/// An inbound request as seen by the agent.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    /// Header name -> values. Lookups are case-insensitive.
    pub headers: HashMap<String, Vec<String>>,
}

impl AgentRequest {
    pub fn new(method: &str, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            method: method.to_uppercase(),
            path,
            query,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }

    /// Decoded query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Path plus query, as the browser requested it.
    pub fn path_and_query(&self) -> String {
        match self.query {
            Some(ref q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

/// Header mutation applied to the upstream request or the client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Set { name: String, value: String },
    Add { name: String, value: String },
    Remove { name: String },
}

/// What happens to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward upstream.
    Allow,
    /// Answer directly with this status and body.
    Block { status: u16, body: Option<String> },
}

/// Tags and reason codes for audit logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditMetadata {
    pub tags: Vec<String>,
    pub reason_codes: Vec<String>,
}

/// Agent decision plus header operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub decision: Decision,
    pub request_headers: Vec<HeaderOp>,
    pub response_headers: Vec<HeaderOp>,
    pub audit: AuditMetadata,
}

impl AgentResponse {
    pub fn default_allow() -> Self {
        Self {
            decision: Decision::Allow,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            audit: AuditMetadata::default(),
        }
    }

    pub fn block(status: u16, body: Option<String>) -> Self {
        Self {
            decision: Decision::Block { status, body },
            ..Self::default_allow()
        }
    }

    /// 302 to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::block(302, None).add_response_header(HeaderOp::Set {
            name: "Location".to_string(),
            value: location.into(),
        })
    }

    pub fn add_request_header(mut self, op: HeaderOp) -> Self {
        self.request_headers.push(op);
        self
    }

    pub fn add_response_header(mut self, op: HeaderOp) -> Self {
        self.response_headers.push(op);
        self
    }

    pub fn with_audit(mut self, audit: AuditMetadata) -> Self {
        self.audit = audit;
        self
    }

    pub fn status(&self) -> Option<u16> {
        match self.decision {
            Decision::Allow => None,
            Decision::Block { status, .. } => Some(status),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }

    /// Value of a `Set`/`Add` response header op.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        find_header(&self.response_headers, name)
    }

    /// Value of a `Set`/`Add` upstream request header op.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        find_header(&self.request_headers, name)
    }
}

fn find_header<'a>(ops: &'a [HeaderOp], name: &str) -> Option<&'a str> {
    ops.iter().find_map(|op| match op {
        HeaderOp::Set { name: n, value } | HeaderOp::Add { name: n, value }
            if n.eq_ignore_ascii_case(name) =>
        {
            Some(value.as_str())
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let req = AgentRequest::new("get", "/weather?days=5&returnUrl=%2Fhome")
            .with_header("Cookie", "a=b");

        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/weather");
        assert_eq!(req.query_param("returnUrl").as_deref(), Some("/home"));
        assert_eq!(req.header("cookie"), Some("a=b"));
        assert_eq!(req.path_and_query(), "/weather?days=5&returnUrl=%2Fhome");
    }

    #[test]
    fn test_response_builders() {
        let response = AgentResponse::redirect("/login").with_audit(AuditMetadata {
            tags: vec!["auth".to_string()],
            ..Default::default()
        });

        assert_eq!(response.status(), Some(302));
        assert_eq!(response.response_header("location"), Some("/login"));
        assert!(!response.is_allow());

        let allow = AgentResponse::default_allow().add_request_header(HeaderOp::Set {
            name: "X-User-Id".to_string(),
            value: "user-1".to_string(),
        });
        assert!(allow.is_allow());
        assert_eq!(allow.request_header("x-user-id"), Some("user-1"));
    }
}
