//! Rendering call nodes into HTTP requests and dispatching them.

use url::Url;

use std::fmt;
use std::io::Read as _;
use std::time::Duration;

use crate::{CallNode, Location, Method, Value};

/// Status recorded when a request never produced a response.
pub const TRANSPORT_FAILURE: u16 = 599;

const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPlacement {
    #[default]
    Header,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: String,
    pub placement: TokenPlacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl fmt::Display for RenderedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.method, self.url)?;
        for (k, v) in &self.headers {
            writeln!(f, "{k}: {v}")?;
        }
        if let Some(body) = &self.body {
            writeln!(f)?;
            f.write_str(&String::from_utf8_lossy(body))?;
        }
        Ok(())
    }
}

impl RenderedRequest {
    /// The request as text with the body bytes kept exactly as sent.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {}\n", self.method, self.url).into_bytes();
        for (k, v) in &self.headers {
            out.extend_from_slice(format!("{k}: {v}\n").as_bytes());
        }
        if let Some(body) = &self.body {
            out.push(b'\n');
            out.extend_from_slice(body);
        }
        out
    }
}

fn escape_path_segment(raw: &[u8]) -> String {
    url::form_urlencoded::byte_serialize(raw)
        .collect::<String>()
        .replace('+', "%20")
}

fn push_query_pair(query: &mut String, name: &str, raw: &[u8]) {
    if !query.is_empty() {
        query.push('&');
    }
    query.extend(url::form_urlencoded::byte_serialize(name.as_bytes()));
    query.push('=');
    query.extend(url::form_urlencoded::byte_serialize(raw));
}

/// Header and cookie values have to be strings on the wire.
fn text(value: &Value, join_lists: bool) -> String {
    String::from_utf8_lossy(&value.render(join_lists)).into_owned()
}

/// Builds the outgoing request for a node against `base`.
pub fn render_request(
    node: &CallNode,
    base: &str,
    token: Option<&BearerToken>,
) -> Result<RenderedRequest, url::ParseError> {
    let mut path = node.path.clone();
    for request in node.requests.iter().filter(|r| r.location == Location::Path) {
        for (name, value) in request.fields() {
            path = path.replace(&format!("{{{name}}}"), &escape_path_segment(&value.render(false)));
        }
    }

    let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))?;
    let mut headers = Vec::new();
    let mut cookies = Vec::new();
    let mut body = None;
    let mut query = url.query().unwrap_or_default().to_string();
    for request in &node.requests {
        match &request.location {
            Location::Query => {
                for (name, value) in request.fields() {
                    push_query_pair(&mut query, name, &value.render(true));
                }
            }
            Location::Header => {
                for (name, value) in request.fields() {
                    headers.push((name.clone(), text(value, true)));
                }
            }
            Location::Cookie => {
                for (name, value) in request.fields() {
                    cookies.push(format!("{name}={}", text(value, false)));
                }
            }
            Location::Body(content_type) if body.is_none() && request.location.is_json_body() => {
                headers.push(("Content-Type".to_string(), content_type.clone()));
                body = Some(request.value.to_wire_json());
            }
            Location::Path | Location::Body(_) => {}
        }
    }
    let bearer = token.filter(|t| !t.value.is_empty());
    if let Some(BearerToken {
        value,
        placement: TokenPlacement::Query,
    }) = bearer
    {
        push_query_pair(&mut query, "Authorization", value.as_bytes());
    }
    url.set_query(if query.is_empty() { None } else { Some(query.as_str()) });
    if !cookies.is_empty() {
        headers.push(("Cookie".to_string(), cookies.join("; ")));
    }
    if let Some(BearerToken {
        value,
        placement: TokenPlacement::Header,
    }) = bearer
    {
        headers.push(("Authorization".to_string(), format!("Bearer {value}")));
    }

    Ok(RenderedRequest {
        method: node.method,
        url: url.to_string(),
        headers,
        body,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Set when the request failed before a response arrived.
    pub error: Option<String>,
}

impl Outcome {
    pub fn failure(err: impl fmt::Display) -> Self {
        let msg = err.to_string();
        Self {
            status: TRANSPORT_FAILURE,
            content_type: String::new(),
            body: msg.clone().into_bytes(),
            error: Some(msg),
        }
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status) && self.status != TRANSPORT_FAILURE
    }
}

pub trait Transport {
    /// Sends one request and always yields an outcome; failures become status 599.
    fn send(&mut self, request: &RenderedRequest) -> Outcome;
}

pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, request: &RenderedRequest) -> Outcome {
        let mut req = self.agent.request(request.method.as_str(), &request.url);
        for (k, v) in &request.headers {
            req = req.set(k, v);
        }
        let result = match &request.body {
            Some(payload) => req.send_bytes(payload),
            None => req.call(),
        };
        let response = match result {
            Ok(resp) => resp,
            Err(ureq::Error::Status(_, resp)) => resp,
            Err(err) => return Outcome::failure(format!("{} {}: {err}", request.method, request.url)),
        };
        let status = response.status();
        let content_type = response.header("Content-Type").unwrap_or_default().to_string();
        let mut body = Vec::new();
        if let Err(err) = response.into_reader().take(MAX_RESPONSE_BYTES).read_to_end(&mut body) {
            return Outcome::failure(format!("{} {}: body read failed: {err}", request.method, request.url));
        }
        Outcome {
            status,
            content_type,
            body,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use std::collections::BTreeMap;

    fn fields(pairs: Vec<(&str, Value)>) -> Value {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    fn node() -> CallNode {
        CallNode {
            group: 1,
            path: "/pets/{petId}".to_string(),
            method: Method::Put,
            requests: vec![
                Request {
                    location: Location::Path,
                    value: fields(vec![("petId", Value::text("a b/c"))]),
                },
                Request {
                    location: Location::Query,
                    value: fields(vec![("tags", Value::List(vec![Value::text("x"), Value::text("y")]))]),
                },
                Request {
                    location: Location::Header,
                    value: fields(vec![("X-Trace", Value::Number(7.0))]),
                },
                Request {
                    location: Location::Cookie,
                    value: fields(vec![("session", Value::text("s1"))]),
                },
                Request {
                    location: Location::Body("application/json".to_string()),
                    value: fields(vec![("name", Value::text("rex")), ("age", Value::Number(3.0))]),
                },
            ],
        }
    }

    #[test]
    fn renders_every_location() {
        let r = render_request(&node(), "http://localhost:8080/v1/", None).expect("render");
        assert_eq!(r.method, Method::Put);
        assert_eq!(r.url, "http://localhost:8080/v1/pets/a%20b%2Fc?tags=x%2C+y");
        assert!(r.headers.contains(&("X-Trace".to_string(), "7".to_string())));
        assert!(r.headers.contains(&("Cookie".to_string(), "session=s1".to_string())));
        assert!(r.headers.contains(&("Content-Type".to_string(), "application/json".to_string())));
        let body: serde_json::Value = serde_json::from_slice(r.body.as_deref().expect("body")).expect("json");
        assert_eq!(body, serde_json::json!({"name": "rex", "age": 3}));
    }

    #[test]
    fn bearer_token_placement() {
        let header = BearerToken {
            value: "tok".to_string(),
            placement: TokenPlacement::Header,
        };
        let r = render_request(&node(), "http://h", Some(&header)).expect("render");
        assert!(r.headers.contains(&("Authorization".to_string(), "Bearer tok".to_string())));

        let query = BearerToken {
            value: "tok".to_string(),
            placement: TokenPlacement::Query,
        };
        let r = render_request(&node(), "http://h", Some(&query)).expect("render");
        assert!(r.url.ends_with("&Authorization=tok"));
        assert!(!r.headers.iter().any(|(k, _)| k == "Authorization"));
    }

    #[test]
    fn empty_bearer_is_not_injected() {
        for placement in [TokenPlacement::Header, TokenPlacement::Query] {
            let token = BearerToken {
                value: String::new(),
                placement,
            };
            let r = render_request(&node(), "http://h", Some(&token)).expect("render");
            assert!(!r.headers.iter().any(|(k, _)| k == "Authorization"));
            assert!(!r.url.contains("Authorization"));
        }
    }

    #[test]
    fn non_utf8_leaves_reach_the_wire_unchanged() {
        let raw = vec![b'a', 0xff, 0x80, b'b'];
        let n = CallNode {
            group: 1,
            path: "/p".to_string(),
            method: Method::Post,
            requests: vec![
                Request {
                    location: Location::Query,
                    value: fields(vec![("q", Value::from_bytes(&raw))]),
                },
                Request {
                    location: Location::Body("application/json".to_string()),
                    value: fields(vec![("blob", Value::from_bytes(&raw))]),
                },
            ],
        };
        let r = render_request(&n, "http://h", None).expect("render");
        assert_eq!(r.url, "http://h/p?q=a%FF%80b");

        let mut expected = b"{\"blob\":\"".to_vec();
        expected.extend_from_slice(&raw);
        expected.extend_from_slice(b"\"}");
        assert_eq!(r.body.as_deref(), Some(expected.as_slice()));
        assert!(r.to_bytes().ends_with(&expected));
    }

    #[test]
    fn raw_body_bytes_are_sent_as_is() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            use std::io::{Read as _, Write as _};
            let (mut stream, _) = listener.accept().expect("accept");
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.ends_with(&[0xff, 0x80, b'}']) {
                let n = stream.read(&mut buf).expect("read");
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .expect("write");
            seen
        });

        let mut payload = b"{\"k\":".to_vec();
        payload.extend_from_slice(&[0xff, 0x80, b'}']);
        let req = RenderedRequest {
            method: Method::Post,
            url: format!("http://{addr}/raw"),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(payload.clone()),
        };
        let out = HttpTransport::new(Duration::from_secs(5)).send(&req);
        assert_eq!(out.status, 200);
        let seen = server.join().expect("server thread");
        assert!(seen.ends_with(&payload));
    }

    #[test]
    fn no_query_leaves_url_bare() {
        let n = CallNode {
            group: 1,
            path: "/health".to_string(),
            method: Method::Get,
            requests: vec![Request {
                location: Location::Query,
                value: Value::Object(BTreeMap::new()),
            }],
        };
        let r = render_request(&n, "http://h", None).expect("render");
        assert_eq!(r.url, "http://h/health");
        assert_eq!(r.body, None);
        assert!(r.to_string().starts_with("GET http://h/health\n"));
    }

    #[test]
    fn malformed_base_is_an_error() {
        assert!(render_request(&node(), "not a url", None).is_err());
    }

    #[test]
    fn unreachable_host_becomes_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let req = RenderedRequest {
            method: Method::Get,
            url: format!("http://{addr}/"),
            headers: Vec::new(),
            body: None,
        };
        let out = HttpTransport::new(Duration::from_millis(500)).send(&req);
        assert_eq!(out.status, TRANSPORT_FAILURE);
        assert!(out.error.is_some());
        assert!(!out.is_server_error());
    }
}
