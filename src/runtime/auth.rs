//! Token file (`Token.yml`) and the login handshake that yields a bearer.

use serde::{Deserialize, Serialize};

use std::path::Path;
use std::time::Duration;

use crate::{BearerToken, KeyPath, RestFuzzError, RestFuzzResult, TokenPlacement};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Login endpoint.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    /// Key path of the bearer in the login response.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub bearer: String,
    #[serde(default, rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Use `bearer` as-is without logging in.
    #[serde(default)]
    pub hardcode: bool,
    /// `header` (default) or `query`.
    #[serde(default, rename = "in")]
    pub placement: String,
}

impl TokenConfig {
    pub fn load(path: &Path) -> RestFuzzResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> RestFuzzResult<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn template() -> Self {
        Self {
            method: "POST".to_string(),
            content_type: "application/json".to_string(),
            placement: "header".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RestFuzzResult<()> {
        if self.url.trim().is_empty() && self.bearer.trim().is_empty() {
            return Err(RestFuzzError::Config(
                "token file needs a login url or a bearer".to_string(),
            ));
        }
        Ok(())
    }

    pub fn token_placement(&self) -> TokenPlacement {
        if self.placement.eq_ignore_ascii_case("query") {
            TokenPlacement::Query
        } else {
            TokenPlacement::Header
        }
    }

    pub fn bearer_token(&self, timeout: Duration) -> RestFuzzResult<BearerToken> {
        Ok(BearerToken {
            value: self.fetch_bearer(timeout)?,
            placement: self.token_placement(),
        })
    }

    /// Runs the login request, or returns the configured bearer when it is
    /// hardcoded or no login url is set.
    pub fn fetch_bearer(&self, timeout: Duration) -> RestFuzzResult<String> {
        if self.hardcode || self.url.trim().is_empty() {
            return Ok(self.bearer.clone());
        }

        let method = if self.method.trim().is_empty() {
            "POST".to_string()
        } else {
            self.method.trim().to_ascii_uppercase()
        };
        let content_type = if self.content_type.is_empty() {
            "application/json"
        } else {
            self.content_type.as_str()
        };
        let payload = match &self.body {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        };

        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let req = agent.request(&method, &self.url).set("Content-Type", content_type);
        let result = match &payload {
            Some(body) => req.send_string(body),
            None => req.call(),
        };
        let response = match result {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                return Err(RestFuzzError::Auth(format!("login {} returned status {code}", self.url)));
            }
            Err(err) => return Err(RestFuzzError::Auth(format!("login {} failed: {err}", self.url))),
        };
        if response.status() != 200 {
            return Err(RestFuzzError::Auth(format!(
                "login {} returned status {}",
                self.url,
                response.status()
            )));
        }
        let text = response
            .into_string()
            .map_err(|e| RestFuzzError::Auth(format!("login {} body read failed: {e}", self.url)))?;
        Ok(extract_bearer(&text, &self.key))
    }
}

/// Bearer at `key` in a JSON login response, else the raw text without quotes.
pub fn extract_bearer(text: &str, key: &str) -> String {
    if !key.is_empty() {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
            match KeyPath::parse(key).lookup(&json) {
                Some(serde_json::Value::String(s)) => return s.clone(),
                Some(serde_json::Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }
    text.replace('"', "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};

    /// Answers a single request with `status` and `body`, after reading the
    /// whole request.
    fn serve_once(status: &str, body: &'static str) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind http listener");
        let addr = listener.local_addr().expect("local addr");
        let status = status.to_string();
        std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap_or(0);
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&req).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if req.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{addr}/login")
    }

    #[test]
    fn hardcoded_bearer_skips_login() {
        let cfg = TokenConfig {
            url: "http://127.0.0.1:1/never".to_string(),
            bearer: "static".to_string(),
            hardcode: true,
            ..TokenConfig::template()
        };
        assert_eq!(cfg.fetch_bearer(Duration::from_millis(200)).expect("bearer"), "static");
    }

    #[test]
    fn login_extracts_bearer_at_key() {
        let url = serve_once("200 OK", r#"{"data":{"token":"abc"}}"#);
        let cfg = TokenConfig {
            url,
            key: "data{token}".to_string(),
            body: serde_json::json!({"user": "u", "password": "p"}),
            placement: "query".to_string(),
            ..TokenConfig::template()
        };
        let token = cfg.bearer_token(Duration::from_secs(5)).expect("token");
        assert_eq!(token.value, "abc");
        assert_eq!(token.placement, TokenPlacement::Query);
    }

    #[test]
    fn non_200_login_is_an_auth_error() {
        let url = serve_once("201 Created", r#"{"token":"abc"}"#);
        let cfg = TokenConfig {
            url,
            key: "token".to_string(),
            ..TokenConfig::template()
        };
        let err = cfg.fetch_bearer(Duration::from_secs(5)).expect_err("must fail");
        assert!(matches!(err, RestFuzzError::Auth(_)));
    }

    #[test]
    fn raw_response_fallback_strips_quotes() {
        assert_eq!(extract_bearer("\"raw-token\"\n", "token"), "raw-token");
        assert_eq!(extract_bearer(r#"{"n": 5}"#, "n"), "5");
    }

    #[test]
    fn template_needs_url_or_bearer() {
        assert!(TokenConfig::template().validate().is_err());
        let yaml = "url: http://api/login\nmethod: POST\ntype: application/json\nin: header\nbody: { user: a }\n";
        let cfg: TokenConfig = serde_yaml::from_str(yaml).expect("yaml");
        cfg.validate().expect("valid");
        assert_eq!(cfg.token_placement(), TokenPlacement::Header);
        assert_eq!(cfg.body, serde_json::json!({"user": "a"}));
    }
}
