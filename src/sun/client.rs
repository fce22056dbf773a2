use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::auth::SunCredentials;
use super::{ObjectMeta, ObjectRevision, ObjectStore, PutRequest, PutResult, SunError, WhoAmI};

const PUT_TIMEOUT: Duration = Duration::from_secs(45);
const GET_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(45);
const TRANSPORT_ATTEMPTS: usize = 2;
const MAX_TOKEN_BYTES: usize = 256;

/// Blocking HTTP client for the Sun object API. Built per command.
#[derive(Debug, Clone)]
pub struct SunClient {
    base_url: Url,
    token: String,
    http: Client,
}

#[derive(Serialize)]
struct PutBody<'a> {
    payload_base64: String,
    content_type: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_revision: Option<i64>,
}

#[derive(Deserialize)]
struct PutResponse {
    #[serde(default)]
    result: PutResponseResult,
}

#[derive(Default, Deserialize)]
struct PutResponseResult {
    #[serde(default)]
    object: LatestRevision,
    #[serde(default)]
    revision: Revision,
}

#[derive(Default, Deserialize)]
struct LatestRevision {
    #[serde(default)]
    latest_revision: i64,
}

#[derive(Default, Deserialize)]
struct Revision {
    #[serde(default)]
    revision: i64,
}

#[derive(Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    current_revision: Option<i64>,
}

impl SunClient {
    pub fn new(credentials: &SunCredentials) -> Result<Self, SunError> {
        let raw_url = credentials.base_url.as_deref().ok_or_else(|| {
            SunError::InvalidConfig(
                "sun base url is required (run `si sun auth login` or set SI_SUN_BASE_URL)"
                    .to_string(),
            )
        })?;
        let base_url = parse_base_url(raw_url, credentials.allow_insecure_http)?;
        let token = credentials.token.as_deref().ok_or_else(|| {
            SunError::NotAuthenticated(
                "sun token is required (run `si sun auth login` or set SI_SUN_TOKEN)".to_string(),
            )
        })?;
        validate_token(token)?;
        let http = Client::builder()
            .user_agent(concat!("si/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| SunError::Network(err.to_string()))?;
        Ok(Self {
            base_url,
            token: token.to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn whoami(&self) -> Result<WhoAmI, SunError> {
        let url = self.endpoint(&["v1", "auth", "whoami"], &[])?;
        self.get_json(url, GET_TIMEOUT)
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url, SunError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                SunError::InvalidConfig(format!("sun base url {} cannot carry a path", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn object_segments<'a>(kind: &'a str, name: &'a str) -> [&'a str; 4] {
        ["v1", "objects", kind, name]
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url, timeout: Duration) -> Result<T, SunError> {
        let response = self.execute(Method::GET, url, None, timeout)?;
        let bytes = response
            .bytes()
            .map_err(|err| SunError::Network(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| SunError::Decode(err.to_string()))
    }

    /// Sends the request, retrying once on a transport error. HTTP error
    /// statuses are never retried.
    fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Response, SunError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self.build(method.clone(), url.clone(), body, timeout);
            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!(
                        method = %method,
                        path = url.path(),
                        status = status.as_u16(),
                        "sun request"
                    );
                    if status.is_success() {
                        return Ok(response);
                    }
                    return Err(decode_error(response));
                }
                Err(err) if attempt < TRANSPORT_ATTEMPTS => {
                    tracing::debug!(method = %method, path = url.path(), error = %err, "sun transport error, retrying");
                }
                Err(err) => return Err(SunError::Network(err.to_string())),
            }
        }
    }

    fn build(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> RequestBuilder {
        let request = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .timeout(timeout);
        match body {
            Some(body) => request.json(body),
            None => request,
        }
    }
}

impl ObjectStore for SunClient {
    fn lookup_meta(&self, kind: &str, name: &str) -> Result<Option<ObjectMeta>, SunError> {
        let url = self.endpoint(
            &["v1", "objects"],
            &[
                ("kind", kind.to_string()),
                ("name", name.to_string()),
                ("limit", "1".to_string()),
            ],
        )?;
        let items: Items<ObjectMeta> = self.get_json(url, LIST_TIMEOUT)?;
        Ok(items
            .items
            .into_iter()
            .find(|item| item.name.is_empty() || item.name == name))
    }

    fn get_payload(&self, kind: &str, name: &str) -> Result<Vec<u8>, SunError> {
        let [v1, objects, kind, name] = Self::object_segments(kind, name);
        let url = self.endpoint(&[v1, objects, kind, name, "payload"], &[])?;
        let response = self.execute(Method::GET, url, None, GET_TIMEOUT)?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SunError::Network(err.to_string()))
    }

    fn put_object(&self, request: PutRequest<'_>) -> Result<PutResult, SunError> {
        let url = self.endpoint(&Self::object_segments(request.kind, request.name), &[])?;
        let body = serde_json::to_value(PutBody {
            payload_base64: STANDARD.encode(request.payload),
            content_type: request.content_type.trim(),
            metadata: &request.metadata,
            expected_revision: request.expected_revision,
        })
        .map_err(|err| SunError::Decode(err.to_string()))?;
        let response = self.execute(Method::PUT, url, Some(&body), PUT_TIMEOUT)?;
        let bytes = response
            .bytes()
            .map_err(|err| SunError::Network(err.to_string()))?;
        let parsed: PutResponse =
            serde_json::from_slice(&bytes).map_err(|err| SunError::Decode(err.to_string()))?;
        let latest_revision = parsed.result.object.latest_revision;
        let revision = match parsed.result.revision.revision {
            0 => latest_revision,
            revision => revision,
        };
        Ok(PutResult {
            latest_revision,
            revision,
        })
    }

    fn list_objects(&self, kind: &str, limit: usize) -> Result<Vec<ObjectMeta>, SunError> {
        let mut query = vec![("kind", kind.to_string())];
        if limit > 0 {
            query.push(("limit", limit.to_string()));
        }
        let url = self.endpoint(&["v1", "objects"], &query)?;
        let items: Items<ObjectMeta> = self.get_json(url, LIST_TIMEOUT)?;
        Ok(items.items)
    }

    fn list_revisions(
        &self,
        kind: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRevision>, SunError> {
        let query = if limit > 0 {
            vec![("limit", limit.to_string())]
        } else {
            Vec::new()
        };
        let [v1, objects, kind, name] = Self::object_segments(kind, name);
        let url = self.endpoint(&[v1, objects, kind, name, "revisions"], &query)?;
        let items: Items<ObjectRevision> = self.get_json(url, LIST_TIMEOUT)?;
        Ok(items.items)
    }
}

fn decode_error(response: Response) -> SunError {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    let parsed = serde_json::from_str::<ErrorBody>(&body).unwrap_or_default();
    let message = if !parsed.error.trim().is_empty() {
        parsed.error.trim().to_string()
    } else if !body.trim().is_empty() {
        body.trim().to_string()
    } else {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_ascii_lowercase()
    };
    SunError::from_status(status.as_u16(), message, parsed.current_revision)
}

/// Trims a trailing `/` and enforces https for non-loopback hosts.
pub fn parse_base_url(raw: &str, allow_insecure_http: bool) -> Result<Url, SunError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .map_err(|_| SunError::InvalidConfig(format!("invalid sun base url {trimmed:?}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if allow_insecure_http || is_loopback(&url) => Ok(url),
        "http" => Err(SunError::InvalidConfig(
            "sun base url must use https for non-local hosts (set SI_SUN_ALLOW_INSECURE_HTTP=1 to override)"
                .to_string(),
        )),
        scheme => Err(SunError::InvalidConfig(format!(
            "unsupported sun base url scheme {scheme:?}"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(
        url.host_str().map(|host| host.to_ascii_lowercase()).as_deref(),
        Some("localhost" | "127.0.0.1" | "::1" | "[::1]")
    )
}

pub fn validate_token(token: &str) -> Result<(), SunError> {
    if token.is_empty() {
        return Err(SunError::NotAuthenticated(
            "sun token is required (run `si sun auth login` or set SI_SUN_TOKEN)".to_string(),
        ));
    }
    if token.len() > MAX_TOKEN_BYTES {
        return Err(SunError::InvalidConfig("sun token is too long".to_string()));
    }
    if token.chars().any(|ch| ch <= ' ' || ch == '\u{7f}') {
        return Err(SunError::InvalidConfig(
            "sun token must not contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_base_url, validate_token, SunClient};
    use crate::sun::auth::SunCredentials;
    use crate::sun::SunError;

    fn credentials(url: &str, token: &str) -> SunCredentials {
        SunCredentials {
            base_url: Some(url.to_string()),
            token: Some(token.to_string()),
            allow_insecure_http: false,
        }
    }

    #[test]
    fn base_url_requires_https_except_for_loopback() {
        assert!(parse_base_url("https://sun.example.com/", false).is_ok());
        assert!(parse_base_url("http://localhost:8080", false).is_ok());
        assert!(parse_base_url("http://127.0.0.1:8080", false).is_ok());
        assert!(parse_base_url("http://[::1]:8080", false).is_ok());
        assert!(matches!(
            parse_base_url("http://sun.example.com", false),
            Err(SunError::InvalidConfig(_))
        ));
        assert!(parse_base_url("http://sun.example.com", true).is_ok());
        assert!(parse_base_url("ftp://sun.example.com", true).is_err());
    }

    #[test]
    fn token_rules_reject_whitespace_and_oversize_values() {
        assert!(validate_token("abc.def-123").is_ok());
        assert!(matches!(
            validate_token(""),
            Err(SunError::NotAuthenticated(_))
        ));
        assert!(validate_token("has space").is_err());
        assert!(validate_token("tab\there").is_err());
        assert!(validate_token(&"x".repeat(257)).is_err());
    }

    #[test]
    fn missing_token_is_not_authenticated() {
        let creds = SunCredentials {
            token: None,
            ..credentials("https://sun.example.com", "t")
        };
        let err = SunClient::new(&creds).expect_err("token is required");
        assert_eq!(err.kind(), crate::error::ErrKind::NotAuthenticated);
    }

    #[test]
    fn object_names_with_slashes_are_escaped_as_one_segment() {
        let client = SunClient::new(&credentials("https://sun.example.com/api/", "t"))
            .expect("client should build");
        let [v1, objects, kind, name] = SunClient::object_segments("dotenv_scope", "kv/alpha");
        let url = client
            .endpoint(&[v1, objects, kind, name, "payload"], &[])
            .expect("endpoint should build");
        assert_eq!(
            url.as_str(),
            "https://sun.example.com/api/v1/objects/dotenv_scope/kv%2Falpha/payload"
        );

        let url = client
            .endpoint(
                &["v1", "objects"],
                &[("kind", "dyad_taskboard".to_string()), ("limit", "1".to_string())],
            )
            .expect("endpoint should build");
        assert_eq!(
            url.as_str(),
            "https://sun.example.com/api/v1/objects?kind=dyad_taskboard&limit=1"
        );
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        use crate::error::ErrKind;
        let cases = [
            (401, ErrKind::Unauthorized),
            (404, ErrKind::NotFound),
            (409, ErrKind::RevisionConflict),
            (503, ErrKind::Server),
            (400, ErrKind::InvalidArgument),
        ];
        for (status, kind) in cases {
            assert_eq!(
                SunError::from_status(status, "boom".to_string(), None).kind(),
                kind
            );
        }
        assert_eq!(
            SunError::from_status(409, "revision mismatch".to_string(), Some(4)).to_string(),
            "sun: revision mismatch (status 409)"
        );
    }
}
