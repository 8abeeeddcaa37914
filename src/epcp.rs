//! EPCP control-protocol publishing
//!
//! Outbound data frames reach subscribers by publishing to named channels on
//! the GRIP proxy's control endpoint: an HTTP POST of publish items in the
//! EPCP wire format, authorized with a short-lived HS256 bearer token when
//! the configured GRIP URI carries claim credentials
//! (`?iss=<realm>&key=base64:<secret>`).

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Lifetime of a control-endpoint bearer token.
const TOKEN_TTL_SECONDS: i64 = 3600;

/// A parsed GRIP control URI.
#[derive(Debug, Clone, PartialEq)]
pub struct GripUri {
    /// Control endpoint base URL, credentials stripped.
    pub control_uri: String,
    /// JWT claim issuer, when the URI carried `iss`.
    pub iss: Option<String>,
    /// Signing key, when the URI carried `key` (`base64:` prefix decoded).
    pub key: Option<Vec<u8>>,
}

/// Parse a GRIP URI of the form `http://host:port/path?iss=realm&key=base64:...`.
///
/// Query parameters other than `iss` and `key` are preserved on the control
/// URI.
pub fn parse_grip_uri(uri: &str) -> Result<GripUri> {
    let (base, query) = match uri.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (uri, None),
    };
    if base.is_empty() {
        return Err(Error::InvalidRequest("empty GRIP URI".into()));
    }

    let mut iss = None;
    let mut key = None;
    let mut passthrough = Vec::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        match name {
            "iss" => {
                let decoded = urlencoding::decode(value).map_err(|e| {
                    Error::InvalidRequest(format!("GRIP URI is not UTF-8: {e}"))
                })?;
                iss = Some(decoded.into_owned());
            }
            "key" => {
                let decoded = urlencoding::decode(value).map_err(|e| {
                    Error::InvalidRequest(format!("GRIP URI is not UTF-8: {e}"))
                })?;
                let bytes = match decoded.strip_prefix("base64:") {
                    Some(encoded) => BASE64.decode(encoded).map_err(|e| {
                        Error::InvalidRequest(format!("invalid base64 GRIP key: {e}"))
                    })?,
                    None => decoded.into_owned().into_bytes(),
                };
                key = Some(bytes);
            }
            _ => passthrough.push(pair.to_string()),
        }
    }

    let control_uri = if passthrough.is_empty() {
        base.trim_end_matches('/').to_string()
    } else {
        format!("{}?{}", base.trim_end_matches('/'), passthrough.join("&"))
    };
    Ok(GripUri {
        control_uri,
        iss,
        key,
    })
}

#[derive(Serialize)]
struct Claims {
    iss: String,
    exp: i64,
}

/// Publishes one message to one channel on the control protocol.
///
/// The trait seam lets tests observe publishes without a network; the
/// production implementation is [`EpcpPublisher`].
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// EPCP publisher addressing a GRIP control endpoint over HTTP.
pub struct EpcpPublisher {
    uri: GripUri,
    client: reqwest::Client,
}

impl EpcpPublisher {
    pub fn new(grip_uri: &str) -> Result<Self> {
        Ok(Self {
            uri: parse_grip_uri(grip_uri)?,
            client: reqwest::Client::new(),
        })
    }

    pub fn control_uri(&self) -> &str {
        &self.uri.control_uri
    }

    fn publish_url(&self) -> String {
        match self.uri.control_uri.split_once('?') {
            Some((base, query)) => format!("{base}/publish/?{query}"),
            None => format!("{}/publish/", self.uri.control_uri),
        }
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        let (Some(iss), Some(key)) = (&self.uri.iss, &self.uri.key) else {
            return Ok(None);
        };
        let claims = Claims {
            iss: iss.clone(),
            exp: Utc::now().timestamp() + TOKEN_TTL_SECONDS,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(key),
        )
        .map_err(|e| Error::Publish(format!("could not sign control token: {e}")))?;
        Ok(Some(token))
    }
}

/// EPCP item body for a WebSocket message publish.
pub fn publish_body(channel: &str, message: &str) -> Value {
    serde_json::json!({
        "items": [{
            "channel": channel,
            "formats": {
                "ws-message": { "content": message },
            },
        }],
    })
}

#[async_trait]
impl ChannelPublisher for EpcpPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut request = self
            .client
            .post(self.publish_url())
            .json(&publish_body(channel, message));
        if let Some(token) = self.bearer_token()? {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Publish(format!(
                "control endpoint returned {status}: {body}"
            )));
        }
        debug!(channel, "published message to control endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use serde::Deserialize;

    #[test]
    fn test_parse_plain_uri() {
        let uri = parse_grip_uri("http://localhost:5561").unwrap();
        assert_eq!(uri.control_uri, "http://localhost:5561");
        assert_eq!(uri.iss, None);
        assert_eq!(uri.key, None);
    }

    #[test]
    fn test_parse_uri_with_credentials() {
        let encoded_key = BASE64.encode(b"changeme");
        let uri =
            parse_grip_uri(&format!("http://localhost:5561?iss=realm&key=base64:{encoded_key}"))
                .unwrap();
        assert_eq!(uri.control_uri, "http://localhost:5561");
        assert_eq!(uri.iss.as_deref(), Some("realm"));
        assert_eq!(uri.key.as_deref(), Some(b"changeme".as_ref()));
    }

    #[test]
    fn test_parse_uri_with_raw_key() {
        let uri = parse_grip_uri("http://localhost:5561?key=secret").unwrap();
        assert_eq!(uri.key.as_deref(), Some(b"secret".as_ref()));
    }

    #[test]
    fn test_parse_uri_preserves_other_params() {
        let uri = parse_grip_uri("http://localhost:5561?iss=realm&zone=eu").unwrap();
        assert_eq!(uri.control_uri, "http://localhost:5561?zone=eu");
        assert_eq!(uri.iss.as_deref(), Some("realm"));
    }

    #[test]
    fn test_parse_uri_strips_trailing_slash() {
        let uri = parse_grip_uri("http://localhost:5561/").unwrap();
        assert_eq!(uri.control_uri, "http://localhost:5561");
    }

    #[test]
    fn test_parse_rejects_empty_uri() {
        assert!(parse_grip_uri("").is_err());
        assert!(parse_grip_uri("?iss=realm").is_err());
    }

    #[test]
    fn test_parse_uri_decodes_percent_escapes() {
        let uri = parse_grip_uri("http://localhost:5561?iss=my%20realm").unwrap();
        assert_eq!(uri.iss.as_deref(), Some("my realm"));
    }

    #[test]
    fn test_publish_url() {
        let publisher = EpcpPublisher::new("http://localhost:5561?iss=realm").unwrap();
        assert_eq!(publisher.publish_url(), "http://localhost:5561/publish/");

        let publisher = EpcpPublisher::new("http://localhost:5561?zone=eu").unwrap();
        assert_eq!(publisher.publish_url(), "http://localhost:5561/publish/?zone=eu");
    }

    #[test]
    fn test_publish_body_wire_shape() {
        let body = publish_body("postAdded?subscription.operation.id=op1", "{\"type\":\"data\"}");
        assert_eq!(
            body["items"][0]["channel"],
            "postAdded?subscription.operation.id=op1"
        );
        assert_eq!(
            body["items"][0]["formats"]["ws-message"]["content"],
            "{\"type\":\"data\"}"
        );
    }

    #[test]
    fn test_bearer_token_signed_with_uri_key() {
        #[derive(Debug, Deserialize)]
        struct TokenClaims {
            iss: String,
        }

        let encoded_key = BASE64.encode(b"changeme");
        let publisher = EpcpPublisher::new(&format!(
            "http://localhost:5561?iss=realm&key=base64:{encoded_key}"
        ))
        .unwrap();

        let token = publisher.bearer_token().unwrap().unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let decoded = decode::<TokenClaims>(
            &token,
            &DecodingKey::from_secret(b"changeme"),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.iss, "realm");
    }

    #[test]
    fn test_no_token_without_credentials() {
        let publisher = EpcpPublisher::new("http://localhost:5561").unwrap();
        assert!(publisher.bearer_token().unwrap().is_none());
    }
}
