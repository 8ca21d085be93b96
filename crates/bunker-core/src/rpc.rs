//! RPC wire types shared by both planes.
//!
//! A request is `{id, method, params[]}`, a response `{id, result, error?}`.
//! Both travel as the encrypted content of a transport envelope; the sender
//! pubkey of the envelope authenticates the caller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A request as decrypted off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl RpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            id: uuid_like(),
            method: method.into(),
            params,
        }
    }

    /// Positional param accessor; empty strings count as absent.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str).filter(|p| !p.is_empty())
    }
}

// Request ids only need uniqueness within a session; 16 random bytes of hex.
fn uuid_like() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    hex::encode(bytes)
}

/// A response as sent back over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    #[must_use]
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: impl Into<String>, failure: &RpcFailure) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(failure.to_string()),
        }
    }

    /// The out-of-band `auth_url` reply: carries the approval URL without
    /// resolving the request.
    #[must_use]
    pub fn auth_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some("auth_url".to_owned()),
            error: Some(url.into()),
        }
    }
}

/// The RPC methods the user plane accepts, plus the wildcard used in ACL
/// rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    SignEvent,
    Encrypt,
    Decrypt,
    Ping,
    CreateAccount,
    /// ACL wildcard; never a wire method.
    Wildcard,
}

impl Method {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SignEvent => "sign_event",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Ping => "ping",
            Self::CreateAccount => "create_account",
            Self::Wildcard => "*",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RpcFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Self::Connect),
            "sign_event" => Ok(Self::SignEvent),
            "encrypt" => Ok(Self::Encrypt),
            "decrypt" => Ok(Self::Decrypt),
            "ping" => Ok(Self::Ping),
            "create_account" => Ok(Self::CreateAccount),
            "*" => Ok(Self::Wildcard),
            other => Err(RpcFailure::bad_request(format!("unknown method: {other}"))),
        }
    }
}

/// Error kinds surfaced in RPC responses.
///
/// Every failure inside a handler is caught at the dispatch boundary and
/// serialized as `<kind>: <message>` in the response `error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    BadRequest,
    Unauthorized,
    KeyLocked,
    BadPassphraseOrCorrupt,
    NotFound,
    AlreadyRedeemed,
    Expired,
    Denied,
    TimedOut,
    Conflict,
    Internal,
}

impl RpcErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::KeyLocked => "key_locked",
            Self::BadPassphraseOrCorrupt => "bad_passphrase",
            Self::NotFound => "not_found",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::Expired => "expired",
            Self::Denied => "denied",
            Self::TimedOut => "timed_out",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

/// A structured handler failure: kind plus human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct RpcFailure {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcFailure {
    #[must_use]
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::BadRequest, message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Unauthorized, message)
    }

    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Denied, message)
    }

    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(RpcErrorKind::TimedOut, "no approval arrived in time")
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Conflict, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Internal, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn key_locked(name: &str) -> Self {
        Self::new(RpcErrorKind::KeyLocked, format!("key is locked: {name}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips() {
        let request = RpcRequest::new("sign_event", vec!["{}".to_owned()]);
        let json = serde_json::to_string(&request).unwrap();
        let parsed: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.method, "sign_event");
        assert_eq!(parsed.params.len(), 1);
    }

    #[test]
    fn response_skips_absent_fields() {
        let response = RpcResponse::ok("1", "pong");
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn auth_url_reply_carries_url_in_error_slot() {
        let response = RpcResponse::auth_url("1", "https://b.example/requests/abc");
        assert_eq!(response.result.as_deref(), Some("auth_url"));
        assert_eq!(
            response.error.as_deref(),
            Some("https://b.example/requests/abc")
        );
    }

    #[test]
    fn method_parse_rejects_unknown() {
        assert!("sign_event".parse::<Method>().is_ok());
        assert!("steal_key".parse::<Method>().is_err());
    }

    #[test]
    fn failure_formats_kind_and_message() {
        let failure = RpcFailure::denied("explicitly denied");
        assert_eq!(failure.to_string(), "denied: explicitly denied");
    }

    #[test]
    fn empty_param_counts_as_absent() {
        let request = RpcRequest {
            id: "1".to_owned(),
            method: "create_account".to_owned(),
            params: vec![String::new(), "example.com".to_owned()],
        };
        assert_eq!(request.param(0), None);
        assert_eq!(request.param(1), Some("example.com"));
    }
}
