//! First-message validation on a freshly upgraded socket.

use crate::config::Options;
use axum::extract::ws::{Message, WebSocket};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// The client's opening message.
#[derive(Debug, Default, Deserialize)]
pub struct InitMessage {
    #[serde(rename = "Arguments", default)]
    pub arguments: Option<String>,
    #[serde(rename = "AuthToken", default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to read init message: {0}")]
    Read(#[from] axum::Error),
    #[error("connection closed before init message")]
    Closed,
    #[error("unexpected {0} frame before init message")]
    UnexpectedFrame(&'static str),
    #[error("failed to parse init message: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("authentication token mismatch")]
    BadToken,
    #[error("malformed arguments: {0:?}")]
    BadArguments(String),
}

/// Wait for the init message. Anything other than one data frame is a
/// protocol violation.
pub async fn read_init(socket: &mut WebSocket) -> Result<InitMessage, HandshakeError> {
    let frame = match socket.recv().await {
        None => return Err(HandshakeError::Closed),
        Some(Err(e)) => return Err(HandshakeError::Read(e)),
        Some(Ok(Message::Text(text))) => text.into_bytes(),
        Some(Ok(Message::Binary(data))) => data,
        Some(Ok(Message::Close(_))) => return Err(HandshakeError::Closed),
        Some(Ok(Message::Ping(_))) => return Err(HandshakeError::UnexpectedFrame("ping")),
        Some(Ok(Message::Pong(_))) => return Err(HandshakeError::UnexpectedFrame("pong")),
    };
    parse_init(&frame)
}

pub fn parse_init(frame: &[u8]) -> Result<InitMessage, HandshakeError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Apply auth and argument policy, producing the argv to spawn.
pub fn validate(
    init: &InitMessage,
    options: &Options,
    base: &[String],
) -> Result<Vec<String>, HandshakeError> {
    if options.enable_auth {
        let token = init.auth_token.as_deref().unwrap_or_default();
        if !bool::from(token.as_bytes().ct_eq(options.credential.as_bytes())) {
            return Err(HandshakeError::BadToken);
        }
    }

    let mut argv = base.to_vec();
    if options.permit_arguments {
        if let Some(raw) = init.arguments.as_deref().filter(|a| !a.trim().is_empty()) {
            let extra = shlex::split(raw).ok_or_else(|| HandshakeError::BadArguments(raw.into()))?;
            argv.extend(extra);
        }
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<String> {
        vec!["/bin/echo".to_string(), "hi".to_string()]
    }

    #[test]
    fn test_parse_init_fields() {
        let init = parse_init(br#"{"Arguments":"-n x","AuthToken":"secret"}"#).unwrap();
        assert_eq!(init.arguments.as_deref(), Some("-n x"));
        assert_eq!(init.auth_token.as_deref(), Some("secret"));

        let empty = parse_init(b"{}").unwrap();
        assert!(empty.arguments.is_none() && empty.auth_token.is_none());
    }

    #[test]
    fn test_parse_init_rejects_garbage() {
        assert!(matches!(parse_init(b"hello"), Err(HandshakeError::Parse(_))));
        assert!(matches!(parse_init(b"[1,2]"), Err(HandshakeError::Parse(_))));
    }

    #[test]
    fn test_arguments_ignored_unless_permitted() {
        let init = InitMessage {
            arguments: Some("--evil".into()),
            auth_token: None,
        };
        let argv = validate(&init, &Options::default(), &base()).unwrap();
        assert_eq!(argv, base());
    }

    #[test]
    fn test_arguments_shell_split_when_permitted() {
        let options = Options {
            permit_arguments: true,
            ..Options::default()
        };
        let init = InitMessage {
            arguments: Some(r#"there "big world""#.into()),
            auth_token: None,
        };
        let argv = validate(&init, &options, &base()).unwrap();
        assert_eq!(argv, ["/bin/echo", "hi", "there", "big world"]);

        let unbalanced = InitMessage {
            arguments: Some(r#""open"#.into()),
            auth_token: None,
        };
        assert!(matches!(
            validate(&unbalanced, &options, &base()),
            Err(HandshakeError::BadArguments(_))
        ));
    }

    #[test]
    fn test_auth_token_checked_when_enabled() {
        let options = Options {
            enable_auth: true,
            credential: "user:pass".into(),
            ..Options::default()
        };
        let good = InitMessage {
            arguments: None,
            auth_token: Some("user:pass".into()),
        };
        assert!(validate(&good, &options, &base()).is_ok());

        for token in [Some("user:pas"), Some(""), None] {
            let bad = InitMessage {
                arguments: None,
                auth_token: token.map(str::to_string),
            };
            assert!(matches!(
                validate(&bad, &options, &base()),
                Err(HandshakeError::BadToken)
            ));
        }
    }

    #[test]
    fn test_auth_token_ignored_when_disabled() {
        let init = InitMessage {
            arguments: None,
            auth_token: Some("whatever".into()),
        };
        assert!(validate(&init, &Options::default(), &base()).is_ok());
    }
}
