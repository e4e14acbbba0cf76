//! gotty wire framing.
//!
//! Every frame is a text message whose first byte names its type.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

// Server -> client
pub const OUTPUT: char = '0';
pub const PONG: char = '1';
pub const SET_WINDOW_TITLE: char = '2';
pub const SET_PREFERENCES: char = '3';
pub const SET_RECONNECT: char = '4';

// Client -> server
pub const INPUT: u8 = b'0';
pub const PING: u8 = b'1';
pub const RESIZE_TERMINAL: u8 = b'2';

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("malformed resize payload: {0}")]
    Resize(#[from] serde_json::Error),
}

/// Decoded client message.
#[derive(Debug, PartialEq)]
pub enum ClientMessage<'a> {
    Input(&'a [u8]),
    Ping,
    Resize { rows: u16, cols: u16 },
}

#[derive(Deserialize)]
struct ResizeRequest {
    columns: f64,
    rows: f64,
}

pub fn decode(frame: &[u8]) -> Result<ClientMessage<'_>, ProtocolError> {
    let (&kind, payload) = frame.split_first().ok_or(ProtocolError::Empty)?;
    match kind {
        INPUT => Ok(ClientMessage::Input(payload)),
        PING => Ok(ClientMessage::Ping),
        RESIZE_TERMINAL => {
            let req: ResizeRequest = serde_json::from_slice(payload)?;
            Ok(ClientMessage::Resize {
                rows: clamp_dimension(req.rows),
                cols: clamp_dimension(req.columns),
            })
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

// Browsers send fractional sizes; winsize wants u16.
fn clamp_dimension(value: f64) -> u16 {
    value.clamp(0.0, f64::from(u16::MAX)) as u16
}

pub fn output(data: &[u8]) -> String {
    let mut frame = String::with_capacity(1 + data.len().div_ceil(3) * 4);
    frame.push(OUTPUT);
    STANDARD.encode_string(data, &mut frame);
    frame
}

pub fn pong() -> String {
    PONG.to_string()
}

pub fn window_title(title: &str) -> String {
    format!("{SET_WINDOW_TITLE}{title}")
}

pub fn preferences(prefs: &serde_json::Value) -> String {
    format!("{SET_PREFERENCES}{prefs}")
}

pub fn reconnect(seconds: u32) -> String {
    format!("{SET_RECONNECT}{seconds}")
}

/// Inverse of [`output`].
#[cfg(test)]
pub fn decode_output(frame: &str) -> Option<Vec<u8>> {
    let payload = frame.strip_prefix(OUTPUT)?;
    STANDARD.decode(payload).ok()
}
