//! Server options.

use std::path::PathBuf;
use std::time::Duration;

/// Immutable per-process configuration shared by every session.
#[derive(Debug, Clone)]
pub struct Options {
    pub address: String,
    pub port: u16,
    /// Exact `Origin` header required on WebSocket requests, if set.
    pub ws_origin: Option<String>,
    pub permit_write: bool,
    pub enable_auth: bool,
    pub credential: String,
    pub permit_arguments: bool,
    /// 0 means unlimited.
    pub max_connection: u32,
    /// Idle timeout in seconds, 0 disables it.
    pub timeout: u64,
    /// Per-send deadline in seconds, 0 disables it.
    pub write_timeout: u64,
    pub close_signal: i32,
    pub title_format: String,
    pub enable_reconnect: bool,
    pub reconnect_time: u32,
    pub index_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            ws_origin: None,
            permit_write: true,
            enable_auth: false,
            credential: String::new(),
            permit_arguments: false,
            max_connection: 0,
            timeout: 0,
            write_timeout: 30,
            close_signal: libc::SIGHUP,
            title_format: "{command}@{hostname}".to_string(),
            enable_reconnect: false,
            reconnect_time: 10,
            index_dir: None,
        }
    }
}

impl Options {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn write_deadline(&self) -> Option<Duration> {
        (self.write_timeout > 0).then(|| Duration::from_secs(self.write_timeout))
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
