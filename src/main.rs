//! ptygate - share many terminals as a web application.
//!
//! Usage:
//!   ptygate [OPTIONS] <COMMAND_SERVER>
//!
//! `COMMAND_SERVER` is a URL returning `{ "<id>": ["prog", "arg", ...] }`.
//! Browsers connect to `/<mount>/<id>/ws` and get a terminal running the
//! command mapped to `<id>`.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

mod admission;
mod config;
mod handshake;
mod http_server;
mod protocol;
mod pty;
mod resolver;
mod session;
mod shutdown;
mod state;

use clap::Parser;
use config::Options;
use resolver::CommandResolver;
use state::AppState;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ptygate", version)]
#[command(about = "Share many terminals as a web application")]
struct Args {
    /// IP address to listen on
    #[arg(long, env = "PTYGATE_ADDRESS", default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on
    #[arg(long, env = "PTYGATE_PORT", default_value_t = 8080)]
    port: u16,

    /// Only accept websocket requests carrying this exact Origin header
    #[arg(long, env = "PTYGATE_WS_ORIGIN")]
    ws_origin: Option<String>,

    /// Forward client keystrokes to the terminal
    #[arg(long, env = "PTYGATE_PERMIT_WRITE", default_value_t = true, action = clap::ArgAction::Set)]
    permit_write: bool,

    /// Require clients to present this token in their init message
    #[arg(long, env = "PTYGATE_CREDENTIAL")]
    credential: Option<String>,

    /// Let clients append arguments to the resolved command
    #[arg(long, env = "PTYGATE_PERMIT_ARGUMENTS")]
    permit_arguments: bool,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long, env = "PTYGATE_MAX_CONNECTION", default_value_t = 0)]
    max_connection: u32,

    /// Close sessions with no client input for this many seconds (0 = never)
    #[arg(long, env = "PTYGATE_TIMEOUT", default_value_t = 0)]
    timeout: u64,

    /// Deadline in seconds for a single websocket write (0 = none)
    #[arg(long, env = "PTYGATE_WRITE_TIMEOUT", default_value_t = 30)]
    write_timeout: u64,

    /// Signal sent to the command when its session closes
    #[arg(long, env = "PTYGATE_CLOSE_SIGNAL", default_value_t = libc::SIGHUP)]
    close_signal: i32,

    /// Window title; supports {command}, {hostname} and {remote}
    #[arg(long, env = "PTYGATE_TITLE_FORMAT", default_value = "{command}@{hostname}")]
    title_format: String,

    /// Ask clients to reconnect after the session closes
    #[arg(long, env = "PTYGATE_RECONNECT")]
    reconnect: bool,

    /// Seconds clients wait before reconnecting
    #[arg(long, env = "PTYGATE_RECONNECT_TIME", default_value_t = 10)]
    reconnect_time: u32,

    /// Directory to serve static files from
    #[arg(long, env = "PTYGATE_INDEX_DIR")]
    index_dir: Option<PathBuf>,

    /// URL of the command server
    command_server: String,
}

impl From<Args> for Options {
    fn from(args: Args) -> Self {
        Options {
            address: args.address,
            port: args.port,
            ws_origin: args.ws_origin.filter(|o| !o.is_empty()),
            permit_write: args.permit_write,
            enable_auth: args.credential.is_some(),
            credential: args.credential.unwrap_or_default(),
            permit_arguments: args.permit_arguments,
            max_connection: args.max_connection,
            timeout: args.timeout,
            write_timeout: args.write_timeout,
            close_signal: args.close_signal,
            title_format: args.title_format,
            enable_reconnect: args.reconnect,
            reconnect_time: args.reconnect_time,
            index_dir: args.index_dir,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let command_server = args.command_server.clone();

    let resolver = match CommandResolver::new(command_server) {
        Ok(resolver) => resolver,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(3);
        }
    };
    let state = AppState::new(Options::from(args), resolver);

    register_signals(Arc::clone(&state.shutdown));

    if let Err(e) = http_server::run_server(state).await {
        eprintln!("Error: {}", e);
        exit(4);
    }
}

/// First SIGINT/SIGTERM starts a graceful drain; a second one exits at once.
fn register_signals(shutdown: Arc<shutdown::ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("Error: failed to install signal handlers: {}", e);
                exit(3);
            }
        };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            if shutdown.request_close() {
                println!("Send ^C to force exit.");
            } else {
                exit(5);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_to_options() {
        let args = Args::parse_from([
            "ptygate",
            "--port",
            "9000",
            "--credential",
            "user:pass",
            "--max-connection",
            "4",
            "--permit-write",
            "false",
            "http://127.0.0.1:7000/map",
        ]);
        assert_eq!(args.command_server, "http://127.0.0.1:7000/map");

        let options = Options::from(args);
        assert_eq!(options.port, 9000);
        assert!(options.enable_auth);
        assert_eq!(options.credential, "user:pass");
        assert_eq!(options.max_connection, 4);
        assert!(!options.permit_write);
        assert_eq!(options.close_signal, libc::SIGHUP);
    }

    #[test]
    fn test_defaults_match_options() {
        let options = Options::from(Args::parse_from(["ptygate", "http://localhost/"]));
        let defaults = Options::default();
        assert_eq!(options.endpoint(), defaults.endpoint());
        assert!(!options.enable_auth);
        assert_eq!(options.permit_write, defaults.permit_write);
        assert_eq!(options.write_timeout, defaults.write_timeout);
        assert_eq!(options.title_format, defaults.title_format);
        assert!(options.ws_origin.is_none());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
