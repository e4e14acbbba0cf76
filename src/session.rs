//! Per-connection session bridge.
//!
//! A session owns one child on a pty and one WebSocket. Two tasks pump bytes
//! between them: pty output to the socket, and socket input to the pty. The
//! first task to stop triggers teardown. Teardown cancels the other task,
//! signals the child, closes the socket and gives back the admission slot.
//! It runs exactly once no matter which side gets there first.

use crate::admission::AdmissionSlot;
use crate::config::Options;
use crate::handshake;
use crate::protocol::{self, ClientMessage};
use crate::pty::{self, ExitWaiter, ProcessHandle, PtyMaster};
use crate::shutdown::SessionGuard;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const OUTPUT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
enum BridgeError {
    #[error("socket write failed: {0}")]
    Socket(#[from] axum::Error),
    #[error("socket write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("pty write failed: {0}")]
    Pty(#[from] io::Error),
}

/// A WebSocket request that passed admission and command lookup.
#[derive(Debug)]
pub struct Admitted {
    pub id: Uuid,
    pub remote: SocketAddr,
    pub command: Vec<String>,
    pub slot: AdmissionSlot,
}

/// Run a session on a freshly upgraded socket until it ends.
pub async fn serve(socket: WebSocket, state: AppState, admitted: Admitted) {
    let span = info_span!("session", session_id = %admitted.id, remote = %admitted.remote);
    serve_inner(socket, state, admitted).instrument(span).await
}

async fn serve_inner(mut socket: WebSocket, state: AppState, admitted: Admitted) {
    let Admitted {
        remote,
        command,
        slot,
        ..
    } = admitted;
    info!("New client connected");

    let argv = match handshake::read_init(&mut socket)
        .await
        .and_then(|init| handshake::validate(&init, &state.options, &command))
    {
        Ok(argv) => argv,
        Err(e) => {
            warn!(error = %e, "Handshake rejected");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let guard = state.shutdown.mark_start();

    let process = match pty::spawn(&argv) {
        Ok(process) => process,
        Err(e) => {
            error!(error = %e, ?argv, "Failed to execute command");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let args = argv[1..].join(" ");
    if state.gate.max() != 0 {
        info!(
            pid = process.pid(),
            args = %args,
            "Command is running, connections: {}/{}",
            slot.current(),
            state.gate.max()
        );
    } else {
        info!(pid = process.pid(), args = %args, "Command is running, connections: {}", slot.current());
    }

    let title = render_title(&state.options.title_format, &argv, &state.hostname, remote);
    let (waiter, handle, master) = process.into_parts();
    let (sink, stream) = socket.split();
    let bridge = Arc::new(Bridge {
        options: Arc::clone(&state.options),
        sink: Mutex::new(sink),
        process: handle,
        exited: Arc::new(AtomicBool::new(false)),
        lifecycle: Lifecycle::new(slot, guard),
    });
    bridge.run(stream, master, waiter, title).await;
}

/// Single-fire teardown guard holding the resources released last.
#[derive(Debug)]
struct Lifecycle {
    torn_down: AtomicBool,
    cancel: CancellationToken,
    slot: AdmissionSlot,
    guard: StdMutex<Option<SessionGuard>>,
}

impl Lifecycle {
    fn new(slot: AdmissionSlot, guard: SessionGuard) -> Self {
        Self {
            torn_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            slot,
            guard: StdMutex::new(Some(guard)),
        }
    }

    /// True for the first caller only. Cancels both pumps.
    fn begin(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn finish(&self) {
        self.slot.release();
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(guard);
    }
}

struct Bridge {
    options: Arc<Options>,
    /// Write lock: output frames, pongs and the close frame all go through it.
    sink: Mutex<SplitSink<WebSocket, Message>>,
    process: ProcessHandle,
    exited: Arc<AtomicBool>,
    lifecycle: Lifecycle,
}

impl Bridge {
    async fn run(
        self: Arc<Self>,
        stream: SplitStream<WebSocket>,
        master: PtyMaster,
        waiter: ExitWaiter,
        title: String,
    ) {
        let exited = Arc::clone(&self.exited);
        let exit = tokio::spawn(
            async move {
                let status = waiter.wait().await;
                exited.store(true, Ordering::SeqCst);
                status
            }
            .in_current_span(),
        );

        if let Err(e) = self.send_initial(&title).await {
            debug!(error = %e, "Failed to send initial messages");
            self.teardown("initial write failed").await;
        }

        let output = tokio::spawn(
            Arc::clone(&self)
                .pump_output(master.clone())
                .in_current_span(),
        );
        let input = tokio::spawn(Arc::clone(&self).pump_input(stream, master).in_current_span());
        let (output, input) = tokio::join!(output, input);
        if let Err(e) = output.and(input) {
            error!(error = %e, "Session pump panicked");
        }
        self.teardown("pumps stopped").await;

        match exit.await {
            Ok(Ok(status)) => info!(%status, "Process exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for process"),
            Err(e) => error!(error = %e, "Exit observer panicked"),
        }
    }

    async fn send_initial(&self, title: &str) -> Result<(), BridgeError> {
        self.send(protocol::window_title(title)).await?;
        self.send(protocol::preferences(&serde_json::json!({}))).await?;
        if self.options.enable_reconnect {
            self.send(protocol::reconnect(self.options.reconnect_time))
                .await?;
        }
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), BridgeError> {
        let mut sink = self.sink.lock().await;
        let write = sink.send(Message::Text(frame));
        match self.options.write_deadline() {
            Some(deadline) => tokio::time::timeout(deadline, write)
                .await
                .map_err(|_| BridgeError::WriteTimeout(deadline))??,
            None => write.await?,
        }
        Ok(())
    }

    async fn pump_output(self: Arc<Self>, master: PtyMaster) {
        let mut buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        let reason = loop {
            let n = tokio::select! {
                _ = self.lifecycle.cancel.cancelled() => break "cancelled",
                read = master.read(&mut buf) => match read {
                    Ok(0) => break "pty closed",
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Pty read ended");
                        break "pty closed";
                    }
                },
            };
            let frame = protocol::output(&buf[..n]);
            tokio::select! {
                _ = self.lifecycle.cancel.cancelled() => break "cancelled",
                sent = self.send(frame) => if let Err(e) = sent {
                    debug!(error = %e, "Output write failed");
                    break "socket write failed";
                },
            }
        };
        drop(master);
        self.teardown(reason).await;
    }

    async fn pump_input(self: Arc<Self>, mut stream: SplitStream<WebSocket>, master: PtyMaster) {
        let idle = self.options.idle_timeout();
        let deadline = tokio::time::sleep(idle.unwrap_or(Duration::ZERO));
        tokio::pin!(deadline);

        let reason = loop {
            let msg = tokio::select! {
                _ = self.lifecycle.cancel.cancelled() => break "cancelled",
                _ = &mut deadline, if idle.is_some() => break "idle timeout",
                msg = stream.next() => msg,
            };
            if let Some(idle) = idle {
                deadline.as_mut().reset(Instant::now() + idle);
            }

            let frame = match msg {
                None | Some(Ok(Message::Close(_))) => break "peer closed",
                Some(Err(e)) => {
                    debug!(error = %e, "Socket read failed");
                    break "socket read failed";
                }
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            };

            // A child that never reads stdin can block the pty write forever.
            let handled = tokio::select! {
                _ = self.lifecycle.cancel.cancelled() => break "cancelled",
                _ = &mut deadline, if idle.is_some() => break "idle timeout",
                handled = self.handle_frame(&frame, &master) => handled,
            };
            if let Err(e) = handled {
                debug!(error = %e, "Input handling failed");
                break "input failed";
            }
        };
        drop(master);
        self.teardown(reason).await;
    }

    async fn handle_frame(&self, frame: &[u8], master: &PtyMaster) -> Result<(), BridgeError> {
        match protocol::decode(frame) {
            Ok(ClientMessage::Input(data)) => {
                if self.options.permit_write {
                    master.write_all(data).await?;
                }
            }
            Ok(ClientMessage::Ping) => self.send(protocol::pong()).await?,
            Ok(ClientMessage::Resize { rows, cols }) => {
                if let Err(e) = master.resize(rows, cols) {
                    warn!(error = %e, rows, cols, "Failed to resize terminal");
                }
            }
            Err(e) => warn!(error = %e, "Ignoring malformed message"),
        }
        Ok(())
    }

    /// Idempotent; safe to call from either pump.
    async fn teardown(&self, reason: &'static str) {
        if !self.lifecycle.begin() {
            return;
        }

        if !self.exited.load(Ordering::SeqCst) {
            if let Err(e) = self.process.signal(self.options.close_signal) {
                debug!(error = %e, pid = self.process.pid(), "Failed to signal process");
            }
        }

        {
            let mut sink = self.sink.lock().await;
            let close = async {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            };
            match self.options.write_deadline() {
                Some(deadline) => {
                    let _ = tokio::time::timeout(deadline, close).await;
                }
                None => close.await,
            }
        }

        self.lifecycle.finish();
        info!(reason, "Connection closed");
    }
}

fn render_title(format: &str, argv: &[String], hostname: &str, remote: SocketAddr) -> String {
    format
        .replace("{command}", argv.first().map(String::as_str).unwrap_or_default())
        .replace("{hostname}", hostname)
        .replace("{remote}", &remote.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::shutdown::ShutdownCoordinator;

    #[test]
    fn test_teardown_guard_fires_once() {
        let gate = AdmissionGate::new(1);
        let coordinator = ShutdownCoordinator::new();
        let lifecycle = Arc::new(Lifecycle::new(gate.claim(), coordinator.mark_start()));
        assert_eq!(gate.connections(), 1);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                std::thread::spawn(move || {
                    let won = lifecycle.begin();
                    lifecycle.finish();
                    usize::from(won)
                })
            })
            .collect();
        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(winners, 1);
        assert!(lifecycle.cancel.is_cancelled());
        assert_eq!(gate.connections(), 0);
        assert_eq!(coordinator.in_flight(), 0);
        drop(lifecycle);
        assert_eq!(gate.connections(), 0);
    }

    #[test]
    fn test_render_title() {
        let argv = vec!["/bin/bash".to_string(), "-l".to_string()];
        let remote: SocketAddr = "10.0.0.2:5555".parse().unwrap();
        assert_eq!(
            render_title("{command}@{hostname} ({remote})", &argv, "box", remote),
            "/bin/bash@box (10.0.0.2:5555)"
        );
        assert_eq!(render_title("static", &argv, "box", remote), "static");
    }
}
