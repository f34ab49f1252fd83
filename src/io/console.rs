//! TCP console for operator clients
//!
//! JSON-lines in both directions: every hub broadcast goes out as one
//! line, every inbound line is a subscriber command answered with a
//! direct reply line. A client may identify itself with a single hello
//! line sent immediately after connecting; anonymous clients still get
//! the full event stream but cannot broadcast notices.

use crate::infra::config::Config;
use crate::services::hub::{CommandRouter, RealtimeHub, RouteReply, SubscriberCommand};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const HELLO_WINDOW: Duration = Duration::from_secs(1);
const REPLY_BUFFER: usize = 32;

/// Optional first line a client sends to identify itself
#[derive(Debug, Deserialize)]
struct Hello {
    #[serde(default)]
    hello: bool,
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

pub struct ConsoleListener {
    port: u16,
    admin_token: Option<String>,
    hub: Arc<RealtimeHub>,
    router: Arc<CommandRouter>,
}

impl ConsoleListener {
    pub fn new(config: &Config, hub: Arc<RealtimeHub>, router: Arc<CommandRouter>) -> Self {
        Self {
            port: config.console_port(),
            admin_token: config.console_admin_token().map(str::to_string),
            hub,
            router,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = %self.port, "console_listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept loop, split from `run` so tests can bind their own listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("console_shutdown");
                        return;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "console_client_connected");
                            let this = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                this.handle_client(stream, shutdown).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "console_accept_failed"),
                    }
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Hello is optional: if the first line doesn't arrive quickly or
        // isn't a hello, treat the client as anonymous and keep the line
        let mut first_command: Option<String> = None;
        let mut identity = None;
        let mut role = None;
        let mut privileged = false;

        if let Ok(Ok(Some(line))) = tokio::time::timeout(HELLO_WINDOW, lines.next_line()).await {
            match serde_json::from_str::<Hello>(&line) {
                Ok(hello) if hello.hello => {
                    privileged = match (&self.admin_token, &hello.token) {
                        (Some(expected), Some(offered)) => expected == offered,
                        _ => false,
                    };
                    identity = hello.identity;
                    role = hello.role;
                }
                _ => first_command = Some(line),
            }
        }

        let mut handle = self.hub.subscribe(identity, role, privileged);
        let subscriber = handle.id;

        // Writer owns the socket's write half; hub events and direct
        // replies both funnel through it
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_BUFFER);
        let writer = tokio::spawn(async move {
            let mut write_half: OwnedWriteHalf = write_half;
            loop {
                let line = tokio::select! {
                    event = handle.rx.recv() => match event {
                        Some(event) => match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(_) => continue,
                        },
                        None => return,
                    },
                    reply = reply_rx.recv() => match reply {
                        Some(line) => line,
                        None => return,
                    },
                };
                if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        loop {
            let line = match first_command.take() {
                Some(line) => Some(line),
                None => tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    line = lines.next_line() => match line {
                        Ok(line) => line,
                        Err(e) => {
                            debug!(subscriber = %subscriber, error = %e, "console_read_error");
                            break;
                        }
                    },
                },
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match serde_json::from_str::<SubscriberCommand>(&line) {
                Ok(cmd) => self.router.route(subscriber, cmd).await,
                Err(e) => RouteReply { success: false, message: format!("bad command: {e}") },
            };
            let Ok(json) = serde_json::to_string(&reply) else { continue };
            if reply_tx.send(json).await.is_err() {
                break;
            }
        }

        self.hub.unsubscribe(subscriber);
        writer.abort();
        debug!(subscriber = %subscriber, "console_client_disconnected");
    }
}
