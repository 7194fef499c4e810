//! Connection manager
//!
//! Accepts clients and runs one task per connection. Each task multiplexes
//! socket reads, queued pushes from the scheduler and cancellation.

use super::protocol::{Response, Session};
use crate::config::{ConfigProvider, ListenConfig, Settings};
use crate::core::{lock, ConnectionId, SharedState};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use sensd_core::{MAX_LINE, OUTBOX_CAPACITY, READ_CHUNK};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Splits a byte stream into lines
///
/// Lines end at `\n`, a trailing `\r` is dropped. A line that grows past
/// `MAX_LINE` bytes without a terminator is discarded up to its end.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    pending: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    if self.pending.last() == Some(&b'\r') {
                        self.pending.pop();
                    }
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                }
                self.pending.clear();
                continue;
            }
            if self.discarding {
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() > MAX_LINE {
                warn!("Discarding input line longer than {} bytes", MAX_LINE);
                self.pending.clear();
                self.discarding = true;
            }
        }
        lines
    }
}

/// Listening socket plus the set of live client tasks
pub struct ConnectionManager {
    listener: TcpListener,
    state: SharedState,
    settings: Arc<Settings>,
}

impl ConnectionManager {
    /// Bind the listening socket; failure here ends the daemon run
    pub async fn bind(
        listen: &ListenConfig,
        state: SharedState,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", listen.host, listen.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `cancel` fires, then close every connection
    pub async fn run(self, cancel: CancellationToken) {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let state = self.state.clone();
                        let settings = self.settings.clone();
                        let token = cancel.child_token();
                        clients.spawn(serve(stream, peer, state, settings, token));
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
                // Reap finished connection tasks
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        debug!("Closing {} connections", clients.len());
        while clients.join_next().await.is_some() {}
        debug!("Connection manager stopped");
    }
}

/// Serve one client until it leaves, fails, or the server stops
async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: SharedState,
    settings: Arc<Settings>,
    cancel: CancellationToken,
) {
    let id = ConnectionId::new();
    // Bounded, so a peer that stops reading loses its subscriptions
    let (outbox, mut pushes) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    lock(&state).register_connection(id, outbox);

    let config: Arc<dyn ConfigProvider> = settings.clone();
    let mut session = Session::new(
        id,
        settings.password().map(str::to_string),
        config,
        state.clone(),
    );
    let mut framer = LineFramer::default();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        debug!("Connection {} ({}) closed by peer", id, peer);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read from {} failed: {}", peer, e);
                        break;
                    }
                };

                let mut replies = String::new();
                let mut farewell = false;
                for line in framer.push(&buf[..n]) {
                    match session.handle_line(&line).await {
                        Response::Silent => {}
                        Response::Reply(reply) => {
                            replies.push_str(&reply);
                            replies.push_str("\r\n");
                        }
                        Response::Farewell(reply) => {
                            replies.push_str(&reply);
                            replies.push_str("\r\n");
                            farewell = true;
                            break;
                        }
                    }
                }
                if !replies.is_empty() {
                    if let Err(e) = stream.write_all(replies.as_bytes()).await {
                        debug!("Write to {} failed: {}", peer, e);
                        break;
                    }
                }
                if farewell {
                    debug!("Connection {} ({}) said bye", id, peer);
                    break;
                }
            }
            push = pushes.recv() => match push {
                Some(line) => {
                    if let Err(e) = stream.write_all(line.as_bytes()).await {
                        debug!("Push to {} failed: {}", peer, e);
                        break;
                    }
                }
                // State dropped the outbox: the daemon is shutting down
                None => break,
            },
        }
    }

    lock(&state).drop_connection(id);
    let _ = stream.shutdown().await;
}
