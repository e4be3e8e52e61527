//! WebSocket signaling server
//!
//! One router task owns the [`Relay`]; the accept loop and every connection
//! task talk to it through a command channel. Outbound frames go through a
//! bounded per-connection queue drained by a writer task, so routing never
//! waits on a slow socket.

use std::future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::model::endpoint::{Connection, EndpointId, EndpointInfo};
use crate::relay::connection::WsConnection;
use crate::relay::{Relay, RelayStats, Route};
use crate::util::select_host_address;

const COMMAND_QUEUE: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events funnelled into the router task.
enum RouterCommand {
    Connect {
        connection: Box<dyn Connection>,
        reply: oneshot::Sender<RelayResult<EndpointId>>,
    },
    Message {
        from: EndpointId,
        raw: Vec<u8>,
    },
    Disconnect {
        id: EndpointId,
    },
    Error {
        id: EndpointId,
        reason: String,
    },
    Endpoints {
        reply: oneshot::Sender<Vec<EndpointInfo>>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A bound, not yet running, signaling server.
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
}

impl RelayServer {
    /// Bind the listen socket immediately.
    pub async fn bind(config: RelayConfig) -> RelayResult<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;

        let local = listener.local_addr()?;
        info!("Bound signaling port: {}", local);

        if local.ip().is_unspecified() {
            if let Some(host) = select_host_address() {
                info!("Connect peers to ws://{}:{}", host, local.port());
            }
        }

        Ok(RelayServer { listener, config })
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start routing and accepting connections.
    pub fn spawn(self) -> RelayResult<RelayHandle> {
        let addr = self.listener.local_addr()?;
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (stop, stopped) = watch::channel(false);

        let router = tokio::spawn(run_router(Relay::new(), rx));
        let acceptor = tokio::spawn(accept_loop(
            self.listener,
            commands.clone(),
            stopped,
            self.config.outbound_queue,
        ));

        Ok(RelayHandle {
            addr,
            commands,
            stop,
            router,
            acceptor,
        })
    }

    /// Serve until Ctrl-C, then shut down cleanly.
    pub async fn run(self) -> RelayResult<()> {
        let handle = self.spawn()?;

        tokio::signal::ctrl_c().await?;
        info!("Interrupted, shutting down relay");

        handle.shutdown().await;
        Ok(())
    }
}

/// Control handle for a running relay.
///
/// Dropping the handle detaches the relay: it keeps accepting and routing
/// until the runtime shuts down. Only [`RelayHandle::shutdown`] stops it.
pub struct RelayHandle {
    addr: SocketAddr,
    commands: mpsc::Sender<RouterCommand>,
    stop: watch::Sender<bool>,
    router: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Currently connected endpoints, in identity order.
    pub async fn endpoints(&self) -> Vec<EndpointInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::Endpoints { reply })
            .await
            .is_err()
        {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> RelayStats {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::Stats { reply })
            .await
            .is_err()
        {
            return RelayStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop accepting, close every endpoint and wait for the router to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);

        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }

        drop(self.commands);
        let _ = self.acceptor.await;
        let _ = self.router.await;
        info!("Relay stopped");
    }
}

async fn run_router(mut relay: Relay, mut rx: mpsc::Receiver<RouterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            RouterCommand::Connect { connection, reply } => {
                let _ = reply.send(relay.on_connect(connection));
            }
            RouterCommand::Message { from, raw } => {
                if let Route::Delivered { recipients } = relay.on_message(from, &raw) {
                    debug!(endpoint = %from, recipients = recipients.len(), "Routed envelope");
                }
            }
            RouterCommand::Disconnect { id } => {
                relay.on_disconnect(id);
            }
            RouterCommand::Error { id, reason } => {
                relay.on_error(id, &reason);
            }
            RouterCommand::Endpoints { reply } => {
                let _ = reply.send(relay.endpoints());
            }
            RouterCommand::Stats { reply } => {
                let _ = reply.send(relay.stats());
            }
            RouterCommand::Shutdown { reply } => {
                relay.shutdown();
                let _ = reply.send(());
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    commands: mpsc::Sender<RouterCommand>,
    mut stopped: watch::Receiver<bool>,
    outbound_queue: usize,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stop_requested(&mut stopped) => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                let commands = commands.clone();
                let stopped = stopped.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, addr, commands, stopped, outbound_queue).await
                    {
                        warn!("Connection from {} failed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    info!("Stopped accepting connections");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    commands: mpsc::Sender<RouterCommand>,
    mut stopped: watch::Receiver<bool>,
    outbound_queue: usize,
) -> RelayResult<()> {
    let ws_stream = tokio::select! {
        handshake = accept_async(stream) => {
            handshake.map_err(|e| RelayError::Handshake(e.to_string()))?
        }
        _ = stop_requested(&mut stopped) => return Ok(()),
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Channel for sending frames back to this connection
    let (tx, mut rx) = mpsc::channel::<Message>(outbound_queue);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_tx.send(msg).await {
                debug!("Failed to write to {}: {}", addr, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let (reply, registered) = oneshot::channel();
    let connect = RouterCommand::Connect {
        connection: Box::new(WsConnection::new(tx)),
        reply,
    };
    if commands.send(connect).await.is_err() {
        return Err(RelayError::ShuttingDown);
    }
    let id = match registered.await {
        Ok(result) => result?,
        Err(_) => return Err(RelayError::ShuttingDown),
    };

    info!(endpoint = %id, "WebSocket connected from {}", addr);

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = stop_requested(&mut stopped) => break,
        };

        let command = match frame {
            Some(Ok(Message::Text(text))) => RouterCommand::Message {
                from: id,
                raw: text.into_bytes(),
            },
            Some(Ok(Message::Binary(data))) => RouterCommand::Message { from: id, raw: data },
            Some(Ok(Message::Close(_))) | None => {
                let _ = commands.send(RouterCommand::Disconnect { id }).await;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let reason = e.to_string();
                let _ = commands.send(RouterCommand::Error { id, reason }).await;
                break;
            }
        };

        if commands.send(command).await.is_err() {
            break;
        }
    }

    debug!(endpoint = %id, "Connection task finished");
    Ok(())
}

/// Resolves once a stop is signalled. A dropped sender never resolves it.
async fn stop_requested(stopped: &mut watch::Receiver<bool>) {
    if stopped.wait_for(|stop| *stop).await.is_err() {
        future::pending::<()>().await;
    }
}
