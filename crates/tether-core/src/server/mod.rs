//! TCP transport server.
//!
//! Accepts client connections, checks the handshake key, and dispatches
//! `request` events against a [`MethodRegistry`]. Each connection gets a reader
//! loop and a writer task fed by a channel; each request runs in its own task
//! so slow methods never block the connection.
//!
//! # Shutdown
//!
//! [`RpcServerHandle::shutdown`] stops accepting, tells every connection to
//! close, stops the autosave driver and runs a final save.

pub mod autosave;
pub(crate) mod dispatcher;
pub mod registry;

pub use autosave::{AutosaveScheduler, NoPersistence, Persistence};
pub use registry::{CallArgs, Handler, HandlerResult, MethodRegistry, MethodRegistryBuilder, Param};

use crate::config::{ProtocolConfig, ServerConfig};
use crate::protocol::{event, read_event, write_event, Frame, Handshake, HealthStatus, Rejection};
use crate::{Result, TetherError};
use dispatcher::Dispatcher;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping it stops the server without the final
/// save; call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct RpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    autosave_stop_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    autosave_handle: Option<tokio::task::JoinHandle<()>>,
    autosave: Arc<AutosaveScheduler>,
}

impl RpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn autosave(&self) -> &Arc<AutosaveScheduler> {
        &self.autosave
    }

    /// Stop accepting, close connections, stop autosave and save once more.
    ///
    /// Safe to call more than once; only the first call saves.
    pub async fn shutdown(&mut self) {
        if !self.signal_stop() {
            return;
        }

        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.autosave_handle.take() {
            let _ = handle.await;
        }
        self.autosave.final_flush().await;
        info!("RPC server on {} stopped", self.addr);
    }

    /// Returns false if the server was already stopping.
    fn signal_stop(&mut self) -> bool {
        let Some(tx) = self.shutdown_tx.take() else {
            return false;
        };
        let _ = tx.send(());
        let _ = self.conn_shutdown_tx.send(true);
        let _ = self.autosave_stop_tx.send(true);
        true
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Shared per-server state handed to every connection.
struct ServerContext {
    dispatcher: Dispatcher,
    auth_key: Option<String>,
}

/// The transport server.
pub struct RpcServer;

impl RpcServer {
    /// Initialize persistence, bind `config.host:config.port` and start serving.
    pub async fn start(
        registry: MethodRegistry,
        persistence: Arc<dyn Persistence>,
        config: ServerConfig,
    ) -> Result<RpcServerHandle> {
        config.validate()?;

        persistence.initialize().await.map_err(TetherError::from)?;

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!(
            "RPC server listening on {} ({} methods, auth {})",
            addr,
            registry.len(),
            if config.auth_key.is_some() { "on" } else { "off" }
        );

        let autosave = Arc::new(AutosaveScheduler::new(&config.autosave, persistence));
        let (autosave_stop_tx, autosave_stop_rx) = watch::channel(false);
        let autosave_handle = tokio::spawn(autosave.clone().run(autosave_stop_rx));

        let context = Arc::new(ServerContext {
            dispatcher: Dispatcher::new(
                Arc::new(registry),
                autosave.clone(),
                config.stream_chunk_size,
                config.dispatch_deadline,
            ),
            auth_key: config.auth_key.clone(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            context,
            config.max_connections,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(RpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            autosave_stop_tx,
            task_handle: Some(task_handle),
            autosave_handle: Some(autosave_handle),
            autosave,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        context: Arc<ServerContext>,
        max_connections: usize,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr, max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let context = context.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, peer_addr, context, &mut conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<ServerContext>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let first = tokio::time::timeout(ProtocolConfig::HANDSHAKE_TIMEOUT, read_event(&mut reader))
            .await
            .map_err(|_| TetherError::Protocol {
                message: "no handshake received".to_string(),
            })??;
        let Some(first) = first else {
            return Ok(());
        };
        if first.event != event::HANDSHAKE {
            return Err(TetherError::Protocol {
                message: format!("expected handshake, got '{}'", first.event),
            });
        }
        let hello: Handshake = first.decode()?;

        if !Self::authorized(context.auth_key.as_deref(), hello.auth_key.as_deref()) {
            warn!("Rejecting {}: bad auth key", peer_addr);
            let rejection = Rejection {
                message: "invalid auth key".to_string(),
            };
            write_event(&mut writer, &Frame::new(event::UNAUTHORIZED, &rejection)?).await?;
            return Ok(());
        }

        write_event(&mut writer, &Frame::new(event::CONNECTED, &HealthStatus::now())?).await?;
        info!(
            "Client {} connected from {}",
            hello.client.as_deref().unwrap_or("(unnamed)"),
            peer_addr
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
        let writer_task = tokio::spawn(Self::write_loop(writer, out_rx, peer_addr));

        let result = loop {
            let frame = tokio::select! {
                result = read_event(&mut reader) => {
                    match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Ok(()), // Clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(()); // Server shutting down
                }
            };

            match frame.event.as_str() {
                event::REQUEST => {
                    let context = context.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        for frame in context.dispatcher.handle(frame.data).await {
                            if out_tx.send(frame).is_err() {
                                debug!("Connection closed before reply was sent");
                                break;
                            }
                        }
                    });
                }
                event::HEALTH => {
                    let _ = out_tx.send(Frame::new(event::HEALTH, &HealthStatus::now())?);
                }
                other => debug!("Ignoring '{}' event from {}", other, peer_addr),
            }
        };

        // The writer drains once the last in-flight dispatch drops its sender.
        drop(out_tx);
        if *shutdown_rx.borrow() {
            writer_task.abort();
        }
        result
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Frame>,
        peer_addr: SocketAddr,
    ) {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_event(&mut writer, &frame).await {
                debug!("Write to {} failed: {}", peer_addr, e);
                break;
            }
        }
    }

    fn authorized(expected: Option<&str>, presented: Option<&str>) -> bool {
        match expected {
            None => true,
            Some(expected) => presented == Some(expected),
        }
    }
}
