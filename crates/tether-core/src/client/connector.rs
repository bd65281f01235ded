//! Connection loop for the transport client.
//!
//! Owns the TCP stream. Connects, performs the handshake, then pumps frames in
//! both directions until the link drops, and reconnects with backoff. Every
//! state change is reported to the client actor as a [`LinkEvent`]; the
//! connector itself never touches pending requests.

use crate::config::{ClientConfig, ProtocolConfig};
use crate::protocol::{event, read_event, write_event, Frame, Handshake, Rejection};
use crate::{Result, TetherError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Link state changes reported to the client actor.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Connected {
        generation: u64,
        outbound: mpsc::UnboundedSender<Frame>,
    },
    Inbound {
        generation: u64,
        frame: Frame,
    },
    Disconnected {
        generation: u64,
    },
    /// The server refused the handshake; no further attempts are made.
    Rejected {
        message: String,
    },
}

/// Run until `shutdown` flips to `true` or the server rejects the handshake.
pub(crate) async fn run(
    config: ClientConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut generation: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            result = connect_once(&config) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((reader, writer)) => {
                attempt = 0;
                generation += 1;
                info!("Connected to {} (link {})", config.addr, generation);
                let stopped = pump(reader, writer, generation, &events, &mut shutdown).await;
                let _ = events.send(LinkEvent::Disconnected { generation });
                if stopped {
                    break;
                }
                info!("Link {} to {} dropped", generation, config.addr);
            }
            Err(TetherError::Unauthorized { message }) => {
                warn!("Server {} rejected handshake: {}", config.addr, message);
                let _ = events.send(LinkEvent::Rejected { message });
                break;
            }
            Err(e) => {
                debug!("Connect attempt {} to {} failed: {}", attempt + 1, config.addr, e);
            }
        }

        let delay = config.backoff.calculate_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("Connector for {} stopped", config.addr);
}

async fn connect_once(config: &ClientConfig) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = tokio::time::timeout(
        ProtocolConfig::CONNECT_TIMEOUT,
        TcpStream::connect(config.addr.as_str()),
    )
    .await
    .map_err(|_| TetherError::NotConnected)??;
    stream.set_nodelay(true)?;

    let (mut reader, mut writer) = stream.into_split();

    let hello = Handshake {
        auth_key: config.auth_key.clone(),
        client: config.client_name.clone(),
    };
    write_event(&mut writer, &Frame::new(event::HANDSHAKE, &hello)?).await?;

    let reply = tokio::time::timeout(ProtocolConfig::HANDSHAKE_TIMEOUT, read_event(&mut reader))
        .await
        .map_err(|_| TetherError::Protocol {
            message: "handshake timed out".to_string(),
        })??
        .ok_or(TetherError::NotConnected)?;

    match reply.event.as_str() {
        event::CONNECTED => Ok((reader, writer)),
        event::UNAUTHORIZED => {
            let rejection: Rejection = reply.decode()?;
            Err(TetherError::Unauthorized {
                message: rejection.message,
            })
        }
        other => Err(TetherError::Protocol {
            message: format!("expected handshake reply, got '{}'", other),
        }),
    }
}

/// Move frames until the link drops. Returns `true` if stopped by shutdown.
async fn pump(
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    generation: u64,
    events: &mpsc::UnboundedSender<LinkEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    if events
        .send(LinkEvent::Connected {
            generation,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return true;
    }

    // Reads run in their own task: read_exact is not cancel-safe inside select!.
    let mut read_task = tokio::spawn(read_loop(reader, generation, events.clone()));

    let stopped = loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(e) = write_event(&mut writer, &frame).await {
                        debug!("Link {} write failed: {}", generation, e);
                        break false;
                    }
                }
                None => break true,
            },
            _ = &mut read_task => break false,
            _ = shutdown.changed() => break true,
        }
    };

    read_task.abort();
    stopped
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        match read_event(&mut reader).await {
            Ok(Some(frame)) => {
                if events.send(LinkEvent::Inbound { generation, frame }).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("Link {} closed by server", generation);
                return;
            }
            Err(e) => {
                debug!("Link {} read failed: {}", generation, e);
                return;
            }
        }
    }
}
