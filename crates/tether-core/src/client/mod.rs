//! Transport client.
//!
//! A [`TransportClient`] is a cheap, cloneable handle to a single actor task
//! that owns all per-connection state: the [`CorrelationTable`], the
//! [`OfflineQueue`] and the current link. Callers send commands through a
//! mailbox and await a oneshot completion, so nothing outside the actor ever
//! touches that state.
//!
//! # Delivery semantics
//!
//! - A request issued while disconnected is queued and replayed once, in
//!   order, on the next connect. If its deadline passes first it is dropped
//!   from the queue and never sent.
//! - A disconnect never fails a pending request; only its own deadline does.
//! - `close()` stops the link without rejecting pending requests. They receive
//!   no further events and end when their deadlines pass.

pub mod backoff;
pub(crate) mod connector;
pub mod correlation;
pub mod offline_queue;

pub use backoff::BackoffConfig;
pub use correlation::CorrelationTable;
pub use offline_queue::OfflineQueue;

use crate::config::ClientConfig;
use crate::protocol::{
    event, now_millis, ChunkEnvelope, Frame, HealthStatus, RequestEnvelope, ResponseEnvelope,
};
use crate::{Result, TetherError};
use connector::LinkEvent;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// The server refused the handshake key.
    Rejected,
    Closed,
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    pub collection: Option<String>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

enum Command {
    Send {
        method: String,
        params: Vec<Value>,
        options: RequestOptions,
        completion: oneshot::Sender<Result<Value>>,
    },
    Health {
        reply: oneshot::Sender<Result<HealthStatus>>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a transport client actor.
#[derive(Clone)]
pub struct TransportClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    default_timeout: Duration,
}

impl TransportClient {
    /// Spawn the client actor and its connector.
    ///
    /// Returns immediately; requests issued before the first connect are
    /// queued. Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let default_timeout = config.default_timeout;
        tokio::spawn(connector::run(config, events_tx, shutdown_rx));

        let actor = ClientActor {
            commands: commands_rx,
            events: events_rx,
            state: state_tx,
            shutdown: shutdown_tx,
            table: CorrelationTable::new(),
            queue: OfflineQueue::new(),
            link: None,
            health_waiters: VecDeque::new(),
            default_timeout,
            closing: false,
            rejected: None,
            commands_open: true,
            events_open: true,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            default_timeout,
        })
    }

    /// Send a request and await its logical result.
    pub async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let (completion, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send {
                method: method.to_string(),
                params,
                options,
                completion,
            })
            .map_err(|_| TetherError::Closed)?;

        outcome.await.map_err(|_| TetherError::Closed)?
    }

    /// Send with default options.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.send_request(method, params, RequestOptions::default())
            .await
    }

    /// A handle that stamps `collection` on every request.
    pub fn collection(&self, name: impl Into<String>) -> CollectionHandle {
        CollectionHandle {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Round-trip a `health` event. Fails with `NotConnected` while offline.
    pub async fn health(&self) -> Result<HealthStatus> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Health { reply })
            .map_err(|_| TetherError::Closed)?;

        match tokio::time::timeout(self.default_timeout, outcome).await {
            Ok(result) => result.map_err(|_| TetherError::Closed)?,
            Err(_) => Err(TetherError::RequestTimeout {
                id: event::HEALTH.to_string(),
                timeout: self.default_timeout,
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Wait until the link reaches `target`, up to `timeout`.
    pub async fn wait_for_state(&self, target: LinkState, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let reached = match tokio::time::timeout(timeout, state.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TetherError::Closed),
            Err(_) => Err(TetherError::NotConnected),
        };
        reached
    }

    /// Tear down the link and stop reconnecting.
    ///
    /// Pending requests are not rejected; they end through their own
    /// deadlines. New requests fail with [`TetherError::Closed`].
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

/// Requests scoped to one collection.
#[derive(Clone)]
pub struct CollectionHandle {
    client: TransportClient,
    name: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.send_request(method, params, RequestOptions::default())
            .await
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let options = options.with_collection(self.name.clone());
        self.client.send_request(method, params, options).await
    }
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

struct ClientActor {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    state: watch::Sender<LinkState>,
    shutdown: watch::Sender<bool>,
    table: CorrelationTable,
    queue: OfflineQueue,
    link: Option<Link>,
    health_waiters: VecDeque<oneshot::Sender<Result<HealthStatus>>>,
    default_timeout: Duration,
    closing: bool,
    rejected: Option<String>,
    commands_open: bool,
    events_open: bool,
}

impl ClientActor {
    async fn run(mut self) {
        loop {
            if self.closing && self.table.is_empty() {
                break;
            }
            let deadline = self.table.next_deadline();

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Every handle is gone; nobody can issue requests any more.
                        self.commands_open = false;
                        self.begin_close();
                    }
                },
                link_event = self.events.recv(), if self.events_open => match link_event {
                    Some(link_event) => self.handle_link_event(link_event),
                    None => self.events_open = false,
                },
                _ = sleep_until(deadline) => {
                    let expired = self.table.expire(Instant::now());
                    let dropped = self.queue.discard(&expired);
                    if dropped > 0 {
                        debug!("Dropped {} queued requests that timed out offline", dropped);
                    }
                }
            }
        }

        let _ = self.shutdown.send(true);
        debug!("Transport client actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                method,
                params,
                options,
                completion,
            } => self.submit(method, params, options, completion),
            Command::Health { reply } => {
                let sent = self
                    .link
                    .as_ref()
                    .is_some_and(|link| link.outbound.send(Frame::bare(event::HEALTH)).is_ok());
                if sent {
                    // Callers whose health() already timed out hold no receiver.
                    self.health_waiters.retain(|waiter| !waiter.is_closed());
                    self.health_waiters.push_back(reply);
                } else {
                    let _ = reply.send(Err(TetherError::NotConnected));
                }
            }
            Command::Close { ack } => {
                self.begin_close();
                let _ = ack.send(());
            }
        }
    }

    fn submit(
        &mut self,
        method: String,
        params: Vec<Value>,
        options: RequestOptions,
        completion: oneshot::Sender<Result<Value>>,
    ) {
        if self.closing {
            let _ = completion.send(Err(TetherError::Closed));
            return;
        }
        if let Some(message) = &self.rejected {
            let _ = completion.send(Err(TetherError::Unauthorized {
                message: message.clone(),
            }));
            return;
        }

        let id = self.next_id();
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        self.table
            .register(id.clone(), completion, timeout, Instant::now());

        let envelope = RequestEnvelope {
            id,
            method,
            params,
            collection: options.collection,
            timestamp: now_millis(),
        };

        if let Err(envelope) = self.transmit(envelope) {
            debug!(
                "Link down, queueing request {} ({} queued)",
                envelope.id,
                self.queue.len() + 1
            );
            self.queue.push(envelope);
        }
    }

    /// Emit on the live link, or hand the envelope back if there is none.
    fn transmit(&mut self, envelope: RequestEnvelope) -> std::result::Result<(), RequestEnvelope> {
        let Some(link) = &self.link else {
            return Err(envelope);
        };
        let frame = match Frame::new(event::REQUEST, &envelope) {
            Ok(frame) => frame,
            Err(e) => {
                // Params are already JSON values, so this only fails on exotic floats.
                warn!("Failed to encode request {}: {}", envelope.id, e);
                return Ok(());
            }
        };
        if link.outbound.send(frame).is_err() {
            self.link = None;
            return Err(envelope);
        }
        Ok(())
    }

    fn handle_link_event(&mut self, link_event: LinkEvent) {
        match link_event {
            LinkEvent::Connected {
                generation,
                outbound,
            } => {
                self.link = Some(Link {
                    generation,
                    outbound,
                });
                let _ = self.state.send(LinkState::Connected);
                self.replay_queue();
            }
            LinkEvent::Inbound { generation, frame } => {
                if self.link.as_ref().map(|l| l.generation) != Some(generation) {
                    debug!("Dropping '{}' frame from stale link {}", frame.event, generation);
                    return;
                }
                self.handle_frame(frame);
            }
            LinkEvent::Disconnected { generation } => {
                if self.link.as_ref().map(|l| l.generation) == Some(generation) {
                    self.link = None;
                }
                for waiter in self.health_waiters.drain(..) {
                    let _ = waiter.send(Err(TetherError::NotConnected));
                }
                if !self.closing {
                    let _ = self.state.send(LinkState::Connecting);
                }
            }
            LinkEvent::Rejected { message } => {
                self.rejected = Some(message);
                let _ = self.state.send(LinkState::Rejected);
            }
        }
    }

    fn replay_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        // Only ids the table still awaits go out; the rest already resolved.
        let queued: Vec<RequestEnvelope> = self
            .queue
            .drain()
            .into_iter()
            .filter(|envelope| self.table.contains(&envelope.id))
            .collect();
        info!("Replaying {} queued requests", queued.len());

        let mut remaining = queued.into_iter();
        while let Some(envelope) = remaining.next() {
            if let Err(envelope) = self.transmit(envelope) {
                self.queue
                    .requeue_front(std::iter::once(envelope).chain(remaining));
                break;
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.event.as_str() {
            event::RESPONSE => match frame.decode::<ResponseEnvelope>() {
                Ok(response) => {
                    self.table.on_response(response);
                }
                Err(e) => warn!("{}", e),
            },
            event::RESPONSE_CHUNK => match frame.decode::<ChunkEnvelope>() {
                Ok(chunk) => {
                    self.table.on_chunk(chunk, Instant::now());
                }
                Err(e) => warn!("{}", e),
            },
            event::HEALTH => {
                let status = frame.decode::<HealthStatus>();
                match next_live_waiter(&mut self.health_waiters) {
                    Some(waiter) => {
                        let _ = waiter.send(status);
                    }
                    None => debug!("Ignoring health reply with no caller waiting"),
                }
            }
            other => debug!("Ignoring unexpected '{}' event", other),
        }
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.link = None;
        let _ = self.shutdown.send(true);
        let _ = self.state.send(LinkState::Closed);

        let dropped = self.queue.drain();
        if !dropped.is_empty() {
            debug!("Discarding {} queued requests on close", dropped.len());
        }
        for waiter in self.health_waiters.drain(..) {
            let _ = waiter.send(Err(TetherError::Closed));
        }
        info!(
            "Transport client closed with {} pending requests",
            self.table.len()
        );
    }

    fn next_id(&self) -> String {
        loop {
            let id = format!("{:x}-{:08x}", now_millis(), rand::random::<u32>());
            if !self.table.contains(&id) {
                return id;
            }
        }
    }
}

/// Pop the oldest waiter whose caller is still listening.
fn next_live_waiter<T>(waiters: &mut VecDeque<oneshot::Sender<T>>) -> Option<oneshot::Sender<T>> {
    while let Some(waiter) = waiters.pop_front() {
        if !waiter.is_closed() {
            return Some(waiter);
        }
    }
    None
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_live_waiter_skips_abandoned_callers() {
        let mut waiters = VecDeque::new();
        let (abandoned, abandoned_rx) = oneshot::channel::<u32>();
        let (live, mut live_rx) = oneshot::channel::<u32>();
        waiters.push_back(abandoned);
        waiters.push_back(live);
        drop(abandoned_rx);

        let waiter = next_live_waiter(&mut waiters).unwrap();
        waiter.send(7).unwrap();
        assert_eq!(live_rx.try_recv().unwrap(), 7);
        assert!(waiters.is_empty());
    }

    #[test]
    fn test_next_live_waiter_empty_when_all_abandoned() {
        let mut waiters = VecDeque::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel::<u32>();
            drop(rx);
            waiters.push_back(tx);
        }
        assert!(next_live_waiter(&mut waiters).is_none());
        assert!(waiters.is_empty());
    }
}
