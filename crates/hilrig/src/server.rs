//! Server loop: accepts clients, routes their commands, streams bench events.
//!
//! Task layout:
//! - one accept task wrapping each new socket in a [`Channel`]
//! - one reactor (the `serve` future) owning the client table and the
//!   shutdown sequence
//! - per client, a reader task that dispatches one command at a time and a
//!   writer task that sends one queued message at a time
//!
//! Each client has a single outgoing queue fed by both its bus subscription
//! and its reader, so events fired while a command runs are queued ahead of
//! that command's response.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bridge::ProtocolError;
use crate::bridge::channel::{Channel, ChannelReader, ChannelWriter, local_pair};
use crate::bridge::protocol::{ClientRequest, CommandResponse, ControlSignal, ServerMessage};
use crate::config::ServerConfig;
use crate::engine::Bench;
use crate::event::{Event, EventSink, SubscriberId};
use crate::router::CommandRouter;

/// Server side of one client connection.
pub type ServerChannel = Channel<ClientRequest, ServerMessage>;
/// Client side of one connection.
pub type ClientChannel = Channel<ServerMessage, ClientRequest>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server loop has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "client-{}", &simple[..8])
    }
}

/// Bus subscriber feeding one client's bounded outgoing queue.
///
/// A client too slow to keep up loses events rather than stalling the bus;
/// it stays subscribed until its queue is closed.
struct ClientQueue {
    id: ClientId,
    tx: mpsc::Sender<ServerMessage>,
}

impl EventSink for ClientQueue {
    fn deliver(&self, event: &Arc<Event>) -> bool {
        match self.tx.try_send(ServerMessage::Event(Arc::clone(event))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    client = %self.id,
                    capacity = self.tx.max_capacity(),
                    kind = ?event.kind,
                    "Client outgoing queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Messages from client tasks to the reactor.
enum ReactorMsg {
    Control(ClientId, ControlSignal),
    Closed(ClientId),
}

/// Cloneable handle for attaching in-process clients and stopping the loop.
#[derive(Clone)]
pub struct ServerHandle {
    attach: mpsc::UnboundedSender<ServerChannel>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    /// Attach a client over an in-process channel instead of a socket.
    pub fn connect_local(&self) -> Result<ClientChannel, ServerError> {
        let (server_side, client_side) = local_pair::<ClientRequest, ServerMessage>();
        self.attach
            .send(server_side)
            .map_err(|_| ServerError::Stopped)?;
        Ok(client_side)
    }

    /// Begin graceful shutdown, same as a client sending `TERMINATE`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

struct ClientSlot {
    subscription: SubscriberId,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientSlot {
    /// Stop reading, drop the bus subscription and hand back the writer,
    /// which finishes once the queue it holds is drained.
    fn detach(self, id: ClientId, bench: &Bench) -> JoinHandle<()> {
        bench.events().unregister(self.subscription);
        self.reader.abort();
        tracing::debug!(client = %id, "Client detached");
        self.writer
    }
}

pub struct ServerLoop {
    config: ServerConfig,
    router: CommandRouter,
    attach_tx: mpsc::UnboundedSender<ServerChannel>,
    attach_rx: mpsc::UnboundedReceiver<ServerChannel>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerLoop {
    pub fn new(config: ServerConfig, bench: Arc<Bench>) -> Self {
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            router: CommandRouter::new(bench),
            attach_tx,
            attach_rx,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            attach: self.attach_tx.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn bench(&self) -> &Arc<Bench> {
        self.router.bench()
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Run until `TERMINATE` or [`ServerHandle::shutdown`], then drain every
    /// client and tear the bench down.
    ///
    /// Binds from the config unless a listener is supplied.
    pub async fn serve(self, listener: Option<TcpListener>) -> Result<(), ServerError> {
        let listener = match listener {
            Some(listener) => listener,
            None => self.bind().await?,
        };
        tracing::info!(addr = %listener.local_addr()?, "Bench server listening");

        let Self {
            config,
            router,
            attach_tx,
            mut attach_rx,
            shutdown,
        } = self;

        let accept = tokio::spawn(accept_loop(listener, attach_tx.clone()));
        let (reactor_tx, mut reactor_rx) = mpsc::unbounded_channel::<ReactorMsg>();
        let mut shutdown_rx = shutdown.subscribe();
        let mut clients: HashMap<ClientId, ClientSlot> = HashMap::new();
        let mut draining: Vec<JoinHandle<()>> = Vec::new();
        let mut tick = tokio::time::interval(config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown_rx) => {
                    tracing::info!("Shutdown requested");
                    break;
                }

                Some(msg) = reactor_rx.recv() => match msg {
                    ReactorMsg::Control(id, ControlSignal::Terminate) => {
                        tracing::info!(client = %id, "TERMINATE received");
                        break;
                    }
                    ReactorMsg::Control(id, ControlSignal::Disconnect) | ReactorMsg::Closed(id) => {
                        if let Some(client) = clients.remove(&id) {
                            draining.push(client.detach(id, router.bench()));
                            tracing::info!(client = %id, clients = clients.len(), "Client disconnected");
                        }
                    }
                },

                Some(channel) = attach_rx.recv() => {
                    let id = ClientId::new();
                    let client = spawn_client(
                        id,
                        channel,
                        &router,
                        config.outgoing_capacity,
                        reactor_tx.clone(),
                    );
                    clients.insert(id, client);
                    tracing::info!(client = %id, clients = clients.len(), "Client attached");
                }

                _ = tick.tick() => {
                    draining.retain(|writer| !writer.is_finished());
                    clients.retain(|id, client| {
                        let alive = !client.writer.is_finished();
                        if !alive {
                            tracing::debug!(client = %id, "Writer gone, dropping client");
                            router.bench().events().unregister(client.subscription);
                            client.reader.abort();
                        }
                        alive
                    });
                }
            }
        }

        accept.abort();
        shutdown.send_replace(true);
        drop(attach_rx);

        let count = clients.len();
        draining.extend(
            clients
                .into_iter()
                .map(|(id, client)| client.detach(id, router.bench())),
        );
        for writer in futures::future::join_all(draining).await {
            if let Err(e) = writer
                && e.is_panic()
            {
                tracing::error!(error = %e, "Client writer panicked");
            }
        }
        tracing::info!(clients = count, "Client queues drained");

        let bench = Arc::clone(router.bench());
        if let Err(e) = tokio::task::spawn_blocking(move || bench.teardown()).await {
            tracing::error!(error = %e, "Bench teardown panicked");
        }
        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn accept_loop(listener: TcpListener, attach: mpsc::UnboundedSender<ServerChannel>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                tracing::debug!(%peer, "Accepted connection");
                if attach.send(Channel::from_stream(stream)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

fn spawn_client(
    id: ClientId,
    channel: ServerChannel,
    router: &CommandRouter,
    capacity: usize,
    reactor: mpsc::UnboundedSender<ReactorMsg>,
) -> ClientSlot {
    let (reader, writer) = channel.split();
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    // Held events go out before anything this client triggers.
    let subscription = router.bench().events().register(ClientQueue {
        id,
        tx: out_tx.clone(),
    });
    ClientSlot {
        subscription,
        reader: tokio::spawn(read_loop(id, reader, router.clone(), out_tx, reactor)),
        writer: tokio::spawn(write_loop(id, writer, out_rx)),
    }
}

async fn read_loop(
    id: ClientId,
    mut reader: ChannelReader<ClientRequest>,
    router: CommandRouter,
    out: mpsc::Sender<ServerMessage>,
    reactor: mpsc::UnboundedSender<ReactorMsg>,
) {
    loop {
        let request = match reader.recv().await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionLost) => {
                tracing::debug!(client = %id, "Peer closed connection");
                let _ = reactor.send(ReactorMsg::Closed(id));
                return;
            }
            Err(e) => {
                tracing::warn!(client = %id, error = %e, "Dropping client after protocol error");
                let _ = reactor.send(ReactorMsg::Closed(id));
                return;
            }
        };

        let response = match request {
            ClientRequest::Control(signal) => {
                let _ = reactor.send(ReactorMsg::Control(id, signal));
                return;
            }
            ClientRequest::Command(command) => {
                tracing::debug!(client = %id, command = %command.name, address = %command.address, "Command received");
                let router = router.clone();
                tokio::task::spawn_blocking(move || router.dispatch(command))
                    .await
                    .unwrap_or_else(|e| CommandResponse::failure(format!("command panicked: {e}")))
            }
            ClientRequest::Unsupported(payload) => router.reject(&payload),
        };

        // responses are never dropped; wait for the writer to make room
        if out.send(ServerMessage::Response(response)).await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    id: ClientId,
    mut writer: ChannelWriter<ServerMessage>,
    mut queue: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = queue.recv().await {
        if let Err(e) = writer.send(msg).await {
            tracing::debug!(client = %id, error = %e, "Send failed, closing writer");
            return;
        }
    }
    if let Err(e) = writer.close().await {
        tracing::debug!(client = %id, error = %e, "Close failed");
    }
}
