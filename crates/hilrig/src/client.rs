//! Client proxy: issue commands to a bench server and observe its events.
//!
//! One command is in flight at a time, so responses match commands by
//! arrival order and need no correlation id.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::bridge::ProtocolError;
use crate::bridge::channel::Channel;
use crate::bridge::protocol::{ClientRequest, Command, CommandResponse, ControlSignal, ServerMessage};
use crate::config::ClientConfig;
use crate::event::EventBus;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection to bench server closed")]
    Closed,
}

/// Incoming responses plus the count of timed-out commands whose answers
/// are still on their way and must be skipped.
struct ResponseQueue {
    rx: mpsc::UnboundedReceiver<CommandResponse>,
    abandoned: usize,
}

impl ResponseQueue {
    /// Next response that belongs to the command just sent.
    async fn next_current(&mut self) -> Option<CommandResponse> {
        loop {
            let response = self.rx.recv().await?;
            if self.abandoned == 0 {
                return Some(response);
            }
            self.abandoned -= 1;
            tracing::debug!(
                result = %response.result,
                message = %response.message,
                "Discarding stale response"
            );
        }
    }
}

pub struct ClientProxy {
    config: ClientConfig,
    outgoing: mpsc::UnboundedSender<ClientRequest>,
    responses: Mutex<ResponseQueue>,
    events: EventBus,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientProxy {
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self::new(Channel::connect_tcp(addr).await?, config))
    }

    /// Start the receive and send tasks on an already connected channel.
    pub fn new(channel: Channel<ServerMessage, ClientRequest>, config: ClientConfig) -> Self {
        let (mut reader, mut writer) = channel.split();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (resp_tx, responses) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let bus = events.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(ServerMessage::Event(event)) => bus.publish(event),
                    Ok(ServerMessage::Response(response)) => {
                        if resp_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::ConnectionLost) => {
                        tracing::debug!("Bench server closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping bench connection after protocol error");
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(request) = out_rx.recv().await {
                if let Err(e) = writer.send(request).await {
                    tracing::warn!(error = %e, "Failed to send request");
                    return;
                }
            }
            if let Err(e) = writer.close().await {
                tracing::debug!(error = %e, "Close failed");
            }
        });

        Self {
            config,
            outgoing,
            responses: Mutex::new(ResponseQueue {
                rx: responses,
                abandoned: 0,
            }),
            events,
            reader,
            writer,
        }
    }

    /// Bus carrying every event the server sends. Events that arrive before
    /// anyone subscribes are held for the first subscriber.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Send one command and wait for its response.
    pub async fn run_command(&self, command: Command) -> Result<CommandResponse, ClientError> {
        let mut responses = self.responses.lock().await;

        let name = command.name.clone();
        self.outgoing
            .send(ClientRequest::Command(command))
            .map_err(|_| ClientError::Closed)?;

        match tokio::time::timeout(self.config.response_timeout, responses.next_current()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => {
                // its answer is still owed; skip it when it shows up
                responses.abandoned += 1;
                tracing::warn!(
                    command = %name,
                    timeout = ?self.config.response_timeout,
                    abandoned = responses.abandoned,
                    "Command timed out"
                );
                Err(ClientError::Timeout(self.config.response_timeout))
            }
        }
    }

    /// Ask the server to shut down, flush everything queued, then close.
    pub async fn terminate(self) -> Result<(), ClientError> {
        self.close_with(ControlSignal::Terminate).await
    }

    /// Leave without affecting the server or other clients.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        self.close_with(ControlSignal::Disconnect).await
    }

    async fn close_with(self, signal: ControlSignal) -> Result<(), ClientError> {
        let Self {
            config,
            outgoing,
            reader,
            writer,
            ..
        } = self;
        outgoing
            .send(ClientRequest::Control(signal))
            .map_err(|_| ClientError::Closed)?;
        drop(outgoing);

        if writer.await.is_err() {
            tracing::error!("Client writer panicked");
        }
        // the server closes its side once our queue on its end is drained
        let mut reader = reader;
        if tokio::time::timeout(config.response_timeout, &mut reader)
            .await
            .is_err()
        {
            tracing::warn!(?signal, "Server did not close the connection, aborting reader");
            reader.abort();
        }
        Ok(())
    }
}
