//! Message channels: one contract, two carriers.
//!
//! - **Framed**: any byte stream (TCP, Unix socket) with [`FrameCodec`] framing
//! - **Local**: in-process queue pair, values passed without serialization
//!
//! A channel splits into a reader and a writer so one task can receive while
//! another sends.

use std::net::SocketAddr;
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::ProtocolError;
use super::codec::FrameCodec;

type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Receiving half of a [`Channel`].
pub struct ChannelReader<In> {
    inner: ReaderInner<In>,
}

enum ReaderInner<In> {
    Framed(FramedRead<BoxedRead, FrameCodec<In>>),
    Local(mpsc::UnboundedReceiver<In>),
}

/// Sending half of a [`Channel`].
pub struct ChannelWriter<Out> {
    inner: WriterInner<Out>,
}

enum WriterInner<Out> {
    Framed(FramedWrite<BoxedWrite, FrameCodec<Out>>),
    Local(Option<mpsc::UnboundedSender<Out>>),
}

impl<In: DeserializeOwned> ChannelReader<In> {
    /// Wait for the next message.
    ///
    /// Returns [`ProtocolError::ConnectionLost`] when the peer has gone away.
    pub async fn recv(&mut self) -> Result<In, ProtocolError> {
        match &mut self.inner {
            ReaderInner::Framed(framed) => match framed.next().await {
                Some(Ok(msg)) => Ok(msg),
                Some(Err(e)) => Err(e),
                None => Err(ProtocolError::ConnectionLost),
            },
            ReaderInner::Local(rx) => rx.recv().await.ok_or(ProtocolError::ConnectionLost),
        }
    }
}

impl<Out: Serialize> ChannelWriter<Out> {
    /// Send one message, flushing it completely before returning.
    pub async fn send(&mut self, msg: Out) -> Result<(), ProtocolError> {
        match &mut self.inner {
            WriterInner::Framed(framed) => framed.send(msg).await,
            WriterInner::Local(Some(tx)) => tx.send(msg).map_err(|_| ProtocolError::ConnectionLost),
            WriterInner::Local(None) => Err(ProtocolError::ChannelClosed),
        }
    }

    /// Flush and shut down the write side. The peer's reader sees end of stream.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        match &mut self.inner {
            WriterInner::Framed(framed) => framed.close().await,
            WriterInner::Local(tx) => {
                tx.take();
                Ok(())
            }
        }
    }
}

/// Bidirectional message channel.
pub struct Channel<In, Out> {
    reader: ChannelReader<In>,
    writer: ChannelWriter<Out>,
}

impl<In, Out> Channel<In, Out>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    /// Wrap a byte stream with digest-checked JSON framing.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::from_parts(Box::pin(read), Box::pin(write))
    }

    fn from_parts(read: BoxedRead, write: BoxedWrite) -> Self {
        Self {
            reader: ChannelReader {
                inner: ReaderInner::Framed(FramedRead::new(read, FrameCodec::new())),
            },
            writer: ChannelWriter {
                inner: WriterInner::Framed(FramedWrite::new(write, FrameCodec::new())),
            },
        }
    }

    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "Connected to bench server");
        let (read, write) = stream.into_split();
        Ok(Self::from_parts(Box::pin(read), Box::pin(write)))
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: &std::path::Path) -> Result<Self, ProtocolError> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        tracing::debug!(path = %path.display(), "Connected to bench server");
        let (read, write) = stream.into_split();
        Ok(Self::from_parts(Box::pin(read), Box::pin(write)))
    }

    pub async fn send(&mut self, msg: Out) -> Result<(), ProtocolError> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<In, ProtocolError> {
        self.reader.recv().await
    }

    pub fn split(self) -> (ChannelReader<In>, ChannelWriter<Out>) {
        (self.reader, self.writer)
    }
}

/// Connected in-process channel pair. Each side reads what the other writes.
pub fn local_pair<A, B>() -> (Channel<A, B>, Channel<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel::<A>();
    let (b_tx, b_rx) = mpsc::unbounded_channel::<B>();
    let left = Channel {
        reader: ChannelReader {
            inner: ReaderInner::Local(a_rx),
        },
        writer: ChannelWriter {
            inner: WriterInner::Local(Some(b_tx)),
        },
    };
    let right = Channel {
        reader: ChannelReader {
            inner: ReaderInner::Local(b_rx),
        },
        writer: ChannelWriter {
            inner: WriterInner::Local(Some(a_tx)),
        },
    };
    (left, right)
}
