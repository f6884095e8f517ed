//! Peer links
//!
//! A [`PeerLink`] moves whole protocol [`Message`]s between the client and
//! the daemon, whatever the underlying transport. The handshake runs over a
//! link, and once it succeeds the link carries opaque `Data` frames.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use ras_protocol::{decode_message, encode_message, FrameCodec, Message};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::ConnectionError;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65_507;

/// Bidirectional message transport to the peer
#[async_trait]
pub trait PeerLink: Send {
    /// Send one message
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError>;

    /// Receive the next message; `Ok(None)` once the peer has gone away
    async fn recv(&mut self) -> Result<Option<Message>, ConnectionError>;

    /// Close the link. Further sends fail.
    async fn close(&mut self) -> Result<(), ConnectionError>;

    /// Local address, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Owned, type-erased link
pub type BoxedLink = Box<dyn PeerLink>;

/// Link over any byte stream, framed with [`FrameCodec`]
pub struct StreamLink<S> {
    framed: Framed<S, FrameCodec>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a stream
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            local: None,
            peer: None,
            closed: false,
        }
    }
}

impl StreamLink<TcpStream> {
    /// Wrap a connected TCP stream
    pub fn tcp(stream: TcpStream) -> Self {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);

        let mut link = Self::new(stream);
        link.local = local;
        link.peer = peer;
        link
    }
}

/// Two in-memory links connected to each other
pub fn duplex_pair(max_buf_size: usize) -> (StreamLink<DuplexStream>, StreamLink<DuplexStream>) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (StreamLink::new(a), StreamLink::new(b))
}

#[async_trait]
impl<S> PeerLink for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.framed.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>, ConnectionError> {
        if self.closed {
            return Ok(None);
        }
        match self.framed.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Link over a UDP socket, one frame per datagram.
///
/// Datagrams from other senders, leftover hole-punch probes and undecodable
/// datagrams are skipped.
pub struct DatagramLink {
    socket: UdpSocket,
    peer: SocketAddr,
    buf: Vec<u8>,
    closed: bool,
}

impl DatagramLink {
    /// Use `socket` to talk to `peer`
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            buf: vec![0u8; MAX_DATAGRAM],
            closed: false,
        }
    }
}

#[async_trait]
impl PeerLink for DatagramLink {
    async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let frame = encode_message(&message)?;
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>, ConnectionError> {
        while !self.closed {
            let (len, from) = self.socket.recv_from(&mut self.buf).await?;
            if from != self.peer {
                debug!("Ignoring datagram from unexpected sender {}", from);
                continue;
            }

            match decode_message(&self.buf[..len]) {
                Ok(Message::Probe { .. }) => continue,
                Ok(Message::Close { .. }) => {
                    self.closed = true;
                    return Ok(None);
                }
                Ok(message) => return Ok(Some(message)),
                Err(e) => debug!("Dropping undecodable datagram from {}: {}", from, e),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = encode_message(&Message::Close { reason: None })?;
        // Best effort: the peer may already be gone
        let _ = self.socket.send_to(&frame, self.peer).await;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}
