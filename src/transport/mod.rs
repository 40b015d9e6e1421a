//! Transport Layer
//!
//! The single peer connection a scenario owns: an active TCP (or TLS)
//! connect toward a broker under test, or a bind/listen/accept for the
//! connection a client under test is expected to initiate. Reads are
//! framed on packet boundaries and every blocking operation carries an
//! explicit deadline.

mod tls;

pub use tls::{load_tls_connector, TlsClientConfig};

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::codec;

/// Upper bound on one received frame. Far above any packet in the
/// suite; stops a misbehaving peer from growing the buffer without
/// limit.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Transport error types
#[derive(Debug)]
pub enum TransportError {
    /// Active connect failed (refused, unreachable)
    Connect(std::io::Error),
    /// Bind/listen/accept failed
    Accept(std::io::Error),
    /// No data within the deadline
    Timeout,
    /// Peer closed or reset the connection mid-exchange
    ConnectionClosed,
    /// Received data exceeded MAX_FRAME_SIZE without a frame boundary
    FrameTooLarge,
    /// TLS setup or handshake failure
    Tls(String),
    /// Read/write error on an established connection
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "connect failed: {}", e),
            TransportError::Accept(e) => write!(f, "accept failed: {}", e),
            TransportError::Timeout => write!(f, "timed out waiting for peer"),
            TransportError::ConnectionClosed => write!(f, "peer closed the connection"),
            TransportError::FrameTooLarge => write!(f, "frame exceeds maximum size"),
            TransportError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TransportError::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

enum PeerStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PeerStream {
    async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PeerStream::Tcp(s) => s.read(buf).await,
            PeerStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            PeerStream::Tcp(s) => s.write_all(data).await,
            PeerStream::Tls(s) => s.write_all(data).await,
        }
    }
}

/// The one active connection of a running scenario
pub struct PeerLink {
    stream: PeerStream,
    buf: BytesMut,
}

impl PeerLink {
    /// Actively connect to the peer under test (broker scenarios)
    pub async fn connect(addr: SocketAddr, limit: Duration) -> Result<Self, TransportError> {
        let stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Connect)?;
        stream.set_nodelay(true).map_err(TransportError::Connect)?;
        debug!(%addr, "connected");

        Ok(Self {
            stream: PeerStream::Tcp(stream),
            buf: BytesMut::new(),
        })
    }

    /// Actively connect with a TLS wrap (secure-listener scenarios)
    pub async fn connect_tls(
        addr: SocketAddr,
        tls: &TlsClientConfig,
        limit: Duration,
    ) -> Result<Self, TransportError> {
        let connector = load_tls_connector(tls)?;
        let server_name = tls.server_name()?;

        let stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Connect)?;
        stream.set_nodelay(true).map_err(TransportError::Connect)?;

        let stream = timeout(limit, connector.connect(server_name, stream))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!(%addr, "connected (TLS)");

        Ok(Self {
            stream: PeerStream::Tls(Box::new(stream)),
            buf: BytesMut::new(),
        })
    }

    /// Write one encoded packet to the peer
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await.map_err(TransportError::Io)
    }

    /// Read exactly one framed packet, waiting at most `limit`.
    ///
    /// Frame boundaries come from the fixed header's remaining length.
    /// Bytes that cannot frame at all (bad type, broken varint) are
    /// returned as-is so the matcher can report them as malformed
    /// rather than this layer guessing.
    pub async fn recv_frame(&mut self, limit: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + limit;

        loop {
            match codec::decode(&self.buf) {
                Ok(Some((_, consumed))) => return Ok(self.buf.split_to(consumed).freeze()),
                Ok(None) => {}
                Err(_) => return Ok(self.buf.split().freeze()),
            }

            if self.buf.len() >= MAX_FRAME_SIZE {
                return Err(TransportError::FrameTooLarge);
            }

            let mut chunk = [0u8; 4096];
            let n = timeout_at(deadline, self.stream.read_some(&mut chunk))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(TransportError::Io)?;

            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Wait for the peer to close the connection. True when it closed
    /// or reset within the deadline; false when it sent data or stayed
    /// silent past the deadline.
    pub async fn expect_close(&mut self, limit: Duration) -> bool {
        if !self.buf.is_empty() {
            return false; // unconsumed bytes already contradict a close
        }
        let mut chunk = [0u8; 64];
        match timeout(limit, self.stream.read_some(&mut chunk)).await {
            Ok(Ok(0)) => true,
            Ok(Err(_)) => true, // reset counts as closed
            _ => false,
        }
    }
}

/// Listening socket for client-under-test scenarios. Bound with
/// SO_REUSEADDR so back-to-back scenarios can reuse the port as soon as
/// the previous process has exited.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::Accept)?;
        socket.set_reuse_address(true).map_err(TransportError::Accept)?;
        socket.set_nonblocking(true).map_err(TransportError::Accept)?;
        socket.bind(&addr.into()).map_err(TransportError::Accept)?;
        socket.listen(5).map_err(TransportError::Accept)?;

        let inner =
            TcpListener::from_std(socket.into()).map_err(TransportError::Accept)?;
        debug!(%addr, "listening");

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::Accept)
    }

    /// Accept the single connection the client under test initiates
    pub async fn accept(&self, limit: Duration) -> Result<PeerLink, TransportError> {
        let (stream, addr) = timeout(limit, self.inner.accept())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Accept)?;
        stream.set_nodelay(true).map_err(TransportError::Accept)?;
        debug!(%addr, "accepted");

        Ok(PeerLink {
            stream: PeerStream::Tcp(stream),
            buf: BytesMut::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_bytes;
    use crate::protocol::Packet;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn frame_boundaries_follow_remaining_length() {
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut link = PeerLink::connect(addr, Duration::from_secs(1)).await.unwrap();
            // Two packets in a single write
            let mut data = encode_to_bytes(&Packet::PingReq).unwrap();
            data.extend_from_slice(&encode_to_bytes(&Packet::Disconnect).unwrap());
            link.send(&data).await.unwrap();
            link
        });

        let mut server = listener.accept(Duration::from_secs(1)).await.unwrap();
        let first = server.recv_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&first[..], &[192, 0]);
        let second = server.recv_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&second[..], &[224, 0]);

        client.await.unwrap();
    }

    #[tokio::test]
    async fn recv_times_out_on_silence() {
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = PeerLink::connect(addr, Duration::from_secs(1)).await.unwrap();
        let mut server = listener.accept(Duration::from_secs(1)).await.unwrap();

        match server.recv_frame(Duration::from_millis(50)).await {
            Err(TransportError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other.map(|b| b.to_vec())),
        }
    }

    #[tokio::test]
    async fn expect_close_sees_a_dropped_peer() {
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = PeerLink::connect(addr, Duration::from_secs(1)).await.unwrap();
        let mut server = listener.accept(Duration::from_secs(1)).await.unwrap();

        drop(client);
        assert!(server.expect_close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn connect_to_dead_port_is_refused() {
        // Bind then drop to find a port nothing listens on
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match PeerLink::connect(addr, Duration::from_secs(1)).await {
            Err(TransportError::Connect(_)) => {}
            other => panic!("expected refusal, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[tokio::test]
    async fn unframeable_bytes_are_handed_to_the_caller() {
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut link = PeerLink::connect(addr, Duration::from_secs(1)).await.unwrap();
            // Packet type 0 is reserved: no frame boundary can be found
            link.send(&[0x00, 0x00]).await.unwrap();
            link
        });

        let mut server = listener.accept(Duration::from_secs(1)).await.unwrap();
        let frame = server.recv_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&frame[..], &[0x00, 0x00]);

        client.await.unwrap();
    }
}
