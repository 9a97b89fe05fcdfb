//! Byte level I/O below the link. The framing makes no assumptions about message boundaries, so a
//!  datagram socket and a byte stream (serial device, TCP connection, pipe) are interchangeable.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ByteSink: Send {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait ByteSource: Send {
    /// Waits for data and returns the number of bytes read. Zero means the source is closed.
    async fn recv_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

/// A UDP socket connected to the peer, so datagrams from anywhere else are filtered out by the OS.
///  Clones share the socket, which allows using one clone as the sink and another as the source.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpTransport {
    pub async fn connect(local: SocketAddr, peer: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        debug!("UDP transport {:?} connected to {:?}", socket.local_addr()?, peer);

        Ok(UdpTransport {
            socket: Arc::new(socket),
            peer,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait::async_trait]
impl ByteSink for UdpTransport {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        match self.socket.send(buf).await {
            Ok(_) => Ok(()),
            // the peer is not listening (yet), which is the same as a lost datagram
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                trace!("peer {:?} refused datagram", self.peer);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ByteSource for UdpTransport {
    async fn recv_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        loop {
            match self.socket.recv(buf).await {
                Ok(len) => return Ok(len),
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    trace!("ICMP port unreachable from {:?}", self.peer);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub struct StreamSink<W> {
    inner: W,
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for StreamSink<W> {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

pub struct StreamSource<R> {
    inner: R,
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for StreamSource<R> {
    async fn recv_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.inner.read(buf).await?)
    }
}

/// Splits a bidirectional byte stream into a sink and a source
pub fn split_stream<S: AsyncRead + AsyncWrite + Send>(stream: S) -> (StreamSink<WriteHalf<S>>, StreamSource<ReadHalf<S>>) {
    let (read, write) = tokio::io::split(stream);
    (StreamSink { inner: write }, StreamSource { inner: read })
}
