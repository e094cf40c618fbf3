use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// One leg of an intercepted connection.
///
/// The client leg is either plain TCP or a TLS session terminated with a
/// CA-issued leaf; the origin leg is either plain TCP or a TLS session the
/// proxy opened itself.
#[derive(Debug)]
pub enum Socket {
  /// TCP
  Tcp(TcpStream),
  /// TLS terminated by the proxy, facing the client
  ServerTls(Box<server::TlsStream<TcpStream>>),
  /// TLS initiated by the proxy, facing the origin
  ClientTls(Box<client::TlsStream<TcpStream>>),
}

impl From<TcpStream> for Socket {
  fn from(stream: TcpStream) -> Self {
    Socket::Tcp(stream)
  }
}

impl From<server::TlsStream<TcpStream>> for Socket {
  fn from(stream: server::TlsStream<TcpStream>) -> Self {
    Socket::ServerTls(Box::new(stream))
  }
}

impl From<client::TlsStream<TcpStream>> for Socket {
  fn from(stream: client::TlsStream<TcpStream>) -> Self {
    Socket::ClientTls(Box::new(stream))
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      Socket::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      Socket::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      Socket::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      Socket::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      Socket::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      Socket::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      Socket::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      Socket::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
