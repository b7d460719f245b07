//! Shared listening sockets.
//!
//! Every worker binds the same address with `SO_REUSEPORT` set before bind,
//! so the kernel spreads inbound connections across the group. With a TLS
//! configuration the raw listener is wrapped so that connections are only
//! handed out after a completed handshake.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, warn};

use crate::error::{PreforkError, Result};

/// Listen backlog for the shared socket.
const BACKLOG: u32 = 1024;

/// Upper bound on a single TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting to be picked up by the server.
const HANDSHAKE_QUEUE: usize = 128;

/// Back-off after a failed `accept(2)` (e.g. EMFILE).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bind `addr` with port reuse enabled, optionally wrapping it in TLS.
///
/// Must be called from within a tokio runtime.
pub async fn bind(addr: &str, tls: Option<Arc<ServerConfig>>) -> Result<Listener> {
    let socket_addr = resolve(addr).await?;
    let listener = bind_reuseport(socket_addr).map_err(|source| PreforkError::Bind {
        addr: addr.to_string(),
        source,
    })?;

    match tls {
        Some(config) => Listener::tls(listener, config),
        None => Listener::plain(listener),
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| PreforkError::InvalidAddress(addr.to_string()))
}

fn bind_reuseport(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// A bound listener, plain or TLS.
pub struct Listener {
    local_addr: SocketAddr,
    kind: Kind,
}

enum Kind {
    Plain(TcpListener),
    Tls {
        incoming: mpsc::Receiver<(Connection, SocketAddr)>,
        acceptor: JoinHandle<()>,
    },
}

impl Listener {
    fn plain(listener: TcpListener) -> Result<Self> {
        Ok(Self {
            local_addr: listener.local_addr()?,
            kind: Kind::Plain(listener),
        })
    }

    fn tls(listener: TcpListener, config: Arc<ServerConfig>) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let (ready, incoming) = mpsc::channel(HANDSHAKE_QUEUE);
        let acceptor = tokio::spawn(tls_accept_loop(
            listener,
            TlsAcceptor::from(config),
            ready,
        ));
        Ok(Self {
            local_addr,
            kind: Kind::Tls { incoming, acceptor },
        })
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.kind, Kind::Tls { .. })
    }

    /// Accept the next connection. TLS connections are returned post-handshake.
    pub async fn next_connection(&mut self) -> io::Result<(Connection, SocketAddr)> {
        match &mut self.kind {
            Kind::Plain(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Plain(stream), peer))
            }
            Kind::Tls { incoming, .. } => incoming.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "TLS acceptor stopped")
            }),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Kind::Tls { acceptor, .. } = &self.kind {
            acceptor.abort();
        }
    }
}

impl axum::serve::Listener for Listener {
    type Io = Connection;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.next_connection().await {
                Ok(conn) => return conn,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Accept raw TCP and hand each stream to its own handshake task.
async fn tls_accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<(Connection, SocketAddr)>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = ready.closed() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "TLS listener accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = ready.send((Connection::Tls(Box::new(tls)), peer)).await;
                }
                Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%peer, "TLS handshake timed out"),
            }
        });
    }
}

/// An accepted connection.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Self::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(s) => s.is_write_vectored(),
            Self::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
