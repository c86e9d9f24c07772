//! Transport selection and the connected stream.
//!
//! Platforms with filesystem sockets talk to the worker over a Unix domain
//! socket inside the worker's private runtime directory. Elsewhere the
//! worker listens on a loopback TCP port picked by a throw-away probe.
//!
//! The TCP probe is released before the worker binds the port, so another
//! process can grab it in between. That window is accepted: the worker
//! fails to bind, never becomes ready, and the start reports a timeout.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;

/// File name of the worker socket inside the runtime directory.
pub const SOCKET_FILE_NAME: &str = "katex.sock";

/// Requested transport strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix socket where supported, TCP loopback otherwise.
    #[default]
    Auto,
    Unix,
    Tcp,
}

impl TransportKind {
    /// Resolve against platform capabilities.
    pub fn resolve(self) -> TransportKind {
        match self {
            TransportKind::Auto | TransportKind::Unix if cfg!(unix) => TransportKind::Unix,
            TransportKind::Unix => {
                tracing::warn!("Unix sockets are unavailable on this platform; using TCP");
                TransportKind::Tcp
            }
            _ => TransportKind::Tcp,
        }
    }
}

/// Where the worker listens. Fixed for the lifetime of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    UnixSocket(PathBuf),
    TcpLoopback { host: IpAddr, port: u16 },
}

impl TransportAddress {
    /// Command-line arguments telling the worker where to listen.
    pub fn worker_args(&self) -> Vec<OsString> {
        match self {
            TransportAddress::UnixSocket(path) => {
                vec!["--socket".into(), path.as_os_str().to_owned()]
            }
            TransportAddress::TcpLoopback { port, .. } => {
                vec!["--port".into(), port.to_string().into()]
            }
        }
    }

    /// Whether a connection attempt is worth making yet.
    ///
    /// A Unix socket is only attempted once its file exists; TCP has no such
    /// signal and is always attempted.
    pub async fn may_be_ready(&self) -> bool {
        match self {
            TransportAddress::UnixSocket(path) => {
                tokio::fs::try_exists(path).await.unwrap_or(false)
            }
            TransportAddress::TcpLoopback { .. } => true,
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::UnixSocket(path) => write!(f, "unix:{}", path.display()),
            TransportAddress::TcpLoopback { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// Pick the worker address for `kind`, placing Unix sockets in `runtime_dir`.
///
/// Must be called from within a tokio runtime when the result is TCP.
pub fn choose_transport(kind: TransportKind, runtime_dir: &Path) -> io::Result<TransportAddress> {
    match kind.resolve() {
        TransportKind::Unix => Ok(TransportAddress::UnixSocket(
            runtime_dir.join(SOCKET_FILE_NAME),
        )),
        _ => {
            let port = ephemeral_port()?;
            Ok(TransportAddress::TcpLoopback {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
            })
        }
    }
}

/// Ask the OS for a free loopback port by binding a short-lived listener.
fn ephemeral_port() -> io::Result<u16> {
    let probe = TcpSocket::new_v4()?;
    probe.set_reuseaddr(true)?;
    probe.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
    let listener = probe.listen(1)?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// A connected worker stream.
#[derive(Debug)]
pub enum Transport {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    pub async fn connect(address: &TransportAddress) -> io::Result<Self> {
        match address {
            #[cfg(unix)]
            TransportAddress::UnixSocket(path) => Ok(Transport::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            TransportAddress::UnixSocket(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Unix sockets are unavailable on this platform",
            )),
            TransportAddress::TcpLoopback { host, port } => {
                let stream = TcpStream::connect((*host, *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Transport::Tcp(stream))
            }
        }
    }

    /// Shut down the write half; the socket closes when the value is dropped.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
