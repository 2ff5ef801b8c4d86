//! Listener decorator binding every accepted connection to one shared [`Limiter`].
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use tokio_tcprate::listener::LimitedListener;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let listener = LimitedListener::new(TcpListener::bind("127.0.0.1:8080").await?);
//! listener.set_limits(1024 * 1024, 64 * 1024)?; // 1 MiB/s total, 64 KiB/s per connection
//!
//! loop {
//!     let (mut conn, _addr) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = conn.write_all(&[0u8; 256 * 1024]).await;
//!     });
//! }
//! # }
//! ```
use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::{conn::LimitedConn, limiter::Limiter, Error};

/// Anything that accepts duplex byte streams.
pub trait Listener {
    /// Stream produced by [`accept`](Listener::accept).
    type Io: AsyncRead + AsyncWrite;
    /// Peer address reported with each stream.
    type Addr;

    /// Accept the next incoming connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send;

    /// Local address the listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for tokio::net::TcpListener {
    type Io = tokio::net::TcpStream;
    type Addr = SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        tokio::net::TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::TcpListener::local_addr(self)
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        tokio::net::UnixListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// A listener whose accepted connections share one global limit and each obey the
/// per-connection limit.
///
/// Dropping it drops (closes) the inner listener. Connections already accepted keep working
/// against the limiter, which they hold a handle to.
pub struct LimitedListener<L> {
    inner: L,
    limiter: Arc<Limiter>,
}

impl<L> LimitedListener<L> {
    /// Wrap `inner` with a fresh, unlimited [`Limiter`].
    pub fn new(inner: L) -> Self {
        Self::with_limiter(inner, Limiter::new())
    }

    /// Wrap `inner` with an existing limiter, e.g. to share one budget between listeners.
    pub fn with_limiter(inner: L, limiter: Arc<Limiter>) -> Self {
        Self { inner, limiter }
    }

    /// Set the global and per-connection limits in bytes per second.
    ///
    /// May be called at any time; open connections pick the change up at their next round.
    pub fn set_limits(&self, global: usize, per_conn: usize) -> Result<(), Error> {
        self.limiter.set_limits(global, per_conn)
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: Listener> LimitedListener<L> {
    /// Accept a connection and bind it to the shared limiter.
    ///
    /// Errors from the inner listener are returned unchanged.
    pub async fn accept(&self) -> io::Result<(LimitedConn<L::Io>, L::Addr)> {
        let (io, addr) = self.inner.accept().await?;
        debug!(
            per_conn = self.limiter.per_conn_limit(),
            "accepted rate-limited connection"
        );
        Ok((self.limiter.wrap(io), addr))
    }

    pub fn local_addr(&self) -> io::Result<L::Addr> {
        self.inner.local_addr()
    }
}

impl<L: fmt::Debug> fmt::Debug for LimitedListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedListener")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UNLIMITED;
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        net::{TcpListener, TcpStream},
        sync::{mpsc, Mutex},
        time::{Duration, Instant},
    };

    /// In-memory listener fed through a channel; `accept` fails once the sender is gone.
    struct ChannelListener {
        rx: Mutex<mpsc::Receiver<DuplexStream>>,
    }

    impl ChannelListener {
        fn new() -> (mpsc::Sender<DuplexStream>, Self) {
            let (tx, rx) = mpsc::channel(8);
            (tx, Self { rx: Mutex::new(rx) })
        }
    }

    impl Listener for ChannelListener {
        type Io = DuplexStream;
        type Addr = ();

        fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
            async move {
                match self.rx.lock().await.recv().await {
                    Some(io) => Ok((io, ())),
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "closed")),
                }
            }
        }

        fn local_addr(&self) -> io::Result<Self::Addr> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_connections_share_one_limiter() {
        let (tx, raw) = ChannelListener::new();
        let listener = LimitedListener::new(raw);
        listener.set_limits(20, UNLIMITED).unwrap();

        let mut peers = Vec::new();
        for _ in 0..2 {
            let (a, b) = duplex(1024);
            tx.send(a).await.unwrap();
            peers.push(b);
        }

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let (mut conn, ()) = listener.accept().await.unwrap();
            assert!(Arc::ptr_eq(conn.limiter(), listener.limiter()));
            tasks.push(tokio::spawn(async move {
                let start = Instant::now();
                conn.write_limited(&[9u8; 100]).await.unwrap();
                start.elapsed()
            }));
        }

        for task in tasks {
            let elapsed = task.await.unwrap();
            // 200 bytes through a 20 B/s global bucket with 20 bytes of burst.
            assert!(
                elapsed >= Duration::from_secs(7) && elapsed <= Duration::from_secs(10),
                "elapsed {elapsed:?}"
            );
        }

        for mut peer in peers {
            let mut out = [0u8; 100];
            peer.read_exact(&mut out).await.unwrap();
            assert!(out.iter().all(|b| *b == 9));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn limits_can_change_after_accept() {
        let (tx, raw) = ChannelListener::new();
        let listener = LimitedListener::new(raw);

        let (a, _b) = duplex(1024);
        tx.send(a).await.unwrap();
        let (mut conn, ()) = listener.accept().await.unwrap();
        assert_eq!(conn.per_conn_limit(), UNLIMITED);

        listener.set_limits(UNLIMITED, 10).unwrap();
        let start = Instant::now();
        conn.write_limited(&[0u8; 30]).await.unwrap();
        assert_eq!(conn.per_conn_limit(), 10);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn accept_errors_are_propagated() {
        let (tx, raw) = ChannelListener::new();
        drop(tx);
        let listener = LimitedListener::new(raw);

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let (_tx, raw) = ChannelListener::new();
        let listener = LimitedListener::new(raw);
        assert!(matches!(
            listener.set_limits(0, 10),
            Err(Error::InvalidBandwidth(0))
        ));
    }

    #[tokio::test]
    async fn tcp_listener_round_trip() {
        let listener = LimitedListener::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            out
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        conn.write_all(b"limited hello").await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);

        assert_eq!(client.await.unwrap(), b"limited hello");
    }
}
