//! Extension traits for bolting the limiter onto existing streams and listeners.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::{TcpListener, TcpStream};
//! use tokio_tcprate::io::{LimitExt, ListenerLimitExt};
//! use tokio_tcprate::Limiter;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Outbound stream sharing a 32 KiB/s budget with anything else wrapped by `limiter`.
//! let limiter = Limiter::with_limits(32 * 1024, 8 * 1024)?;
//! let mut stream = TcpStream::connect("127.0.0.1:12345")
//!     .await?
//!     .limit_with(&limiter);
//! stream.write_all(b"ping").await?;
//!
//! // Inbound: every accepted stream draws from the listener's own limiter.
//! let listener = TcpListener::bind("127.0.0.1:0").await?.limit_listener();
//! listener.set_limits(1024 * 1024, 64 * 1024)?;
//! # Ok(()) }
//! ```
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    conn::LimitedConn,
    limiter::Limiter,
    listener::{LimitedListener, Listener},
};

/// Stream-side ergonomics. Implemented for every `AsyncRead + AsyncWrite`.
pub trait LimitExt: AsyncRead + AsyncWrite {
    /// Throttle this stream with `limiter`'s global and per-connection limits.
    #[must_use]
    fn limit_with(self, limiter: &Arc<Limiter>) -> LimitedConn<Self>
    where
        Self: Sized,
    {
        limiter.wrap(self)
    }
}

impl<T: AsyncRead + AsyncWrite> LimitExt for T {}

/// Listener-side ergonomics. Implemented for every [`Listener`].
pub trait ListenerLimitExt: Listener {
    /// Wrap with a fresh unlimited limiter; configure it with
    /// [`LimitedListener::set_limits`].
    #[must_use]
    fn limit_listener(self) -> LimitedListener<Self>
    where
        Self: Sized,
    {
        LimitedListener::new(self)
    }

    /// Wrap with an existing limiter.
    #[must_use]
    fn limit_listener_with(self, limiter: Arc<Limiter>) -> LimitedListener<Self>
    where
        Self: Sized,
    {
        LimitedListener::with_limiter(self, limiter)
    }
}

impl<L: Listener> ListenerLimitExt for L {}
