//! Global and per-connection bandwidth limits for Tokio streams and listeners.
//!
//! A [`Limiter`] holds two independent knobs, both in **bytes per second** and both adjustable
//! while transfers are running:
//!
//! - the **global** limit, enforced by one token bucket shared by every connection bound to the
//!   limiter, and
//! - the **per-connection** limit, which every [`LimitedConn`] pulls into its own private bucket
//!   at the start of each I/O round.
//!
//! [`LimitedListener`] wraps a listener so that every accepted stream is bound to the same
//! limiter. [`UNLIMITED`] (the default for both knobs) disables throttling entirely.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use tokio_tcprate::LimitedListener;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = LimitedListener::new(TcpListener::bind("0.0.0.0:9000").await?);
//! listener.set_limits(10 * 1024 * 1024, 512 * 1024)?;
//!
//! let limiter = listener.limiter().clone();
//! tokio::spawn(async move {
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     // Tighten the global budget for everybody, in flight.
//!     let _ = limiter.set_global_bandwidth(1024 * 1024);
//! });
//!
//! loop {
//!     let (mut conn, _) = listener.accept().await?;
//!     tokio::spawn(async move { conn.write_all(&vec![0u8; 1 << 24]).await });
//! }
//! # }
//! ```
pub mod bucket;
pub mod conn;
pub mod error;
pub mod io;
pub mod limiter;
pub mod listener;

pub use conn::LimitedConn;
pub use error::{Error, TransferError};
pub use limiter::{Limiter, Limits, UNLIMITED};
pub use listener::{LimitedListener, Listener};
