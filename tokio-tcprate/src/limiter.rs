//! The shared limiter: one global token supply plus an advisory per-connection cap.
//!
//! A [`Limiter`] is created once per listener and shared (as `Arc<Limiter>`) with every
//! connection accepted from it. It is the single arbitration point for quota: each I/O round of
//! every [`LimitedConn`] asks it how many bytes may be moved, and the answer is capped by both
//! the global and the per-connection limit. Capping every grant to at most one per-connection
//! quota keeps a single connection from draining a whole second of global allowance at once;
//! connections that need more re-enter the queue round after round, which approximates
//! round-robin sharing of the global bucket.
//!
//! ```
//! use tokio::io::{duplex, AsyncWriteExt};
//! use tokio_tcprate::{Limiter, UNLIMITED};
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Limiter::new();
//! limiter.set_global_bandwidth(64 * 1024)?; // 64 KiB/s shared by all connections
//! limiter.set_per_conn_bandwidth(8 * 1024)?; // 8 KiB/s each
//!
//! let (a, _peer) = duplex(1024);
//! let mut conn = limiter.wrap(a);
//! conn.write_all(b"hello").await?;
//!
//! limiter.set_per_conn_bandwidth(UNLIMITED)?; // picked up at the next round
//! # Ok(()) }
//! ```
use std::{fmt, sync::Arc};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    bucket::{Epoch, Reservation, TokenBucket},
    conn::LimitedConn,
    Error,
};

/// Sentinel bandwidth value disabling throttling (infinite rate, unbounded burst).
pub const UNLIMITED: usize = usize::MAX;

/// Snapshot of both limits, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub global: usize,
    pub per_conn: usize,
}

impl Limits {
    /// Smallest of `requested` and both limits.
    #[inline]
    pub fn cap(&self, requested: usize) -> usize {
        requested.min(self.global).min(self.per_conn)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            global: UNLIMITED,
            per_conn: UNLIMITED,
        }
    }
}

/// Reject non-positive bandwidths.
pub(crate) fn validate_bandwidth(bytes_per_sec: usize) -> Result<usize, Error> {
    if bytes_per_sec == 0 {
        return Err(Error::InvalidBandwidth(bytes_per_sec));
    }
    Ok(bytes_per_sec)
}

/// Quota granted for one round, with the global reservation backing it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Quota {
    pub(crate) granted: usize,
    pub(crate) reservation: Reservation,
}

struct Settings {
    limits: Limits,
    /// Advanced on every limit change so pending waits can re-check their grant.
    epoch: Epoch,
}

/// Global and per-connection bandwidth limits shared by a set of connections.
///
/// Limit changes take effect for waits already in progress, not only for later rounds.
pub struct Limiter {
    settings: RwLock<Settings>,
    global: TokenBucket,
}

impl Limiter {
    /// Create a limiter with both limits unlimited.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            settings: RwLock::new(Settings {
                limits: Limits::default(),
                epoch: Epoch::new(),
            }),
            global: TokenBucket::unlimited(),
        })
    }

    /// Create a limiter with the given global and per-connection limits.
    pub fn with_limits(global: usize, per_conn: usize) -> Result<Arc<Self>, Error> {
        let limiter = Self::new();
        limiter.set_limits(global, per_conn)?;
        Ok(limiter)
    }

    /// Set the aggregate limit in **bytes per second** and resize the global bucket to one
    /// second of burst. [`UNLIMITED`] disables global throttling.
    pub fn set_global_bandwidth(&self, bytes_per_sec: usize) -> Result<(), Error> {
        let bytes_per_sec = validate_bandwidth(bytes_per_sec)?;

        let mut settings = self.settings.write();
        self.global.reconfigure(bytes_per_sec, bytes_per_sec);
        settings.limits.global = bytes_per_sec;
        let previous = settings.epoch.advance();
        drop(settings);
        previous.cancel();

        debug!(global = bytes_per_sec, "global bandwidth updated");
        Ok(())
    }

    /// Set the per-connection limit in **bytes per second**.
    ///
    /// Connections blocked in a round re-cap their grant at once; idle ones pick the new
    /// value up at their next I/O round.
    pub fn set_per_conn_bandwidth(&self, bytes_per_sec: usize) -> Result<(), Error> {
        let bytes_per_sec = validate_bandwidth(bytes_per_sec)?;

        let mut settings = self.settings.write();
        settings.limits.per_conn = bytes_per_sec;
        let previous = settings.epoch.advance();
        drop(settings);
        previous.cancel();

        debug!(per_conn = bytes_per_sec, "per-connection bandwidth updated");
        Ok(())
    }

    /// Set both limits. Each value is validated before either is applied.
    pub fn set_limits(&self, global: usize, per_conn: usize) -> Result<(), Error> {
        validate_bandwidth(global)?;
        validate_bandwidth(per_conn)?;
        self.set_global_bandwidth(global)?;
        self.set_per_conn_bandwidth(per_conn)
    }

    /// Consistent snapshot of both limits.
    pub fn limits(&self) -> Limits {
        self.settings.read().limits
    }

    /// Aggregate limit in bytes per second.
    pub fn global_limit(&self) -> usize {
        self.settings.read().limits.global
    }

    /// Limit each connection pulls at the start of its next round, in bytes per second.
    pub fn per_conn_limit(&self) -> usize {
        self.settings.read().limits.per_conn
    }

    /// Number of limit changes so far.
    pub(crate) fn generation(&self) -> u64 {
        self.settings.read().epoch.generation()
    }

    /// Token cancelled by the first limit change after `generation`.
    pub(crate) fn changed_since(&self, generation: u64) -> CancellationToken {
        self.settings.read().epoch.since(generation)
    }

    /// Cap `requested` by both limits and reserve that many tokens from the global bucket.
    ///
    /// The reservation is taken under the read lock, so a concurrent
    /// [`set_global_bandwidth`](Self::set_global_bandwidth) cannot shrink the bucket between
    /// the snapshot and the reservation.
    pub(crate) fn reserve_quota(&self, requested: usize) -> Result<Quota, Error> {
        let settings = self.settings.read();
        let granted = settings.limits.cap(requested);
        let reservation = self.global.reserve(granted)?;
        Ok(Quota {
            granted,
            reservation,
        })
    }

    /// Bring a pending quota in line with limits changed after it was reserved.
    ///
    /// A grant the new limits still allow keeps its place in the global queue and only has
    /// its wait re-timed; a grant they no longer allow is handed back and reserved again at
    /// the new size.
    pub(crate) fn refresh_quota(&self, quota: Quota) -> Result<Quota, Error> {
        let settings = self.settings.read();
        let granted = settings.limits.cap(quota.granted);
        if granted == quota.granted {
            return Ok(Quota {
                granted,
                reservation: self.global.reschedule(quota.reservation),
            });
        }

        self.global.cancel(quota.reservation);
        let reservation = self.global.reserve(granted)?;
        Ok(Quota {
            granted,
            reservation,
        })
    }

    /// Hand an unused global reservation back.
    pub(crate) fn release(&self, reservation: Reservation) {
        self.global.cancel(reservation);
    }

    /// Grant up to `requested` bytes for one round, waiting on the global bucket.
    ///
    /// Returns `min(requested, global, per_conn)` once that many global tokens are available,
    /// or [`Error::Cancelled`] if `cancel` fires first. If the limits change while waiting,
    /// the grant is re-capped and the wait re-timed under the new values.
    pub async fn request_quota(
        &self,
        requested: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut generation = self.generation();
        let mut quota = self.reserve_quota(requested)?;
        loop {
            let ready_at = quota.reservation.ready_at();
            if ready_at <= tokio::time::Instant::now() {
                return Ok(quota.granted);
            }

            let changed = self.changed_since(generation);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.release(quota.reservation);
                    return Err(Error::Cancelled);
                }
                _ = changed.cancelled() => {
                    generation = self.generation();
                    quota = self.refresh_quota(quota)?;
                }
                _ = tokio::time::sleep_until(ready_at) => return Ok(quota.granted),
            }
        }
    }

    /// Wrap `io` so its reads and writes draw from this limiter.
    pub fn wrap<T>(self: &Arc<Self>, io: T) -> LimitedConn<T> {
        LimitedConn::new(io, self.clone())
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("limits", &self.limits())
            .field("global", &self.global)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration, Instant};

    #[tokio::test(start_paused = true)]
    async fn defaults_are_unlimited() {
        let limiter = Limiter::new();
        assert_eq!(limiter.limits(), Limits::default());
        assert_eq!(limiter.global_limit(), UNLIMITED);
        assert_eq!(limiter.per_conn_limit(), UNLIMITED);

        let never = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..10 {
            let granted = limiter.request_quota(1 << 20, &never).await.unwrap();
            assert_eq!(granted, 1 << 20);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn zero_bandwidth_is_rejected() {
        let limiter = Limiter::new();
        assert!(matches!(
            limiter.set_global_bandwidth(0),
            Err(Error::InvalidBandwidth(0))
        ));
        assert!(matches!(
            limiter.set_per_conn_bandwidth(0),
            Err(Error::InvalidBandwidth(0))
        ));
        assert_eq!(limiter.limits(), Limits::default());
    }

    #[test]
    fn set_limits_validates_both_before_applying() {
        let limiter = Limiter::new();
        assert!(limiter.set_limits(100, 0).is_err());
        assert_eq!(limiter.global_limit(), UNLIMITED);

        limiter.set_limits(100, 10).unwrap();
        assert_eq!(
            limiter.limits(),
            Limits {
                global: 100,
                per_conn: 10
            }
        );
    }

    #[test]
    fn limits_are_independent() {
        let limiter = Limiter::with_limits(10, 1000).unwrap();
        assert_eq!(limiter.global_limit(), 10);
        assert_eq!(limiter.per_conn_limit(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_is_capped_by_both_limits() {
        let limiter = Limiter::new();
        let never = CancellationToken::new();

        limiter.set_per_conn_bandwidth(15).unwrap();
        assert_eq!(limiter.request_quota(300, &never).await.unwrap(), 15);
        assert_eq!(limiter.request_quota(7, &never).await.unwrap(), 7);

        limiter.set_global_bandwidth(10).unwrap();
        assert_eq!(limiter.request_quota(300, &never).await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn global_bucket_paces_grants() {
        let limiter = Limiter::with_limits(20, UNLIMITED).unwrap();
        let never = CancellationToken::new();
        let start = Instant::now();

        let mut total = 0;
        while total < 100 {
            total += limiter.request_quota(100 - total, &never).await.unwrap();
        }
        // 20 bytes of burst, then 80 bytes at 20 B/s.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_round_robin() {
        let limiter = Limiter::with_limits(20, UNLIMITED).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let never = CancellationToken::new();
                let start = Instant::now();
                let mut total = 0;
                while total < 100 {
                    total += limiter.request_quota(100 - total, &never).await.unwrap();
                }
                start.elapsed()
            }));
        }

        for task in tasks {
            let elapsed = task.await.unwrap();
            // 200 bytes shared at 20 B/s after a 20 byte burst: the last grant lands at 9s.
            assert!(
                elapsed >= Duration::from_secs(7) && elapsed <= Duration::from_secs(9),
                "elapsed {elapsed:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_returns_error_and_tokens() {
        let limiter = Limiter::with_limits(10, UNLIMITED).unwrap();
        let never = CancellationToken::new();
        limiter.request_quota(10, &never).await.unwrap();

        let token = CancellationToken::new();
        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            let token = token.clone();
            async move { limiter.request_quota(10, &token).await }
        });

        time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());

        let start = Instant::now();
        limiter.request_quota(1, &never).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn global_change_reaches_pending_request() {
        let limiter = Limiter::with_limits(10, UNLIMITED).unwrap();
        let never = CancellationToken::new();
        limiter.request_quota(10, &never).await.unwrap();

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                let never = CancellationToken::new();
                let start = Instant::now();
                let granted = limiter.request_quota(10, &never).await.unwrap();
                (granted, start.elapsed())
            }
        });

        time::sleep(Duration::from_millis(100)).await;
        limiter.set_global_bandwidth(UNLIMITED).unwrap();

        let (granted, elapsed) = waiter.await.unwrap();
        assert_eq!(granted, 10);
        assert_eq!(elapsed, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn lowered_per_conn_limit_recaps_pending_request() {
        let limiter = Limiter::with_limits(10, UNLIMITED).unwrap();
        let never = CancellationToken::new();
        limiter.request_quota(10, &never).await.unwrap();

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                let never = CancellationToken::new();
                limiter.request_quota(10, &never).await.unwrap()
            }
        });

        time::sleep(Duration::from_millis(100)).await;
        limiter.set_per_conn_bandwidth(4).unwrap();
        assert_eq!(waiter.await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_sentinel_restores_pass_through() {
        let limiter = Limiter::with_limits(1, 1).unwrap();
        limiter.set_limits(UNLIMITED, UNLIMITED).unwrap();

        let never = CancellationToken::new();
        let start = Instant::now();
        assert_eq!(limiter.request_quota(4096, &never).await.unwrap(), 4096);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
