//! Rate-limited connections.
//!
//! [`LimitedConn`] wraps any Tokio stream and gates every read and write through two token
//! buckets: the global bucket owned by the shared [`Limiter`], and a private bucket sized to the
//! per-connection limit. Each I/O operation is performed in *quota rounds*:
//!
//! 1. re-sync the private bucket if the limiter's per-connection limit changed,
//! 2. ask the limiter for `min(remaining, global, per_conn)` bytes and wait for them,
//! 3. wait on the private bucket for the same amount,
//! 4. perform the I/O on exactly that many bytes.
//!
//! A limit change while a round is waiting reaches that wait: the round re-syncs, re-caps its
//! grant if it no longer fits, and re-times the remaining wait at the new rates.
//!
//! The [`AsyncRead`]/[`AsyncWrite`] impls run one round per poll, so a single `poll_write`
//! may accept fewer bytes than offered (the usual Tokio contract; `write_all` and friends
//! loop). [`LimitedConn::read_limited`] and [`LimitedConn::write_limited`] loop rounds until
//! the buffer is exhausted and report the exact progress made if a round fails.
//!
//! ```
//! use tokio::io::{duplex, AsyncReadExt};
//! use tokio_tcprate::Limiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Limiter::with_limits(1024, 128)?;
//! let (a, mut b) = duplex(4096);
//!
//! let cancel = CancellationToken::new();
//! let mut conn = limiter.wrap(a).with_cancellation(cancel.clone());
//!
//! let moved = conn.write_limited(&[7u8; 512]).await?; // ~3s at 128 B/s
//! assert_eq!(moved, 512);
//!
//! let mut out = vec![0u8; 512];
//! b.read_exact(&mut out).await?;
//! # Ok(()) }
//! ```
use std::{
    fmt,
    future::{poll_fn, Future},
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use smallvec::SmallVec;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Instant, Sleep},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

use crate::{
    bucket::{Reservation, TokenBucket},
    limiter::{Limiter, Quota},
    Error, TransferError,
};

/// Inline `IoSlice` capacity for vectored writes trimmed to a grant.
const INLINE_IOVEC: usize = 16;

/// Per-connection pacing state shared by the read and write directions.
struct Pacer {
    limiter: Arc<Limiter>,
    bucket: TokenBucket,
    cached_limit: usize,
    cancel: Option<CancellationToken>,
}

impl Pacer {
    fn new(limiter: Arc<Limiter>) -> Self {
        let cached_limit = limiter.per_conn_limit();
        Self {
            limiter,
            bucket: TokenBucket::new(cached_limit, cached_limit),
            cached_limit,
            cancel: None,
        }
    }

    /// Pull the limiter's per-connection limit and resize the private bucket on drift.
    fn sync(&mut self) {
        let current = self.limiter.per_conn_limit();
        if current != self.cached_limit {
            trace!(
                from = self.cached_limit,
                to = current,
                "per-connection limit resynced"
            );
            self.bucket.reconfigure(current, current);
            self.cached_limit = current;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    /// Waiting for the global reservation.
    Global(Quota),
    /// Waiting for the private reservation.
    Local {
        granted: usize,
        reservation: Reservation,
    },
    /// Both gates passed; the I/O has not completed yet.
    Granted(usize),
}

/// Why [`Round::poll_until`] stopped waiting.
enum Wake {
    Elapsed,
    LimitsChanged,
}

/// One direction's progress through a quota round.
struct Round {
    phase: Phase,
    sleep: Pin<Box<Sleep>>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    /// Limiter generation the current phase was computed under.
    generation: u64,
    changed: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl Round {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            sleep: Box::pin(sleep(Duration::ZERO)),
            cancelled: None,
            generation: 0,
            changed: None,
        }
    }

    /// Note the limiter generation, then pull the per-connection limit. In that order a change
    /// landing in between still wakes the next wait.
    fn resync(&mut self, pacer: &mut Pacer) {
        self.generation = pacer.limiter.generation();
        self.changed = None;
        pacer.sync();
    }

    /// Drive the round until a grant is available. The grant stays in place until
    /// [`finish`](Self::finish) so an I/O that returns `Pending` is retried without re-requesting
    /// quota.
    fn poll_grant(
        &mut self,
        pacer: &mut Pacer,
        cx: &mut Context<'_>,
        want: usize,
    ) -> Poll<Result<usize, Error>> {
        loop {
            match self.phase {
                Phase::Idle => {
                    if pacer.is_cancelled() {
                        return Poll::Ready(Err(Error::Cancelled));
                    }
                    self.resync(pacer);
                    // Capping by the cached limit keeps the grant within the private burst.
                    let quota = pacer
                        .limiter
                        .reserve_quota(want.min(pacer.cached_limit))?;
                    self.phase = Phase::Global(quota);
                }
                Phase::Global(quota) => {
                    match ready!(self.poll_until(pacer, cx, quota.reservation.ready_at())) {
                        Ok(Wake::Elapsed) => {}
                        Ok(Wake::LimitsChanged) => {
                            self.resync(pacer);
                            match pacer.limiter.refresh_quota(quota) {
                                Ok(quota) => self.phase = Phase::Global(quota),
                                Err(err) => {
                                    self.phase = Phase::Idle;
                                    return Poll::Ready(Err(err));
                                }
                            }
                            continue;
                        }
                        Err(err) => {
                            pacer.limiter.release(quota.reservation);
                            self.phase = Phase::Idle;
                            return Poll::Ready(Err(err));
                        }
                    }
                    // The other direction may have shrunk the private bucket meanwhile.
                    let granted = quota.granted.min(pacer.cached_limit);
                    let reservation = match pacer.bucket.reserve(granted) {
                        Ok(r) => r,
                        Err(err) => {
                            self.phase = Phase::Idle;
                            return Poll::Ready(Err(err));
                        }
                    };
                    self.phase = Phase::Local {
                        granted,
                        reservation,
                    };
                }
                Phase::Local {
                    granted,
                    reservation,
                } => {
                    match ready!(self.poll_until(pacer, cx, reservation.ready_at())) {
                        Ok(Wake::Elapsed) => self.phase = Phase::Granted(granted),
                        Ok(Wake::LimitsChanged) => {
                            self.resync(pacer);
                            self.phase = Phase::Local {
                                granted,
                                reservation: pacer.bucket.reschedule(reservation),
                            };
                        }
                        Err(err) => {
                            pacer.bucket.cancel(reservation);
                            self.phase = Phase::Idle;
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                Phase::Granted(granted) => return Poll::Ready(Ok(granted)),
            }
        }
    }

    /// Sleep until `deadline` unless the pacer's cancellation token fires or the limits
    /// change first.
    fn poll_until(
        &mut self,
        pacer: &Pacer,
        cx: &mut Context<'_>,
        deadline: Instant,
    ) -> Poll<Result<Wake, Error>> {
        if deadline <= Instant::now() {
            return Poll::Ready(Ok(Wake::Elapsed));
        }

        if let Some(token) = &pacer.cancel {
            let cancelled = self
                .cancelled
                .get_or_insert_with(|| Box::pin(token.clone().cancelled_owned()));
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(Error::Cancelled));
            }
        }

        let generation = self.generation;
        let changed = self.changed.get_or_insert_with(|| {
            Box::pin(pacer.limiter.changed_since(generation).cancelled_owned())
        });
        if changed.as_mut().poll(cx).is_ready() {
            self.changed = None;
            return Poll::Ready(Ok(Wake::LimitsChanged));
        }

        if self.sleep.deadline() != deadline {
            self.sleep.as_mut().reset(deadline);
        }
        ready!(self.sleep.as_mut().poll(cx));
        Poll::Ready(Ok(Wake::Elapsed))
    }

    #[inline]
    fn finish(&mut self) {
        self.phase = Phase::Idle;
    }
}

/// A stream whose reads and writes are throttled by a shared [`Limiter`] and a private
/// per-connection bucket.
///
/// Created by [`Limiter::wrap`], [`LimitedConn::new`], or accepted from a
/// [`LimitedListener`](crate::listener::LimitedListener). Dropping the wrapper drops (and so
/// closes) the inner stream.
#[pin_project]
pub struct LimitedConn<T> {
    #[pin]
    inner: T,
    pacer: Pacer,
    read: Round,
    write: Round,
}

impl<T> LimitedConn<T> {
    /// Wrap `inner`, drawing quota from `limiter`.
    ///
    /// The private bucket is sized to the limiter's per-connection limit at this moment.
    pub fn new(inner: T, limiter: Arc<Limiter>) -> Self {
        Self {
            inner,
            pacer: Pacer::new(limiter),
            read: Round::new(),
            write: Round::new(),
        }
    }

    /// Attach a cancellation token; cancelling it fails every pending and future pacing wait
    /// with [`Error::Cancelled`].
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.set_cancellation(token);
        self
    }

    /// Replace the cancellation token.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.pacer.cancel = Some(token);
        self.read.cancelled = None;
        self.write.cancelled = None;
    }

    /// The attached cancellation token, if any.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.pacer.cancel.as_ref()
    }

    /// The shared limiter this connection draws from.
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.pacer.limiter
    }

    /// Per-connection limit as of the last round.
    pub fn per_conn_limit(&self) -> usize {
        self.pacer.cached_limit
    }

    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead> LimitedConn<T> {
    fn poll_read_round(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), Error>> {
        let this = self.project();

        let want = buf.remaining();
        if want == 0 {
            return Poll::Ready(Ok(()));
        }

        let granted = ready!(this.read.poll_grant(this.pacer, cx, want))?;
        let granted = granted.min(want);

        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(granted));
        let res = ready!(this.inner.poll_read(cx, &mut limited));
        let n = limited.filled().len();
        this.read.finish();
        res?;

        buf.advance(n);
        trace!(granted, n, "read round");
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> LimitedConn<T> {
    fn poll_write_round(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        let this = self.project();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let granted = ready!(this.write.poll_grant(this.pacer, cx, buf.len()))?;
        let granted = granted.min(buf.len());

        let res = ready!(this.inner.poll_write(cx, &buf[..granted]));
        this.write.finish();
        let n = res?;

        trace!(granted, n, "write round");
        Poll::Ready(Ok(n))
    }

    fn poll_write_vectored_round(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, Error>> {
        let this = self.project();

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }

        let granted = ready!(this.write.poll_grant(this.pacer, cx, total));

        // Trimmed view over the caller's slices, inline in the common case.
        let mut remaining = granted?.min(total);
        let mut slices: SmallVec<[io::IoSlice<'_>; INLINE_IOVEC]> = SmallVec::new();
        for s in bufs {
            if remaining == 0 {
                break;
            }
            let take = s.len().min(remaining);
            slices.push(io::IoSlice::new(&s[..take]));
            remaining -= take;
        }

        let res = ready!(this.inner.poll_write_vectored(cx, &slices));
        this.write.finish();
        Poll::Ready(res.map_err(Error::from))
    }
}

impl<T: AsyncRead + Unpin> LimitedConn<T> {
    /// Read until `buf` is full or the stream ends, in rate-limited rounds.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only at end of stream.
    /// On failure, [`TransferError::moved`] holds the bytes read before the error; they are
    /// already in `buf`.
    pub async fn read_limited(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut moved = 0;

        while moved < buf.len() {
            let mut rb = ReadBuf::new(&mut buf[moved..]);
            if let Err(err) = poll_fn(|cx| Pin::new(&mut *self).poll_read_round(cx, &mut rb)).await
            {
                return Err(TransferError::new(moved, err));
            }

            let n = rb.filled().len();
            if n == 0 {
                break;
            }
            moved += n;
        }

        Ok(moved)
    }
}

impl<T: AsyncWrite + Unpin> LimitedConn<T> {
    /// Write all of `buf` in rate-limited rounds.
    ///
    /// On failure, [`TransferError::moved`] holds the bytes written before the error.
    pub async fn write_limited(&mut self, buf: &[u8]) -> Result<usize, TransferError> {
        let mut moved = 0;

        while moved < buf.len() {
            let n = poll_fn(|cx| Pin::new(&mut *self).poll_write_round(cx, &buf[moved..]))
                .await
                .map_err(|err| TransferError::new(moved, err))?;

            if n == 0 {
                return Err(TransferError::new(
                    moved,
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }
            moved += n;
        }

        Ok(moved)
    }
}

impl<T: AsyncRead> AsyncRead for LimitedConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_round(cx, buf).map_err(Into::into)
    }
}

impl<T: AsyncWrite> AsyncWrite for LimitedConn<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_round(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_vectored_round(cx, bufs).map_err(Into::into)
    }
}

impl<T: fmt::Debug> fmt::Debug for LimitedConn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedConn")
            .field("inner", &self.inner)
            .field("per_conn_limit", &self.pacer.cached_limit)
            .finish()
    }
}
