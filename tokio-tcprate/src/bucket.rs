//! A reconfigurable token bucket driven by the Tokio clock.
//!
//! The bucket accrues `rate` tokens per second up to `burst` tokens. Callers *reserve* tokens
//! up front: a reservation always succeeds immediately (as long as it fits in the burst) and
//! tells the caller at which instant it may proceed. Outstanding reservations put the bucket
//! into debt, so concurrent waiters are served in the order they reserved.
//!
//! A rate of [`UNLIMITED`] short-circuits everything: reservations are ready immediately and
//! the burst is not enforced.
//!
//! Reconfiguring the bucket reaches reservations that are still pending: their outstanding
//! debt is re-timed at the new rate (see [`TokenBucket::reschedule`]), so lifting the limit
//! releases every waiter at once and lowering it stretches their remaining waits.
//!
//! ```
//! use tokio_tcprate::bucket::TokenBucket;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), tokio_tcprate::Error> {
//! let bucket = TokenBucket::new(100, 100); // 100 tokens/s, starts full
//! let never = CancellationToken::new();
//!
//! bucket.wait(100, &never).await?; // drains the initial burst without sleeping
//! bucket.wait(50, &never).await?;  // sleeps ~500ms
//!
//! bucket.reconfigure(10, 10);
//! # Ok(()) }
//! ```
use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{Error, UNLIMITED};

/// Permission to move `tokens()` tokens once [`ready_at`](Reservation::ready_at) is reached.
///
/// Hand it back with [`TokenBucket::cancel`] if the caller gives up before that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reservation does nothing unless waited on or cancelled"]
pub struct Reservation {
    tokens: usize,
    ready_at: Instant,
    /// Rate `ready_at` was computed at; [`UNLIMITED`] for reservations that never waited.
    rate: usize,
    generation: u64,
}

impl Reservation {
    fn immediate(tokens: usize, now: Instant, generation: u64) -> Self {
        Self {
            tokens,
            ready_at: now,
            rate: UNLIMITED,
            generation,
        }
    }

    /// Number of tokens this reservation took.
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Instant at which the reserved tokens are available.
    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// Remaining delay relative to `now`.
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.ready_at.saturating_duration_since(now)
    }
}

/// Change counter paired with a token that is cancelled whenever the counter moves.
pub(crate) struct Epoch {
    generation: u64,
    token: CancellationToken,
}

impl Epoch {
    pub(crate) fn new() -> Self {
        Self {
            generation: 0,
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Move to the next generation. The caller cancels the returned token once its lock is
    /// released.
    #[must_use]
    pub(crate) fn advance(&mut self) -> CancellationToken {
        self.generation += 1;
        std::mem::replace(&mut self.token, CancellationToken::new())
    }

    /// Token cancelled once the epoch moves past `generation`, already cancelled if it has.
    pub(crate) fn since(&self, generation: u64) -> CancellationToken {
        if generation == self.generation {
            return self.token.clone();
        }
        let stale = CancellationToken::new();
        stale.cancel();
        stale
    }
}

struct State {
    rate: usize,
    burst: usize,
    tokens: f64,
    last: Instant,
    epoch: Epoch,
}

impl State {
    #[inline]
    fn unlimited(&self) -> bool {
        self.rate == UNLIMITED
    }

    /// Accrue tokens for the time elapsed since the last update, capped at one burst.
    #[inline]
    fn advance(&mut self, now: Instant) {
        if now <= self.last {
            return;
        }
        let elapsed = now.duration_since(self.last);
        self.last = now;
        if self.unlimited() {
            return;
        }
        let added = elapsed.as_secs_f64() * self.rate as f64;
        self.tokens = (self.tokens + added).min(self.burst as f64);
    }
}

/// Rate limiter granting tokens at `rate` per second with capacity `burst`.
///
/// All methods take `&self`; the bucket is meant to be shared (by `Arc` or by embedding it in
/// a shared owner) between many concurrently waiting tasks.
pub struct TokenBucket {
    state: Mutex<State>,
}

impl TokenBucket {
    /// Create a bucket granting `rate` tokens per second, holding at most `burst`.
    ///
    /// The bucket starts full. Passing [`UNLIMITED`] as `rate` disables throttling.
    pub fn new(rate: usize, burst: usize) -> Self {
        Self {
            state: Mutex::new(State {
                rate,
                burst,
                tokens: burst as f64,
                last: Instant::now(),
                epoch: Epoch::new(),
            }),
        }
    }

    /// A bucket that never blocks.
    pub fn unlimited() -> Self {
        Self::new(UNLIMITED, UNLIMITED)
    }

    /// Current rate in tokens per second.
    pub fn rate(&self) -> usize {
        self.state.lock().rate
    }

    /// Current capacity.
    pub fn burst(&self) -> usize {
        self.state.lock().burst
    }

    /// `true` when the current rate is [`UNLIMITED`].
    pub fn is_unlimited(&self) -> bool {
        self.state.lock().unlimited()
    }

    /// Atomically change the rate and capacity.
    ///
    /// Tokens accrued under the old rate are kept (clamped to the new burst). Leaving the
    /// unlimited state starts with a full bucket. Pending reservations are signalled through
    /// [`changed`](Self::changed) and re-timed by [`reschedule`](Self::reschedule).
    pub fn reconfigure(&self, rate: usize, burst: usize) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.unlimited() {
            state.tokens = burst as f64;
            state.last = now;
        } else {
            state.advance(now);
            state.tokens = state.tokens.min(burst as f64);
        }

        state.rate = rate;
        state.burst = burst;
        let previous = state.epoch.advance();
        drop(state);

        previous.cancel();
    }

    /// Take `n` tokens now and return when they may be used.
    ///
    /// Fails with [`Error::ExceedsBurst`] if a finite bucket could never hold `n` tokens.
    pub fn reserve(&self, n: usize) -> Result<Reservation, Error> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let generation = state.epoch.generation();
        if n == 0 || state.unlimited() {
            return Ok(Reservation::immediate(n, now, generation));
        }

        if n > state.burst {
            return Err(Error::ExceedsBurst {
                requested: n,
                burst: state.burst,
            });
        }

        state.advance(now);
        state.tokens -= n as f64;

        let wait = if state.tokens < 0.0 {
            Duration::from_secs_f64(-state.tokens / state.rate as f64)
        } else {
            Duration::ZERO
        };

        Ok(Reservation {
            tokens: n,
            ready_at: now + wait,
            rate: state.rate,
            generation,
        })
    }

    /// Token cancelled by the first reconfiguration after `reservation` was taken or last
    /// rescheduled. Already cancelled if that reconfiguration has happened.
    pub fn changed(&self, reservation: &Reservation) -> CancellationToken {
        self.state.lock().epoch.since(reservation.generation)
    }

    /// Re-time a pending reservation after a reconfiguration.
    ///
    /// The debt still outstanding is repaid at the current rate, so the reservation keeps its
    /// place behind earlier ones. An unlimited bucket makes it ready immediately.
    pub fn reschedule(&self, reservation: Reservation) -> Reservation {
        let now = Instant::now();
        let state = self.state.lock();
        let generation = state.epoch.generation();

        if reservation.rate == UNLIMITED || reservation.ready_at <= now {
            return Reservation {
                generation,
                ..reservation
            };
        }
        if state.unlimited() {
            return Reservation::immediate(reservation.tokens, now, generation);
        }
        if reservation.rate == state.rate {
            return Reservation {
                generation,
                ..reservation
            };
        }

        let outstanding = reservation.ready_at.duration_since(now).as_secs_f64();
        let wait = outstanding * reservation.rate as f64 / state.rate as f64;
        Reservation {
            tokens: reservation.tokens,
            ready_at: now + Duration::from_secs_f64(wait),
            rate: state.rate,
            generation,
        }
    }

    /// Return the tokens of a reservation that will not be used.
    ///
    /// Has no effect once the reservation's deadline has passed: the tokens were already
    /// spent on time.
    pub fn cancel(&self, reservation: Reservation) {
        if reservation.rate == UNLIMITED {
            return;
        }

        let now = Instant::now();
        if reservation.ready_at <= now {
            return;
        }

        let mut state = self.state.lock();
        if state.unlimited() {
            return;
        }
        state.advance(now);
        state.tokens = (state.tokens + reservation.tokens as f64).min(state.burst as f64);
    }

    /// Wait until `n` tokens are available, or until `cancel` fires.
    ///
    /// An already-cancelled token fails before reserving anything. On cancellation the
    /// reserved tokens are returned to the bucket. A reconfiguration while waiting re-times
    /// the wait at the new rate.
    pub async fn wait(&self, n: usize, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut reservation = self.reserve(n)?;
        loop {
            if reservation.ready_at <= Instant::now() {
                return Ok(());
            }

            let changed = self.changed(&reservation);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel(reservation);
                    return Err(Error::Cancelled);
                }
                _ = changed.cancelled() => reservation = self.reschedule(reservation),
                _ = sleep_until(reservation.ready_at) => return Ok(()),
            }
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("rate", &state.rate)
            .field("burst", &state.burst)
            .field("tokens", &state.tokens)
            .finish()
    }
}
