//! Process-wide bandwidth limiting for peer connections.
//!
//! One token bucket per direction, shared by every connection of a node.
//! Reservations never fail: a caller that overdraws the bucket is told how
//! long to wait, and later callers queue behind that debt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::BandwidthConfig;

/// Direction of traffic relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Egress,
    Ingress,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Egress => write!(f, "egress"),
            Direction::Ingress => write!(f, "ingress"),
        }
    }
}

/// Token bucket rate limiter with reservation debt.
///
/// Tokens are added at a fixed rate up to `capacity`. Reservations always
/// succeed and may drive the balance negative; the returned wait is the time
/// until the balance is back at zero. Over any window the bytes granted
/// before their wait elapses never exceed `rate * window + capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: f64,
    /// Current balance, negative while in debt
    tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Timestamp of last refill operation
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full token bucket.
    ///
    /// # Panics
    ///
    /// Panics if capacity or refill_rate is zero.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    /// Creates a full token bucket whose clock starts at `now`.
    ///
    /// # Panics
    ///
    /// Panics if capacity or refill_rate is zero.
    pub fn new_at(capacity: u64, refill_rate: u64, now: Instant) -> Self {
        assert!(
            capacity > 0,
            "Token bucket capacity must be greater than zero"
        );
        assert!(
            refill_rate > 0,
            "Token bucket refill rate must be greater than zero"
        );

        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate: refill_rate as f64,
            last_refill: now,
        }
    }

    /// Reserves `amount` tokens and returns how long the caller must wait
    /// before using them.
    pub fn reserve_at(&mut self, amount: u64, now: Instant) -> Duration {
        self.refill_at(now);
        self.tokens -= amount as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }

    /// Returns `amount` unused tokens to the bucket, never beyond capacity.
    pub fn refund_at(&mut self, amount: u64, now: Instant) {
        self.refill_at(now);
        self.tokens = (self.tokens + amount as f64).min(self.capacity);
    }

    /// Current balance after refilling, negative while in debt.
    pub fn balance_at(&mut self, now: Instant) -> f64 {
        self.refill_at(now);
        self.tokens
    }

    /// Swaps rate and capacity, clamping the balance to the new capacity.
    ///
    /// # Panics
    ///
    /// Panics if capacity or refill_rate is zero.
    pub fn reconfigure_at(&mut self, capacity: u64, refill_rate: u64, now: Instant) {
        assert!(
            capacity > 0 && refill_rate > 0,
            "Token bucket capacity and refill rate must be greater than zero"
        );
        self.refill_at(now);
        self.capacity = capacity as f64;
        self.refill_rate = refill_rate as f64;
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate as u64
    }

    /// Adds tokens to bucket based on elapsed time since last refill.
    fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Shared egress and ingress budgets for all connections of a node.
///
/// Each direction sits behind its own mutex, held only for the arithmetic of
/// a reservation and never across an await point.
#[derive(Debug)]
pub struct BandwidthLimiter {
    enabled: AtomicBool,
    egress: Mutex<TokenBucket>,
    ingress: Mutex<TokenBucket>,
    egress_reserved: AtomicU64,
    ingress_reserved: AtomicU64,
}

impl BandwidthLimiter {
    /// Creates a limiter from config. Zero rates fall back to defaults.
    pub fn new(config: &BandwidthConfig) -> Self {
        let mut config = config.clone();
        config.apply_defaults();

        Self {
            enabled: AtomicBool::new(config.enabled),
            egress: Mutex::new(TokenBucket::new(config.egress_burst, config.egress_rate)),
            ingress: Mutex::new(TokenBucket::new(config.ingress_burst, config.ingress_rate)),
            egress_reserved: AtomicU64::new(0),
            ingress_reserved: AtomicU64::new(0),
        }
    }

    /// Limiter that grants every reservation immediately.
    pub fn unlimited() -> Self {
        Self::new(&BandwidthConfig::unlimited())
    }

    /// Reserves `bytes` in `direction` and returns the required wait.
    pub fn reserve(&self, direction: Direction, bytes: u64) -> Duration {
        self.counter(direction).fetch_add(bytes, Ordering::Relaxed);

        if !self.is_enabled() {
            return Duration::ZERO;
        }

        self.bucket(direction).lock().reserve_at(bytes, Instant::now())
    }

    /// Gives back a reservation whose bytes were never transferred.
    pub fn refund(&self, direction: Direction, bytes: u64) {
        if !self.is_enabled() {
            return;
        }
        self.bucket(direction).lock().refund_at(bytes, Instant::now());
    }

    /// Reserves `bytes` and sleeps until they may be used.
    ///
    /// Callers bound this with their own timeout; blocking here is not an
    /// error in itself. Dropping the future before the sleep ends refunds
    /// the reservation, so a cancelled caller leaves no debt behind.
    pub async fn wait(&self, direction: Direction, bytes: u64) {
        let delay = self.reserve(direction, bytes);
        if delay.is_zero() {
            return;
        }

        tracing::trace!("Throttling {} bytes {} for {:?}", bytes, direction, delay);
        let mut pending = PendingReservation {
            limiter: self,
            direction,
            bytes,
            granted: false,
        };
        tokio::time::sleep(delay).await;
        pending.granted = true;
    }

    /// Applies new limits without disturbing outstanding reservations.
    pub fn reconfigure(&self, config: &BandwidthConfig) {
        let mut config = config.clone();
        config.apply_defaults();

        let now = Instant::now();
        self.egress
            .lock()
            .reconfigure_at(config.egress_burst, config.egress_rate, now);
        self.ingress
            .lock()
            .reconfigure_at(config.ingress_burst, config.ingress_rate, now);
        self.enabled.store(config.enabled, Ordering::Relaxed);

        tracing::debug!(
            "Bandwidth reconfigured: enabled={}, egress={}B/s, ingress={}B/s",
            config.enabled,
            config.egress_rate,
            config.ingress_rate
        );
    }

    /// Total bytes ever reserved in `direction`.
    pub fn reserved_bytes(&self, direction: Direction) -> u64 {
        self.counter(direction).load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn bucket(&self, direction: Direction) -> &Mutex<TokenBucket> {
        match direction {
            Direction::Egress => &self.egress,
            Direction::Ingress => &self.ingress,
        }
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Egress => &self.egress_reserved,
            Direction::Ingress => &self.ingress_reserved,
        }
    }
}

/// Refunds its reservation on drop unless the wait ran to completion.
struct PendingReservation<'a> {
    limiter: &'a BandwidthLimiter,
    direction: Direction,
    bytes: u64,
    granted: bool,
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if !self.granted {
            tracing::trace!(
                "Refunding {} cancelled {} bytes",
                self.bytes,
                self.direction
            );
            self.limiter.refund(self.direction, self.bytes);
        }
    }
}
