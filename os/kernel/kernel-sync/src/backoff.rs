use core::hint::spin_loop;

/// Largest exponent used by [`Backoff::spin`]; one step spins `1 << SPIN_LIMIT` times.
pub const SPIN_LIMIT: u32 = 6;

/// Bounded exponential backoff for compare-and-swap retry loops.
///
/// Each call to [`spin`](Self::spin) issues `2^step` pause hints and then
/// raises `step`, saturating at [`SPIN_LIMIT`]. A single step therefore never
/// spins for longer than `2^SPIN_LIMIT` hints, no matter how long the caller
/// keeps retrying.
///
/// ```rust
/// # use kernel_sync::Backoff;
/// let mut backoff = Backoff::new();
/// assert!(!backoff.is_saturated());
/// for _ in 0..16 {
///     backoff.spin();
/// }
/// assert!(backoff.is_saturated());
/// ```
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Spin for the current step, then escalate.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..1u32 << self.step {
            spin_loop();
        }
        if self.step < SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Start over at the shortest step, e.g. after the caller made progress.
    #[inline]
    pub const fn reset(&mut self) {
        self.step = 0;
    }

    /// Whether the backoff reached its longest step.
    #[inline]
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.step >= SPIN_LIMIT
    }
}
