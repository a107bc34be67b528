//! Backoff strategies used to space out retries of failed jobs.
//!
//! The pool's default is [`BackoffStrategy::exponential`] built from the configured base and
//! maximum delays with a relative jitter of 20%, so that
//!
//! ```text
//! delay(attempts_made) = min(max_delay, base_delay * 2^attempts_made) * U[0.8, 1.2]
//! ```
//!
//! Three shapes are provided, each of which can be modified with a [`Jitter`]:
//!
//! 1. Constant
//! 2. Linear
//! 3. Exponential
//!
//! A strategy never returns a zero delay: results are floored at one millisecond, or at the value
//! given to [`BackoffStrategy::with_min`].
//!
//! # Example
//!
//! ```
//! # use taskmill::prelude::*;
//! # use std::time::Duration;
//! let strategy = BackoffStrategy::exponential(Duration::from_secs(1))
//!     .with_max(Duration::from_secs(30))
//!     .with_jitter(Jitter::Relative(0.2))
//!     .with_seed(7);
//!
//! assert!(strategy.backoff(1) >= Duration::from_millis(1_600));
//! assert!(strategy.backoff(1) <= Duration::from_millis(2_400));
//! // The cap is applied before the jitter.
//! assert!(strategy.backoff(10) <= Duration::from_secs(36));
//! ```

use std::{sync::Mutex, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};

const FLOOR: Duration = Duration::from_millis(1);

/// Type that can be used to implement a backoff strategy.
pub trait Strategy: Send + Sync {
    /// Given the number of attempts made so far returns the [`Duration`] to wait before the job
    /// should be tried again.
    fn backoff(&self, attempts_made: u16) -> Duration;
}

/// Always returns the same delay regardless of the attempt.
///
/// Construct via [`BackoffStrategy::constant`].
///
/// ```
/// # use taskmill::prelude::*;
/// # use std::time::Duration;
/// let strategy = BackoffStrategy::constant(Duration::from_secs(10));
///
/// assert_eq!(strategy.backoff(1), Duration::from_secs(10));
/// assert_eq!(strategy.backoff(5), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: Duration,
}

impl Strategy for Constant {
    fn backoff(&self, _attempts_made: u16) -> Duration {
        self.delay
    }
}

/// Doubles the delay with every attempt: `base * 2^attempts_made`.
///
/// Construct via [`BackoffStrategy::exponential`]. Setting a ceiling with
/// [`BackoffStrategy::with_max`] is strongly advised.
///
/// ```
/// # use taskmill::prelude::*;
/// # use std::time::Duration;
/// let strategy =
///     BackoffStrategy::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(30));
///
/// assert_eq!(strategy.backoff(0), Duration::from_secs(1));
/// assert_eq!(strategy.backoff(1), Duration::from_secs(2));
/// assert_eq!(strategy.backoff(2), Duration::from_secs(4));
/// assert_eq!(strategy.backoff(4), Duration::from_secs(16));
/// assert_eq!(strategy.backoff(5), Duration::from_secs(30));
/// assert_eq!(strategy.backoff(60), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: Duration,
    max: Option<Duration>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempts_made: u16) -> Duration {
        let factor = 2u32.checked_pow(attempts_made.into()).unwrap_or(u32::MAX);
        let backoff = self.base.checked_mul(factor).unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// Grows linearly with each attempt: `factor * attempts_made`.
///
/// Construct via [`BackoffStrategy::linear`].
///
/// ```
/// # use taskmill::prelude::*;
/// # use std::time::Duration;
/// let strategy =
///     BackoffStrategy::linear(Duration::from_secs(10)).with_max(Duration::from_secs(25));
///
/// assert_eq!(strategy.backoff(1), Duration::from_secs(10));
/// assert_eq!(strategy.backoff(2), Duration::from_secs(20));
/// assert_eq!(strategy.backoff(3), Duration::from_secs(25));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: Duration,
    max: Option<Duration>,
}

impl Strategy for Linear {
    fn backoff(&self, attempts_made: u16) -> Duration {
        let backoff = self
            .factor
            .checked_mul(attempts_made.into())
            .unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// A random jitter applied to a computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Adds a value in the range `-delta..=delta`.
    Absolute(Duration),
    /// Scales the backoff by a factor in `1 - ratio..=1 + ratio`.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: Duration, rng: &mut impl Rng) -> Duration {
        match self {
            Self::Absolute(delta) => {
                let delta = delta.as_millis() as i128;
                let offset = rng.gen_range(-delta..=delta);
                let millis = (value.as_millis() as i128 + offset).max(0);
                Duration::from_millis(millis.min(u64::MAX as i128) as u64)
            }
            Self::Relative(ratio) => {
                let ratio = ratio.abs();
                let factor = rng.gen_range(1.0 - ratio..=1.0 + ratio);
                Duration::try_from_secs_f64((value.as_secs_f64() * factor).max(0.0))
                    .unwrap_or(Duration::MAX)
            }
        }
    }
}

/// A backoff shape with an optional jitter and lower bound.
///
/// Without a seed the jitter draws from the thread local generator. With
/// [`BackoffStrategy::with_seed`] the sequence of delays is reproducible.
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: Duration,
    rng: Option<Mutex<StdRng>>,
}

impl<T: Strategy + std::fmt::Debug> std::fmt::Debug for BackoffStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffStrategy")
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .field("min", &self.min)
            .field("seeded", &self.rng.is_some())
            .finish()
    }
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] returning the same delay for every attempt.
    pub const fn constant(delay: Duration) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] doubling `base` with every attempt made.
    pub const fn exponential(base: Duration) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the un-jittered delay to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Linear> {
    /// Creates a [`BackoffStrategy`] growing by `factor` with every attempt made.
    pub const fn linear(factor: Duration) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the un-jittered delay to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: FLOOR,
            rng: None,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Raises the lower bound on returned delays. Values below one millisecond are ignored.
    pub fn with_min(mut self, min: Duration) -> Self {
        self.min = min.max(FLOOR);
        self
    }

    /// Makes the jitter deterministic.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Some(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        let Some(jitter) = self.jitter else {
            return backoff;
        };
        match &self.rng {
            Some(rng) => match rng.lock() {
                Ok(mut rng) => jitter.apply(backoff, &mut *rng),
                Err(poisoned) => jitter.apply(backoff, &mut *poisoned.into_inner()),
            },
            None => jitter.apply(backoff, &mut rand::thread_rng()),
        }
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempts_made: u16) -> Duration {
        let backoff = self.strategy.backoff(attempts_made);
        self.jittered(backoff).max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn default_policy() -> BackoffStrategy<Exponential> {
        BackoffStrategy::exponential(Duration::from_millis(1_000))
            .with_max(Duration::from_millis(30_000))
            .with_jitter(Jitter::Relative(0.2))
    }

    #[test]
    fn constant_backoff() {
        let delay = Duration::from_secs(60);
        let strategy = BackoffStrategy::constant(delay);

        for i in 0..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn constant_backoff_with_absolute_jitter() {
        let delay = Duration::from_secs(60);
        let jitter = Duration::from_secs(10);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 0..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn zero_delay_is_floored() {
        let strategy = BackoffStrategy::constant(Duration::ZERO);
        assert_eq!(strategy.backoff(1), Duration::from_millis(1));

        let strategy = BackoffStrategy::linear(Duration::from_secs(1));
        assert_eq!(strategy.backoff(0), Duration::from_millis(1));
    }

    #[test]
    fn absolute_jitter_cannot_go_negative() {
        let strategy = BackoffStrategy::constant(Duration::from_millis(5))
            .with_jitter(Jitter::Absolute(Duration::from_secs(10)))
            .with_seed(3);

        for i in 0..100 {
            assert!(strategy.backoff(i) >= Duration::from_millis(1));
        }
    }

    #[test]
    fn min_is_respected() {
        let min = Duration::from_secs(5);
        let strategy = BackoffStrategy::constant(Duration::from_secs(20))
            .with_jitter(Jitter::Absolute(Duration::from_secs(20)))
            .with_min(min);

        for i in 0..100 {
            assert!(strategy.backoff(i) >= min);
        }
    }

    #[test]
    fn linear_backoff_with_max() {
        let strategy =
            BackoffStrategy::linear(Duration::from_secs(60)).with_max(Duration::from_secs(600));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert_eq!(backoff, (Duration::from_secs(60) * i as u32).min(Duration::from_secs(600)));
        }
    }

    #[test]
    fn exponential_backoff() {
        let strategy = BackoffStrategy::exponential(Duration::from_millis(1_000));

        for i in 0..10 {
            assert_eq!(strategy.backoff(i), Duration::from_millis(1_000 * 2u64.pow(i as _)));
        }
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let strategy =
            BackoffStrategy::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(30));

        assert_eq!(strategy.backoff(u16::MAX), Duration::from_secs(30));
    }

    #[test]
    fn seeded_strategies_are_reproducible() {
        let first = default_policy().with_seed(42);
        let second = default_policy().with_seed(42);

        let a: Vec<_> = (0..20).map(|i| first.backoff(i)).collect();
        let b: Vec<_> = (0..20).map(|i| second.backoff(i)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let strategy = default_policy().with_seed(1);

        let first = strategy.backoff(1);
        assert!(first >= Duration::from_millis(1_600) && first <= Duration::from_millis(2_400));
        let second = strategy.backoff(2);
        assert!(second >= Duration::from_millis(3_200) && second <= Duration::from_millis(4_800));
        let capped = strategy.backoff(12);
        assert!(capped >= Duration::from_millis(24_000) && capped <= Duration::from_millis(36_000));
    }

    proptest! {
        #[test]
        fn jittered_delay_is_bounded(attempts in 0u16..64, seed in any::<u64>()) {
            let strategy = default_policy().with_seed(seed);
            let backoff = strategy.backoff(attempts);

            prop_assert!(backoff > Duration::ZERO);
            prop_assert!(backoff <= Duration::from_millis(36_000));
        }

        #[test]
        fn jittered_delay_stays_within_twenty_percent(attempts in 0u16..16, seed in any::<u64>()) {
            let nominal = Duration::from_millis(1_000)
                .saturating_mul(2u32.saturating_pow(attempts.into()))
                .min(Duration::from_millis(30_000));
            let backoff = default_policy().with_seed(seed).backoff(attempts);

            prop_assert!(backoff.as_secs_f64() >= nominal.as_secs_f64() * 0.8 - 1e-6);
            prop_assert!(backoff.as_secs_f64() <= nominal.as_secs_f64() * 1.2 + 1e-6);
        }

        #[test]
        fn unjittered_delay_is_non_decreasing(attempts in 0u16..63) {
            let strategy = BackoffStrategy::exponential(Duration::from_millis(1_000))
                .with_max(Duration::from_millis(30_000));

            prop_assert!(strategy.backoff(attempts) <= strategy.backoff(attempts + 1));
        }
    }
}
