//! Backoff timers: stateful, monotonic delay sequences.
//!
//! A [`Timer`] starts at an initial value in seconds and grows by a
//! [`Strategy`] each time [`Timer::increase`] is called, until a [`Bound`] is
//! reached. The request handler uses one timer to space retries and another to
//! absorb rate limiting; both are ordinary values that can be cloned
//! mid-flight or forked back to their starting state with [`Timer::fresh`].

use std::time::Duration;

/// How a timer's value grows on each step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Strategy {
    /// Adds a fixed increment per step.
    Step(f64),
    /// Multiplies by a fixed factor per step.
    Geometric(f64),
    /// Raises the value to a fixed exponent per step, so the value after
    /// `n` steps is `initial ^ (exponent ^ n)`.
    Power(f64),
}

/// When a timer stops growing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Bound {
    /// Stop after this many successful or attempted steps.
    Count(u32),
    /// Stop once the value reaches this ceiling; the final step is clamped
    /// to it exactly.
    Ceiling(f64),
    /// Never stop growing.
    Unbounded,
}

/// A stateful backoff timer.
///
/// `Clone` preserves the timer's current progress; [`Timer::fresh`] returns a
/// copy reset to the initial value with the step counter at zero. The
/// asymmetry is deliberate: cloning forks a continuation, `fresh` forks a new
/// attempt.
///
/// Timers compare by their current numeric value, against each other or
/// against a plain `f64`, so `timer == 0.0` reads as the no-delay sentinel.
/// A timer built with a zero count or a zero step never moves off its initial
/// value, which is how "no retry" and "no backoff" policies are expressed
/// without optional fields.
#[derive(Clone, Debug)]
pub struct Timer {
    value: f64,
    initial: f64,
    counter: u32,
    strategy: Strategy,
    bound: Bound,
}

impl Timer {
    /// Create a timer from its parts.
    pub fn new(initial: f64, strategy: Strategy, bound: Bound) -> Self {
        Self {
            value: initial,
            initial,
            counter: 0,
            strategy,
            bound,
        }
    }

    /// Fixed increment per step, stopping after `count` steps.
    pub fn step_count(initial: f64, count: u32, step: f64) -> Self {
        Self::new(initial, Strategy::Step(step), Bound::Count(count))
    }

    /// Multiplicative growth, stopping after `count` steps.
    pub fn geometric_count(initial: f64, count: u32, factor: f64) -> Self {
        Self::new(initial, Strategy::Geometric(factor), Bound::Count(count))
    }

    /// Exponential-tower growth, stopping after `count` steps.
    pub fn power_count(initial: f64, count: u32, exponent: f64) -> Self {
        Self::new(initial, Strategy::Power(exponent), Bound::Count(count))
    }

    /// Fixed increment per step, stopping at `ceiling` seconds.
    pub fn step_ceiling(initial: f64, ceiling: f64, step: f64) -> Self {
        Self::new(initial, Strategy::Step(step), Bound::Ceiling(ceiling))
    }

    /// Multiplicative growth, stopping at `ceiling` seconds.
    pub fn geometric_ceiling(initial: f64, ceiling: f64, factor: f64) -> Self {
        Self::new(initial, Strategy::Geometric(factor), Bound::Ceiling(ceiling))
    }

    /// Exponential-tower growth, stopping at `ceiling` seconds.
    pub fn power_ceiling(initial: f64, ceiling: f64, exponent: f64) -> Self {
        Self::new(initial, Strategy::Power(exponent), Bound::Ceiling(ceiling))
    }

    /// A timer that grows forever. All sequence projections return `None`.
    pub fn unbounded(initial: f64, strategy: Strategy) -> Self {
        Self::new(initial, strategy, Bound::Unbounded)
    }

    /// The current delay in seconds.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The delay this timer started from.
    pub fn initial(&self) -> f64 {
        self.initial
    }

    /// How many steps have been taken so far.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The current delay as a [`Duration`], clamped to non-negative.
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.value.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Whether another step is allowed by the bound.
    pub fn can_increase(&self) -> bool {
        match self.bound {
            Bound::Count(count) => self.counter < count,
            Bound::Ceiling(ceiling) => self.value < ceiling,
            Bound::Unbounded => true,
        }
    }

    /// Advance one step, clamped to the ceiling and to monotonicity.
    ///
    /// Returns whether the value changed. The counter still advances when the
    /// bound allows a step that leaves the value in place (a zero step), so a
    /// count-bounded no-op timer eventually reports `can_increase() == false`.
    pub fn increase(&mut self) -> bool {
        if !self.can_increase() {
            return false;
        }
        let next = match self.strategy {
            Strategy::Step(step) => self.value + step,
            Strategy::Geometric(factor) => self.value * factor,
            Strategy::Power(exponent) => self.value.powf(exponent),
        };
        let mut next = next.max(self.value);
        if let Bound::Ceiling(ceiling) = self.bound {
            next = next.min(ceiling);
        }
        self.counter += 1;
        let changed = next > self.value;
        self.value = next;
        changed
    }

    /// A copy reset to the initial value with the counter at zero.
    pub fn fresh(&self) -> Self {
        Self {
            value: self.initial,
            counter: 0,
            ..*self
        }
    }

    /// Suspend the current task for the timer's current value.
    pub async fn wait(&self) {
        tokio::time::sleep(self.duration()).await;
    }

    /// Total number of steps in the full sequence, or `None` when the timer
    /// is unbounded or its sequence never reaches the ceiling.
    pub fn count(&self) -> Option<u32> {
        match self.bound {
            Bound::Count(count) => Some(count),
            _ => self.sequence().map(|seq| (seq.len() - 1) as u32),
        }
    }

    /// Steps left before the bound is reached.
    pub fn count_remaining(&self) -> Option<u32> {
        self.count().map(|count| count.saturating_sub(self.counter))
    }

    /// The value the timer ends on after its last step.
    pub fn final_value(&self) -> Option<f64> {
        self.sequence().and_then(|seq| seq.last().copied())
    }

    /// Sum of every value in the full sequence, the initial value included.
    pub fn total(&self) -> Option<f64> {
        self.sequence().map(|seq| seq.iter().sum())
    }

    /// Sum of the values strictly after the current one: the longest time the
    /// timer can still make a caller wait.
    pub fn total_remaining(&self) -> Option<f64> {
        self.sequence()
            .map(|seq| seq.iter().skip(self.counter as usize + 1).sum())
    }

    /// The full value sequence from the initial value through the bound.
    ///
    /// `None` for unbounded timers and for ceiling timers whose value stops
    /// moving below the ceiling (a zero step), which behave as unbounded.
    fn sequence(&self) -> Option<Vec<f64>> {
        if matches!(self.bound, Bound::Unbounded) {
            return None;
        }
        let ceiling_bound = matches!(self.bound, Bound::Ceiling(_));
        let mut probe = self.fresh();
        let mut seq = vec![probe.value];
        while probe.can_increase() {
            let changed = probe.increase();
            if ceiling_bound && !changed {
                return None;
            }
            seq.push(probe.value);
        }
        Some(seq)
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialEq<f64> for Timer {
    fn eq(&self, other: &f64) -> bool {
        self.value == *other
    }
}

impl PartialEq<Timer> for f64 {
    fn eq(&self, other: &Timer) -> bool {
        *self == other.value
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl PartialOrd<f64> for Timer {
    fn partial_cmp(&self, other: &f64) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(other)
    }
}
