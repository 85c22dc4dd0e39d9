// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Sleep-and-retry policy shared by the lock and the completion poller.

use std::time::Duration;

/// Retry delays: start at `initial`, multiply by `multiplier` after every
/// attempt, never exceed `ceiling`. With a `cap`, the policy is exhausted once
/// the cumulative wait reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub ceiling: Duration,
    pub cap: Option<Duration>,
}

impl Backoff {
    /// Exponential backoff doubling from `initial` up to `ceiling`.
    pub const fn exponential(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            multiplier: 2,
            ceiling,
            cap: None,
        }
    }

    /// Constant interval between attempts.
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            multiplier: 1,
            ceiling: interval,
            cap: None,
        }
    }

    pub const fn with_cap(mut self, cap: Option<Duration>) -> Self {
        self.cap = cap;
        self
    }

    pub fn start(&self) -> Retry {
        Retry {
            policy: *self,
            next: self.initial.min(self.ceiling),
            waited: Duration::ZERO,
        }
    }
}

/// Progress through one sequence of retries.
#[derive(Debug, Clone)]
pub struct Retry {
    policy: Backoff,
    next: Duration,
    waited: Duration,
}

impl Retry {
    /// Cumulative time accounted for by `advance`.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// True once the cumulative wait has reached the cap.
    pub fn exhausted(&self) -> bool {
        self.policy.cap.is_some_and(|cap| self.waited >= cap)
    }

    /// Account for the next delay and return it, without sleeping.
    pub fn advance(&mut self) -> Duration {
        let delay = self.next;
        self.waited += delay;
        self.next = (self.next * self.policy.multiplier).min(self.policy.ceiling);
        delay
    }

    /// Sleep for the next delay.
    pub fn wait(&mut self) {
        std::thread::sleep(self.advance());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_up_to_ceiling() {
        let mut retry =
            Backoff::exponential(Duration::from_millis(125), Duration::from_secs(1)).start();
        let delays: Vec<u64> = (0..6).map(|_| retry.advance().as_millis() as u64).collect();
        assert_eq!(delays, vec![125, 250, 500, 1000, 1000, 1000]);
        assert_eq!(retry.waited(), Duration::from_millis(3875));
    }

    #[test]
    fn test_fixed_interval() {
        let mut retry = Backoff::fixed(Duration::from_secs(1)).start();
        assert_eq!(retry.advance(), Duration::from_secs(1));
        assert_eq!(retry.advance(), Duration::from_secs(1));
        assert_eq!(retry.waited(), Duration::from_secs(2));
    }

    #[test]
    fn test_cap_exhaustion() {
        let mut retry = Backoff::exponential(Duration::from_millis(125), Duration::from_secs(1))
            .with_cap(Some(Duration::from_millis(300)))
            .start();
        assert!(!retry.exhausted());
        retry.advance();
        assert!(!retry.exhausted());
        retry.advance();
        assert!(retry.exhausted());
    }

    #[test]
    fn test_uncapped_never_exhausted() {
        let mut retry = Backoff::fixed(Duration::from_secs(1)).start();
        for _ in 0..1000 {
            retry.advance();
        }
        assert!(!retry.exhausted());
    }
}
