//! Reconnection policy and the order in which brokers are tried

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};

use crate::connection::BrokerDetails;

/// How hard to try before giving up on a broker list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverPolicy {
    /// Extra attempts made against each broker after the first one.
    /// Overridden per broker by the `retries` url option.
    pub retries: u32,

    /// Pause before every attempt except the very first one. Overridden
    /// per broker by the `connectdelay` url option.
    pub connect_delay: Duration,

    /// Number of passes over the broker list
    pub cycle_count: u32,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            connect_delay: Duration::ZERO,
            cycle_count: 1,
        }
    }
}

/// One connection attempt produced by a [`FailoverPlan`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Attempt {
    pub broker: BrokerDetails,

    /// Position in the configured broker list, `None` for redirect targets
    pub index: Option<usize>,

    pub delay: Duration,
}

/// Lazily yields connection attempts
///
/// Redirect targets come first, in the order the broker gave them. The
/// configured broker list follows, starting at the broker the connection
/// was last established with and wrapping around, once per cycle.
#[derive(Debug)]
pub(crate) struct FailoverPlan {
    redirects: VecDeque<BrokerDetails>,
    brokers: Vec<BrokerDetails>,
    policy: FailoverPolicy,
    start: usize,
    cycle: u32,
    offset: usize,
    attempt: u32,
    yielded: bool,
}

impl FailoverPlan {
    pub fn new(policy: FailoverPolicy, brokers: Vec<BrokerDetails>, start: usize) -> Self {
        let start = match brokers.len() {
            0 => 0,
            len => start % len,
        };
        Self {
            redirects: VecDeque::new(),
            brokers,
            policy,
            start,
            cycle: 0,
            offset: 0,
            attempt: 0,
            yielded: false,
        }
    }

    /// Puts a redirect target and the broker's known hosts ahead of every
    /// remaining attempt
    pub fn redirect(&mut self, host: BrokerDetails, known_hosts: Vec<BrokerDetails>) {
        for known in known_hosts.into_iter().rev() {
            if known != host {
                self.redirects.push_front(known);
            }
        }
        self.redirects.push_front(host);
    }

    fn retries_for(&self, broker: &BrokerDetails) -> u32 {
        broker.retries.unwrap_or(self.policy.retries)
    }

    fn delay_for(&self, broker: &BrokerDetails) -> Duration {
        broker.connect_delay.unwrap_or(self.policy.connect_delay)
    }
}

impl Iterator for FailoverPlan {
    type Item = Attempt;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(broker) = self.redirects.pop_front() {
            self.yielded = true;
            return Some(Attempt {
                broker,
                index: None,
                delay: Duration::ZERO,
            });
        }

        let len = self.brokers.len();
        while self.cycle < self.policy.cycle_count.max(1) && len > 0 {
            if self.offset >= len {
                self.offset = 0;
                self.cycle += 1;
                continue;
            }

            let index = (self.start + self.offset) % len;
            let broker = &self.brokers[index];
            if self.attempt > self.retries_for(broker) {
                self.attempt = 0;
                self.offset += 1;
                continue;
            }

            self.attempt += 1;
            let delay = match self.yielded {
                true => self.delay_for(broker),
                false => Duration::ZERO,
            };
            self.yielded = true;
            return Some(Attempt {
                broker: broker.clone(),
                index: Some(index),
                delay,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn broker(host: &str) -> BrokerDetails {
        BrokerDetails::new(host, 5672)
    }

    fn hosts(plan: FailoverPlan) -> Vec<String> {
        plan.map(|a| a.broker.host).collect()
    }

    #[test]
    fn each_broker_is_tried_once_plus_retries() {
        let policy = FailoverPolicy {
            retries: 1,
            connect_delay: Duration::from_millis(10),
            cycle_count: 1,
        };
        let plan = FailoverPlan::new(policy, vec![broker("a"), broker("b")], 0);
        let attempts: Vec<_> = plan.collect();
        let order: Vec<_> = attempts.iter().map(|a| a.broker.host.as_str()).collect();
        assert_eq!(order, ["a", "a", "b", "b"]);
        assert_eq!(attempts[0].delay, Duration::ZERO);
        assert_eq!(attempts[1].delay, Duration::from_millis(10));
    }

    #[test]
    fn starts_from_current_broker_and_wraps() {
        let policy = FailoverPolicy {
            retries: 0,
            connect_delay: Duration::ZERO,
            cycle_count: 2,
        };
        let plan = FailoverPlan::new(policy, vec![broker("a"), broker("b"), broker("c")], 1);
        assert_eq!(hosts(plan), ["b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn per_broker_retries_override_the_policy() {
        let mut b = broker("b");
        b.retries = Some(2);
        let policy = FailoverPolicy {
            retries: 0,
            ..Default::default()
        };
        let plan = FailoverPlan::new(policy, vec![broker("a"), b], 0);
        assert_eq!(hosts(plan), ["a", "b", "b", "b"]);
    }

    #[test]
    fn redirect_targets_come_first_in_given_order() {
        let policy = FailoverPolicy {
            retries: 0,
            ..Default::default()
        };
        let mut plan = FailoverPlan::new(policy, vec![broker("x")], 0);
        plan.redirect(broker("a"), vec![broker("b"), broker("c")]);
        assert_eq!(hosts(plan), ["a", "b", "c", "x"]);
    }

    #[test]
    fn empty_broker_list_yields_nothing() {
        let plan = FailoverPlan::new(FailoverPolicy::default(), Vec::new(), 3);
        assert_eq!(plan.count(), 0);
    }
}
