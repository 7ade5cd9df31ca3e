//! Prefetch credit bookkeeping
//!
//! When a session manages credit itself, a blocking receive temporarily
//! raises the broker's prefetch window by one so that exactly one message
//! can be in flight, and the window is restored afterwards.

use super::AcknowledgeMode;

/// Command the session has to send after a credit change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreditAction {
    /// `basic.qos` with the given prefetch count
    Qos(u16),
    /// `channel.flow`, `true` suspends the channel
    Suspend(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Credit {
    prefetch: u16,
    unacknowledged: u16,
    changed: bool,
}

impl Credit {
    pub fn new(prefetch: u16) -> Self {
        Self {
            prefetch,
            unacknowledged: 0,
            changed: false,
        }
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn set_prefetch(&mut self, prefetch: u16) {
        self.prefetch = prefetch;
        self.unacknowledged = 0;
    }

    /// A message was handed to the application and is not yet settled
    pub fn increment(&mut self) {
        self.unacknowledged = self.unacknowledged.saturating_add(1);
    }

    /// Everything outstanding was settled
    pub fn reset(&mut self) {
        self.unacknowledged = 0;
    }

    /// Opens the window by one if every prefetched slot is taken
    pub fn ensure_for_receive(&mut self, suspended: bool) -> Vec<CreditAction> {
        if self.unacknowledged < self.prefetch {
            return Vec::new();
        }
        let mut actions = vec![CreditAction::Qos(self.unacknowledged.saturating_add(1))];
        if self.unacknowledged == 0 && suspended {
            actions.push(CreditAction::Suspend(false));
        }
        self.changed = true;
        actions
    }

    /// Undoes [`ensure_for_receive`](Self::ensure_for_receive). Does
    /// nothing unless the window was opened and credit is managed.
    pub fn reduce_to_original(&mut self, managing: bool) -> Option<CreditAction> {
        if !(managing && self.changed) {
            return None;
        }
        self.changed = false;
        match self.prefetch {
            0 => Some(CreditAction::Suspend(true)),
            prefetch => Some(CreditAction::Qos(prefetch)),
        }
    }

    /// Clears the changed flag, returning whether it was set
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }
}

/// Whether receives have to open the prefetch window themselves
pub(crate) fn is_managing_credit(mode: AcknowledgeMode, prefetch: u16) -> bool {
    match mode {
        AcknowledgeMode::Client | AcknowledgeMode::Transacted => true,
        AcknowledgeMode::Auto | AcknowledgeMode::DupsOk => prefetch == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_ensure_then_reduce_restores_original_window() {
        let mut credit = Credit::new(0);
        let original = credit.clone();

        for _ in 0..3 {
            let actions = credit.ensure_for_receive(true);
            assert_eq!(
                actions,
                [CreditAction::Qos(1), CreditAction::Suspend(false)]
            );
        }
        assert_eq!(
            credit.reduce_to_original(true),
            Some(CreditAction::Suspend(true))
        );
        assert_eq!(credit, original);
        assert_eq!(credit.reduce_to_original(true), None);
    }

    #[test]
    fn window_only_opens_when_prefetch_is_exhausted() {
        let mut credit = Credit::new(2);
        assert!(credit.ensure_for_receive(false).is_empty());
        credit.increment();
        credit.increment();
        assert_eq!(credit.ensure_for_receive(false), [CreditAction::Qos(3)]);
        assert_eq!(credit.reduce_to_original(true), Some(CreditAction::Qos(2)));
    }

    #[test]
    fn unmanaged_sessions_never_reduce() {
        let mut credit = Credit::new(0);
        credit.ensure_for_receive(false);
        assert_eq!(credit.reduce_to_original(false), None);
        assert!(credit.take_changed());
    }

    #[test]
    fn managing_credit_depends_on_mode_and_prefetch() {
        assert!(is_managing_credit(AcknowledgeMode::Client, 10));
        assert!(is_managing_credit(AcknowledgeMode::Transacted, 10));
        assert!(is_managing_credit(AcknowledgeMode::Auto, 0));
        assert!(!is_managing_credit(AcknowledgeMode::DupsOk, 1));
    }
}
