//! The common shape of the two delivery strategies that repeat outbound traffic until it is
//!  confirmed: the counter/receipt based [crate::stream::reliable_queue::ReliableQueue], and the
//!  idempotent polling of [crate::blob::requester::BlobRequester].
//!
//! Both are plain state machines that ask their driver to arm timers. Every armed timer carries a
//!  fresh [CheckId], and a state machine acts only on the timer it armed most recently: a timer
//!  that fires after the state moved on is a no-op.

use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CheckId(u64);

/// Source of strictly increasing check ids
#[derive(Debug, Default)]
pub struct CheckIds {
    last: u64,
}

impl CheckIds {
    pub fn next(&mut self) -> CheckId {
        self.last += 1;
        CheckId(self.last)
    }
}

/// A request to the driver to call back `on_timer(check_id)` after `delay`
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TimerRequest {
    pub check_id: CheckId,
    pub delay: Duration,
}

pub trait ReliableDelivery {
    /// What to (re)send when a timer fires
    type Retry;

    /// `None` if the timer is stale or there is nothing to resend
    fn on_timer(&mut self, check_id: CheckId) -> Option<(Self::Retry, TimerRequest)>;

    /// the check id of the currently armed timer, if any
    fn armed_timer(&self) -> Option<CheckId>;

    /// Drops all pending work, disarming any timer
    fn reset(&mut self);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ids_increase() {
        let mut ids = CheckIds::default();
        let a = ids.next();
        let b = ids.next();
        assert!(b > a);
        assert_ne!(a, CheckId::default());
    }
}
