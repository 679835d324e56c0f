//! Timer queue for the cooperative session timeline.
//!
//! Every deferred continuation in the engine (cycle restarts, deferred cycle
//! starts, sync polling) is an entry in the [`TimerQueue`]. The session pops
//! due entries in deadline order and dispatches them; nothing blocks.

use crate::looper::LooperId;
use crate::timing::Timestamp;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Handle to a scheduled timer, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// What to do when a timer fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// Commit the first cycle of a looper whose start was deferred to a sync target.
    KickOff(LooperId),
    /// Loop boundary reached: restart the cycle or honour a pending stop.
    Restart(LooperId),
    /// Re-check the reference boundary for a parked sync request.
    SyncPoll(LooperId),
}

impl TimerAction {
    /// The looper this action concerns.
    pub fn looper(&self) -> LooperId {
        match self {
            TimerAction::KickOff(id) | TimerAction::Restart(id) | TimerAction::SyncPoll(id) => *id,
        }
    }

    /// Whether this timer belongs to the looper's own cycle scheduling.
    pub fn is_cycle_timer(&self) -> bool {
        matches!(self, TimerAction::KickOff(_) | TimerAction::Restart(_))
    }
}

/// Deadline-ordered queue of pending timers.
///
/// Entries with equal deadlines fire in the order they were armed.
#[derive(Debug, Default)]
pub struct TimerQueue {
    queue: BTreeMap<(Timestamp, TimerId), TimerAction>,
    deadlines: HashMap<TimerId, Timestamp>,
    next_id: u64,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer firing `delay` after `now`.
    pub fn after(&mut self, now: Timestamp, delay: Duration, action: TimerAction) -> TimerId {
        self.at(now + delay, action)
    }

    /// Arm a timer firing at an absolute instant.
    pub fn at(&mut self, due: Timestamp, action: TimerAction) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((due, id), action);
        self.deadlines.insert(id, due);
        log::trace!("[TIMERS] Armed {:?} at {} ({:?})", id, due, action);
        id
    }

    /// Cancel a pending timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(due) => self.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(TimerId, Timestamp, TimerAction)> {
        let (&(due, id), _) = self.queue.first_key_value()?;
        if due > now {
            return None;
        }
        let action = self.queue.remove(&(due, id))?;
        self.deadlines.remove(&id);
        Some((id, due, action))
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Deadline of a specific pending timer.
    pub fn deadline_of(&self, id: TimerId) -> Option<Timestamp> {
        self.deadlines.get(&id).copied()
    }

    /// Number of pending cycle timers (kick-off or restart) owned by a looper.
    pub fn cycle_timers_for(&self, looper: LooperId) -> usize {
        self.queue
            .values()
            .filter(|action| action.is_cycle_timer() && action.looper() == looper)
            .count()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: f64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let a = LooperId::from_index(0);
        let b = LooperId::from_index(1);
        timers.at(ms(200.0), TimerAction::Restart(a));
        timers.at(ms(100.0), TimerAction::KickOff(b));

        assert!(timers.pop_due(ms(50.0)).is_none());
        let (_, due, action) = timers.pop_due(ms(250.0)).unwrap();
        assert_eq!(due, ms(100.0));
        assert_eq!(action, TimerAction::KickOff(b));
        let (_, due, _) = timers.pop_due(ms(250.0)).unwrap();
        assert_eq!(due, ms(200.0));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_equal_deadlines_fire_in_arming_order() {
        let mut timers = TimerQueue::new();
        let first = LooperId::from_index(3);
        let second = LooperId::from_index(1);
        timers.at(ms(10.0), TimerAction::SyncPoll(first));
        timers.at(ms(10.0), TimerAction::SyncPoll(second));
        assert_eq!(timers.pop_due(ms(10.0)).unwrap().2.looper(), first);
        assert_eq!(timers.pop_due(ms(10.0)).unwrap().2.looper(), second);
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerQueue::new();
        let id = timers.after(ms(0.0), Duration::from_millis(30), TimerAction::Restart(LooperId::from_index(0)));
        assert_eq!(timers.deadline_of(id), Some(ms(30.0)));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_cycle_timers_for_ignores_sync_polls() {
        let mut timers = TimerQueue::new();
        let a = LooperId::from_index(0);
        timers.at(ms(1.0), TimerAction::Restart(a));
        timers.at(ms(2.0), TimerAction::SyncPoll(a));
        assert_eq!(timers.cycle_timers_for(a), 1);
        assert_eq!(timers.cycle_timers_for(LooperId::from_index(1)), 0);
    }
}
