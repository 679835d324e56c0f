//! Cross-track start synchronization.
//!
//! The [`SyncScheduler`] turns "start this looper in phase with that one"
//! into a concrete `play(target)` call. When the reference boundary is not
//! known yet the request is parked until it is, either as a continuation
//! fired by the reference looper's next committed cycle ([`SyncMode::Event`])
//! or by re-checking on a fixed interval ([`SyncMode::Poll`]).

use crate::looper::LooperId;
use crate::registry::LooperRegistry;
use crate::timers::{TimerAction, TimerId, TimerQueue};
use crate::timing::Timestamp;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default interval between boundary re-checks in poll mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How parked requests wait for the reference boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Resolve when the reference looper commits its next cycle.
    #[default]
    Event,
    /// Re-check the reference boundary every poll interval.
    Poll,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(SyncMode::Event),
            "poll" => Ok(SyncMode::Poll),
            other => Err(format!("unknown sync mode '{other}' (expected event or poll)")),
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncMode::Event => "event",
            SyncMode::Poll => "poll",
        })
    }
}

/// Immediate result of a sync request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Call `play` on the candidate now with this target (`None` = immediately).
    Start(Option<Timestamp>),
    /// Parked until the reference boundary becomes known.
    Waiting,
}

/// A parked request.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    /// Looper waiting to start.
    pub candidate: LooperId,
    /// Looper it phase-locks to.
    pub reference: LooperId,
    /// When the request was made.
    pub requested_at: Timestamp,
    poll_timer: Option<TimerId>,
    polls: u32,
}

impl SyncRequest {
    /// Number of boundary re-checks so far (poll mode).
    pub fn polls(&self) -> u32 {
        self.polls
    }
}

/// Resolves start targets for loopers synchronized to other loopers.
#[derive(Debug)]
pub struct SyncScheduler {
    mode: SyncMode,
    poll_interval: Duration,
    requests: IndexMap<LooperId, SyncRequest>,
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new(SyncMode::default(), DEFAULT_POLL_INTERVAL)
    }
}

impl SyncScheduler {
    /// Create a scheduler.
    pub fn new(mode: SyncMode, poll_interval: Duration) -> Self {
        Self {
            mode,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            requests: IndexMap::new(),
        }
    }

    /// Request that `candidate` starts on the next boundary of `reference`.
    ///
    /// Any earlier parked request for the same candidate is superseded.
    pub fn request(
        &mut self,
        candidate: LooperId,
        reference: Option<LooperId>,
        registry: &LooperRegistry,
        timers: &mut TimerQueue,
        now: Timestamp,
    ) -> SyncOutcome {
        if let Some(old) = self.requests.shift_remove(&candidate) {
            log::debug!(
                "[SYNC] Request for '{}' superseded",
                registry.looper(old.candidate).track()
            );
            if let Some(timer) = old.poll_timer {
                timers.cancel(timer);
            }
        }

        let Some(reference) = reference.filter(|r| *r != candidate) else {
            return SyncOutcome::Start(None);
        };

        let reference_looper = registry.looper(reference);
        if let Some(boundary) = reference_looper.next_loop_boundary() {
            log::debug!(
                "[SYNC] '{}' will start with '{}' at {}",
                registry.looper(candidate).track(),
                reference_looper.track(),
                boundary
            );
            return SyncOutcome::Start(Some(boundary));
        }

        if !reference_looper.is_playing() && !reference_looper.is_starting() {
            log::debug!(
                "[SYNC] Reference '{}' is stopped, starting '{}' unsynchronized",
                reference_looper.track(),
                registry.looper(candidate).track()
            );
            return SyncOutcome::Start(None);
        }

        log::debug!(
            "[SYNC] '{}' waiting for the boundary of '{}' ({} mode)",
            registry.looper(candidate).track(),
            reference_looper.track(),
            self.mode
        );
        let poll_timer = match self.mode {
            SyncMode::Poll => {
                Some(timers.after(now, self.poll_interval, TimerAction::SyncPoll(candidate)))
            }
            SyncMode::Event => None,
        };
        self.requests.insert(
            candidate,
            SyncRequest {
                candidate,
                reference,
                requested_at: now,
                poll_timer,
                polls: 0,
            },
        );
        SyncOutcome::Waiting
    }

    /// Handle a poll timer. Returns the candidate and its start target once resolvable.
    pub fn on_poll(
        &mut self,
        timer: TimerId,
        candidate: LooperId,
        registry: &LooperRegistry,
        timers: &mut TimerQueue,
        now: Timestamp,
    ) -> Option<(LooperId, Option<Timestamp>)> {
        let request = self.requests.get_mut(&candidate)?;
        if request.poll_timer != Some(timer) {
            return None;
        }
        request.poll_timer = None;
        request.polls += 1;

        let reference = registry.looper(request.reference);
        let target = if let Some(boundary) = reference.next_loop_boundary() {
            Some(boundary)
        } else if !reference.is_playing() && !reference.is_starting() {
            None
        } else {
            log::trace!(
                "[SYNC] Boundary of '{}' still unknown (poll {})",
                reference.track(),
                request.polls
            );
            request.poll_timer =
                Some(timers.after(now, self.poll_interval, TimerAction::SyncPoll(candidate)));
            return None;
        };

        self.requests.shift_remove(&candidate);
        Some((candidate, target))
    }

    /// Resolve requests parked on `reference` after it committed a cycle at `at`.
    ///
    /// Only applies in event mode. A reference without a known duration
    /// resolves to the cycle start itself.
    pub fn on_cycle_started(
        &mut self,
        reference: LooperId,
        at: Timestamp,
        boundary: Option<Timestamp>,
    ) -> Vec<(LooperId, Option<Timestamp>)> {
        if self.mode != SyncMode::Event {
            return Vec::new();
        }
        let target = boundary.unwrap_or(at);
        self.take_parked_on(reference)
            .into_iter()
            .map(|request| (request.candidate, Some(target)))
            .collect()
    }

    /// Release requests parked on a reference that stopped. They start unsynchronized.
    pub fn on_stopped(&mut self, reference: LooperId, timers: &mut TimerQueue) -> Vec<LooperId> {
        self.take_parked_on(reference)
            .into_iter()
            .map(|request| {
                if let Some(timer) = request.poll_timer {
                    timers.cancel(timer);
                }
                request.candidate
            })
            .collect()
    }

    fn take_parked_on(&mut self, reference: LooperId) -> Vec<SyncRequest> {
        let candidates: Vec<LooperId> = self
            .requests
            .values()
            .filter(|r| r.reference == reference)
            .map(|r| r.candidate)
            .collect();
        candidates
            .into_iter()
            .filter_map(|c| self.requests.shift_remove(&c))
            .collect()
    }

    /// The parked request of a candidate, if any.
    pub fn parked(&self, candidate: LooperId) -> Option<&SyncRequest> {
        self.requests.get(&candidate)
    }

    /// Number of parked requests.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Wait mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Poll interval used in poll mode.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
