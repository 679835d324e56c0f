//! Per-track looping player.
//!
//! A [`Looper`] owns one [`PlaybackResource`] and restarts it every time its
//! duration elapses until a stop is requested. Readiness (metadata loading)
//! and playback are two orthogonal axes:
//!
//! ```text
//! readiness:  Loading ──► Ready            (or ──► Failed, degraded)
//! playback:   Stopped ──► [AwaitingReady] ──► [AwaitingStart] ──► Playing ──► Stopped
//! ```
//!
//! While `Playing`, exactly one wakeup is armed: a restart timer at
//! `duration - restart_skew`, or, when the duration is unknown, a one-shot
//! subscription to the resource's "ended" notification.

use crate::resource::{PlaybackResource, TrackId};
use crate::timers::{TimerAction, TimerId, TimerQueue};
use crate::timing::Timestamp;
use std::time::Duration;

/// Index of a looper inside its registry. Stable for the session lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LooperId(usize);

impl LooperId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Registry insertion index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Metadata loading state. Leaves `Loading` exactly once and never returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Resource created, metadata not yet available.
    Loading,
    /// Metadata available.
    Ready,
    /// Metadata will never arrive; playback relies on "ended" notifications.
    Failed,
}

/// Playback axis of the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    /// Not playing.
    Stopped,
    /// `play` was requested before metadata loaded.
    AwaitingReady { target: Option<Timestamp> },
    /// First cycle deferred to a sync target.
    AwaitingStart { target: Timestamp },
    /// Cycling.
    Playing,
}

/// The single pending wakeup of a looper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wakeup {
    Timer(TimerId),
    Ended,
}

/// Observable outcome of a state machine step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable happened.
    Idle,
    /// A cycle was committed at `at`. `boundary` is the end of that cycle, if known.
    CycleStarted {
        at: Timestamp,
        boundary: Option<Timestamp>,
    },
    /// A scheduled stop took effect.
    Stopped,
}

/// Looping player for a single track.
pub struct Looper {
    id: LooperId,
    track: TrackId,
    resource: Box<dyn PlaybackResource>,
    readiness: Readiness,
    duration: Option<Duration>,
    state: PlaybackState,
    cycle_start: Option<Timestamp>,
    stop_after_loop: bool,
    wakeup: Option<Wakeup>,
    restart_skew: Duration,
    cycles: u64,
}

impl Looper {
    /// Create a looper around `resource`. Loading is started by the registry.
    pub fn new(
        id: LooperId,
        track: TrackId,
        resource: Box<dyn PlaybackResource>,
        restart_skew: Duration,
    ) -> Self {
        Self {
            id,
            track,
            resource,
            readiness: Readiness::Loading,
            duration: None,
            state: PlaybackState::Stopped,
            cycle_start: None,
            stop_after_loop: false,
            wakeup: None,
            restart_skew,
            cycles: 0,
        }
    }

    pub(crate) fn begin_load(&mut self) {
        self.resource.begin_load();
    }

    /// Start looping, optionally deferring the first cycle to `target`.
    ///
    /// A no-op while already playing or already waiting to start. Before
    /// metadata has loaded, the request is parked until it does.
    pub fn play(
        &mut self,
        target: Option<Timestamp>,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> Transition {
        if self.state != PlaybackState::Stopped {
            log::debug!(
                "[LOOPER] '{}' play ignored, state is {:?}",
                self.track,
                self.state
            );
            return Transition::Idle;
        }

        if self.readiness == Readiness::Loading {
            log::debug!("[LOOPER] '{}' waiting for metadata before playing", self.track);
            self.state = PlaybackState::AwaitingReady { target };
            return Transition::Idle;
        }

        self.start(target, now, timers)
    }

    /// Request a stop at the end of the current cycle.
    ///
    /// Returns false (and changes nothing) when the looper is not playing.
    pub fn schedule_stop_after_loop(&mut self) -> bool {
        if self.state != PlaybackState::Playing {
            log::debug!(
                "[LOOPER] '{}' stop ignored, not playing ({:?})",
                self.track,
                self.state
            );
            return false;
        }
        if !self.stop_after_loop {
            log::debug!("[LOOPER] '{}' will stop at the next loop boundary", self.track);
        }
        self.stop_after_loop = true;
        true
    }

    /// End of the current cycle, if playing with a known duration.
    pub fn next_loop_boundary(&self) -> Option<Timestamp> {
        if self.state != PlaybackState::Playing {
            return None;
        }
        Some(self.cycle_start? + self.duration?)
    }

    pub(crate) fn on_metadata_loaded(
        &mut self,
        duration: Option<Duration>,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> Transition {
        if self.readiness != Readiness::Loading {
            log::debug!("[LOOPER] '{}' duplicate metadata ignored", self.track);
            return Transition::Idle;
        }
        self.readiness = Readiness::Ready;
        self.duration = duration.filter(|d| !d.is_zero());
        match self.duration {
            Some(d) => log::debug!("[LOOPER] '{}' ready, duration {:?}", self.track, d),
            None => log::warn!(
                "[LOOPER] '{}' ready without a usable duration, looping on end-of-audio",
                self.track
            ),
        }
        self.resume_parked_play(now, timers)
    }

    pub(crate) fn on_load_failed(
        &mut self,
        reason: &str,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> Transition {
        if self.readiness != Readiness::Loading {
            return Transition::Idle;
        }
        log::warn!(
            "[LOOPER] '{}' metadata unavailable ({}), looping on end-of-audio",
            self.track,
            reason
        );
        self.readiness = Readiness::Failed;
        self.resume_parked_play(now, timers)
    }

    pub(crate) fn on_timer(
        &mut self,
        timer: TimerId,
        action: TimerAction,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> Transition {
        if self.wakeup != Some(Wakeup::Timer(timer)) {
            log::trace!("[LOOPER] '{}' stale timer {:?} ignored", self.track, timer);
            return Transition::Idle;
        }
        self.wakeup = None;

        match (action, self.state) {
            (TimerAction::KickOff(_), PlaybackState::AwaitingStart { .. }) => {
                self.kick_off(now, timers)
            }
            (TimerAction::Restart(_), PlaybackState::Playing) => self.loop_boundary(now, timers, true),
            (action, state) => {
                log::debug!(
                    "[LOOPER] '{}' timer {:?} does not apply in state {:?}",
                    self.track,
                    action,
                    state
                );
                Transition::Idle
            }
        }
    }

    pub(crate) fn on_ended(&mut self, now: Timestamp, timers: &mut TimerQueue) -> Transition {
        if self.wakeup != Some(Wakeup::Ended) || self.state != PlaybackState::Playing {
            log::trace!("[LOOPER] '{}' unsubscribed end-of-audio ignored", self.track);
            return Transition::Idle;
        }
        self.wakeup = None;
        self.loop_boundary(now, timers, false)
    }

    fn resume_parked_play(&mut self, now: Timestamp, timers: &mut TimerQueue) -> Transition {
        match self.state {
            PlaybackState::AwaitingReady { target } => {
                self.state = PlaybackState::Stopped;
                self.start(target, now, timers)
            }
            _ => Transition::Idle,
        }
    }

    fn start(
        &mut self,
        target: Option<Timestamp>,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> Transition {
        match target {
            Some(target) if target > now => {
                self.clear_wakeup(timers);
                let id = timers.at(target, TimerAction::KickOff(self.id));
                self.wakeup = Some(Wakeup::Timer(id));
                self.state = PlaybackState::AwaitingStart { target };
                log::debug!(
                    "[LOOPER] '{}' first cycle deferred to {} (in {:?})",
                    self.track,
                    target,
                    target.saturating_duration_since(now)
                );
                Transition::Idle
            }
            _ => self.kick_off(now, timers),
        }
    }

    fn kick_off(&mut self, now: Timestamp, timers: &mut TimerQueue) -> Transition {
        self.state = PlaybackState::Playing;
        log::info!("[LOOPER] '{}' started at {}", self.track, now);
        self.begin_cycle(now, timers)
    }

    fn begin_cycle(&mut self, now: Timestamp, timers: &mut TimerQueue) -> Transition {
        self.resource.seek_to_start();
        self.resource.play();
        self.cycle_start = Some(now);
        self.cycles += 1;

        self.clear_wakeup(timers);
        self.wakeup = Some(match self.duration {
            Some(duration) => {
                let delay = self.restart_delay(duration);
                Wakeup::Timer(timers.after(now, delay, TimerAction::Restart(self.id)))
            }
            None => Wakeup::Ended,
        });

        log::trace!("[LOOPER] '{}' cycle {} at {}", self.track, self.cycles, now);
        Transition::CycleStarted {
            at: now,
            boundary: self.next_loop_boundary(),
        }
    }

    fn loop_boundary(&mut self, now: Timestamp, timers: &mut TimerQueue, pause: bool) -> Transition {
        if self.stop_after_loop {
            if pause {
                self.resource.pause();
            }
            self.state = PlaybackState::Stopped;
            self.stop_after_loop = false;
            log::info!("[LOOPER] '{}' stopped at {}", self.track, now);
            return Transition::Stopped;
        }
        self.begin_cycle(now, timers)
    }

    /// Delay before the restart check, compensated for dispatch latency.
    ///
    /// Durations not longer than the skew are used uncompensated.
    fn restart_delay(&self, duration: Duration) -> Duration {
        let compensated = duration.saturating_sub(self.restart_skew);
        if compensated.is_zero() {
            duration
        } else {
            compensated
        }
    }

    fn clear_wakeup(&mut self, timers: &mut TimerQueue) {
        if let Some(Wakeup::Timer(id)) = self.wakeup.take() {
            timers.cancel(id);
        }
    }

    /// Registry id.
    pub fn id(&self) -> LooperId {
        self.id
    }

    /// Track this looper plays.
    pub fn track(&self) -> &TrackId {
        &self.track
    }

    /// Metadata loading state.
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// Whether metadata has loaded.
    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    /// Loop duration, once known.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Playback state.
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Whether a cycle is committed (stays true across restarts).
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// Whether `play` was accepted but the first cycle has not started yet.
    pub fn is_starting(&self) -> bool {
        matches!(
            self.state,
            PlaybackState::AwaitingReady { .. } | PlaybackState::AwaitingStart { .. }
        )
    }

    /// Start of the most recent cycle.
    pub fn cycle_start(&self) -> Option<Timestamp> {
        self.cycle_start
    }

    /// Whether a stop is pending for the current cycle.
    pub fn stop_requested(&self) -> bool {
        self.stop_after_loop
    }

    /// Number of cycles committed so far.
    pub fn cycles_started(&self) -> u64 {
        self.cycles
    }

    /// Number of armed wakeups (timer or ended subscription). Never more than one.
    pub fn pending_wakeups(&self) -> usize {
        usize::from(self.wakeup.is_some())
    }

    /// Skew subtracted from the duration when arming restart timers.
    pub fn restart_skew(&self) -> Duration {
        self.restart_skew
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("id", &self.id)
            .field("track", &self.track)
            .field("readiness", &self.readiness)
            .field("duration", &self.duration)
            .field("state", &self.state)
            .field("cycle_start", &self.cycle_start)
            .field("stop_after_loop", &self.stop_after_loop)
            .finish_non_exhaustive()
    }
}
