//! Playback session.
//!
//! A [`Session`] is the single owner of everything that changes over time:
//! the clock, the timer queue, the track registry, the sync scheduler and
//! the resolver. Resource notifications arrive over a channel and are
//! applied on the session's thread by [`Session::pump`], so the whole
//! engine is one cooperative timeline without locks.

use crate::config::Config;
use crate::looper::{Looper, LooperId, Transition};
use crate::registry::LooperRegistry;
use crate::resolver::{ActiveLooperResolver, ResolveContext, SyncPolicy};
use crate::resource::{ResourceEvent, ResourceEventKind, ResourceEvents, ResourceFactory, TrackId};
use crate::sync::{SyncOutcome, SyncScheduler};
use crate::timers::{TimerAction, TimerId, TimerQueue};
use crate::timing::{Clock, Timestamp};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::time::Duration;

/// How a synchronized start request was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStart {
    /// The track was already playing or about to start; nothing changed.
    AlreadyPlaying,
    /// Started without a reference (nothing else playing, or the reference stopped).
    Immediate,
    /// First cycle scheduled on the reference's next boundary.
    Synced { reference: TrackId, target: Timestamp },
    /// Waiting for the reference's boundary to become known.
    Deferred { reference: TrackId },
}

/// Owner of the playback timeline.
pub struct Session {
    clock: Box<dyn Clock>,
    timers: TimerQueue,
    registry: LooperRegistry,
    sync: SyncScheduler,
    resolver: Box<dyn ActiveLooperResolver>,
    events: ResourceEvents,
    event_rx: Receiver<ResourceEvent>,
    first_play_at: Option<Timestamp>,
}

impl Session {
    /// Create a session with default settings.
    pub fn new(clock: impl Clock + 'static, factory: impl ResourceFactory + 'static) -> Self {
        Self::with_config(clock, factory, &Config::default())
    }

    /// Create a session using the timing and sync settings of `config`.
    pub fn with_config(
        clock: impl Clock + 'static,
        factory: impl ResourceFactory + 'static,
        config: &Config,
    ) -> Self {
        let (tx, event_rx) = crossbeam_channel::unbounded();
        let events = ResourceEvents::new(tx);
        let registry = LooperRegistry::new(
            Box::new(factory),
            events.clone(),
            config.timing.restart_skew(),
        );
        let sync = SyncScheduler::new(config.sync.mode, config.timing.sync_poll_interval());
        let policy = config.sync.policy.unwrap_or_default();

        log::debug!(
            "[SESSION] Created (skew {:?}, sync {} mode, policy {})",
            registry.restart_skew(),
            sync.mode(),
            policy
        );

        Self {
            clock: Box::new(clock),
            timers: TimerQueue::new(),
            registry,
            sync,
            resolver: policy.resolver(),
            events,
            event_rx,
            first_play_at: None,
        }
    }

    /// Replace the reference selection strategy.
    pub fn set_resolver(&mut self, resolver: Box<dyn ActiveLooperResolver>) {
        log::debug!("[SESSION] Resolver set to {}", resolver.policy());
        self.resolver = resolver;
    }

    /// Policy of the current resolver.
    pub fn policy(&self) -> SyncPolicy {
        self.resolver.policy()
    }

    /// Current session time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Register a track (starting its load) or return the existing looper.
    pub fn track(&mut self, track: &TrackId) -> LooperId {
        self.registry.get_or_create(track)
    }

    /// Looper by id.
    pub fn looper(&self, id: LooperId) -> &Looper {
        self.registry.looper(id)
    }

    /// Looper of a registered track.
    pub fn get(&self, track: &str) -> Option<&Looper> {
        self.registry.get(track)
    }

    /// The track registry.
    pub fn registry(&self) -> &LooperRegistry {
        &self.registry
    }

    /// Pending timers.
    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// The sync scheduler.
    pub fn sync(&self) -> &SyncScheduler {
        &self.sync
    }

    /// Handle for resources (or drivers) to report events to this session.
    pub fn event_sender(&self) -> ResourceEvents {
        self.events.clone()
    }

    /// Play `track`, optionally deferring its first cycle to `target`.
    pub fn play(&mut self, track: &TrackId, target: Option<Timestamp>) -> LooperId {
        let id = self.registry.get_or_create(track);
        let now = self.clock.now();
        self.note_first_play(now);
        let transition = self.registry.looper_mut(id).play(target, now, &mut self.timers);
        self.apply(id, transition, now);
        id
    }

    /// Start `track` in phase with `reference` (or unsynchronized without one).
    pub fn start_synced(&mut self, track: &TrackId, reference: Option<&str>) -> SyncStart {
        let id = self.registry.get_or_create(track);
        if self.is_active(id) {
            return SyncStart::AlreadyPlaying;
        }
        let reference = reference.and_then(|r| {
            let found = self.registry.id_of(r);
            if found.is_none() {
                log::debug!("[SESSION] Reference '{}' is not registered", r);
            }
            found
        });
        self.request_start(id, reference)
    }

    /// Start `track` in phase with the looper picked by the resolver.
    pub fn play_synced(&mut self, track: &TrackId, context: &ResolveContext<'_>) -> SyncStart {
        let id = self.registry.get_or_create(track);
        if self.is_active(id) {
            return SyncStart::AlreadyPlaying;
        }
        let reference = self.resolver.resolve(&self.registry, context);
        self.request_start(id, reference)
    }

    fn is_active(&self, id: LooperId) -> bool {
        let looper = self.registry.looper(id);
        if looper.is_playing() || looper.is_starting() {
            log::debug!("[SESSION] '{}' is already playing", looper.track());
            return true;
        }
        false
    }

    fn request_start(&mut self, id: LooperId, reference: Option<LooperId>) -> SyncStart {
        let now = self.clock.now();
        self.note_first_play(now);

        match self.sync.request(id, reference, &self.registry, &mut self.timers, now) {
            SyncOutcome::Start(target) => {
                let transition = self.registry.looper_mut(id).play(target, now, &mut self.timers);
                self.apply(id, transition, now);
                match (target, reference) {
                    (Some(target), Some(reference)) => SyncStart::Synced {
                        reference: self.registry.looper(reference).track().clone(),
                        target,
                    },
                    _ => SyncStart::Immediate,
                }
            }
            SyncOutcome::Waiting => SyncStart::Deferred {
                reference: reference
                    .map(|r| self.registry.looper(r).track().clone())
                    .unwrap_or_else(|| self.registry.looper(id).track().clone()),
            },
        }
    }

    /// Stop `track` at its next loop boundary.
    ///
    /// Returns false for unknown or non-playing tracks.
    pub fn schedule_stop_after_loop(&mut self, track: &str) -> bool {
        match self.registry.id_of(track) {
            Some(id) => self.registry.looper_mut(id).schedule_stop_after_loop(),
            None => {
                log::debug!("[SESSION] Stop for unknown track '{}' ignored", track);
                false
            }
        }
    }

    /// Stop every playing track at its next boundary. Returns how many were asked.
    pub fn stop_all_after_loop(&mut self) -> usize {
        let playing: Vec<LooperId> = self
            .registry
            .iter()
            .filter(|l| l.is_playing())
            .map(|l| l.id())
            .collect();
        playing
            .into_iter()
            .filter(|id| self.registry.looper_mut(*id).schedule_stop_after_loop())
            .count()
    }

    /// End of the current cycle of `track`, if known.
    pub fn next_loop_boundary(&self, track: &str) -> Option<Timestamp> {
        self.registry.get(track)?.next_loop_boundary()
    }

    /// Tracks currently cycling, in registration order.
    pub fn playing_tracks(&self) -> Vec<&TrackId> {
        self.registry
            .iter()
            .filter(|l| l.is_playing())
            .map(|l| l.track())
            .collect()
    }

    /// When the first play of this session was requested.
    pub fn first_play_at(&self) -> Option<Timestamp> {
        self.first_play_at
    }

    /// Time since the first play, if anything has played yet.
    pub fn elapsed_since_first_play(&self) -> Option<Duration> {
        self.first_play_at
            .map(|start| self.clock.now().saturating_duration_since(start))
    }

    fn note_first_play(&mut self, now: Timestamp) {
        if self.first_play_at.is_none() {
            self.first_play_at = Some(now);
        }
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Apply queued resource events and fire every due timer.
    ///
    /// Returns the number of events and timers handled.
    pub fn pump(&mut self) -> usize {
        let now = self.clock.now();
        let mut handled = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.dispatch_event(event, now);
            handled += 1;
        }
        while let Some((timer, _due, action)) = self.timers.pop_due(now) {
            self.dispatch_timer(timer, action, now);
            handled += 1;
        }
        handled
    }

    /// Block until the next timer deadline, a resource event or `max_wait`,
    /// whichever comes first, then pump.
    pub fn wait_and_pump(&mut self, max_wait: Duration) -> usize {
        let now = self.clock.now();
        let wait = match self.timers.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(max_wait),
            None => max_wait,
        };

        let mut handled = 0;
        match self.event_rx.recv_timeout(wait) {
            Ok(event) => {
                let now = self.clock.now();
                self.dispatch_event(event, now);
                handled += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::trace!("[SESSION] Event channel closed");
            }
        }
        handled + self.pump()
    }

    /// Keep the timeline running for `duration` of real time.
    ///
    /// Stops early when `interrupted` returns true; returns false in that case.
    pub fn run_for(&mut self, duration: Duration, mut interrupted: impl FnMut() -> bool) -> bool {
        let deadline = self.clock.now() + duration;
        loop {
            if interrupted() {
                return false;
            }
            let now = self.clock.now();
            if now >= deadline {
                self.pump();
                return true;
            }
            let slice = deadline
                .saturating_duration_since(now)
                .min(Duration::from_millis(100));
            self.wait_and_pump(slice);
        }
    }

    fn dispatch_event(&mut self, event: ResourceEvent, now: Timestamp) {
        let Some(id) = self.registry.id_of(event.track.as_str()) else {
            log::debug!("[SESSION] Event for unknown track '{}' ignored", event.track);
            return;
        };
        let looper = self.registry.looper_mut(id);
        let transition = match event.kind {
            ResourceEventKind::MetadataLoaded { duration } => {
                looper.on_metadata_loaded(duration, now, &mut self.timers)
            }
            ResourceEventKind::LoadFailed { reason } => {
                looper.on_load_failed(&reason, now, &mut self.timers)
            }
            ResourceEventKind::Ended => looper.on_ended(now, &mut self.timers),
        };
        self.apply(id, transition, now);
    }

    fn dispatch_timer(&mut self, timer: TimerId, action: TimerAction, now: Timestamp) {
        match action {
            TimerAction::SyncPoll(candidate) => {
                let resolved =
                    self.sync
                        .on_poll(timer, candidate, &self.registry, &mut self.timers, now);
                if let Some((candidate, target)) = resolved {
                    let transition =
                        self.registry
                            .looper_mut(candidate)
                            .play(target, now, &mut self.timers);
                    self.apply(candidate, transition, now);
                }
            }
            TimerAction::KickOff(id) | TimerAction::Restart(id) => {
                let transition =
                    self.registry
                        .looper_mut(id)
                        .on_timer(timer, action, now, &mut self.timers);
                self.apply(id, transition, now);
            }
        }
    }

    /// Propagate a looper transition to parked sync requests.
    ///
    /// Starting a candidate can itself commit a cycle that releases further
    /// candidates, hence the worklist.
    fn apply(&mut self, id: LooperId, transition: Transition, now: Timestamp) {
        let mut work = VecDeque::from([(id, transition)]);
        while let Some((id, transition)) = work.pop_front() {
            let released: Vec<(LooperId, Option<Timestamp>)> = match transition {
                Transition::Idle => continue,
                Transition::CycleStarted { at, boundary } => {
                    self.sync.on_cycle_started(id, at, boundary)
                }
                Transition::Stopped => self
                    .sync
                    .on_stopped(id, &mut self.timers)
                    .into_iter()
                    .map(|candidate| (candidate, None))
                    .collect(),
            };
            for (candidate, target) in released {
                let next = self
                    .registry
                    .looper_mut(candidate)
                    .play(target, now, &mut self.timers);
                work.push_back((candidate, next));
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry)
            .field("sync", &self.sync)
            .field("timers", &self.timers.len())
            .field("policy", &self.resolver.policy())
            .field("first_play_at", &self.first_play_at)
            .finish_non_exhaustive()
    }
}
