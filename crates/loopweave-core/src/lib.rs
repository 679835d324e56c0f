//! LoopWeave Core - phase-locked looping for interactive audio narratives.
//!
//! This crate provides the engine behind LoopWeave stories, where the
//! listener adds and removes looping audio layers while they keep playing in
//! phase with each other:
//!
//! - **Looper** - Per-track looping state machine with skew-compensated restarts
//! - **Registry** - Insertion-ordered map from track id to looper
//! - **Resolver** - Strategy picking the playing looper a new loop aligns to
//! - **Sync** - Turns "start in phase with X" into a concrete start target
//! - **Session** - Owns the clock, timers and registry; one cooperative timeline
//! - **Scenario** - Linear scenarios and decision trees
//! - **Config** - TOML configuration
//!
//! # Architecture
//!
//! Nothing in the engine blocks or spawns tasks. Every deferred continuation
//! is a [`TimerQueue`] entry, and resource notifications (metadata loaded,
//! load failed, playback ended) arrive as [`ResourceEvent`] messages that the
//! [`Session`] drains on its own thread. Audio itself is produced by an
//! injected [`PlaybackResource`]; the engine only decides when it starts,
//! restarts and stops.

pub mod config;
pub mod error;
pub mod looper;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod scenario;
pub mod session;
pub mod sync;
pub mod timers;
pub mod timing;
pub mod wav;

pub use config::Config;
pub use error::{Error, Result};
pub use looper::{Looper, LooperId, PlaybackState, Readiness, Transition};
pub use registry::LooperRegistry;
pub use resolver::{ActiveLooperResolver, GlobalLatest, NearestPriorStep, ResolveContext, SyncPolicy};
pub use resource::{
    PlaybackResource, ResourceEvent, ResourceEventKind, ResourceEvents, ResourceFactory, TrackId,
};
pub use scenario::{DecisionTree, OptionAction, Scenario, ScenarioAction};
pub use session::{Session, SyncStart};
pub use sync::{SyncMode, SyncOutcome, SyncScheduler};
pub use timers::{TimerAction, TimerId, TimerQueue};
pub use timing::{Clock, ManualClock, SystemClock, Timestamp};
