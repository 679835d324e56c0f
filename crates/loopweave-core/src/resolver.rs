//! Choosing which playing looper a new loop phase-locks to.
//!
//! The policy is an injected strategy ([`ActiveLooperResolver`]) so that the
//! same session can serve a linear scenario (nearest prior step wins) or a
//! decision tree (global latest wins).

use crate::looper::LooperId;
use crate::registry::LooperRegistry;
use crate::scenario::ScenarioAction;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What the caller knows about where it is in the story.
#[derive(Clone, Copy, Debug)]
pub enum ResolveContext<'a> {
    /// No step information (decision-tree navigation).
    Global,
    /// Current step `index` of a linear scenario.
    Step {
        index: usize,
        actions: &'a [ScenarioAction],
    },
}

/// Strategy selecting the reference looper for a new loop.
pub trait ActiveLooperResolver: Send {
    /// Pick the reference looper, or `None` to start unsynchronized.
    fn resolve(&self, registry: &LooperRegistry, context: &ResolveContext<'_>) -> Option<LooperId>;

    /// Policy this resolver implements.
    fn policy(&self) -> SyncPolicy;
}

/// The last playing looper in registry insertion order.
///
/// This is "most recently registered among the playing ones", not "most
/// recently started".
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalLatest;

impl ActiveLooperResolver for GlobalLatest {
    fn resolve(&self, registry: &LooperRegistry, _context: &ResolveContext<'_>) -> Option<LooperId> {
        registry.iter().rev().find(|l| l.is_playing()).map(|l| l.id())
    }

    fn policy(&self) -> SyncPolicy {
        SyncPolicy::GlobalLatest
    }
}

/// The first playing track found scanning the scenario backwards from the
/// step before the current one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NearestPriorStep;

impl ActiveLooperResolver for NearestPriorStep {
    fn resolve(&self, registry: &LooperRegistry, context: &ResolveContext<'_>) -> Option<LooperId> {
        let ResolveContext::Step { index, actions } = *context else {
            log::debug!("[RESOLVER] No scenario step given, starting unsynchronized");
            return None;
        };

        actions[..index.min(actions.len())]
            .iter()
            .rev()
            .filter(|action| action.starts_loops())
            .flat_map(|action| action.tracks())
            .filter_map(|track| registry.get(track.as_str()))
            .find(|looper| looper.is_playing())
            .map(|looper| looper.id())
    }

    fn policy(&self) -> SyncPolicy {
        SyncPolicy::NearestPriorStep
    }
}

/// Configurable choice of resolver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPolicy {
    /// See [`GlobalLatest`].
    #[default]
    GlobalLatest,
    /// See [`NearestPriorStep`].
    NearestPriorStep,
}

impl SyncPolicy {
    /// Build the resolver for this policy.
    pub fn resolver(self) -> Box<dyn ActiveLooperResolver> {
        match self {
            SyncPolicy::GlobalLatest => Box::new(GlobalLatest),
            SyncPolicy::NearestPriorStep => Box::new(NearestPriorStep),
        }
    }

    /// Name used in configuration files and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPolicy::GlobalLatest => "global-latest",
            SyncPolicy::NearestPriorStep => "nearest-prior-step",
        }
    }
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global-latest" => Ok(SyncPolicy::GlobalLatest),
            "nearest-prior-step" => Ok(SyncPolicy::NearestPriorStep),
            other => Err(format!(
                "unknown sync policy '{other}' (expected global-latest or nearest-prior-step)"
            )),
        }
    }
}

impl std::fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::make_registry;
    use crate::resource::testing::CallLog;
    use crate::resource::TrackId;
    use crate::scenario::{ChoiceOption, Scenario};
    use crate::timers::TimerQueue;
    use crate::timing::Timestamp;
    use std::time::Duration;

    fn start(registry: &mut LooperRegistry, track: &str) -> LooperId {
        let id = registry.get_or_create(&TrackId::new(track));
        let mut timers = TimerQueue::new();
        let looper = registry.looper_mut(id);
        looper.on_metadata_loaded(Some(Duration::from_secs(4)), Timestamp::ZERO, &mut timers);
        looper.play(None, Timestamp::ZERO, &mut timers);
        id
    }

    fn steps() -> Scenario {
        Scenario::new(vec![
            ScenarioAction::Play { audio: "A".into() },
            ScenarioAction::Play { audio: "B".into() },
            ScenarioAction::Wait { seconds: 2.0 },
            ScenarioAction::Choose {
                options: vec![
                    ChoiceOption { audio: "C".into(), text: None },
                    ChoiceOption { audio: "D".into(), text: None },
                ],
            },
        ])
    }

    #[test]
    fn test_nearest_prior_step_picks_nearest_playing() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        registry.get_or_create(&TrackId::new("A"));
        let b = start(&mut registry, "B");

        let scenario = steps();
        let context = ResolveContext::Step {
            index: 3,
            actions: scenario.actions(),
        };
        assert_eq!(NearestPriorStep.resolve(&registry, &context), Some(b));
    }

    #[test]
    fn test_nearest_prior_step_prefers_nearer_over_later_registered() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        let b = start(&mut registry, "B");
        start(&mut registry, "A");

        let scenario = steps();
        let context = ResolveContext::Step {
            index: 3,
            actions: scenario.actions(),
        };
        assert_eq!(NearestPriorStep.resolve(&registry, &context), Some(b));
        // Global-latest would have picked A, the later registration.
        assert_eq!(
            GlobalLatest.resolve(&registry, &context),
            registry.id_of("A")
        );
    }

    #[test]
    fn test_nearest_prior_step_ignores_current_and_later_steps() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        start(&mut registry, "C");

        let scenario = steps();
        let context = ResolveContext::Step {
            index: 3,
            actions: scenario.actions(),
        };
        assert_eq!(NearestPriorStep.resolve(&registry, &context), None);

        let context = ResolveContext::Step {
            index: 99,
            actions: scenario.actions(),
        };
        assert_eq!(NearestPriorStep.resolve(&registry, &context), registry.id_of("C"));
    }

    #[test]
    fn test_nearest_prior_step_without_step_is_none() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        start(&mut registry, "A");
        assert_eq!(NearestPriorStep.resolve(&registry, &ResolveContext::Global), None);
    }

    #[test]
    fn test_global_latest_uses_insertion_order() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        let first = start(&mut registry, "first.wav");
        registry.get_or_create(&TrackId::new("idle.wav"));
        assert_eq!(GlobalLatest.resolve(&registry, &ResolveContext::Global), Some(first));

        let second = start(&mut registry, "second.wav");
        assert_eq!(GlobalLatest.resolve(&registry, &ResolveContext::Global), Some(second));
    }

    #[test]
    fn test_global_latest_empty_registry() {
        let log = CallLog::default();
        let registry = make_registry(&log);
        assert_eq!(GlobalLatest.resolve(&registry, &ResolveContext::Global), None);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("global-latest".parse(), Ok(SyncPolicy::GlobalLatest));
        assert_eq!("nearest-prior-step".parse(), Ok(SyncPolicy::NearestPriorStep));
        assert!("latest".parse::<SyncPolicy>().is_err());
        assert_eq!(SyncPolicy::NearestPriorStep.resolver().policy(), SyncPolicy::NearestPriorStep);
        assert_eq!(SyncPolicy::default().to_string(), "global-latest");
    }
}
