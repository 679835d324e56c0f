//! Track registry.
//!
//! The [`LooperRegistry`] maps track ids to loopers. Entries are created on
//! first reference (which starts loading the resource) and are never
//! removed. Iteration follows insertion order, which the global-latest
//! resolver relies on.

use crate::looper::{Looper, LooperId};
use crate::resource::{ResourceEvents, ResourceFactory, TrackId};
use indexmap::IndexMap;
use std::time::Duration;

/// Insertion-ordered, append-only map from track id to [`Looper`].
pub struct LooperRegistry {
    loopers: IndexMap<TrackId, Looper>,
    factory: Box<dyn ResourceFactory>,
    events: ResourceEvents,
    restart_skew: Duration,
}

impl LooperRegistry {
    /// Create an empty registry.
    ///
    /// `factory` builds resources for new tracks; `events` is handed to each
    /// of them for reporting back to the session.
    pub fn new(
        factory: Box<dyn ResourceFactory>,
        events: ResourceEvents,
        restart_skew: Duration,
    ) -> Self {
        Self {
            loopers: IndexMap::new(),
            factory,
            events,
            restart_skew,
        }
    }

    /// Return the looper for `track`, creating it (and starting its load) on first use.
    pub fn get_or_create(&mut self, track: &TrackId) -> LooperId {
        if let Some(index) = self.loopers.get_index_of(track.as_str()) {
            return LooperId::from_index(index);
        }

        let id = LooperId::from_index(self.loopers.len());
        let resource = self.factory.create(track, self.events.clone());
        let mut looper = Looper::new(id, track.clone(), resource, self.restart_skew);
        looper.begin_load();
        self.loopers.insert(track.clone(), looper);
        log::debug!("[REGISTRY] Registered '{}' as {:?}", track, id);
        id
    }

    /// Look up a registered track.
    pub fn id_of(&self, track: &str) -> Option<LooperId> {
        self.loopers.get_index_of(track).map(LooperId::from_index)
    }

    /// Get the looper for a registered track.
    pub fn get(&self, track: &str) -> Option<&Looper> {
        self.loopers.get(track)
    }

    /// Get a looper by id.
    ///
    /// Ids are only handed out by this registry, so a foreign id is a caller bug.
    pub fn looper(&self, id: LooperId) -> &Looper {
        &self.loopers[id.index()]
    }

    /// Get a looper by id, mutably.
    pub fn looper_mut(&mut self, id: LooperId) -> &mut Looper {
        &mut self.loopers[id.index()]
    }

    /// Iterate loopers in insertion order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Looper> {
        self.loopers.values()
    }

    /// Number of registered tracks.
    pub fn len(&self) -> usize {
        self.loopers.len()
    }

    /// Check if no track has been registered.
    pub fn is_empty(&self) -> bool {
        self.loopers.is_empty()
    }

    /// Skew applied to restart timers of new loopers.
    pub fn restart_skew(&self) -> Duration {
        self.restart_skew
    }
}

impl std::fmt::Debug for LooperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LooperRegistry")
            .field("tracks", &self.loopers.keys().collect::<Vec<_>>())
            .field("restart_skew", &self.restart_skew)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resource::testing::{recording_factory, Call, CallLog};

    pub(crate) fn make_registry(log: &CallLog) -> LooperRegistry {
        let (tx, _rx) = crossbeam_channel::unbounded();
        LooperRegistry::new(
            Box::new(recording_factory(log.clone())),
            ResourceEvents::new(tx),
            Duration::from_millis(30),
        )
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        let drone = TrackId::new("drone.wav");

        let first = registry.get_or_create(&drone);
        let second = registry.get_or_create(&drone);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(log.count(&Call::Load("drone.wav".into())), 1);
    }

    #[test]
    fn test_insertion_order_and_lookup() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        for name in ["a.wav", "b.wav", "c.wav"] {
            registry.get_or_create(&TrackId::new(name));
        }
        registry.get_or_create(&TrackId::new("a.wav"));

        let order: Vec<_> = registry.iter().map(|l| l.track().to_string()).collect();
        assert_eq!(order, ["a.wav", "b.wav", "c.wav"]);
        assert_eq!(registry.id_of("b.wav").map(LooperId::index), Some(1));
        assert_eq!(registry.looper(LooperId::from_index(2)).track().as_str(), "c.wav");
        assert!(registry.get("missing.wav").is_none());
        assert!(registry.id_of("missing.wav").is_none());
    }

    #[test]
    fn test_new_loopers_use_registry_skew() {
        let log = CallLog::default();
        let mut registry = make_registry(&log);
        let id = registry.get_or_create(&TrackId::new("a.wav"));
        assert_eq!(registry.looper(id).restart_skew(), Duration::from_millis(30));
        assert!(!registry.looper(id).is_ready());
    }
}
