//! Playback resource contract.
//!
//! A [`PlaybackResource`] is the opaque audio handle a [`Looper`](crate::Looper)
//! drives. The engine only decides *when* it starts and stops; decoding and
//! output belong to the implementation. Asynchronous notifications
//! (metadata loaded, load failure, playback ended) travel back to the
//! session as [`ResourceEvent`] messages through a [`ResourceEvents`] handle,
//! so loader threads never touch engine state directly.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::time::Duration;

/// Opaque, stable identifier of an audio track (usually its file name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    /// Create a track id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TrackId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport primitives the engine needs from an audio handle.
pub trait PlaybackResource: Send {
    /// Start loading the source. Completion is reported through [`ResourceEvents`].
    fn begin_load(&mut self);

    /// Rewind to the beginning of the audio.
    fn seek_to_start(&mut self);

    /// Start (or resume) audible playback.
    fn play(&mut self);

    /// Pause audible playback.
    fn pause(&mut self);
}

/// Creates resources for newly registered tracks.
pub trait ResourceFactory: Send {
    /// Build the resource for `track`. The resource reports through `events`.
    fn create(&mut self, track: &TrackId, events: ResourceEvents) -> Box<dyn PlaybackResource>;
}

impl<F> ResourceFactory for F
where
    F: FnMut(&TrackId, ResourceEvents) -> Box<dyn PlaybackResource> + Send,
{
    fn create(&mut self, track: &TrackId, events: ResourceEvents) -> Box<dyn PlaybackResource> {
        self(track, events)
    }
}

/// Notification from a resource to the session.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceEvent {
    /// Track the notification concerns.
    pub track: TrackId,
    /// What happened.
    pub kind: ResourceEventKind,
}

/// Kinds of resource notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEventKind {
    /// Metadata is available. `duration` is `None` when the source length is unknown.
    MetadataLoaded { duration: Option<Duration> },
    /// Metadata will never arrive.
    LoadFailed { reason: String },
    /// Playback reached the end of the audio.
    Ended,
}

/// Sending half handed to resources for reporting events.
#[derive(Clone, Debug)]
pub struct ResourceEvents {
    tx: Sender<ResourceEvent>,
}

impl ResourceEvents {
    /// Wrap a channel sender.
    pub fn new(tx: Sender<ResourceEvent>) -> Self {
        Self { tx }
    }

    /// Report an event. A closed session is silently ignored.
    pub fn send(&self, track: &TrackId, kind: ResourceEventKind) {
        let event = ResourceEvent {
            track: track.clone(),
            kind,
        };
        if self.tx.send(event).is_err() {
            log::debug!("[RESOURCE] Session closed, dropping event for '{}'", track);
        }
    }

    /// Report that metadata has loaded.
    pub fn metadata_loaded(&self, track: &TrackId, duration: Option<Duration>) {
        self.send(track, ResourceEventKind::MetadataLoaded { duration });
    }

    /// Report that loading failed for good.
    pub fn load_failed(&self, track: &TrackId, reason: impl Into<String>) {
        self.send(
            track,
            ResourceEventKind::LoadFailed {
                reason: reason.into(),
            },
        );
    }

    /// Report that playback reached the end.
    pub fn ended(&self, track: &TrackId) {
        self.send(track, ResourceEventKind::Ended);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording resource used by the engine tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    /// A transport call observed on a [`RecordingResource`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        Load(String),
        Seek(String),
        Play(String),
        Pause(String),
    }

    /// Shared log of transport calls across all resources of a factory.
    #[derive(Clone, Default)]
    pub struct CallLog(Arc<Mutex<Vec<Call>>>);

    impl CallLog {
        pub fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }

        pub fn count(&self, call: &Call) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        fn push(&self, call: Call) {
            self.0.lock().unwrap().push(call);
        }
    }

    /// Resource that records calls and never produces events on its own.
    pub struct RecordingResource {
        track: TrackId,
        log: CallLog,
    }

    impl PlaybackResource for RecordingResource {
        fn begin_load(&mut self) {
            self.log.push(Call::Load(self.track.to_string()));
        }

        fn seek_to_start(&mut self) {
            self.log.push(Call::Seek(self.track.to_string()));
        }

        fn play(&mut self) {
            self.log.push(Call::Play(self.track.to_string()));
        }

        fn pause(&mut self) {
            self.log.push(Call::Pause(self.track.to_string()));
        }
    }

    /// Factory producing [`RecordingResource`]s that share one [`CallLog`].
    pub fn recording_factory(log: CallLog) -> impl ResourceFactory {
        move |track: &TrackId, _events: ResourceEvents| -> Box<dyn PlaybackResource> {
            Box::new(RecordingResource {
                track: track.clone(),
                log: log.clone(),
            })
        }
    }
}
