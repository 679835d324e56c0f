//! Playback backends for audio files on disk.
//!
//! Both backends read loop lengths from the WAV header on a probe thread.
//! The monitor backend only logs transport calls, which makes it usable on
//! machines without an audio device. The speaker backend (feature
//! `speaker`) plays the files through rodio.
//!
//! Both report the end of every cycle, so tracks without a known length keep
//! looping on end-of-audio. Unreadable files loop silently with a fixed
//! length.

use anyhow::Result;
use loopweave_core::{wav, PlaybackResource, ResourceEvents, ResourceFactory, TrackId};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Where resources send their audio.
pub enum Backend {
    /// Log transport events only.
    Monitor,
    /// Play through the default output device.
    #[cfg(feature = "speaker")]
    Speaker(rodio::OutputStreamHandle),
}

/// Keeps the audio output stream open for the lifetime of the session.
pub struct Output {
    #[cfg(feature = "speaker")]
    _stream: Option<rodio::OutputStream>,
}

/// Open the requested backend.
pub fn open(speaker: bool) -> Result<(Backend, Output)> {
    if !speaker {
        return Ok((
            Backend::Monitor,
            Output {
                #[cfg(feature = "speaker")]
                _stream: None,
            },
        ));
    }
    open_speaker()
}

#[cfg(feature = "speaker")]
fn open_speaker() -> Result<(Backend, Output)> {
    use anyhow::Context;
    let (stream, handle) =
        rodio::OutputStream::try_default().context("Failed to open the default audio output")?;
    log::info!("Audio output opened");
    Ok((
        Backend::Speaker(handle),
        Output {
            _stream: Some(stream),
        },
    ))
}

#[cfg(not(feature = "speaker"))]
fn open_speaker() -> Result<(Backend, Output)> {
    anyhow::bail!("This build has no audio output; rebuild with `--features speaker`")
}

/// Creates resources for track ids relative to a sounds directory.
pub struct FileResources {
    dir: PathBuf,
    backend: Backend,
    unreadable_length: Duration,
}

impl FileResources {
    /// `unreadable_length` is the cycle length used for files whose audio
    /// cannot be read.
    pub fn new(dir: PathBuf, backend: Backend, unreadable_length: Duration) -> Self {
        Self {
            dir,
            backend,
            unreadable_length,
        }
    }
}

impl ResourceFactory for FileResources {
    fn create(&mut self, track: &TrackId, events: ResourceEvents) -> Box<dyn PlaybackResource> {
        let path = self.dir.join(track.as_str());
        let watch = EndWatch::new(track.clone(), events.clone());
        match &self.backend {
            Backend::Monitor => Box::new(MonitorResource::new(
                path,
                track.clone(),
                events,
                watch,
                self.unreadable_length,
            )),
            #[cfg(feature = "speaker")]
            Backend::Speaker(handle) => Box::new(speaker::SpeakerResource::new(
                path,
                track.clone(),
                events,
                watch,
                self.unreadable_length,
                handle.clone(),
            )),
        }
    }
}

fn probe(path: &Path, track: &TrackId, events: &ResourceEvents) {
    if let Err(e) = wav::spawn_probe(path.to_path_buf(), track.clone(), events.clone()) {
        events.load_failed(track, format!("could not start probe thread: {e}"));
    }
}

/// How often a watcher checks whether the current cycle has ended.
const WATCH_TICK: Duration = Duration::from_millis(5);

/// Reports the end of each played cycle as an `Ended` event.
///
/// Every cycle gets a watcher thread. Starting a new cycle or cancelling
/// bumps the generation, which retires the previous watcher without it
/// sending anything.
struct EndWatch {
    track: TrackId,
    events: ResourceEvents,
    generation: Arc<Mutex<u64>>,
}

impl EndWatch {
    fn new(track: TrackId, events: ResourceEvents) -> Self {
        Self {
            track,
            events,
            generation: Arc::new(Mutex::new(0)),
        }
    }

    fn bump(&self) -> u64 {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        *generation
    }

    /// Retire the running watcher, if any.
    fn cancel(&self) {
        self.bump();
    }

    /// Send `Ended` once `finished` returns true, unless cancelled first.
    fn watch(&self, mut finished: impl FnMut() -> bool + Send + 'static) {
        let cycle = self.bump();
        let generation = Arc::clone(&self.generation);
        let track = self.track.clone();
        let events = self.events.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("end-{}", self.track))
            .spawn(move || loop {
                {
                    let current = generation.lock().unwrap_or_else(PoisonError::into_inner);
                    if *current != cycle {
                        return;
                    }
                    if finished() {
                        log::trace!("'{}' reached its end", track);
                        events.ended(&track);
                        return;
                    }
                }
                std::thread::sleep(WATCH_TICK);
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn end watcher for '{}': {}", self.track, e);
        }
    }

    /// Report the end `length` from now.
    fn watch_for(&self, length: Duration) {
        let deadline = Instant::now() + length;
        self.watch(move || Instant::now() >= deadline);
    }
}

/// Length of one cycle: the WAV header length, or `fallback` when the file
/// cannot be read or is empty.
fn cycle_length(path: &Path, fallback: Duration) -> Duration {
    match wav::probe_duration(path) {
        Ok(length) if !length.is_zero() => length,
        Ok(_) => fallback,
        Err(e) => {
            log::debug!("Looping {} silently: {}", path.display(), e);
            fallback
        }
    }
}

/// Resource that logs what would be heard.
///
/// Cycles end after the file's length, so the resource also works for tracks
/// whose metadata never arrived.
pub struct MonitorResource {
    path: PathBuf,
    track: TrackId,
    events: ResourceEvents,
    watch: EndWatch,
    unreadable_length: Duration,
    length: Option<Duration>,
    cycles: u64,
}

impl MonitorResource {
    fn new(
        path: PathBuf,
        track: TrackId,
        events: ResourceEvents,
        watch: EndWatch,
        unreadable_length: Duration,
    ) -> Self {
        Self {
            path,
            track,
            events,
            watch,
            unreadable_length,
            length: None,
            cycles: 0,
        }
    }
}

impl PlaybackResource for MonitorResource {
    fn begin_load(&mut self) {
        log::debug!("Probing {}", self.path.display());
        probe(&self.path, &self.track, &self.events);
    }

    fn seek_to_start(&mut self) {
        self.watch.cancel();
        log::trace!("'{}' rewound", self.track);
    }

    fn play(&mut self) {
        self.cycles += 1;
        let length = *self
            .length
            .get_or_insert_with(|| cycle_length(&self.path, self.unreadable_length));
        self.watch.watch_for(length);
        log::info!("▶ {} (cycle {})", self.track, self.cycles);
    }

    fn pause(&mut self) {
        self.watch.cancel();
        log::info!("■ {}", self.track);
    }
}

#[cfg(feature = "speaker")]
mod speaker {
    use super::*;
    use rodio::{Decoder, OutputStreamHandle, Sink};
    use std::fs::File;
    use std::io::BufReader;

    /// Resource playing a file through rodio. Each cycle gets a fresh sink,
    /// and the cycle ends when the sink runs dry. Files rodio cannot decode
    /// loop silently.
    pub struct SpeakerResource {
        path: PathBuf,
        track: TrackId,
        events: ResourceEvents,
        watch: EndWatch,
        unreadable_length: Duration,
        handle: OutputStreamHandle,
        sink: Option<Arc<Sink>>,
    }

    impl SpeakerResource {
        pub(super) fn new(
            path: PathBuf,
            track: TrackId,
            events: ResourceEvents,
            watch: EndWatch,
            unreadable_length: Duration,
            handle: OutputStreamHandle,
        ) -> Self {
            Self {
                path,
                track,
                events,
                watch,
                unreadable_length,
                handle,
                sink: None,
            }
        }

        fn open_sink(&self) -> Result<Sink> {
            let file = File::open(&self.path)?;
            let source = Decoder::new(BufReader::new(file))?;
            let sink = Sink::try_new(&self.handle)?;
            sink.pause();
            sink.append(source);
            Ok(sink)
        }
    }

    impl PlaybackResource for SpeakerResource {
        fn begin_load(&mut self) {
            probe(&self.path, &self.track, &self.events);
        }

        fn seek_to_start(&mut self) {
            self.watch.cancel();
            if let Some(old) = self.sink.take() {
                old.stop();
            }
            match self.open_sink() {
                Ok(sink) => self.sink = Some(Arc::new(sink)),
                Err(e) => log::error!("Cannot play {}: {}", self.path.display(), e),
            }
        }

        fn play(&mut self) {
            match &self.sink {
                Some(sink) => {
                    sink.play();
                    let sink = Arc::clone(sink);
                    self.watch.watch(move || sink.empty());
                }
                None => self.watch.watch_for(self.unreadable_length),
            }
        }

        fn pause(&mut self) {
            self.watch.cancel();
            if let Some(sink) = &self.sink {
                sink.pause();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopweave_core::{ResourceEventKind, Session, SystemClock};

    fn monitor(dir: &Path, unreadable_length: Duration) -> FileResources {
        let (backend, _output) = open(false).unwrap();
        FileResources::new(dir.to_path_buf(), backend, unreadable_length)
    }

    fn write_wav(path: &Path, sample_rate: u32, frames: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_monitor_backend_probes_files_in_sounds_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut factory = monitor(dir.path(), Duration::from_secs(1));

        let track = TrackId::new("missing.wav");
        let mut resource = factory.create(&track, ResourceEvents::new(tx));
        resource.begin_load();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.track, track);
        assert!(matches!(event.kind, ResourceEventKind::LoadFailed { .. }));
    }

    #[test]
    fn test_monitor_cycle_ends_after_file_length() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("tick.wav"), 8000, 400);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut factory = monitor(dir.path(), Duration::from_secs(60));

        let track = TrackId::new("tick.wav");
        let mut resource = factory.create(&track, ResourceEvents::new(tx));
        resource.seek_to_start();
        resource.play();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.track, track);
        assert_eq!(event.kind, ResourceEventKind::Ended);
    }

    #[test]
    fn test_paused_cycle_reports_no_end() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut factory = monitor(dir.path(), Duration::from_millis(50));

        let mut resource = factory.create(&TrackId::new("gone.wav"), ResourceEvents::new(tx));
        resource.play();
        resource.pause();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_unreadable_track_loops_and_stops_on_end_of_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(
            SystemClock::new(),
            monitor(dir.path(), Duration::from_millis(100)),
        );
        let track = TrackId::new("missing.wav");

        session.play(&track, None);
        session.run_for(Duration::from_millis(350), || false);
        let looper = session.get("missing.wav").unwrap();
        assert!(!looper.is_ready());
        assert!(looper.is_playing());
        assert!(looper.cycles_started() >= 2);

        assert!(session.schedule_stop_after_loop("missing.wav"));
        session.run_for(Duration::from_millis(500), || false);
        let looper = session.get("missing.wav").unwrap();
        assert!(!looper.is_playing());
        assert!(!looper.stop_requested());
    }

    #[cfg(not(feature = "speaker"))]
    #[test]
    fn test_speaker_requires_feature() {
        assert!(open(true).is_err());
    }
}
