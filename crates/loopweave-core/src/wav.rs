//! WAV header probing.
//!
//! Loop durations come from the file header, so loading a track only needs
//! the header. [`spawn_probe`] does that on a loader thread and reports the
//! result as a resource event.

use crate::error::{Error, Result};
use crate::resource::{ResourceEvents, TrackId};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read the playback length of a WAV file from its header.
pub fn probe_duration(path: &Path) -> Result<Duration> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(Error::Wav(hound::Error::Unsupported));
    }
    let frames = u64::from(reader.duration());
    let micros = frames * 1_000_000 / u64::from(spec.sample_rate);
    Ok(Duration::from_micros(micros))
}

/// Probe `path` on a loader thread and report the outcome for `track`.
///
/// An empty file reports a metadata event without a duration. Unreadable
/// files report a load failure.
pub fn spawn_probe(path: PathBuf, track: TrackId, events: ResourceEvents) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("probe-{}", track))
        .spawn(move || match probe_duration(&path) {
            Ok(duration) => {
                log::debug!("[WAV] '{}' is {:?} long", track, duration);
                events.metadata_loaded(&track, Some(duration).filter(|d| !d.is_zero()));
            }
            Err(e) => {
                log::warn!("[WAV] Failed to read {}: {}", path.display(), e);
                events.load_failed(&track, e.to_string());
            }
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceEventKind;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * u32::from(channels) {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_probe_duration_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drone.wav");
        write_wav(&path, 8000, 1, 32_000);
        assert_eq!(probe_duration(&path).unwrap(), Duration::from_secs(4));
    }

    #[test]
    fn test_probe_duration_counts_frames_not_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perc.wav");
        write_wav(&path, 8000, 2, 4000);
        assert_eq!(probe_duration(&path).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_probe_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = probe_duration(&dir.path().join("missing.wav")).unwrap_err();
        assert!(matches!(err, Error::Wav(_)));
    }

    #[test]
    fn test_spawn_probe_reports_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drone.wav");
        write_wav(&path, 8000, 1, 16_000);

        let (tx, rx) = crossbeam_channel::unbounded();
        let track = TrackId::new("drone.wav");
        spawn_probe(path, track.clone(), ResourceEvents::new(tx)).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.track, track);
        assert_eq!(
            event.kind,
            ResourceEventKind::MetadataLoaded {
                duration: Some(Duration::from_secs(2))
            }
        );
    }

    #[test]
    fn test_spawn_probe_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"not a wav file").unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_probe(path, TrackId::new("broken.wav"), ResourceEvents::new(tx)).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event.kind, ResourceEventKind::LoadFailed { .. }));
    }
}
