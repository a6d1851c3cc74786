use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{AudioEngine, AudioTrack, LoadResultHandler, Player, PlayerEvent, PlayerListener};
use crate::engine::models::TrackInfo;

/// Bytes handed out per frame.
pub const DEFAULT_FRAME_SIZE: usize = 960;

/// Pass-through engine: local files are treated as already-encoded frame
/// payloads. Remote identifiers are not supported and report no match.
pub struct LocalAudioEngine {
    frame_size: usize,
}

impl LocalAudioEngine {
    pub fn new() -> Self {
        Self::with_frame_size(DEFAULT_FRAME_SIZE)
    }

    pub fn with_frame_size(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
        }
    }
}

impl Default for LocalAudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine for LocalAudioEngine {
    fn create_player(&self) -> Arc<dyn Player> {
        Arc::new(LocalPlayer::new(self.frame_size))
    }
}

struct Playing {
    track: AudioTrack,
    offset: usize,
}

pub struct LocalPlayer {
    frame_size: usize,
    current: Mutex<Option<Playing>>,
    listeners: Mutex<Vec<Arc<dyn PlayerListener>>>,
}

impl LocalPlayer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            current: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, event: PlayerEvent) {
        // Snapshot listeners so callbacks never run under our locks.
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}

fn is_remote(identifier: &str) -> bool {
    identifier.starts_with("http://") || identifier.starts_with("https://")
}

fn title_of(identifier: &str) -> String {
    Path::new(identifier)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(identifier)
        .to_string()
}

impl Player for LocalPlayer {
    fn load(&self, identifier: &str, handler: Arc<dyn LoadResultHandler>) {
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            if is_remote(&identifier) {
                handler.no_matches();
                return;
            }
            match tokio::fs::read(&identifier).await {
                Ok(bytes) => {
                    debug!(%identifier, size = bytes.len(), "track loaded");
                    handler.track_loaded(AudioTrack {
                        info: TrackInfo {
                            title: title_of(&identifier),
                            id: identifier,
                        },
                        data: Arc::from(bytes),
                    });
                }
                Err(e) => {
                    warn!(%identifier, error = %e, "failed to read track");
                    handler.load_failed(e.to_string());
                }
            }
        });
    }

    fn play(&self, track: AudioTrack) {
        let info = track.info.clone();
        let previous = self.current.lock().replace(Playing { track, offset: 0 });
        if let Some(previous) = previous {
            self.emit(PlayerEvent::TrackEnd(previous.track.info));
        }
        self.emit(PlayerEvent::TrackStart(info));
    }

    fn stop(&self) {
        let stopped = self.current.lock().take();
        if let Some(stopped) = stopped {
            self.emit(PlayerEvent::TrackEnd(stopped.track.info));
        }
    }

    fn is_playing(&self) -> bool {
        self.current.lock().is_some()
    }

    fn provide(&self, frame: &mut Vec<u8>) -> bool {
        let finished = {
            let mut current = self.current.lock();
            let Some(playing) = current.as_mut() else {
                return false;
            };

            let end = (playing.offset + self.frame_size).min(playing.track.data.len());
            frame.clear();
            frame.extend_from_slice(&playing.track.data[playing.offset..end]);
            playing.offset = end;

            if playing.offset >= playing.track.data.len() {
                current.take().map(|p| p.track.info)
            } else {
                None
            }
        };

        if let Some(info) = finished {
            self.emit(PlayerEvent::TrackEnd(info));
        }
        !frame.is_empty()
    }

    fn add_listener(&self, listener: Arc<dyn PlayerListener>) {
        self.listeners.lock().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::sync::mpsc;

    use super::*;

    struct Recorder(Mutex<Vec<PlayerEvent>>);

    impl PlayerListener for Recorder {
        fn on_event(&self, event: PlayerEvent) {
            self.0.lock().push(event);
        }
    }

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Loaded(AudioTrack),
        NoMatches,
        Failed,
    }

    struct Forward(mpsc::UnboundedSender<Outcome>);

    impl LoadResultHandler for Forward {
        fn track_loaded(&self, track: AudioTrack) {
            let _ = self.0.send(Outcome::Loaded(track));
        }
        fn playlist_loaded(&self, _tracks: Vec<AudioTrack>) {}
        fn no_matches(&self) {
            let _ = self.0.send(Outcome::NoMatches);
        }
        fn load_failed(&self, _reason: String) {
            let _ = self.0.send(Outcome::Failed);
        }
    }

    fn track(bytes: &[u8]) -> AudioTrack {
        AudioTrack {
            info: TrackInfo {
                id: "beep.opus".into(),
                title: "beep".into(),
            },
            data: Arc::from(bytes.to_vec()),
        }
    }

    #[test]
    fn test_provide_slices_frames_and_ends_track() {
        let player = LocalPlayer::new(4);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        player.add_listener(recorder.clone());

        player.play(track(&[1, 2, 3, 4, 5, 6]));
        assert!(player.is_playing());

        let mut frame = Vec::new();
        assert!(player.provide(&mut frame));
        assert_eq!(frame, vec![1, 2, 3, 4]);
        assert!(player.provide(&mut frame));
        assert_eq!(frame, vec![5, 6]);
        assert!(!player.is_playing());
        assert!(!player.provide(&mut frame));

        let events = recorder.0.lock();
        assert!(matches!(events[0], PlayerEvent::TrackStart(_)));
        assert!(matches!(events[1], PlayerEvent::TrackEnd(_)));
    }

    #[test]
    fn test_stop_emits_track_end() {
        let player = LocalPlayer::new(4);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        player.add_listener(recorder.clone());

        player.play(track(&[0; 64]));
        player.stop();
        assert!(!player.is_playing());
        assert_eq!(recorder.0.lock().len(), 2);

        // Stopping an idle player is silent.
        player.stop();
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_load_local_file() {
        let mut file = tempfile::Builder::new().suffix(".opus").tempfile().unwrap();
        file.write_all(&[9, 9, 9]).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let engine = LocalAudioEngine::new();
        let player = engine.create_player();
        let (tx, mut rx) = mpsc::unbounded_channel();
        player.load(&path, Arc::new(Forward(tx)));

        match rx.recv().await.unwrap() {
            Outcome::Loaded(track) => {
                assert_eq!(track.info.id, path);
                assert_eq!(&*track.data, &[9, 9, 9]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_remote_reports_no_matches() {
        let player = LocalAudioEngine::new().create_player();
        let (tx, mut rx) = mpsc::unbounded_channel();
        player.load("https://example.com/a.mp3", Arc::new(Forward(tx)));
        assert_eq!(rx.recv().await.unwrap(), Outcome::NoMatches);
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let player = LocalAudioEngine::new().create_player();
        let (tx, mut rx) = mpsc::unbounded_channel();
        player.load("/definitely/not/here.mp3", Arc::new(Forward(tx)));
        assert_eq!(rx.recv().await.unwrap(), Outcome::Failed);
    }
}
