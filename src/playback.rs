//! Audio output: media URLs and synthesized chimes on a rodio sink per playback.

use crate::chime::{self, Chime};
use crate::state::lock;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source as _};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub type PlaybackId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Url(String),
    Chime(Chime),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started,
    Finished,
    /// Stopped by the owner. No completion handling should follow.
    Stopped,
    Failed(String),
}

/// Handle to one playback started by a [`Player`].
pub struct Playback {
    pub id: PlaybackId,
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
    progress: Arc<AtomicU64>,
}

impl Playback {
    pub fn new(
        id: PlaybackId,
        events: mpsc::UnboundedReceiver<PlaybackEvent>,
        progress: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            events,
            progress,
        }
    }

    pub async fn next_event(&mut self) -> PlaybackEvent {
        self.events.recv().await.unwrap_or(PlaybackEvent::Stopped)
    }

    /// Wait for a terminal event, calling `on_start` when output begins.
    pub async fn wait(&mut self, mut on_start: impl FnMut()) -> PlaybackEvent {
        loop {
            match self.next_event().await {
                PlaybackEvent::Started => on_start(),
                end => return end,
            }
        }
    }

    /// Samples rendered so far.
    pub fn position(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

pub trait Player: Send + Sync {
    fn play(&self, source: Source, volume: f32) -> Playback;
    fn stop(&self, id: PlaybackId);
    fn pause(&self, id: PlaybackId);
    fn resume(&self, id: PlaybackId);
    fn set_volume(&self, id: PlaybackId, volume: f32);
}

/// Credentials attached to fetches from the Home Assistant host.
#[derive(Debug, Clone)]
pub struct MediaAuth {
    pub base_url: String,
    pub token: String,
}

enum Command {
    Play {
        id: PlaybackId,
        source: Source,
        volume: f32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        progress: Arc<AtomicU64>,
    },
    Loaded {
        id: PlaybackId,
        bytes: Result<Vec<u8>, String>,
    },
    Stop(PlaybackId),
    Pause(PlaybackId),
    Resume(PlaybackId),
    Volume(PlaybackId, f32),
}

pub struct RodioPlayer {
    commands: Mutex<Sender<Command>>,
    next_id: AtomicU64,
}

impl RodioPlayer {
    pub fn spawn(auth: MediaAuth) -> Result<Self, String> {
        let (tx, rx) = std::sync::mpsc::channel();
        let loopback = tx.clone();
        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || output_thread(rx, loopback, auth))
            .map_err(|e| format!("Failed to spawn output thread: {}", e))?;
        Ok(Self {
            commands: Mutex::new(tx),
            next_id: AtomicU64::new(1),
        })
    }

    fn send(&self, cmd: Command) {
        let _ = lock(&self.commands).send(cmd);
    }
}

impl Player for RodioPlayer {
    fn play(&self, source: Source, volume: f32) -> Playback {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let progress = Arc::new(AtomicU64::new(0));
        self.send(Command::Play {
            id,
            source,
            volume,
            events: events_tx,
            progress: progress.clone(),
        });
        Playback::new(id, events_rx, progress)
    }

    fn stop(&self, id: PlaybackId) {
        self.send(Command::Stop(id));
    }

    fn pause(&self, id: PlaybackId) {
        self.send(Command::Pause(id));
    }

    fn resume(&self, id: PlaybackId) {
        self.send(Command::Resume(id));
    }

    fn set_volume(&self, id: PlaybackId, volume: f32) {
        self.send(Command::Volume(id, volume));
    }
}

struct Pending {
    volume: f32,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    progress: Arc<AtomicU64>,
}

struct Active {
    sink: Sink,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

fn output_thread(rx: Receiver<Command>, loopback: Sender<Command>, auth: MediaAuth) {
    let output: Option<(OutputStream, OutputStreamHandle)> = match OutputStream::try_default() {
        Ok(pair) => Some(pair),
        Err(e) => {
            log::error!("[playback] no output device: {}", e);
            None
        }
    };
    let handle = output.as_ref().map(|(_, h)| h);
    let mut loading: HashMap<PlaybackId, Pending> = HashMap::new();
    let mut active: HashMap<PlaybackId, Active> = HashMap::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(Command::Play {
                id,
                source,
                volume,
                events,
                progress,
            }) => match source {
                Source::Chime(chime) => {
                    let samples = chime.render(volume, chime::SAMPLE_RATE);
                    let buffer = SamplesBuffer::new(1, chime::SAMPLE_RATE, samples);
                    let pending = Pending {
                        volume: 1.0,
                        events,
                        progress,
                    };
                    if let Some(a) = start_sink(handle, buffer, pending) {
                        active.insert(id, a);
                    }
                }
                Source::Url(url) => {
                    loading.insert(
                        id,
                        Pending {
                            volume,
                            events,
                            progress,
                        },
                    );
                    let loopback = loopback.clone();
                    let auth = auth.clone();
                    let spawned = std::thread::Builder::new()
                        .name("media-fetch".into())
                        .spawn(move || {
                            let bytes = fetch(&url, &auth);
                            let _ = loopback.send(Command::Loaded { id, bytes });
                        });
                    if let Err(e) = spawned {
                        if let Some(p) = loading.remove(&id) {
                            let _ = p.events.send(PlaybackEvent::Failed(e.to_string()));
                        }
                    }
                }
            },
            Ok(Command::Loaded { id, bytes }) => {
                // Stopped while the fetch was in flight.
                let Some(pending) = loading.remove(&id) else {
                    continue;
                };
                let decoded = bytes.and_then(|b| {
                    rodio::Decoder::new(Cursor::new(b))
                        .map_err(|e| format!("Decode failed: {}", e))
                });
                match decoded {
                    Ok(source) => {
                        if let Some(a) = start_sink(handle, source.convert_samples::<f32>(), pending)
                        {
                            active.insert(id, a);
                        }
                    }
                    Err(e) => {
                        log::warn!("[playback] {}", e);
                        let _ = pending.events.send(PlaybackEvent::Failed(e));
                    }
                }
            }
            Ok(Command::Stop(id)) => {
                if let Some(a) = active.remove(&id) {
                    a.sink.stop();
                    let _ = a.events.send(PlaybackEvent::Stopped);
                } else if let Some(p) = loading.remove(&id) {
                    let _ = p.events.send(PlaybackEvent::Stopped);
                }
            }
            Ok(Command::Pause(id)) => {
                if let Some(a) = active.get(&id) {
                    a.sink.pause();
                }
            }
            Ok(Command::Resume(id)) => {
                if let Some(a) = active.get(&id) {
                    a.sink.play();
                }
            }
            Ok(Command::Volume(id, volume)) => {
                if let Some(a) = active.get(&id) {
                    a.sink.set_volume(volume);
                } else if let Some(p) = loading.get_mut(&id) {
                    p.volume = volume;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        active.retain(|_, a| {
            if a.sink.empty() {
                let _ = a.events.send(PlaybackEvent::Finished);
                false
            } else {
                true
            }
        });
    }
}

fn start_sink<S>(handle: Option<&OutputStreamHandle>, source: S, pending: Pending) -> Option<Active>
where
    S: rodio::Source<Item = f32> + Send + 'static,
{
    let Some(handle) = handle else {
        let _ = pending
            .events
            .send(PlaybackEvent::Failed("no audio output device".into()));
        return None;
    };
    let sink = match Sink::try_new(handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = pending.events.send(PlaybackEvent::Failed(e.to_string()));
            return None;
        }
    };
    sink.set_volume(pending.volume);
    sink.append(Counted {
        inner: source,
        played: pending.progress,
    });
    let _ = pending.events.send(PlaybackEvent::Started);
    Some(Active {
        sink,
        events: pending.events,
    })
}

fn fetch(url: &str, auth: &MediaAuth) -> Result<Vec<u8>, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| format!("HTTP client: {}", e))?;
    let mut req = client.get(url);
    if !auth.token.is_empty() && url.starts_with(&auth.base_url) {
        req = req.bearer_auth(&auth.token);
    }
    let res = req.send().map_err(|e| format!("Fetch failed: {}", e))?;
    if !res.status().is_success() {
        return Err(format!("Fetch {} returned {}", url, res.status()));
    }
    let bytes = res.bytes().map_err(|e| format!("Fetch body: {}", e))?;
    Ok(bytes.to_vec())
}

/// Counts rendered samples so stalled playback can be detected.
struct Counted<S> {
    inner: S,
    played: Arc<AtomicU64>,
}

impl<S: rodio::Source<Item = f32>> Iterator for Counted<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next()?;
        self.played.fetch_add(1, Ordering::Relaxed);
        Some(sample)
    }
}

impl<S: rodio::Source<Item = f32>> rodio::Source for Counted<S> {
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_source_tracks_position() {
        let played = Arc::new(AtomicU64::new(0));
        let mut src = Counted {
            inner: SamplesBuffer::new(1, 16_000, vec![0.1f32; 10]),
            played: played.clone(),
        };
        assert_eq!(rodio::Source::channels(&src), 1);
        let n = src.by_ref().take(4).count();
        assert_eq!(n, 4);
        assert_eq!(played.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn wait_reports_start_then_end() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut playback = Playback::new(1, rx, Arc::new(AtomicU64::new(0)));
        tx.send(PlaybackEvent::Started).unwrap();
        tx.send(PlaybackEvent::Finished).unwrap();
        let mut started = 0;
        assert_eq!(playback.wait(|| started += 1).await, PlaybackEvent::Finished);
        assert_eq!(started, 1);
        drop(tx);
        assert_eq!(playback.next_event().await, PlaybackEvent::Stopped);
    }
}
