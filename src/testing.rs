//! In-memory collaborators for driving a satellite in tests.

use crate::audio::{AudioTransport, CaptureOptions, Microphone};
use crate::chime::Chime;
use crate::connection::{Subscription, Transport};
use crate::entity_state::EntityStates;
use crate::error::{DeviceError, Result, SatelliteError};
use crate::ownership::OwnershipArbiter;
use crate::playback::{Playback, PlaybackEvent, PlaybackId, Player, Source};
use crate::satellite::{Satellite, SatelliteParts};
use crate::settings::Settings;
use crate::state::{lock, AppEvent};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc as tokio_mpsc};

const RUN_PIPELINE: &str = "voice_satellite/run_pipeline";
const SUBSCRIBE_EVENTS: &str = "voice_satellite/subscribe_events";

/// Let spawned tasks run to their next await point.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub struct Harness {
    pub sat: Arc<Satellite>,
    pub transport: Arc<FakeTransport>,
    pub player: Arc<FakePlayer>,
    pub mic: Arc<FakeMicrophone>,
    pub entities: Arc<EntityStates>,
    events: Mutex<Receiver<AppEvent>>,
    history: Mutex<Vec<AppEvent>>,
}

impl Harness {
    /// Every UI event emitted so far.
    pub fn events(&self) -> Vec<AppEvent> {
        let rx = lock(&self.events);
        let mut history = lock(&self.history);
        history.extend(rx.try_iter());
        history.clone()
    }
}

pub fn harness() -> Harness {
    let transport = Arc::new(FakeTransport::new());
    let player = Arc::new(FakePlayer::default());
    let mic = Arc::new(FakeMicrophone::default());
    let entities = Arc::new(EntityStates::new("assist_satellite.kitchen"));
    let (tx, rx) = mpsc::channel();
    let settings = Settings {
        url: "http://ha.local:8123".into(),
        access_token: "token".into(),
        satellite_entity: "assist_satellite.kitchen".into(),
        ..Settings::default()
    };
    let sat = Satellite::new(SatelliteParts {
        settings,
        transport: transport.clone(),
        player: player.clone(),
        microphone: mic.clone(),
        entities: entities.clone(),
        ownership: OwnershipArbiter::new(),
        events: tx,
    });
    Harness {
        sat,
        transport,
        player,
        mic,
        entities,
        events: Mutex::new(rx),
        history: Mutex::new(Vec::new()),
    }
}

#[derive(Default)]
struct TransportLog {
    auto_init: bool,
    fail_subscribe: bool,
    matched: bool,
    unsubscribe_lag: Option<Duration>,
    calls: Vec<Value>,
    /// Every subscribe attempt; `None` id for refused ones.
    subscribes: Vec<(Option<u64>, Value)>,
    open: HashMap<u64, tokio_mpsc::UnboundedSender<Value>>,
    unsubscribed: Vec<u64>,
    binary: Vec<Vec<u8>>,
}

pub struct FakeTransport {
    log: Mutex<TransportLog>,
    next_id: AtomicU64,
    ready: broadcast::Sender<()>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (ready, _) = broadcast::channel(4);
        Self {
            log: Mutex::new(TransportLog {
                auto_init: true,
                ..TransportLog::default()
            }),
            next_id: AtomicU64::new(1),
            ready,
        }
    }

    pub fn set_auto_init(&self, on: bool) {
        lock(&self.log).auto_init = on;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        lock(&self.log).fail_subscribe = fail;
    }

    pub fn set_matched(&self, matched: bool) {
        lock(&self.log).matched = matched;
    }

    /// Make `unsubscribe` take `lag` before it completes.
    pub fn set_unsubscribe_lag(&self, lag: Duration) {
        lock(&self.log).unsubscribe_lag = Some(lag);
    }

    pub fn calls_of(&self, kind: &str) -> Vec<Value> {
        lock(&self.log)
            .calls
            .iter()
            .filter(|c| c["type"] == kind)
            .cloned()
            .collect()
    }

    pub fn subscriptions_of(&self, kind: &str) -> Vec<Value> {
        lock(&self.log)
            .subscribes
            .iter()
            .filter(|(_, m)| m["type"] == kind)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn latest_open(&self, kind: &str) -> Option<u64> {
        let log = lock(&self.log);
        log.subscribes
            .iter()
            .rev()
            .filter(|(_, m)| m["type"] == kind)
            .filter_map(|(id, _)| *id)
            .find(|id| log.open.contains_key(id))
    }

    /// The newest pipeline run still subscribed.
    pub fn active_run(&self) -> Option<u64> {
        self.latest_open(RUN_PIPELINE)
    }

    pub fn was_unsubscribed(&self, id: u64) -> bool {
        lock(&self.log).unsubscribed.contains(&id)
    }

    pub fn unsubscribed(&self) -> Vec<u64> {
        lock(&self.log).unsubscribed.clone()
    }

    pub fn binary_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.log).binary.clone()
    }

    pub fn emit(&self, id: u64, message: Value) {
        if let Some(tx) = lock(&self.log).open.get(&id) {
            let _ = tx.send(message);
        }
    }

    /// Deliver a pipeline event to the active run.
    pub fn emit_run(&self, kind: &str, data: Value) {
        if let Some(id) = self.active_run() {
            self.emit(id, json!({ "type": kind, "data": data }));
        }
    }

    /// Deliver an event on the satellite event subscription.
    pub fn emit_satellite(&self, kind: &str, data: Value) {
        if let Some(id) = self.latest_open(SUBSCRIBE_EVENTS) {
            self.emit(id, json!({ "type": kind, "data": data }));
        }
    }

    pub fn send_init(&self, handler_id: u8) {
        if let Some(id) = self.active_run() {
            self.send_init_to(id, handler_id);
        }
    }

    pub fn send_init_to(&self, id: u64, handler_id: u8) {
        self.emit(id, json!({ "type": "init", "handler_id": handler_id }));
    }

    pub fn signal_ready(&self) {
        let _ = self.ready.send(());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_connected(&self) -> bool {
        true
    }

    async fn call(&self, message: Value) -> Result<Value> {
        let mut log = lock(&self.log);
        log.calls.push(message.clone());
        let reply = match message["type"].as_str() {
            Some("auth/sign_path") => {
                let path = message["path"].as_str().unwrap_or_default();
                json!({ "path": format!("{}?authSig=x", path) })
            }
            Some("voice_satellite/question_answered") => json!({ "matched": log.matched }),
            _ => Value::Null,
        };
        Ok(reply)
    }

    async fn subscribe(&self, message: Value) -> Result<Subscription> {
        let mut log = lock(&self.log);
        if log.fail_subscribe {
            log.subscribes.push((None, message));
            return Err(SatelliteError::Server {
                code: "unknown_error".into(),
                message: "subscribe refused".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        if log.auto_init && message["type"] == RUN_PIPELINE {
            let _ = tx.send(json!({ "type": "init", "handler_id": 7 }));
        }
        log.subscribes.push((Some(id), message));
        log.open.insert(id, tx);
        Ok(Subscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        let lag = lock(&self.log).unsubscribe_lag;
        if let Some(lag) = lag {
            tokio::time::sleep(lag).await;
        }
        let mut log = lock(&self.log);
        if log.open.remove(&id).is_some() {
            log.unsubscribed.push(id);
        }
        Ok(())
    }

    fn send_binary(&self, frame: Vec<u8>) -> bool {
        lock(&self.log).binary.push(frame);
        true
    }

    fn ready(&self) -> broadcast::Receiver<()> {
        self.ready.subscribe()
    }

    fn base_url(&self) -> String {
        "http://ha.local:8123".into()
    }
}

#[derive(Default)]
struct PlayerLog {
    next_id: PlaybackId,
    plays: Vec<(PlaybackId, Source)>,
    volumes: Vec<f32>,
    live: HashMap<PlaybackId, tokio_mpsc::UnboundedSender<PlaybackEvent>>,
    stopped: Vec<PlaybackId>,
    paused: Vec<PlaybackId>,
    resumed: Vec<PlaybackId>,
}

/// Chimes finish on their own; URL playbacks wait for `start`/`finish`/`fail`.
#[derive(Default)]
pub struct FakePlayer {
    log: Mutex<PlayerLog>,
}

impl FakePlayer {
    fn send(&self, id: PlaybackId, event: PlaybackEvent, terminal: bool) {
        let mut log = lock(&self.log);
        let tx = if terminal {
            log.live.remove(&id)
        } else {
            log.live.get(&id).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    pub fn start(&self, id: PlaybackId) {
        self.send(id, PlaybackEvent::Started, false);
    }

    pub fn finish(&self, id: PlaybackId) {
        self.send(id, PlaybackEvent::Finished, true);
    }

    pub fn fail(&self, id: PlaybackId) {
        self.send(id, PlaybackEvent::Failed("decode error".into()), true);
    }

    pub fn plays(&self) -> Vec<Source> {
        lock(&self.log).plays.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn chimes(&self) -> Vec<Chime> {
        lock(&self.log)
            .plays
            .iter()
            .filter_map(|(_, s)| match s {
                Source::Chime(c) => Some(*c),
                Source::Url(_) => None,
            })
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.log)
            .plays
            .iter()
            .filter_map(|(_, s)| match s {
                Source::Url(u) => Some(u.clone()),
                Source::Chime(_) => None,
            })
            .collect()
    }

    /// Id of the newest URL playback.
    pub fn last_id(&self) -> Option<PlaybackId> {
        lock(&self.log)
            .plays
            .iter()
            .rev()
            .find(|(_, s)| matches!(s, Source::Url(_)))
            .map(|(id, _)| *id)
    }

    pub fn volumes(&self) -> Vec<f32> {
        lock(&self.log).volumes.clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        lock(&self.log).stopped.clone()
    }

    pub fn paused(&self) -> Vec<PlaybackId> {
        lock(&self.log).paused.clone()
    }

    pub fn resumed(&self) -> Vec<PlaybackId> {
        lock(&self.log).resumed.clone()
    }
}

impl Player for FakePlayer {
    fn play(&self, source: Source, volume: f32) -> Playback {
        let mut log = lock(&self.log);
        log.next_id += 1;
        let id = log.next_id;
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        match &source {
            Source::Chime(_) => {
                let _ = tx.send(PlaybackEvent::Started);
                let _ = tx.send(PlaybackEvent::Finished);
            }
            Source::Url(_) => {
                log.live.insert(id, tx);
            }
        }
        log.plays.push((id, source));
        log.volumes.push(volume);
        Playback::new(id, rx, Arc::new(AtomicU64::new(0)))
    }

    fn stop(&self, id: PlaybackId) {
        let mut log = lock(&self.log);
        log.stopped.push(id);
        if let Some(tx) = log.live.remove(&id) {
            let _ = tx.send(PlaybackEvent::Stopped);
        }
    }

    fn pause(&self, id: PlaybackId) {
        lock(&self.log).paused.push(id);
    }

    fn resume(&self, id: PlaybackId) {
        lock(&self.log).resumed.push(id);
    }

    fn set_volume(&self, _id: PlaybackId, volume: f32) {
        lock(&self.log).volumes.push(volume);
    }
}

pub struct FakeMicrophone {
    starts: AtomicUsize,
    stops: AtomicUsize,
    enabled: AtomicBool,
    failure: Mutex<Option<DeviceError>>,
}

impl Default for FakeMicrophone {
    fn default() -> Self {
        Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
            failure: Mutex::new(None),
        }
    }
}

impl FakeMicrophone {
    pub fn fail_with(&self, err: DeviceError) {
        *lock(&self.failure) = Some(err);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn start(
        &self,
        _options: &CaptureOptions,
        _sink: Arc<AudioTransport>,
    ) -> std::result::Result<(), DeviceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
