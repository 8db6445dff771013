//! The satellite's own media_player entity: server-driven playback commands,
//! volume and a single playing/paused/idle state reported across every audio
//! source (speech, chimes, notifications and media).

use crate::connection::{self, commands};
use crate::playback::{PlaybackEvent, PlaybackId, Source};
use crate::satellite::Satellite;
use crate::state::lock;
use crate::timer;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const IDLE_DEBOUNCE: Duration = Duration::from_millis(200);
const SIGN_EXPIRES_SECS: u64 = 3600;

#[derive(Debug)]
struct MediaInner {
    /// Raw 0..1 volume as the server sees it.
    volume: f32,
    muted: bool,
    synced: bool,
    playing: bool,
    paused: bool,
    current: Option<PlaybackId>,
    media_id: Option<String>,
    /// Bumped on every cleanup so a play still signing its URL backs off.
    seq: u64,
    sources: HashSet<&'static str>,
    idle_timer: Option<JoinHandle<()>>,
}

impl Default for MediaInner {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            synced: false,
            playing: false,
            paused: false,
            current: None,
            media_id: None,
            seq: 0,
            sources: HashSet::new(),
            idle_timer: None,
        }
    }
}

impl MediaInner {
    fn effective(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume * self.volume
        }
    }

    fn quiet(&self) -> bool {
        self.sources.is_empty() && !self.playing && !self.paused
    }
}

#[derive(Debug, Default)]
pub(crate) struct MediaPlayerState {
    inner: Mutex<MediaInner>,
}

impl Satellite {
    /// Pick up the entity's volume and mute state the first time it is known.
    fn sync_initial_volume(&self) {
        if lock(&self.media.inner).synced {
            return;
        }
        let Some(entity) = self.entities.media_player_entity() else {
            return;
        };
        let volume = self
            .entities
            .attribute(&entity, "volume_level")
            .and_then(|v| v.as_f64());
        let muted = self
            .entities
            .attribute(&entity, "is_volume_muted")
            .and_then(|v| v.as_bool());
        let mut m = lock(&self.media.inner);
        if let Some(v) = volume {
            log::debug!("[media-player] Synced initial volume from entity: {}", v);
            m.volume = v as f32;
        }
        if let Some(muted) = muted {
            m.muted = muted;
        }
        m.synced = true;
    }

    /// Playback volume for every local source, perceptually curved.
    pub(crate) fn media_volume(&self) -> f32 {
        self.sync_initial_volume();
        lock(&self.media.inner).effective()
    }

    pub(crate) fn notify_audio_start(&self, source: &'static str) {
        {
            let mut m = lock(&self.media.inner);
            timer::cancel(&mut m.idle_timer);
            m.sources.insert(source);
        }
        self.report_media_state("playing");
    }

    pub(crate) fn notify_audio_end(self: &Arc<Self>, source: &'static str) {
        let mut m = lock(&self.media.inner);
        m.sources.remove(source);
        if !m.quiet() {
            return;
        }
        let sat = self.clone();
        let handle = timer::after(IDLE_DEBOUNCE, async move {
            let quiet = {
                let mut m = lock(&sat.media.inner);
                m.idle_timer = None;
                m.quiet()
            };
            if quiet {
                sat.report_media_state("idle");
            }
        });
        timer::cancel(&mut m.idle_timer);
        m.idle_timer = Some(handle);
    }

    pub(crate) fn handle_media_command(self: &Arc<Self>, data: &Value) {
        let command = data["command"].as_str().unwrap_or_default();
        log::info!("[media-player] Command: {}", command);
        match command {
            "play" => self.media_play(data),
            "pause" => self.media_pause(),
            "resume" => self.media_resume(),
            "stop" => self.media_stop(),
            "volume_set" => match data["volume"].as_f64() {
                Some(v) => self.media_set_volume(v as f32),
                None => log::warn!("[media-player] volume_set without volume"),
            },
            "volume_mute" => self.media_set_mute(data["mute"].as_bool().unwrap_or(false)),
            other => log::debug!("[media-player] Unknown command: {}", other),
        }
    }

    /// Stop our own media for a wake word or notification. Other sources
    /// manage themselves.
    pub(crate) fn interrupt_media(&self) {
        let quiet = {
            let m = lock(&self.media.inner);
            if !m.playing && !m.paused {
                return;
            }
            log::info!("[media-player] Interrupted");
            drop(m);
            self.media_cleanup();
            lock(&self.media.inner).sources.is_empty()
        };
        if quiet {
            self.report_media_state("idle");
        }
    }

    fn media_cleanup(&self) {
        let current = {
            let mut m = lock(&self.media.inner);
            timer::cancel(&mut m.idle_timer);
            m.seq += 1;
            m.playing = false;
            m.paused = false;
            m.current.take()
        };
        if let Some(id) = current {
            self.player.stop(id);
        }
    }

    fn media_play(self: &Arc<Self>, data: &Value) {
        self.media_cleanup();
        self.sync_initial_volume();
        let Some(media_id) = data["media_id"].as_str().map(str::to_string) else {
            log::warn!("[media-player] play without media_id");
            return;
        };
        let seq = {
            let mut m = lock(&self.media.inner);
            if let Some(v) = data["volume"].as_f64() {
                m.volume = v as f32;
            }
            m.media_id = Some(media_id.clone());
            m.seq
        };

        let sat = self.clone();
        tokio::spawn(async move {
            let url = sat.sign_media(&media_id).await;
            let volume = {
                let mut m = lock(&sat.media.inner);
                if m.seq != seq {
                    log::debug!("[media-player] play superseded while signing");
                    return;
                }
                m.playing = true;
                m.paused = false;
                m.effective()
            };
            let mut playback = sat.player.play(Source::Url(url), volume);
            let id = playback.id;
            lock(&sat.media.inner).current = Some(id);

            let ended = playback
                .wait(|| {
                    log::info!("[media-player] Playing: {}", media_id);
                    sat.report_media_state("playing");
                })
                .await;
            if ended == PlaybackEvent::Stopped {
                return;
            }
            if let PlaybackEvent::Failed(e) = &ended {
                log::error!("[media-player] Playback error: {}", e);
            }
            let quiet = {
                let mut m = lock(&sat.media.inner);
                if m.current != Some(id) {
                    return;
                }
                m.current = None;
                m.playing = false;
                m.paused = false;
                m.sources.is_empty()
            };
            if quiet {
                sat.report_media_state("idle");
            }
        });
    }

    /// Absolute URLs pass through; server paths get a signed, expiring URL.
    async fn sign_media(&self, media_id: &str) -> String {
        if media_id.starts_with("http://") || media_id.starts_with("https://") {
            return media_id.to_string();
        }
        match self
            .transport
            .call(commands::sign_path(media_id, SIGN_EXPIRES_SECS))
            .await
        {
            Ok(result) => match result["path"].as_str() {
                Some(path) => self.media_url(path),
                None => self.media_url(media_id),
            },
            Err(e) => {
                log::error!("[media-player] Failed to sign URL: {}", e);
                self.media_url(media_id)
            }
        }
    }

    fn media_pause(&self) {
        let current = {
            let mut m = lock(&self.media.inner);
            match m.current {
                Some(id) if m.playing => {
                    m.playing = false;
                    m.paused = true;
                    Some(id)
                }
                _ => None,
            }
        };
        match current {
            Some(id) => {
                self.player.pause(id);
                self.report_media_state("paused");
            }
            None => self.report_media_state("idle"),
        }
    }

    fn media_resume(&self) {
        let current = {
            let mut m = lock(&self.media.inner);
            match m.current {
                Some(id) if m.paused => {
                    m.playing = true;
                    m.paused = false;
                    Some(id)
                }
                _ => None,
            }
        };
        match current {
            Some(id) => {
                self.player.resume(id);
                self.report_media_state("playing");
            }
            None => self.report_media_state("idle"),
        }
    }

    fn media_stop(&self) {
        if lock(&self.media.inner).current.is_none() {
            return;
        }
        self.media_cleanup();
        if lock(&self.media.inner).sources.is_empty() {
            self.report_media_state("idle");
        }
    }

    fn media_set_volume(&self, volume: f32) {
        self.sync_initial_volume();
        let (effective, state) = {
            let mut m = lock(&self.media.inner);
            m.volume = volume.clamp(0.0, 1.0);
            let state = if m.playing || !m.sources.is_empty() {
                "playing"
            } else if m.paused {
                "paused"
            } else {
                "idle"
            };
            (m.effective(), state)
        };
        self.apply_volume(effective);
        self.report_media_state(state);
    }

    fn media_set_mute(&self, mute: bool) {
        self.sync_initial_volume();
        let effective = {
            let mut m = lock(&self.media.inner);
            m.muted = mute;
            m.effective()
        };
        self.apply_volume(effective);
    }

    /// Push a new volume into everything currently audible.
    fn apply_volume(&self, volume: f32) {
        let own = lock(&self.media.inner).current;
        let targets = own
            .into_iter()
            .chain(self.tts_playback())
            .chain(self.notification_playbacks());
        for id in targets {
            self.player.set_volume(id, volume);
        }
    }

    pub(crate) fn report_media_state(&self, state: &str) {
        self.sync_initial_volume();
        let Some(entity) = self.entities.media_player_entity() else {
            log::debug!("[media-player] No media_player entity; skipping state report");
            return;
        };
        let (volume, media_id) = {
            let m = lock(&self.media.inner);
            let volume = m.synced.then_some(m.volume);
            let media_id = m.media_id.clone().filter(|_| state != "idle");
            (volume, media_id)
        };
        connection::send_and_forget(
            &self.transport,
            commands::media_player_event(&entity, state, volume, media_id.as_deref()),
            "media-player",
        );
    }
}
