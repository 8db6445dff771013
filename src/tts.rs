//! Response speech playback and chimes. Speech plays locally, or on a
//! remote `media_player` whose entity state tells when it is done.

use crate::chime::Chime;
use crate::connection::{self, commands};
use crate::playback::{PlaybackEvent, PlaybackId, Source};
use crate::satellite::Satellite;
use crate::state::lock;
use crate::timer;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const PLAYBACK_WATCHDOG: Duration = Duration::from_millis(30_000);
/// Completes remote speech whose player never reports back.
pub const REMOTE_SAFETY_TIMEOUT: Duration = Duration::from_millis(120_000);

#[derive(Debug)]
struct RemoteTts {
    seq: u64,
    target: String,
    /// Completion only counts after the player was seen playing.
    saw_playing: bool,
    safety: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TtsInner {
    playing: bool,
    current: Option<PlaybackId>,
    /// Advertised at run-start when the server streams its response.
    streaming_url: Option<String>,
    /// `tts-end` URL kept as a one-time fallback if playback fails.
    end_url: Option<String>,
    remote: Option<RemoteTts>,
    remote_seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TtsState {
    inner: Mutex<TtsInner>,
}

impl Satellite {
    pub(crate) fn tts_is_playing(&self) -> bool {
        lock(&self.tts.inner).playing
    }

    pub(crate) fn tts_playback(&self) -> Option<PlaybackId> {
        lock(&self.tts.inner).current
    }

    pub(crate) fn store_streaming_url(&self, run_start: &Value) {
        let out = &run_start["tts_output"];
        let url = match (out["url"].as_str(), out["stream_response"].as_bool()) {
            (Some(url), Some(true)) if !url.is_empty() => Some(self.media_url(url)),
            _ => None,
        };
        if let Some(url) = &url {
            log::debug!("[tts] Streaming TTS URL available: {}", url);
        }
        lock(&self.tts.inner).streaming_url = url;
    }

    pub(crate) fn has_streaming_url(&self) -> bool {
        lock(&self.tts.inner).streaming_url.is_some()
    }

    pub(crate) fn take_streaming_url(&self) -> Option<String> {
        lock(&self.tts.inner).streaming_url.take()
    }

    pub(crate) fn set_tts_end_url(&self, url: Option<&str>) {
        let url = url.map(|u| self.media_url(u));
        lock(&self.tts.inner).end_url = url;
    }

    /// Remote `media_player` that speaks responses: the configured one, or
    /// whatever the satellite device's `tts_output` select points at.
    pub(crate) fn tts_target(&self) -> Option<String> {
        let configured = self.settings.tts_target.trim();
        if !configured.is_empty() {
            return Some(configured.to_string());
        }
        self.entities.selected_entity("tts_output")
    }

    /// The remote player currently speaking a response.
    pub(crate) fn remote_tts_entity(&self) -> Option<String> {
        lock(&self.tts.inner).remote.as_ref().map(|r| r.target.clone())
    }

    /// Play response audio. A failure retries once with the stored `tts-end`
    /// URL; a stalled stream is force-completed by the watchdog.
    pub(crate) fn play_tts(self: &Arc<Self>, url: &str, is_retry: bool) {
        let url = self.media_url(url);
        if let Some(target) = self.tts_target() {
            self.play_remote_tts(target, url);
            return;
        }
        let previous = {
            let mut t = lock(&self.tts.inner);
            t.playing = true;
            t.current.take()
        };
        if let Some(id) = previous {
            self.player.stop(id);
        }

        log::info!("[tts] Playing {}", url);
        let mut playback = self.player.play(Source::Url(url.clone()), self.media_volume());
        let id = playback.id;
        lock(&self.tts.inner).current = Some(id);

        let sat = self.clone();
        tokio::spawn(async move {
            let mut last_position = 0;
            loop {
                tokio::select! {
                    event = playback.next_event() => match event {
                        PlaybackEvent::Started => {
                            log::debug!("[tts] Playback started");
                            lock(&sat.tts.inner).end_url = None;
                            sat.notify_audio_start("tts");
                        }
                        PlaybackEvent::Finished => {
                            log::info!("[tts] Playback complete");
                            sat.complete_tts(id, false);
                            return;
                        }
                        PlaybackEvent::Failed(e) => {
                            log::error!("[tts] Playback error: {} ({})", e, url);
                            let retry = {
                                let mut t = lock(&sat.tts.inner);
                                if t.current != Some(id) {
                                    return;
                                }
                                if is_retry { None } else { t.end_url.take() }
                            };
                            match retry {
                                Some(retry_url) => {
                                    log::info!("[tts] Retrying with tts-end URL {}", retry_url);
                                    sat.play_tts(&retry_url, true);
                                }
                                None => sat.complete_tts(id, true),
                            }
                            return;
                        }
                        PlaybackEvent::Stopped => return,
                    },
                    _ = tokio::time::sleep(PLAYBACK_WATCHDOG) => {
                        let position = playback.position();
                        if position > last_position {
                            last_position = position;
                            continue;
                        }
                        log::warn!("[tts] Playback watchdog: audio stalled, forcing completion");
                        sat.player.stop(id);
                        sat.complete_tts(id, false);
                        return;
                    }
                }
            }
        });
    }

    fn play_remote_tts(self: &Arc<Self>, target: String, url: String) {
        let (seq, previous) = {
            let mut t = lock(&self.tts.inner);
            t.playing = true;
            t.remote_seq += 1;
            if let Some(old) = t.remote.take() {
                old.safety.abort();
            }
            (t.remote_seq, t.current.take())
        };
        if let Some(id) = previous {
            self.player.stop(id);
        }

        log::info!("[tts] Playing on remote {}: {}", target, url);
        connection::send_and_forget(
            &self.transport,
            commands::call_service(
                "media_player",
                "play_media",
                json!({
                    "entity_id": target,
                    "media_content_id": url,
                    "media_content_type": "music",
                }),
            ),
            "tts",
        );

        let sat = self.clone();
        let safety = timer::after(REMOTE_SAFETY_TIMEOUT, async move {
            log::warn!("[tts] Remote safety timeout; forcing completion");
            sat.complete_remote_tts(seq);
        });
        lock(&self.tts.inner).remote = Some(RemoteTts {
            seq,
            target,
            saw_playing: false,
            safety,
        });
    }

    /// Follow the remote player's state. It must be seen playing before
    /// any other state counts as finished.
    pub(crate) fn check_remote_playback(self: &Arc<Self>, entity_id: &str) {
        let Some(state) = self.entities.state_of(entity_id).map(|s| s.state) else {
            return;
        };
        let finished = {
            let mut t = lock(&self.tts.inner);
            let Some(remote) = t.remote.as_mut().filter(|r| r.target == entity_id) else {
                return;
            };
            match state.as_str() {
                "playing" | "buffering" => {
                    remote.saw_playing = true;
                    None
                }
                _ if remote.saw_playing => Some(remote.seq),
                _ => None,
            }
        };
        if let Some(seq) = finished {
            log::info!("[tts] Remote player stopped ({}); completing", state);
            self.complete_remote_tts(seq);
        }
    }

    fn complete_remote_tts(self: &Arc<Self>, seq: u64) {
        {
            let mut t = lock(&self.tts.inner);
            if t.remote.as_ref().map(|r| r.seq) != Some(seq) {
                return;
            }
            if let Some(remote) = t.remote.take() {
                remote.safety.abort();
            }
            t.playing = false;
            t.end_url = None;
        }
        log::info!("[tts] Complete (remote)");
        self.notify_audio_end("tts");
        self.on_tts_complete(false);
    }

    /// Silence speech without running completion.
    pub(crate) fn stop_tts(self: &Arc<Self>) {
        let (current, remote) = {
            let mut t = lock(&self.tts.inner);
            t.playing = false;
            t.end_url = None;
            (t.current.take(), t.remote.take())
        };
        if let Some(id) = current {
            self.player.stop(id);
        }
        if let Some(remote) = remote {
            remote.safety.abort();
            connection::send_and_forget(
                &self.transport,
                commands::call_service(
                    "media_player",
                    "media_stop",
                    json!({ "entity_id": remote.target }),
                ),
                "tts",
            );
        }
        self.notify_audio_end("tts");
    }

    fn complete_tts(self: &Arc<Self>, id: PlaybackId, failed: bool) {
        {
            let mut t = lock(&self.tts.inner);
            if t.current != Some(id) {
                return;
            }
            t.current = None;
            t.playing = false;
            t.end_url = None;
        }
        log::info!(
            "[tts] Complete{}",
            if failed { " (playback failed)" } else { "" }
        );
        self.notify_audio_end("tts");
        self.on_tts_complete(failed);
    }

    pub(crate) fn play_chime(self: &Arc<Self>, chime: Chime) {
        self.notify_audio_start("chime");
        let mut playback = self.player.play(Source::Chime(chime), self.media_volume());
        let sat = self.clone();
        tokio::spawn(async move {
            let ended = playback.wait(|| {}).await;
            if let PlaybackEvent::Failed(e) = ended {
                log::warn!("[tts] Chime failed: {}", e);
            }
            sat.notify_audio_end("chime");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_state::{entry, state};
    use crate::state::Phase;
    use crate::testing::{harness, settle};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn failed_playback_retries_once_with_end_url() {
        let h = harness();
        h.sat.set_state(Phase::Tts);
        h.sat.set_tts_end_url(Some("/api/tts_proxy/end.mp3"));
        h.sat.play_tts("/api/tts_proxy/stream.mp3", false);
        settle().await;
        let first = h.player.last_id().unwrap();
        h.player.fail(first);
        settle().await;
        assert_eq!(
            h.player.urls(),
            vec![
                "http://ha.local:8123/api/tts_proxy/stream.mp3".to_string(),
                "http://ha.local:8123/api/tts_proxy/end.mp3".to_string(),
            ]
        );
        assert!(h.sat.tts_is_playing());

        let second = h.player.last_id().unwrap();
        h.player.fail(second);
        settle().await;
        assert_eq!(h.player.urls().len(), 2);
        assert!(!h.sat.tts_is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_completes_a_stalled_stream() {
        let h = harness();
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/x.mp3", false);
        settle().await;
        let id = h.player.last_id().unwrap();
        h.player.start(id);
        tokio::time::sleep(PLAYBACK_WATCHDOG + Duration::from_millis(100)).await;
        settle().await;
        assert!(!h.sat.tts_is_playing());
        assert!(h.player.stopped().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_skips_completion() {
        let h = harness();
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/x.mp3", false);
        settle().await;
        h.sat.stop_tts();
        settle().await;
        assert!(!h.sat.tts_is_playing());
        assert!(h.player.chimes().is_empty());
    }

    fn with_remote_speaker(h: &crate::testing::Harness) {
        h.entities.set_registry(vec![
            entry("assist_satellite.kitchen", None),
            entry("select.kitchen_tts_output", Some("tts_output")),
        ]);
        h.entities.set_state(state(
            "select.kitchen_tts_output",
            "Living room",
            json!({ "entity_id": "media_player.living_room" }),
        ));
        h.sat.ensure_entity_watcher();
    }

    async fn speaker(h: &crate::testing::Harness, value: &str) {
        h.entities
            .set_state(state("media_player.living_room", value, json!({})));
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_speaker_plays_and_completes_on_its_state() {
        let h = harness();
        with_remote_speaker(&h);
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/r.mp3", false);
        settle().await;
        assert!(h.player.urls().is_empty());
        let calls = h.transport.calls_of("call_service");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["service"], "play_media");
        assert_eq!(calls[0]["service_data"]["entity_id"], "media_player.living_room");
        assert_eq!(
            calls[0]["service_data"]["media_content_id"],
            "http://ha.local:8123/api/tts_proxy/r.mp3"
        );

        // Idle before it ever started playing does not count.
        speaker(&h, "idle").await;
        assert!(h.sat.tts_is_playing());
        speaker(&h, "playing").await;
        assert!(h.sat.tts_is_playing());
        speaker(&h, "idle").await;
        assert!(!h.sat.tts_is_playing());
        assert!(h.player.chimes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_remote_speaker_hits_the_safety_timeout() {
        let h = harness();
        with_remote_speaker(&h);
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/r.mp3", false);
        settle().await;
        tokio::time::sleep(REMOTE_SAFETY_TIMEOUT - Duration::from_millis(100)).await;
        assert!(h.sat.tts_is_playing());
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(!h.sat.tts_is_playing());
        assert!(h.sat.remote_tts_entity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_remote_speech_stops_the_speaker() {
        let h = harness();
        with_remote_speaker(&h);
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/r.mp3", false);
        settle().await;
        h.sat.stop_tts();
        settle().await;
        let services: Vec<String> = h
            .transport
            .calls_of("call_service")
            .iter()
            .map(|c| c["service"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(services, vec!["play_media", "media_stop"]);

        // A late state report after the stop is ignored.
        speaker(&h, "playing").await;
        speaker(&h, "idle").await;
        assert!(!h.sat.tts_is_playing());
        assert_eq!(h.sat.phase(), Phase::Tts);
    }

    #[test]
    fn streaming_url_requires_stream_response() {
        let h = harness();
        h.sat
            .store_streaming_url(&json!({ "tts_output": { "url": "/api/tts_proxy/s.mp3" } }));
        assert!(!h.sat.has_streaming_url());
        h.sat.store_streaming_url(
            &json!({ "tts_output": { "url": "/api/tts_proxy/s.mp3", "stream_response": true } }),
        );
        assert_eq!(
            h.sat.take_streaming_url().as_deref(),
            Some("http://ha.local:8123/api/tts_proxy/s.mp3")
        );
    }
}
