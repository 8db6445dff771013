//! Pipeline event dispatch. Each run subscription delivers `{type, data,
//! timestamp}` messages; handlers here are synchronous and hand any async
//! work to spawned tasks.

use super::INTENT_ERROR_DISPLAY;
use crate::chime::Chime;
use crate::satellite::Satellite;
use crate::state::{Overlay, Phase};
use crate::timer;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Error codes that are part of normal operation and restart silently.
pub const EXPECTED_ERRORS: &[&str] = &[
    "timeout",
    "wake-word-timeout",
    "stt-no-text-recognized",
    "duplicate_wake_up_detected",
];

pub const RECOVERY_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RunStart(Value),
    WakeWordStart,
    WakeWordEnd(Value),
    SttStart,
    SttVadStart,
    SttVadEnd,
    SttEnd(Value),
    IntentStart,
    IntentProgress(Value),
    IntentEnd(Value),
    TtsStart,
    TtsEnd(Value),
    RunEnd,
    Error { code: String, message: String },
    Displaced,
    Unknown(String),
}

impl PipelineEvent {
    pub fn parse(message: &Value) -> Self {
        let kind = message["type"].as_str().unwrap_or_default();
        let data = match message.get("data") {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(d) => d.clone(),
        };
        match kind {
            "run-start" => Self::RunStart(data),
            "wake_word-start" => Self::WakeWordStart,
            "wake_word-end" => Self::WakeWordEnd(data),
            "stt-start" => Self::SttStart,
            "stt-vad-start" => Self::SttVadStart,
            "stt-vad-end" => Self::SttVadEnd,
            "stt-end" => Self::SttEnd(data),
            "intent-start" => Self::IntentStart,
            "intent-progress" => Self::IntentProgress(data),
            "intent-end" => Self::IntentEnd(data),
            "tts-start" => Self::TtsStart,
            "tts-end" => Self::TtsEnd(data),
            "run-end" => Self::RunEnd,
            "error" => Self::Error {
                code: data["code"].as_str().unwrap_or_default().to_string(),
                message: data["message"].as_str().unwrap_or_default().to_string(),
            },
            "displaced" => Self::Displaced,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// `tts_output.url`, falling back to `url_path`.
fn tts_url(data: &Value) -> Option<&str> {
    let out = &data["tts_output"];
    out["url"]
        .as_str()
        .or_else(|| out["url_path"].as_str())
        .filter(|s| !s.is_empty())
}

/// Response text from `intent_output`, trying each shape the server emits.
pub fn response_text(data: &Value) -> Option<String> {
    let response = &data["intent_output"]["response"];
    [
        &response["speech"]["plain"]["speech"],
        &response["speech"]["speech"],
        &response["plain"],
        response,
    ]
    .into_iter()
    .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
    .map(str::to_string)
}

impl Satellite {
    pub(crate) fn on_pipeline_message(self: &Arc<Self>, message: Value) {
        let kind = message["type"].as_str().unwrap_or("?").to_string();
        if self.is_paused() {
            log::debug!("[event] Ignoring {} while paused", kind);
            return;
        }
        if self.pipeline.lock().restarting {
            log::debug!("[event] Ignoring {} while restarting", kind);
            return;
        }
        if self.settings.debug {
            let at = message["timestamp"]
                .as_str()
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            let mut data = message["data"].to_string();
            data.truncate(500);
            log::debug!("[event] {} {} {}", at, kind, data);
        }

        match PipelineEvent::parse(&message) {
            PipelineEvent::RunStart(data) => self.on_run_start(&data),
            PipelineEvent::WakeWordStart => self.on_wake_word_start(),
            PipelineEvent::WakeWordEnd(data) => self.on_wake_word_end(&data),
            PipelineEvent::SttStart => self.set_state(Phase::Stt),
            PipelineEvent::SttVadStart => log::debug!("[event] VAD: speech started"),
            PipelineEvent::SttVadEnd => log::debug!("[event] VAD: speech ended"),
            PipelineEvent::SttEnd(data) => self.on_stt_end(&data),
            PipelineEvent::IntentStart => self.set_state(Phase::Intent),
            PipelineEvent::IntentProgress(data) => self.on_intent_progress(&data),
            PipelineEvent::IntentEnd(data) => self.on_intent_end(&data),
            PipelineEvent::TtsStart => self.set_state(Phase::Tts),
            PipelineEvent::TtsEnd(data) => self.on_tts_end(&data),
            PipelineEvent::RunEnd => self.on_run_end(),
            PipelineEvent::Error { code, message } => self.on_pipeline_error(&code, &message),
            PipelineEvent::Displaced => self.handle_displaced(),
            PipelineEvent::Unknown(other) => log::debug!("[event] unhandled {}", other),
        }
    }

    fn on_run_start(self: &Arc<Self>, data: &Value) {
        {
            let mut p = self.pipeline.lock();
            p.run_start_received = true;
            p.wake_word_phase = false;
            p.error_received = false;
        }
        self.store_streaming_url(data);

        let continuing = std::mem::take(&mut self.pipeline.lock().continue_mode);
        if continuing {
            log::info!(
                "[pipeline] Running (continue conversation), handler {:?}",
                self.audio.handler_id()
            );
            self.set_state(Phase::Stt);
        } else {
            log::info!(
                "[pipeline] Running, handler {:?}; listening for wake word",
                self.audio.handler_id()
            );
            self.set_state(Phase::Listening);
        }
        self.start_token_refresh();
    }

    fn on_wake_word_start(self: &Arc<Self>) {
        let unavailable = {
            let mut p = self.pipeline.lock();
            p.wake_word_phase = true;
            p.service_unavailable
        };
        if !unavailable {
            return;
        }
        let sat = self.clone();
        let handle = timer::after(RECOVERY_DELAY, async move {
            let recovered = {
                let mut p = sat.pipeline.lock();
                p.recovery_timer = None;
                let was = std::mem::replace(&mut p.service_unavailable, false);
                if was {
                    p.retry_count = 0;
                }
                was
            };
            if recovered {
                log::info!("[recovery] Wake word service recovered");
                sat.ui.clear_error_bar();
            }
        });
        let mut p = self.pipeline.lock();
        timer::cancel(&mut p.recovery_timer);
        p.recovery_timer = Some(handle);
    }

    fn on_wake_word_end(self: &Arc<Self>, data: &Value) {
        self.clear_token_refresh();
        if !self.pipeline.lock().run_start_received {
            log::debug!("[pipeline] Ignoring stale wake_word-end (no run-start)");
            return;
        }
        let detected = data["wake_word_output"]["wake_word_id"]
            .as_str()
            .is_some_and(|id| !id.is_empty());
        if !detected {
            log::debug!("[pipeline] Ignoring empty wake_word-end");
            return;
        }

        let tts_playing = self.tts_is_playing();
        {
            let mut p = self.pipeline.lock();
            p.wake_word_phase = false;
            timer::cancel(&mut p.recovery_timer);
            p.service_unavailable = false;
            p.retry_count = 0;
            timer::cancel(&mut p.intent_error_timer);
            if tts_playing {
                p.pending_run_end = false;
            }
            p.continuation = None;
        }
        self.ui.clear_error_bar();
        self.interrupt_media();
        if tts_playing {
            self.stop_tts();
        }
        self.ui.clear_chat();
        self.set_state(Phase::WakeWordDetected);

        if self.entities.wake_sound_enabled() {
            // The chime leaks into the microphone; hold audio until it ends.
            self.audio.stop_sending();
            self.play_chime(Chime::Wake);
            let resume = Chime::Wake.duration() + Duration::from_millis(50);
            let sat = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(resume).await;
                sat.audio.clear();
                if sat.audio.handler_id().is_some() {
                    sat.audio.start_sending();
                }
            });
        }
        self.ui.show_overlay(Overlay::Pipeline);
    }

    fn on_stt_end(&self, data: &Value) {
        let text = data["stt_output"]["text"].as_str().unwrap_or_default();
        if !text.is_empty() {
            self.ui.show_transcript(text);
        }
        let callback = {
            let mut p = self.pipeline.lock();
            let cb = p.ask_callback.take();
            if cb.is_some() {
                p.ask_handled = true;
            }
            cb
        };
        if let Some(slot) = callback {
            log::info!("[pipeline] Ask question STT complete: \"{}\"", text);
            slot.resolve(text);
        }
    }

    fn on_intent_progress(self: &Arc<Self>, data: &Value) {
        if data["tts_start_streaming"].as_bool() == Some(true) && !self.tts_is_playing() {
            if let Some(url) = self.take_streaming_url() {
                log::info!("[tts] Streaming TTS started; playing early");
                self.set_state(Phase::Tts);
                self.play_tts(&url, false);
            }
        }
        let Some(chunk) = data["chat_log_delta"]["content"].as_str() else {
            return;
        };
        let text = {
            let mut p = self.pipeline.lock();
            p.streamed_response.push_str(chunk);
            p.streamed_response.clone()
        };
        self.ui.update_response(&text);
    }

    fn on_intent_end(self: &Arc<Self>, data: &Value) {
        let output = &data["intent_output"];
        if output["response"]["response_type"] == "error" {
            let text = response_text(data).unwrap_or_else(|| "An error occurred".into());
            log::error!(
                "[error] Intent error ({}): {}",
                output["response"]["data"]["code"].as_str().unwrap_or("?"),
                text
            );
            self.ui.show_error_bar();
            if self.entities.wake_sound_enabled() {
                self.play_chime(Chime::Error);
            }
            let sat = self.clone();
            let handle = timer::after(INTENT_ERROR_DISPLAY, async move {
                sat.pipeline.lock().intent_error_timer = None;
                sat.ui.clear_error_bar();
            });
            let mut p = self.pipeline.lock();
            p.suppress_tts = true;
            timer::cancel(&mut p.intent_error_timer);
            p.intent_error_timer = Some(handle);
            p.streamed_response.clear();
            return;
        }

        match response_text(data) {
            Some(text) => self.ui.show_response(&text),
            None => log::debug!("[error] Could not extract response text"),
        }
        let mut p = self.pipeline.lock();
        p.continuation = None;
        if output["continue_conversation"].as_bool() == Some(true) {
            let id = output["conversation_id"].as_str().unwrap_or_default();
            log::info!("[pipeline] Continue conversation requested, id {}", id);
            p.continuation = Some(id.to_string());
        }
        p.streamed_response.clear();
    }

    fn on_tts_end(self: &Arc<Self>, data: &Value) {
        let suppressed = std::mem::take(&mut self.pipeline.lock().suppress_tts);
        if suppressed {
            log::info!("[tts] TTS suppressed after intent error");
            self.restart(Duration::ZERO);
            return;
        }
        let url = tts_url(data);
        if self.tts_is_playing() {
            if let Some(url) = url {
                self.set_tts_end_url(Some(url));
            }
            log::debug!("[tts] Streaming TTS already playing; skipping duplicate playback");
        } else if let Some(url) = url {
            self.set_tts_end_url(Some(url));
            self.play_tts(url, false);
        }
        self.restart(Duration::ZERO);
    }

    fn on_run_end(self: &Arc<Self>) {
        let wake_phase_drop = {
            let p = self.pipeline.lock();
            if !p.run_start_received {
                log::debug!("[pipeline] Ignoring stale run-end (no run-start)");
                return;
            }
            p.wake_word_phase && !p.error_received
        };
        if wake_phase_drop {
            log::info!("[pipeline] run-end during wake word phase; restarting");
            self.restart(Duration::ZERO);
            return;
        }

        log::info!("[pipeline] Run ended");
        self.audio.set_handler_id(None);
        let tts_playing = self.tts_is_playing();
        {
            let mut p = self.pipeline.lock();
            if p.restarting {
                log::debug!("[pipeline] Restart already in progress; skipping run-end");
                return;
            }
            if std::mem::take(&mut p.ask_handled) {
                return;
            }
            if p.service_unavailable {
                drop(p);
                self.ui.hide_overlay(Overlay::Pipeline);
                return;
            }
            if tts_playing {
                log::debug!("[ui] TTS playing; deferring cleanup");
                p.pending_run_end = true;
                return;
            }
        }
        self.finish_run_end();
    }

    pub(crate) fn finish_run_end(self: &Arc<Self>) {
        let unavailable = {
            let mut p = self.pipeline.lock();
            p.pending_run_end = false;
            p.service_unavailable
        };
        self.ui.clear_chat();
        self.ui.hide_overlay(Overlay::Pipeline);
        self.set_state(Phase::Idle);
        if !unavailable {
            self.restart(Duration::ZERO);
        }
    }

    fn on_pipeline_error(self: &Arc<Self>, code: &str, message: &str) {
        let callback = {
            let mut p = self.pipeline.lock();
            if !p.run_start_received {
                log::debug!("[pipeline] Ignoring stale error (no run-start)");
                return;
            }
            p.error_received = true;
            p.ask_callback.take()
        };
        log::info!("[error] {}: {}", code, message);

        if let Some(slot) = callback {
            log::info!("[pipeline] Ask question error ({}); sending empty answer", code);
            slot.resolve("");
            return;
        }

        if EXPECTED_ERRORS.contains(&code) {
            if self.phase().is_interacting() {
                self.set_state(Phase::Idle);
                self.ui.clear_chat();
                self.ui.hide_overlay(Overlay::Pipeline);
                self.clear_continuation();
                if self.entities.wake_sound_enabled() && self.tts_target().is_none() {
                    self.play_chime(Chime::Done);
                }
            }
            self.restart(Duration::ZERO);
            return;
        }

        log::error!("[error] Unexpected: {}: {}", code, message);
        let was_interacting = self.phase().is_interacting();
        self.audio.set_handler_id(None);
        if was_interacting && self.entities.wake_sound_enabled() {
            self.play_chime(Chime::Error);
        }
        self.ui.show_error_bar();
        self.pipeline.lock().service_unavailable = true;
        self.set_state(Phase::Error);
        self.ui.clear_chat();
        self.ui.hide_overlay(Overlay::Pipeline);
        let delay = self.next_retry_delay();
        self.restart(delay);
    }
}
