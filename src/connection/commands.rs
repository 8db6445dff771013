//! Websocket command payloads.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WakeWord,
    Stt,
    Intent,
    Tts,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::WakeWord => "wake_word",
            Stage::Stt => "stt",
            Stage::Intent => "intent",
            Stage::Tts => "tts",
        }
    }
}

/// Parameters for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub start_stage: Stage,
    pub end_stage: Stage,
    pub conversation_id: Option<String>,
    pub extra_system_prompt: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start_stage: Stage::WakeWord,
            end_stage: Stage::Tts,
            conversation_id: None,
            extra_system_prompt: None,
        }
    }
}

pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

pub fn run_pipeline(entity_id: &str, options: &RunOptions) -> Value {
    let mut msg = json!({
        "type": "voice_satellite/run_pipeline",
        "entity_id": entity_id,
        "start_stage": options.start_stage.as_str(),
        "end_stage": options.end_stage.as_str(),
        "sample_rate": PIPELINE_SAMPLE_RATE,
    });
    if let Some(id) = &options.conversation_id {
        msg["conversation_id"] = json!(id);
    }
    if let Some(prompt) = &options.extra_system_prompt {
        msg["extra_system_prompt"] = json!(prompt);
    }
    msg
}

pub fn subscribe_satellite(entity_id: &str) -> Value {
    json!({ "type": "voice_satellite/subscribe_events", "entity_id": entity_id })
}

pub fn update_state(entity_id: &str, state: &str) -> Value {
    json!({ "type": "voice_satellite/update_state", "entity_id": entity_id, "state": state })
}

pub fn announce_finished(entity_id: &str, announce_id: u64) -> Value {
    json!({
        "type": "voice_satellite/announce_finished",
        "entity_id": entity_id,
        "announce_id": announce_id,
    })
}

pub fn question_answered(entity_id: &str, announce_id: u64, sentence: &str) -> Value {
    json!({
        "type": "voice_satellite/question_answered",
        "entity_id": entity_id,
        "announce_id": announce_id,
        "sentence": sentence,
    })
}

pub fn cancel_timer(entity_id: &str, timer_id: &str) -> Value {
    json!({
        "type": "voice_satellite/cancel_timer",
        "entity_id": entity_id,
        "timer_id": timer_id,
    })
}

pub fn call_service(domain: &str, service: &str, service_data: Value) -> Value {
    json!({
        "type": "call_service",
        "domain": domain,
        "service": service,
        "service_data": service_data,
    })
}

pub fn media_player_event(
    entity_id: &str,
    state: &str,
    volume: Option<f32>,
    media_id: Option<&str>,
) -> Value {
    let mut msg = json!({
        "type": "voice_satellite/media_player_event",
        "entity_id": entity_id,
        "state": state,
    });
    if let Some(v) = volume {
        msg["volume"] = json!(v);
    }
    if let Some(id) = media_id {
        msg["media_id"] = json!(id);
    }
    msg
}

pub fn sign_path(path: &str, expires_secs: u64) -> Value {
    json!({ "type": "auth/sign_path", "path": path, "expires": expires_secs })
}

pub fn entity_registry_list() -> Value {
    json!({ "type": "config/entity_registry/list" })
}

pub fn get_states() -> Value {
    json!({ "type": "get_states" })
}

pub fn subscribe_state_changes() -> Value {
    json!({ "type": "subscribe_events", "event_type": "state_changed" })
}
