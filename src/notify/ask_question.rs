//! Questions expecting a spoken answer. After the prompt plays, the pipeline
//! runs speech-to-text only and the transcript is posted back to the server,
//! which reports whether it matched one of the expected answers.

use super::{Announcement, NotificationKind};
use crate::chime::Chime;
use crate::connection::commands::{self, Stage};
use crate::connection;
use crate::pipeline::{AnswerSlot, ContinueOptions};
use crate::satellite::Satellite;
use crate::state::Overlay;
use crate::timer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const KIND: NotificationKind = NotificationKind::AskQuestion;

/// Lets the wake chime finish before the microphone reopens.
pub const CHIME_SETTLE: Duration = Duration::from_millis(500);
/// Upper bound on waiting for a transcript.
pub const STT_SAFETY: Duration = Duration::from_millis(30_000);
/// How long the match feedback stays up.
pub const CLEANUP_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Default)]
pub(crate) struct AskState {
    pub answer_sent: bool,
    pub matched: Option<bool>,
    settle_timer: Option<JoinHandle<()>>,
    safety_timer: Option<JoinHandle<()>>,
    cleanup_timer: Option<JoinHandle<()>>,
}

impl Satellite {
    pub(super) fn on_question_played(self: &Arc<Self>, announcement: Announcement) {
        let id = announcement.id;
        self.ack_notification(KIND, id);
        self.ui.set_announcement_mode(false);
        self.ui.show_overlay(Overlay::Pipeline);
        self.play_chime(Chime::Wake);

        let sat = self.clone();
        let settle = timer::after(CHIME_SETTLE, async move {
            sat.notify.ask().settle_timer = None;
            sat.enter_answer_mode(id);
        });
        let mut ask = self.notify.ask();
        ask.answer_sent = false;
        timer::cancel(&mut ask.settle_timer);
        ask.settle_timer = Some(settle);
    }

    fn enter_answer_mode(self: &Arc<Self>, id: u64) {
        log::info!("[ask-question] Entering STT mode for #{}", id);
        let (slot, mut rx) = AnswerSlot::new();
        self.restart_continue(
            None,
            ContinueOptions {
                end_stage: Stage::Stt,
                on_stt_end: Some(slot),
                ..ContinueOptions::default()
            },
        );

        let sat = self.clone();
        let waiter = tokio::spawn(async move {
            let text = tokio::select! {
                Ok(text) = &mut rx => text,
                _ = tokio::time::sleep(STT_SAFETY) => {
                    log::warn!("[ask-question] No transcript in time; sending empty answer");
                    // Nobody is listening for the transcript any more.
                    sat.pipeline.lock().ask_callback = None;
                    String::new()
                }
            };
            {
                let mut ask = sat.notify.ask();
                if ask.answer_sent {
                    return;
                }
                ask.answer_sent = true;
                // Detach rather than abort: this task owns the handle.
                ask.safety_timer = None;
            }
            sat.process_answer(id, text);
        });
        let mut ask = self.notify.ask();
        timer::cancel(&mut ask.safety_timer);
        ask.safety_timer = Some(waiter);
    }

    fn process_answer(self: &Arc<Self>, id: u64, text: String) {
        log::info!("[ask-question] Answer for #{}: \"{}\"", id, text);
        {
            let mut ask = self.notify.ask();
            timer::cancel(&mut ask.settle_timer);
            timer::cancel(&mut ask.safety_timer);
            ask.matched = None;
        }

        let sat = self.clone();
        let cleanup = timer::after(CLEANUP_DELAY, async move {
            let matched = {
                let mut ask = sat.notify.ask();
                ask.cleanup_timer = None;
                ask.matched
            };
            if matched == Some(false) {
                sat.ui.clear_error_bar();
            }
            sat.clear_notification_ui(KIND);
            sat.ui.hide_overlay(Overlay::Pipeline);
            sat.notify.lock().slot(KIND).playing = false;
            if sat.has_queued(KIND) {
                sat.play_queued(KIND);
            } else {
                sat.restart(Duration::ZERO);
            }
        });
        {
            let mut ask = self.notify.ask();
            timer::cancel(&mut ask.cleanup_timer);
            ask.cleanup_timer = Some(cleanup);
        }

        let sat = self.clone();
        tokio::spawn(async move {
            let message = commands::question_answered(sat.entity_id(), id, &text);
            let matched = match sat.transport.call(message).await {
                Ok(result) => result["matched"].as_bool().unwrap_or(false),
                Err(e) => {
                    log::error!("[ask-question] Failed to send answer: {}", e);
                    false
                }
            };
            log::info!("[ask-question] #{} matched={}", id, matched);
            sat.notify.ask().matched = Some(matched);
            sat.play_chime(if matched { Chime::Done } else { Chime::Error });
            if !matched {
                sat.ui.show_error_bar();
            }
        });
    }

    /// Abandon an in-flight question. An answer not yet sent goes out empty
    /// so the server stops waiting.
    pub(crate) fn ask_cancel(&self) {
        let outstanding = {
            let mut ask = self.notify.ask();
            timer::cancel(&mut ask.settle_timer);
            timer::cancel(&mut ask.safety_timer);
            timer::cancel(&mut ask.cleanup_timer);
            let current = self.notify.lock().slot(KIND).current_id;
            match current {
                Some(id) if !ask.answer_sent => {
                    ask.answer_sent = true;
                    Some(id)
                }
                _ => None,
            }
        };
        if let Some(id) = outstanding {
            log::info!("[ask-question] Cancelled #{}; sending empty answer", id);
            connection::send_and_forget(
                &self.transport,
                commands::question_answered(self.entity_id(), id, ""),
                "ask-question",
            );
        }
        self.pipeline.lock().ask_callback = None;
        self.ui.hide_overlay(Overlay::Announcement);
        self.notify.lock().slot(KIND).playing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, settle, Harness};
    use serde_json::json;

    fn ask(h: &Harness, id: u64) {
        h.sat.dispatch_satellite_event(json!({
            "type": "announcement",
            "data": {
                "id": id,
                "message": "Lights off?",
                "preannounce": false,
                "ask_question": true,
                "media_id": "/api/tts_proxy/ask.mp3"
            }
        }));
    }

    async fn prompt_played(h: &Harness) {
        settle().await;
        let id = h.player.last_id().unwrap();
        h.player.start(id);
        h.player.finish(id);
        settle().await;
        tokio::time::sleep(CHIME_SETTLE + Duration::from_millis(10)).await;
        settle().await;
    }

    fn answers(h: &Harness) -> Vec<String> {
        h.transport
            .calls_of("voice_satellite/question_answered")
            .iter()
            .map(|c| c["sentence"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_is_posted_and_matched() {
        let h = harness();
        h.transport.set_matched(true);
        ask(&h, 21);
        prompt_played(&h).await;

        let runs = h.transport.subscriptions_of("voice_satellite/run_pipeline");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["start_stage"], "stt");
        assert_eq!(runs[0]["end_stage"], "stt");

        h.transport.emit_run("run-start", json!({}));
        h.transport.emit_run("stt-end", json!({ "stt_output": { "text": "yes please" } }));
        settle().await;
        assert_eq!(answers(&h), vec!["yes please".to_string()]);
        assert_eq!(h.sat.notify.ask().matched, Some(true));
        assert_eq!(h.player.chimes(), vec![Chime::Wake, Chime::Done]);

        tokio::time::sleep(CLEANUP_DELAY + Duration::from_millis(10)).await;
        settle().await;
        assert!(!h.sat.ui.overlay_visible(Overlay::Pipeline));
        assert!(!h.sat.notify.lock().slot(KIND).playing);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_answer_flags_an_error() {
        let h = harness();
        ask(&h, 22);
        prompt_played(&h).await;
        h.transport.emit_run("run-start", json!({}));
        h.transport.emit_run("stt-end", json!({ "stt_output": { "text": "purple" } }));
        settle().await;
        assert_eq!(h.sat.notify.ask().matched, Some(false));
        assert!(h.sat.ui.error_bar_visible());
        assert_eq!(h.player.chimes(), vec![Chime::Wake, Chime::Error]);

        tokio::time::sleep(CLEANUP_DELAY + Duration::from_millis(10)).await;
        settle().await;
        assert!(!h.sat.ui.error_bar_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timeout_sends_a_single_empty_answer() {
        let h = harness();
        ask(&h, 23);
        prompt_played(&h).await;
        tokio::time::sleep(STT_SAFETY + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(answers(&h), vec![String::new()]);

        // A late transcript is ignored.
        h.transport.emit_run("run-start", json!({}));
        h.transport.emit_run("stt-end", json!({ "stt_output": { "text": "late" } }));
        settle().await;
        assert_eq!(answers(&h).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listening_resumes_normally_after_a_timed_out_question() {
        let h = harness();
        ask(&h, 40);
        prompt_played(&h).await;
        tokio::time::sleep(STT_SAFETY + CLEANUP_DELAY + Duration::from_millis(20)).await;
        settle().await;
        assert!(h.sat.pipeline.lock().ask_callback.is_none());
        let runs = h.transport.subscriptions_of("voice_satellite/run_pipeline");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1]["start_stage"], "wake_word");

        h.transport.emit_run("run-start", json!({}));
        h.transport.emit_run("wake_word-start", json!({}));
        h.transport.emit_run(
            "error",
            json!({ "code": "wake-word-timeout", "message": "no wake word" }),
        );
        settle().await;
        assert_eq!(h.transport.subscriptions_of("voice_satellite/run_pipeline").len(), 3);
        assert!(h.transport.active_run().is_some());

        // A transcript in an ordinary run is not taken for an answer.
        h.transport.emit_run("run-start", json!({}));
        h.transport.emit_run("stt-end", json!({ "stt_output": { "text": "hello" } }));
        settle().await;
        assert_eq!(answers(&h), vec![String::new()]);
        assert!(!h.sat.pipeline.lock().ask_handled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_answer_releases_the_server() {
        let h = harness();
        ask(&h, 24);
        prompt_played(&h).await;
        h.sat.ask_cancel();
        settle().await;
        assert_eq!(answers(&h), vec![String::new()]);
        tokio::time::sleep(STT_SAFETY + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(answers(&h).len(), 1);
    }
}
