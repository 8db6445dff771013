//! Pausing while the client is hidden. Hiding cuts an interaction short at
//! once but only releases the microphone after a short debounce, so a quick
//! hide/show flicker does not tear the pipeline down.

use crate::satellite::Satellite;
use crate::state::{lock, Overlay, Phase};
use crate::timer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const HIDE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct VisibilityInner {
    paused: bool,
    hidden: bool,
    debounce: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct VisibilityState {
    inner: Mutex<VisibilityInner>,
}

impl Satellite {
    pub(crate) fn is_paused(&self) -> bool {
        lock(&self.visibility.inner).paused
    }

    pub(crate) fn is_hidden(&self) -> bool {
        lock(&self.visibility.inner).hidden
    }

    pub fn set_hidden(self: &Arc<Self>) {
        {
            let mut v = lock(&self.visibility.inner);
            timer::cancel(&mut v.debounce);
            v.hidden = true;
        }
        if !self.ownership.is_owner(self.id) {
            return;
        }
        lock(&self.visibility.inner).paused = true;
        log::info!("[visibility] Hidden; pausing");
        timer::cancel(&mut self.pipeline.lock().reconnect_timer);

        self.ask_cancel();
        if self.phase().is_interacting() {
            self.ui.clear_chat();
            self.ui.hide_overlay(Overlay::Pipeline);
            self.clear_continuation();
            if self.tts_is_playing() {
                self.stop_tts();
            }
        }

        let sat = self.clone();
        let handle = timer::after(HIDE_DEBOUNCE, async move {
            lock(&sat.visibility.inner).debounce = None;
            sat.set_state(Phase::Paused);
            sat.audio.stop_sending();
            sat.microphone.set_enabled(false);
        });
        lock(&self.visibility.inner).debounce = Some(handle);
    }

    pub fn set_visible(self: &Arc<Self>) {
        {
            let mut v = lock(&self.visibility.inner);
            timer::cancel(&mut v.debounce);
            v.hidden = false;
            if !v.paused {
                return;
            }
        }
        log::info!("[visibility] Visible; resuming");
        self.reset_for_resume();
        self.audio.clear();
        self.microphone.set_enabled(true);
        lock(&self.visibility.inner).paused = false;

        match self.take_pending_hidden() {
            Some(event) => {
                log::info!("[visibility] Replaying notification received while hidden");
                self.dispatch_satellite_event(event);
            }
            None => {
                self.refresh_satellite_subscription();
                self.restart(Duration::ZERO);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, settle};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn hide_pauses_after_debounce() {
        let h = harness();
        h.sat.set_hidden();
        assert!(h.sat.is_paused());
        assert!(h.mic.enabled());
        tokio::time::sleep(HIDE_DEBOUNCE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(h.sat.phase(), Phase::Paused);
        assert!(!h.mic.enabled());

        h.sat.set_visible();
        settle().await;
        assert!(!h.sat.is_paused());
        assert!(h.mic.enabled());
        assert_eq!(h.transport.subscriptions_of("voice_satellite/run_pipeline").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_flicker_keeps_the_microphone() {
        let h = harness();
        h.sat.set_hidden();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.sat.set_visible();
        tokio::time::sleep(HIDE_DEBOUNCE).await;
        settle().await;
        assert!(h.mic.enabled());
        assert_ne!(h.sat.phase(), Phase::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_supersedes_a_pending_restart() {
        let h = harness();
        h.sat.start_pipeline(crate::connection::commands::RunOptions::default())
            .await
            .unwrap();
        h.sat.restart(Duration::from_millis(1000));
        h.sat.set_hidden();
        h.sat.set_visible();
        settle().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(h.transport.subscriptions_of("voice_satellite/run_pipeline").len(), 2);
        assert_eq!(h.transport.unsubscribed().len(), 1);
        assert!(h.transport.active_run().is_some());
        assert!(h.sat.audio.is_sending());
    }

    #[tokio::test(start_paused = true)]
    async fn newest_notification_replays_on_resume() {
        let h = harness();
        h.sat.set_hidden();
        for id in [8, 9] {
            h.sat.dispatch_satellite_event(json!({
                "type": "announcement",
                "data": { "id": id, "message": format!("n{}", id), "preannounce": false }
            }));
        }
        settle().await;
        assert!(h.player.plays().is_empty());
        assert!(h.events().iter().all(|e| !matches!(e, crate::state::AppEvent::Message { .. })));

        h.sat.set_visible();
        settle().await;
        assert_eq!(
            h.sat.notify.lock().slot(crate::notify::NotificationKind::Announcement).current_id,
            Some(9)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hiding_mid_interaction_abandons_it() {
        let h = harness();
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/r.mp3", false);
        settle().await;
        h.sat.set_hidden();
        settle().await;
        assert!(!h.sat.tts_is_playing());
        assert!(!h.sat.ui.overlay_visible(Overlay::Pipeline));
    }
}
