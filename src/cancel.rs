//! Double-tap cancellation of whatever the satellite is doing.

use crate::chime::Chime;
use crate::satellite::Satellite;
use crate::state::{lock, Overlay, Phase};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DOUBLE_TAP_THRESHOLD: Duration = Duration::from_millis(400);

/// Detects two taps in quick succession.
#[derive(Debug, Default)]
pub struct TapDetector {
    last: Option<Instant>,
}

impl TapDetector {
    /// Record a tap. True when it completes a double tap.
    pub fn tap(&mut self, now: Instant) -> bool {
        let double = self.last.is_some_and(|last| {
            let gap = now.saturating_duration_since(last);
            gap > Duration::ZERO && gap < DOUBLE_TAP_THRESHOLD
        });
        self.last = if double { None } else { Some(now) };
        double
    }
}

#[derive(Debug, Default)]
pub(crate) struct CancelState {
    taps: Mutex<TapDetector>,
}

impl Satellite {
    fn cancellable(&self) -> bool {
        self.phase().is_interacting()
            || self.tts_is_playing()
            || self.timer_alert_active()
            || !self.active_notifications().is_empty()
    }

    /// A tap on the surface. Only counts while there is something to cancel.
    pub fn tap(self: &Arc<Self>) -> bool {
        if !self.cancellable() {
            return false;
        }
        let double = lock(&self.cancel.taps).tap(Instant::now());
        double && self.cancel_interaction()
    }

    /// Stop the current notification or interaction and go back to wake-word
    /// listening. Returns false when there was nothing to cancel.
    pub fn cancel_interaction(self: &Arc<Self>) -> bool {
        if self.timer_alert_active() {
            log::info!("[cancel] Dismissing timer alert");
            self.dismiss_timer_alert();
            return true;
        }

        let notifications = self.active_notifications();
        if !notifications.is_empty() {
            log::info!("[cancel] Dismissing notification");
            self.ask_cancel();
            for kind in notifications {
                self.dismiss_notification(kind);
            }
            self.restart(Duration::ZERO);
            return true;
        }

        if !self.phase().is_interacting() && !self.tts_is_playing() {
            return false;
        }
        log::info!("[cancel] Cancelling interaction");
        if self.tts_is_playing() {
            self.stop_tts();
        }
        self.ask_cancel();
        self.clear_continuation();
        self.set_state(Phase::Idle);
        self.ui.clear_chat();
        self.ui.hide_overlay(Overlay::Pipeline);
        if self.entities.wake_sound_enabled() && self.tts_target().is_none() {
            self.play_chime(Chime::Done);
        }
        self.restart(Duration::ZERO);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;
    use crate::testing::{harness, settle};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn double_tap_needs_two_quick_taps() {
        let start = Instant::now();
        let mut taps = TapDetector::default();
        assert!(!taps.tap(start));
        assert!(taps.tap(start + Duration::from_millis(250)));
        // The pair is consumed; a third tap starts over.
        assert!(!taps.tap(start + Duration::from_millis(300)));
        assert!(!taps.tap(start + Duration::from_millis(900)));
        assert!(!taps.tap(start + Duration::from_millis(900)));
    }

    #[tokio::test(start_paused = true)]
    async fn taps_while_idle_are_ignored() {
        let h = harness();
        assert!(!h.sat.tap());
        assert!(!h.sat.tap());
        assert!(!h.sat.cancel_interaction());
    }

    #[tokio::test(start_paused = true)]
    async fn double_tap_cancels_speech() {
        let h = harness();
        h.sat.set_state(Phase::Tts);
        h.sat.play_tts("/api/tts_proxy/r.mp3", false);
        settle().await;
        assert!(!h.sat.tap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.sat.tap());
        settle().await;
        assert!(!h.sat.tts_is_playing());
        assert_eq!(h.sat.phase(), Phase::Idle);
        assert_eq!(h.player.chimes(), vec![Chime::Done]);
        assert_eq!(h.transport.subscriptions_of("voice_satellite/run_pipeline").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_dismisses_a_playing_announcement() {
        let h = harness();
        h.sat.dispatch_satellite_event(json!({
            "type": "announcement",
            "data": { "id": 30, "message": "Laundry", "preannounce": false, "media_id": "/m.mp3" }
        }));
        settle().await;
        let id = h.player.last_id().unwrap();
        assert!(h.sat.cancel_interaction());
        settle().await;
        assert!(h.player.stopped().contains(&id));
        assert_eq!(h.transport.calls_of("voice_satellite/announce_finished").len(), 1);
        assert!(h.sat.active_notifications().is_empty());
        assert!(!h.sat.ui.overlay_visible(Overlay::Announcement));
        assert!(h.player.chimes().is_empty());
        assert!(!h.sat.notify.lock().slot(NotificationKind::Announcement).playing);
    }
}
