use super::{Announcement, NotificationKind};
use crate::chime::Chime;
use crate::satellite::Satellite;
use crate::timer;
use std::sync::Arc;
use std::time::Duration;

const KIND: NotificationKind = NotificationKind::Announcement;

impl Satellite {
    /// Passive announcement finished playing. The pipeline restarts right
    /// away while the message stays on screen for the display duration.
    pub(super) fn on_announcement_played(self: &Arc<Self>, announcement: Announcement) {
        self.ack_notification(KIND, announcement.id);
        self.restart(Duration::ZERO);

        let seconds = self.entities.announcement_display_duration().max(0.0);
        let sat = self.clone();
        let handle = timer::after(Duration::from_secs_f64(seconds), async move {
            sat.notify.lock().slot(KIND).clear_timer = None;
            sat.clear_notification_ui(KIND);
            sat.notify.lock().slot(KIND).playing = false;
            if sat.has_queued(KIND) {
                sat.play_queued(KIND);
            } else if sat.entities.wake_sound_enabled() {
                sat.play_chime(Chime::Done);
            }
        });
        let mut n = self.notify.lock();
        let slot = n.slot(KIND);
        timer::cancel(&mut slot.clear_timer);
        slot.clear_timer = Some(handle);
    }
}
