use super::{Announcement, NotificationKind};
use crate::pipeline::ContinueOptions;
use crate::satellite::Satellite;
use crate::state::Overlay;
use std::sync::Arc;

const KIND: NotificationKind = NotificationKind::StartConversation;

impl Satellite {
    /// The prompt has played; hand over to a full STT -> TTS run.
    pub(super) fn on_conversation_prompt_played(self: &Arc<Self>, announcement: Announcement) {
        self.ack_notification(KIND, announcement.id);
        self.clear_notification_ui(KIND);
        self.notify.lock().slot(KIND).playing = false;

        self.ui.show_overlay(Overlay::Pipeline);
        log::info!("[start-conversation] Entering STT mode");
        self.restart_continue(
            None,
            ContinueOptions {
                extra_system_prompt: announcement.extra_system_prompt,
                ..ContinueOptions::default()
            },
        );
    }
}
