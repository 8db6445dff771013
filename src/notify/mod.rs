//! Server-pushed notifications: announcements, questions and conversation
//! starts. Each kind has one playback slot and a one-item replace-on-arrival
//! queue; ids are accepted only if greater than every id accepted before.

mod announcement;
mod ask_question;
mod start_conversation;
mod subscription;

use ask_question::AskState;
use subscription::SubscriptionState;

use crate::chime::Chime;
use crate::connection::{self, commands};
use crate::playback::{PlaybackEvent, PlaybackId, Source};
use crate::satellite::Satellite;
use crate::state::{lock, MessageStyle, Overlay};
use crate::timer;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a message without media stays up before completing.
pub const NO_MEDIA_DISPLAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Announcement,
    AskQuestion,
    StartConversation,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 3] = [
        NotificationKind::Announcement,
        NotificationKind::AskQuestion,
        NotificationKind::StartConversation,
    ];

    fn index(self) -> usize {
        match self {
            NotificationKind::Announcement => 0,
            NotificationKind::AskQuestion => 1,
            NotificationKind::StartConversation => 2,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Announcement => "announce",
            NotificationKind::AskQuestion => "ask-question",
            NotificationKind::StartConversation => "start-conversation",
        }
    }
}

/// Payload of an `announcement` / `start_conversation` satellite event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Announcement {
    pub id: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub media_id: Option<String>,
    /// Only an explicit `false` skips the pre-announcement.
    #[serde(default)]
    pub preannounce: Option<bool>,
    #[serde(default)]
    pub preannounce_media_id: Option<String>,
    #[serde(default)]
    pub ask_question: Option<bool>,
    #[serde(default)]
    pub start_conversation: Option<bool>,
    #[serde(default)]
    pub extra_system_prompt: Option<String>,
}

impl Announcement {
    /// Plain announcements; questions and conversation starts are interactive.
    pub fn is_passive(&self) -> bool {
        self.ask_question != Some(true) && self.start_conversation != Some(true)
    }

    fn kind(&self, event_type: &str) -> NotificationKind {
        if self.ask_question == Some(true) {
            NotificationKind::AskQuestion
        } else if event_type == "start_conversation" || self.start_conversation == Some(true) {
            NotificationKind::StartConversation
        } else {
            NotificationKind::Announcement
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub playing: bool,
    pub current_id: Option<u64>,
    pub queued: Option<Announcement>,
    /// Keeps a finished announcement on screen for the display duration.
    pub clear_timer: Option<JoinHandle<()>>,
    pub flow: Option<JoinHandle<()>>,
    pub playback: Option<PlaybackId>,
}

#[derive(Debug, Default)]
pub(crate) struct NotifyInner {
    pub last_accepted: u64,
    pub slots: [Slot; 3],
    /// Newest event received while hidden, replayed on resume.
    pub pending_hidden: Option<Value>,
}

impl NotifyInner {
    pub fn slot(&mut self, kind: NotificationKind) -> &mut Slot {
        &mut self.slots[kind.index()]
    }
}

#[derive(Debug, Default)]
pub(crate) struct NotifyState {
    inner: Mutex<NotifyInner>,
    ask: Mutex<AskState>,
    subscription: Mutex<SubscriptionState>,
}

impl NotifyState {
    pub fn lock(&self) -> MutexGuard<'_, NotifyInner> {
        lock(&self.inner)
    }

    pub fn ask(&self) -> MutexGuard<'_, AskState> {
        lock(&self.ask)
    }

    pub fn subscription(&self) -> MutexGuard<'_, SubscriptionState> {
        lock(&self.subscription)
    }
}

impl Satellite {
    /// Route one event from the satellite event subscription.
    pub(crate) fn dispatch_satellite_event(self: &Arc<Self>, event: Value) {
        let event_type = event["type"].as_str().unwrap_or_default().to_string();
        if event_type == "media_player" {
            self.handle_media_command(&event["data"]);
            return;
        }
        let Some(id) = event["data"]["id"].as_u64().filter(|id| *id > 0) else {
            return;
        };
        if self.is_hidden() {
            log::info!("[satellite-notify] Event #{} held while hidden", id);
            self.notify.lock().pending_hidden = Some(event);
            return;
        }
        let announcement: Announcement = match serde_json::from_value(event["data"].clone()) {
            Ok(a) => a,
            Err(e) => {
                log::warn!("[satellite-notify] Bad event #{}: {}", id, e);
                return;
            }
        };
        let kind = announcement.kind(&event_type);
        self.deliver(kind, announcement);
    }

    pub(crate) fn take_pending_hidden(&self) -> Option<Value> {
        self.notify.lock().pending_hidden.take()
    }

    fn deliver(self: &Arc<Self>, kind: NotificationKind, announcement: Announcement) {
        let busy = self.phase().is_interacting() || self.tts_is_playing();
        let phase = self.phase();
        {
            let mut n = self.notify.lock();
            if announcement.id <= n.last_accepted {
                log::debug!("[{}] Dropping duplicate #{}", kind.as_str(), announcement.id);
                return;
            }
            let slot = n.slot(kind);
            if slot.playing || busy {
                if slot.queued.as_ref().map(|q| q.id) != Some(announcement.id) {
                    log::info!(
                        "[{}] Notification #{} queued ({})",
                        kind.as_str(),
                        announcement.id,
                        if slot.playing { "still displaying" } else { phase.as_str() }
                    );
                    slot.queued = Some(announcement);
                }
                return;
            }
            slot.queued = None;
            n.last_accepted = announcement.id;
        }
        log::info!(
            "[{}] New #{}: message=\"{}\" media=\"{}\"",
            kind.as_str(),
            announcement.id,
            announcement.message,
            announcement.media_id.as_deref().unwrap_or_default()
        );
        self.play_notification(kind, announcement);
    }

    /// Play the queued item for `kind`, if it is still fresh.
    pub(crate) fn play_queued(self: &Arc<Self>, kind: NotificationKind) {
        let next = {
            let mut n = self.notify.lock();
            let last = n.last_accepted;
            let slot = n.slot(kind);
            let Some(queued) = slot.queued.take() else {
                return;
            };
            if queued.id <= last || slot.playing {
                return;
            }
            n.last_accepted = queued.id;
            queued
        };
        log::info!("[{}] Playing queued #{}", kind.as_str(), next.id);
        self.play_notification(kind, next);
    }

    pub(crate) fn has_queued(&self, kind: NotificationKind) -> bool {
        self.notify.lock().slot(kind).queued.is_some()
    }

    fn play_notification(self: &Arc<Self>, kind: NotificationKind, announcement: Announcement) {
        let lingering = timer::is_armed(&self.notify.lock().slot(kind).clear_timer);
        if lingering {
            self.clear_notification_ui(kind);
        }
        self.interrupt_media();
        {
            let mut n = self.notify.lock();
            let slot = n.slot(kind);
            slot.playing = true;
            slot.current_id = Some(announcement.id);
        }
        if kind == NotificationKind::AskQuestion {
            self.notify.ask().answer_sent = false;
        }

        self.ui.show_overlay(Overlay::Announcement);
        if announcement.is_passive() {
            self.ui.set_announcement_mode(true);
        }

        let sat = self.clone();
        let flow = tokio::spawn(async move {
            if !sat.play_preroll(kind, &announcement).await {
                return;
            }
            if !announcement.message.is_empty() {
                let style = if announcement.is_passive() {
                    MessageStyle::Announcement
                } else {
                    MessageStyle::Assistant
                };
                sat.ui.add_message(&announcement.message, style);
            }
            match non_empty(&announcement.media_id) {
                Some(media) => {
                    log::info!("[{}] Playing media {}", kind.as_str(), media);
                    if !sat.play_notification_media(kind, media).await {
                        return;
                    }
                }
                None => tokio::time::sleep(NO_MEDIA_DISPLAY).await,
            }
            sat.notify.lock().slot(kind).flow = None;
            sat.on_notification_played(kind, announcement);
        });
        self.notify.lock().slot(kind).flow = Some(flow);
    }

    /// Chime or pre-announcement media. False when playback was stopped.
    async fn play_preroll(self: &Arc<Self>, kind: NotificationKind, announcement: &Announcement) -> bool {
        if announcement.preannounce == Some(false) {
            log::debug!("[{}] Preannounce disabled; skipping chime", kind.as_str());
            return true;
        }
        if let Some(media) = non_empty(&announcement.preannounce_media_id) {
            log::info!("[{}] Playing pre-announcement {}", kind.as_str(), media);
            return self.play_notification_media(kind, media).await;
        }

        let mut playback = self.player.play(Source::Chime(Chime::Announce), self.media_volume());
        self.notify.lock().slot(kind).playback = Some(playback.id);
        let ended = playback.wait(|| self.notify_audio_start("announce-chime")).await;
        self.notify.lock().slot(kind).playback = None;
        self.notify_audio_end("announce-chime");
        ended != PlaybackEvent::Stopped
    }

    /// Play a media path to the end. Errors still continue the flow; only a
    /// stop returns false.
    async fn play_notification_media(self: &Arc<Self>, kind: NotificationKind, path: &str) -> bool {
        let url = self.media_url(path);
        let mut playback = self.player.play(Source::Url(url), self.media_volume());
        self.notify.lock().slot(kind).playback = Some(playback.id);
        let ended = playback
            .wait(|| self.notify_audio_start("notification"))
            .await;
        self.notify.lock().slot(kind).playback = None;
        if ended == PlaybackEvent::Stopped {
            return false;
        }
        if let PlaybackEvent::Failed(e) = &ended {
            log::error!("[{}] Media playback error: {}", kind.as_str(), e);
        }
        self.notify_audio_end("notification");
        true
    }

    fn on_notification_played(self: &Arc<Self>, kind: NotificationKind, announcement: Announcement) {
        log::info!("[{}] #{} playback complete", kind.as_str(), announcement.id);
        match kind {
            NotificationKind::Announcement => self.on_announcement_played(announcement),
            NotificationKind::AskQuestion => self.on_question_played(announcement),
            NotificationKind::StartConversation => self.on_conversation_prompt_played(announcement),
        }
    }

    /// Tell the server the notification has been played.
    pub(crate) fn ack_notification(&self, kind: NotificationKind, id: u64) {
        log::debug!("[{}] ACK #{}", kind.as_str(), id);
        connection::send_and_forget(
            &self.transport,
            commands::announce_finished(self.entity_id(), id),
            "satellite-notify",
        );
    }

    pub(crate) fn clear_notification_ui(&self, kind: NotificationKind) {
        timer::cancel(&mut self.notify.lock().slot(kind).clear_timer);
        self.ui.set_announcement_mode(false);
        self.ui.clear_chat();
        self.ui.hide_overlay(Overlay::Announcement);
    }

    /// Playbacks owned by notifications, for volume changes.
    pub(crate) fn notification_playbacks(&self) -> Vec<PlaybackId> {
        self.notify
            .lock()
            .slots
            .iter()
            .filter_map(|s| s.playback)
            .collect()
    }

    /// Kinds that are playing or still showing their last message.
    pub(crate) fn active_notifications(&self) -> Vec<NotificationKind> {
        let mut n = self.notify.lock();
        NotificationKind::ALL
            .into_iter()
            .filter(|kind| {
                let slot = n.slot(*kind);
                slot.playing || timer::is_armed(&slot.clear_timer)
            })
            .collect()
    }

    /// Abandon a notification outright: acknowledge it, stop its audio and
    /// clear its UI.
    pub(crate) fn dismiss_notification(&self, kind: NotificationKind) {
        let (id, playback, flow) = {
            let mut n = self.notify.lock();
            let slot = n.slot(kind);
            slot.playing = false;
            (slot.current_id.take(), slot.playback.take(), slot.flow.take())
        };
        if let Some(id) = id {
            self.ack_notification(kind, id);
        }
        if let Some(flow) = flow {
            flow.abort();
        }
        if let Some(playback) = playback {
            self.player.stop(playback);
        }
        self.clear_notification_ui(kind);
    }
}
