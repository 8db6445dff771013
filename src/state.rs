use crate::countdown::TimerView;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Satellite lifecycle as shown to the user and mirrored to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Connecting,
    Listening,
    Paused,
    WakeWordDetected,
    Stt,
    Intent,
    Tts,
    /// The service failed and a backed-off restart is pending.
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Connecting => "CONNECTING",
            Phase::Listening => "LISTENING",
            Phase::Paused => "PAUSED",
            Phase::WakeWordDetected => "WAKE_WORD_DETECTED",
            Phase::Stt => "STT",
            Phase::Intent => "INTENT",
            Phase::Tts => "TTS",
            Phase::Error => "ERROR",
        }
    }

    /// A user interaction is in flight.
    pub fn is_interacting(self) -> bool {
        matches!(
            self,
            Phase::WakeWordDetected | Phase::Stt | Phase::Intent | Phase::Tts
        )
    }

    /// A new interaction has started and no response is playing yet.
    pub fn is_capturing(self) -> bool {
        matches!(self, Phase::WakeWordDetected | Phase::Stt | Phase::Intent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Overlay {
    Pipeline,
    Announcement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStyle {
    /// Passive announcement, rendered centered.
    Announcement,
    Assistant,
}

/// Events sent from the satellite to the front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Phase(Phase),
    ErrorBar(bool),
    StartButton { visible: bool, reason: Option<String> },
    Overlay { overlay: Overlay, visible: bool },
    Transcript(String),
    ResponseDelta(String),
    Response(String),
    Message { text: String, style: MessageStyle },
    ChatCleared,
    AnnouncementMode(bool),
    /// Running voice timers, re-sent on every change and once a second.
    Timers(Vec<TimerView>),
    TimerAlert(bool),
}

/// Front-end surface. Tracks just enough to dedupe redundant events.
pub struct Ui {
    tx: Sender<AppEvent>,
    error_bar: AtomicBool,
    overlays: Mutex<HashSet<Overlay>>,
}

impl Ui {
    pub fn new(tx: Sender<AppEvent>) -> Self {
        Self {
            tx,
            error_bar: AtomicBool::new(false),
            overlays: Mutex::new(HashSet::new()),
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn phase(&self, phase: Phase) {
        self.emit(AppEvent::Phase(phase));
    }

    pub fn show_error_bar(&self) {
        if !self.error_bar.swap(true, Ordering::SeqCst) {
            self.emit(AppEvent::ErrorBar(true));
        }
    }

    pub fn clear_error_bar(&self) {
        if self.error_bar.swap(false, Ordering::SeqCst) {
            self.emit(AppEvent::ErrorBar(false));
        }
    }

    pub fn error_bar_visible(&self) -> bool {
        self.error_bar.load(Ordering::SeqCst)
    }

    pub fn show_overlay(&self, overlay: Overlay) {
        if lock(&self.overlays).insert(overlay) {
            self.emit(AppEvent::Overlay { overlay, visible: true });
        }
    }

    pub fn hide_overlay(&self, overlay: Overlay) {
        if lock(&self.overlays).remove(&overlay) {
            self.emit(AppEvent::Overlay { overlay, visible: false });
        }
    }

    pub fn overlay_visible(&self, overlay: Overlay) -> bool {
        lock(&self.overlays).contains(&overlay)
    }

    pub fn show_start_button(&self, reason: Option<&str>) {
        self.emit(AppEvent::StartButton {
            visible: true,
            reason: reason.map(str::to_string),
        });
    }

    pub fn hide_start_button(&self) {
        self.emit(AppEvent::StartButton {
            visible: false,
            reason: None,
        });
    }

    pub fn show_transcript(&self, text: &str) {
        self.emit(AppEvent::Transcript(text.to_string()));
    }

    pub fn update_response(&self, text: &str) {
        self.emit(AppEvent::ResponseDelta(text.to_string()));
    }

    pub fn show_response(&self, text: &str) {
        self.emit(AppEvent::Response(text.to_string()));
    }

    pub fn add_message(&self, text: &str, style: MessageStyle) {
        self.emit(AppEvent::Message {
            text: text.to_string(),
            style,
        });
    }

    pub fn clear_chat(&self) {
        self.emit(AppEvent::ChatCleared);
    }

    pub fn set_announcement_mode(&self, on: bool) {
        self.emit(AppEvent::AnnouncementMode(on));
    }

    pub fn show_timers(&self, timers: Vec<TimerView>) {
        self.emit(AppEvent::Timers(timers));
    }

    pub fn set_timer_alert(&self, on: bool) {
        self.emit(AppEvent::TimerAlert(on));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn interacting_phases() {
        assert!(Phase::Tts.is_interacting());
        assert!(!Phase::Tts.is_capturing());
        assert!(Phase::Stt.is_capturing());
        assert!(!Phase::Listening.is_interacting());
        assert_eq!(Phase::WakeWordDetected.as_str(), "WAKE_WORD_DETECTED");
    }

    #[test]
    fn overlay_and_error_bar_events_are_deduped() {
        let (tx, rx) = mpsc::channel();
        let ui = Ui::new(tx);
        ui.show_error_bar();
        ui.show_error_bar();
        ui.hide_overlay(Overlay::Pipeline);
        ui.show_overlay(Overlay::Pipeline);
        ui.clear_error_bar();
        let events: Vec<AppEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                AppEvent::ErrorBar(true),
                AppEvent::Overlay {
                    overlay: Overlay::Pipeline,
                    visible: true
                },
                AppEvent::ErrorBar(false),
            ]
        );
        assert!(ui.overlay_visible(Overlay::Pipeline));
    }
}
