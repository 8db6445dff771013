//! The satellite instance: shared state plus lifecycle glue. Pipeline,
//! notification, playback and visibility behaviour live in their own modules
//! as further `impl Satellite` blocks.

use crate::audio::{AudioTransport, CaptureOptions, Microphone};
use crate::cancel::CancelState;
use crate::chime::Chime;
use crate::connection::commands::{self, RunOptions};
use crate::connection::{self, Transport};
use crate::countdown::CountdownState;
use crate::entity_state::EntityStates;
use crate::error::{Result, SatelliteError};
use crate::media_player::MediaPlayerState;
use crate::notify::{NotificationKind, NotifyState};
use crate::ownership::{next_owner_id, OwnerId, OwnershipArbiter, StartBlocked};
use crate::pipeline::{ContinueOptions, PipelineState};
use crate::playback::Player;
use crate::settings::Settings;
use crate::state::{lock, AppEvent, Overlay, Phase, Ui};
use crate::timer;
use crate::tts::TtsState;
use crate::visibility::VisibilityState;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// External collaborators a satellite is built from.
pub struct SatelliteParts {
    pub settings: Settings,
    pub transport: Arc<dyn Transport>,
    pub player: Arc<dyn Player>,
    pub microphone: Arc<dyn Microphone>,
    pub entities: Arc<EntityStates>,
    pub ownership: Arc<OwnershipArbiter>,
    pub events: Sender<AppEvent>,
}

#[derive(Debug)]
struct PhaseState {
    current: Phase,
    last_synced: Option<Phase>,
}

pub struct Satellite {
    pub(crate) id: OwnerId,
    pub(crate) settings: Settings,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) player: Arc<dyn Player>,
    pub(crate) microphone: Arc<dyn Microphone>,
    pub(crate) entities: Arc<EntityStates>,
    pub(crate) ownership: Arc<OwnershipArbiter>,
    pub(crate) ui: Ui,
    pub(crate) audio: Arc<AudioTransport>,
    pub(crate) pipeline: PipelineState,
    pub(crate) tts: TtsState,
    pub(crate) media: MediaPlayerState,
    pub(crate) notify: NotifyState,
    pub(crate) visibility: VisibilityState,
    pub(crate) cancel: CancelState,
    pub(crate) countdown: CountdownState,
    phase: Mutex<PhaseState>,
    reconnect_listener: Mutex<Option<JoinHandle<()>>>,
    entity_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Satellite {
    pub fn new(parts: SatelliteParts) -> Arc<Self> {
        let audio = Arc::new(AudioTransport::new(parts.transport.clone()));
        Arc::new(Self {
            id: next_owner_id(),
            settings: parts.settings,
            transport: parts.transport,
            player: parts.player,
            microphone: parts.microphone,
            entities: parts.entities,
            ownership: parts.ownership,
            ui: Ui::new(parts.events),
            audio,
            pipeline: PipelineState::default(),
            tts: TtsState::default(),
            media: MediaPlayerState::default(),
            notify: NotifyState::default(),
            visibility: VisibilityState::default(),
            cancel: CancelState::default(),
            countdown: CountdownState::default(),
            phase: Mutex::new(PhaseState {
                current: Phase::Idle,
                last_synced: None,
            }),
            reconnect_listener: Mutex::new(None),
            entity_watcher: Mutex::new(None),
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.settings.satellite_entity
    }

    pub fn phase(&self) -> Phase {
        lock(&self.phase).current
    }

    /// Record the phase, update the UI and mirror it to the server. While
    /// TTS is still audible, falling back to listening or idle is not
    /// mirrored so the server keeps showing the response.
    pub(crate) fn set_state(&self, phase: Phase) {
        let old = {
            let mut p = lock(&self.phase);
            std::mem::replace(&mut p.current, phase)
        };
        log::debug!("[state] {} -> {}", old.as_str(), phase.as_str());
        self.ui.phase(phase);
        if self.tts_is_playing() && matches!(phase, Phase::Listening | Phase::Idle) {
            return;
        }
        self.sync_state(phase);
    }

    /// Set the phase locally without mirroring it.
    pub(crate) fn set_phase_silently(&self, phase: Phase) {
        lock(&self.phase).current = phase;
        self.ui.phase(phase);
    }

    pub(crate) fn sync_state(&self, phase: Phase) {
        {
            let mut p = lock(&self.phase);
            if p.last_synced == Some(phase) {
                return;
            }
            p.last_synced = Some(phase);
        }
        if self.entity_id().is_empty() {
            return;
        }
        connection::send_and_forget(
            &self.transport,
            commands::update_state(self.entity_id(), phase.as_str()),
            "state",
        );
    }

    pub(crate) fn media_url(&self, path: &str) -> String {
        connection::media_url(&self.transport.base_url(), path)
    }

    fn capture_options(&self) -> CaptureOptions {
        let device = self.settings.mic_device.trim();
        CaptureOptions {
            device: (!device.is_empty()).then(|| device.to_string()),
            noise_suppression: self.settings.noise_suppression,
            echo_cancellation: self.settings.echo_cancellation,
            auto_gain_control: self.settings.auto_gain_control,
            voice_isolation: self.settings.voice_isolation,
        }
    }

    /// Acquire the microphone, start the pipeline and claim ownership.
    pub async fn start_listening(self: &Arc<Self>) {
        let _guard = match self.ownership.begin_start(self.id) {
            Ok(guard) => guard,
            Err(StartBlocked::OtherOwner) => {
                log::info!("[satellite] another instance owns the satellite");
                return;
            }
            Err(StartBlocked::AlreadyStarting) => {
                log::debug!("[satellite] start already in progress");
                return;
            }
        };

        self.set_state(Phase::Connecting);
        match self.acquire_and_start().await {
            Ok(()) => {
                self.ownership.claim(self.id);
                self.ui.hide_start_button();
                self.subscribe_satellite_events();
                self.ensure_entity_watcher();
            }
            Err(e) => {
                log::error!("[satellite] Failed to start: {}", e);
                self.set_state(Phase::Idle);
                match &e {
                    SatelliteError::Device(device) => match device.start_reason() {
                        Some(reason) => self.ui.show_start_button(Some(reason)),
                        None => {
                            let delay = self.next_retry_delay();
                            self.restart(delay);
                        }
                    },
                    SatelliteError::Config(_) => {
                        self.ui.show_error_bar();
                        self.ui.show_start_button(None);
                    }
                    _ => {
                        let delay = self.next_retry_delay();
                        self.restart(delay);
                    }
                }
            }
        }
    }

    async fn acquire_and_start(self: &Arc<Self>) -> Result<()> {
        self.microphone
            .start(&self.capture_options(), self.audio.clone())
            .await?;
        self.start_pipeline(RunOptions::default()).await
    }

    /// TTS playback ended. Either continue the conversation or settle to idle
    /// and let queued notifications play.
    pub(crate) fn on_tts_complete(self: &Arc<Self>, failed: bool) {
        let phase = self.phase();
        if phase.is_capturing() {
            log::debug!(
                "[tts] complete but a new interaction is in progress ({})",
                phase.as_str()
            );
            return;
        }

        if !failed {
            if let Some(conversation_id) = self.take_continuation() {
                log::info!("[tts] continuing conversation {}", conversation_id);
                self.restart_continue(Some(conversation_id), ContinueOptions::default());
                return;
            }
        }

        // Nothing was heard, so no done chime. A remote speaker is out of
        // earshot of the local chime.
        if !failed && self.entities.wake_sound_enabled() && self.tts_target().is_none() {
            self.play_chime(Chime::Done);
        }
        self.ui.clear_chat();
        self.ui.hide_overlay(Overlay::Pipeline);
        self.sync_state(Phase::Idle);

        self.play_queued(NotificationKind::Announcement);
        self.play_queued(NotificationKind::AskQuestion);
        self.play_queued(NotificationKind::StartConversation);
    }

    /// Another client took over the satellite entity.
    pub(crate) fn handle_displaced(self: &Arc<Self>) {
        log::warn!("[satellite] Displaced by another client; releasing the microphone");
        let (_, subscription) = self.halt_pipeline();
        if let Some(id) = subscription {
            self.detach_subscription(id);
        }
        self.microphone.stop();
        self.audio.clear();
        self.stop_tts();
        self.teardown_satellite_subscription();
        self.reset_voice_timers();
        self.ui.clear_chat();
        self.ui.hide_overlay(Overlay::Pipeline);
        self.ui.hide_overlay(Overlay::Announcement);
        self.ownership.release();
        self.set_phase_silently(Phase::Idle);
        self.ui.show_start_button(None);
    }

    /// Install the once-per-instance handler for connection re-establishment.
    pub(crate) fn ensure_reconnect_listener(self: &Arc<Self>) {
        let mut slot = lock(&self.reconnect_listener);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut ready = self.transport.ready();
        *slot = Some(tokio::spawn(async move {
            loop {
                match ready.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                let Some(sat) = weak.upgrade() else { break };
                sat.on_reconnected();
            }
        }));
    }

    /// Follow entity state changes: voice timers on the satellite entity and
    /// the remote speaker while it plays a response.
    pub(crate) fn ensure_entity_watcher(self: &Arc<Self>) {
        let mut slot = lock(&self.entity_watcher);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut changes = self.entities.changes();
        *slot = Some(tokio::spawn(async move {
            loop {
                let changed = match changes.recv().await {
                    Ok(entity_id) => Some(entity_id),
                    Err(RecvError::Lagged(missed)) => {
                        log::debug!("[entities] Missed {} changes; re-reading", missed);
                        None
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(sat) = weak.upgrade() else { break };
                match changed {
                    Some(entity_id) => sat.on_entity_changed(&entity_id),
                    None => {
                        sat.sync_voice_timers();
                        if let Some(target) = sat.remote_tts_entity() {
                            sat.check_remote_playback(&target);
                        }
                    }
                }
            }
        }));
        drop(slot);
        self.sync_voice_timers();
    }

    fn on_entity_changed(self: &Arc<Self>, entity_id: &str) {
        if entity_id == self.entity_id() {
            self.sync_voice_timers();
        }
        self.check_remote_playback(entity_id);
    }

    fn on_reconnected(self: &Arc<Self>) {
        log::info!("[satellite] Connection re-established");
        self.reset_retry_state();
        self.ui.clear_error_bar();
        self.refresh_satellite_subscription();
        if self.is_paused() {
            log::info!("[satellite] Paused; restart deferred until visible");
            return;
        }
        let sat = self.clone();
        let handle = timer::after(RECONNECT_DELAY, async move {
            sat.pipeline.lock().reconnect_timer = None;
            if sat.is_paused() {
                log::info!("[satellite] Paused; restart deferred until visible");
                return;
            }
            sat.restart(Duration::ZERO);
        });
        let mut p = self.pipeline.lock();
        timer::cancel(&mut p.reconnect_timer);
        p.reconnect_timer = Some(handle);
    }

    pub async fn shutdown(self: &Arc<Self>) {
        self.stop_pipeline().await;
        self.microphone.stop();
        self.stop_tts();
        self.teardown_satellite_subscription();
        self.reset_voice_timers();
        for slot in [&self.reconnect_listener, &self.entity_watcher] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
        self.ownership.release();
        log::info!("[satellite] stopped");
    }
}
