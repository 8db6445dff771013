//! Generation-tagged pipeline session: start, stop, restart with backoff and
//! conversation continuation.

pub mod events;
pub mod generation;

use crate::connection::commands::{self, RunOptions, Stage};
use crate::error::{Result, SatelliteError};
use crate::satellite::Satellite;
use crate::state::{lock, Overlay, Phase};
use crate::timer;
use generation::{Generation, GenerationToken};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const RETRY_BASE: Duration = Duration::from_millis(5000);
pub const MAX_RETRY: Duration = Duration::from_millis(30_000);
pub const MUTE_POLL: Duration = Duration::from_millis(2000);
pub const TOKEN_REFRESH: Duration = Duration::from_millis(240_000);
pub const INTENT_ERROR_DISPLAY: Duration = Duration::from_millis(3000);

/// One-shot destination for a speech-to-text result. Whichever of the
/// pipeline, an error path or a safety timeout resolves it first wins.
#[derive(Debug, Clone)]
pub struct AnswerSlot(Arc<Mutex<Option<oneshot::Sender<String>>>>);

impl AnswerSlot {
    pub fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    pub fn resolve(&self, text: &str) -> bool {
        match lock(&self.0).take() {
            Some(tx) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContinueOptions {
    pub end_stage: Stage,
    pub extra_system_prompt: Option<String>,
    pub on_stt_end: Option<AnswerSlot>,
}

impl Default for ContinueOptions {
    fn default() -> Self {
        Self {
            end_stage: Stage::Tts,
            extra_system_prompt: None,
            on_stt_end: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct PipelineInner {
    pub subscription: Option<u64>,
    pub restarting: bool,
    pub restart_timer: Option<JoinHandle<()>>,
    pub retry_count: u32,
    pub service_unavailable: bool,
    pub run_start_received: bool,
    pub wake_word_phase: bool,
    pub error_received: bool,
    pub continue_mode: bool,
    pub ask_handled: bool,
    pub ask_callback: Option<AnswerSlot>,
    pub suppress_tts: bool,
    pub pending_run_end: bool,
    pub streamed_response: String,
    /// Conversation to resume once TTS finishes.
    pub continuation: Option<String>,
    pub mute_timer: Option<JoinHandle<()>>,
    pub token_refresh: Option<JoinHandle<()>>,
    pub recovery_timer: Option<JoinHandle<()>>,
    pub reconnect_timer: Option<JoinHandle<()>>,
    pub intent_error_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct PipelineState {
    pub generation: Generation,
    init_waiter: Mutex<Option<oneshot::Sender<u8>>>,
    inner: Mutex<PipelineInner>,
}

impl PipelineState {
    pub fn lock(&self) -> MutexGuard<'_, PipelineInner> {
        lock(&self.inner)
    }

    fn take_init_waiter(&self) -> Option<oneshot::Sender<u8>> {
        lock(&self.init_waiter).take()
    }
}

impl Satellite {
    /// Open a pipeline run and wait for its handler id before streaming audio.
    pub(crate) async fn start_pipeline(self: &Arc<Self>, options: RunOptions) -> Result<()> {
        if self.entity_id().is_empty() {
            return Err(SatelliteError::Config("no satellite entity configured".into()));
        }
        if !self.transport.is_connected() {
            return Err(SatelliteError::NotConnected);
        }

        timer::cancel(&mut self.pipeline.lock().mute_timer);
        if self.entities.is_muted() {
            log::info!("[pipeline] Satellite muted; polling again shortly");
            self.ui.show_error_bar();
            self.poll_mute(options);
            return Ok(());
        }
        self.open_run(options).await
    }

    /// Re-check the mute switch until it clears, then open the run. A stop
    /// in the meantime aborts the poll.
    fn poll_mute(self: &Arc<Self>, options: RunOptions) {
        let token = self.pipeline.generation.current();
        let sat = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(MUTE_POLL).await;
                if !sat.pipeline.generation.is_current(token) {
                    return;
                }
                if !sat.entities.is_muted() {
                    break;
                }
                log::debug!("[pipeline] Still muted");
            }
            sat.pipeline.lock().mute_timer = None;
            tokio::spawn(async move {
                if !sat.transport.is_connected() {
                    log::debug!("[pipeline] Unmuted while disconnected; waiting for reconnect");
                    return;
                }
                if let Err(e) = sat.open_run(options).await {
                    log::debug!("[pipeline] start after mute poll failed: {}", e);
                }
            });
        });
        self.pipeline.lock().mute_timer = Some(handle);
    }

    async fn open_run(self: &Arc<Self>, options: RunOptions) -> Result<()> {
        let token = self.pipeline.generation.current();
        self.ui.clear_error_bar();

        let previous = self.pipeline.lock().subscription.take();
        if let Some(id) = previous {
            log::debug!("[pipeline] Cleaning up previous subscription");
            self.close_subscription(id).await;
            if !self.pipeline.generation.is_current(token) {
                log::debug!("[pipeline] Stale start after cleanup (gen {})", token);
                return Ok(());
            }
        }

        self.audio.set_handler_id(None);
        self.ensure_reconnect_listener();
        self.pipeline.lock().run_start_received = false;

        let (init_tx, init_rx) = oneshot::channel();
        *lock(&self.pipeline.init_waiter) = Some(init_tx);

        let message = commands::run_pipeline(self.entity_id(), &options);
        log::info!(
            "[pipeline] Starting pipeline {} -> {}",
            options.start_stage.as_str(),
            options.end_stage.as_str()
        );
        let subscription = match self.transport.subscribe(message).await {
            Ok(sub) => sub,
            Err(e) => {
                if self.pipeline.generation.is_current(token) {
                    self.pipeline.take_init_waiter();
                }
                return Err(e);
            }
        };

        if !self.pipeline.generation.is_current(token) {
            log::debug!("[pipeline] Stale start after subscribe (gen {})", token);
            self.detach_subscription(subscription.id);
            return Ok(());
        }
        self.pipeline.lock().subscription = Some(subscription.id);
        self.spawn_run_reader(token, subscription.events);

        let init_timeout = self.settings.init_timeout_secs;
        let handler = if init_timeout == 0 {
            init_rx.await.ok()
        } else {
            match tokio::time::timeout(Duration::from_secs(init_timeout), init_rx).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    if self.pipeline.generation.is_current(token) {
                        self.pipeline.take_init_waiter();
                        return Err(SatelliteError::Timeout("pipeline init"));
                    }
                    None
                }
            }
        };

        if !self.pipeline.generation.is_current(token) {
            log::debug!("[pipeline] Stale start after init (gen {})", token);
            let sub = {
                let mut p = self.pipeline.lock();
                if p.subscription == Some(subscription.id) {
                    p.subscription.take()
                } else {
                    None
                }
            };
            if let Some(id) = sub {
                self.detach_subscription(id);
            }
            return Ok(());
        }
        let Some(handler) = handler else {
            return Err(SatelliteError::Closed);
        };

        log::info!("[pipeline] Handler id {} confirmed; streaming audio", handler);
        self.audio.clear();
        self.audio.start_sending();
        Ok(())
    }

    fn spawn_run_reader(
        self: &Arc<Self>,
        token: GenerationToken,
        mut events: mpsc::UnboundedReceiver<Value>,
    ) {
        let sat = self.clone();
        tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                if !sat.pipeline.generation.is_current(token) {
                    log::debug!("[pipeline] Dropping event from stale run (gen {})", token);
                    continue;
                }
                if message["type"] == "init" {
                    let handler = message["handler_id"]
                        .as_u64()
                        .and_then(|v| u8::try_from(v).ok());
                    match handler {
                        Some(id) => {
                            sat.audio.set_handler_id(Some(id));
                            if let Some(tx) = sat.pipeline.take_init_waiter() {
                                let _ = tx.send(id);
                            }
                        }
                        None => {
                            log::error!("[pipeline] init without a usable handler_id");
                            sat.pipeline.take_init_waiter();
                        }
                    }
                    continue;
                }
                sat.on_pipeline_message(message);
            }
            if sat.pipeline.generation.is_current(token) {
                sat.pipeline.take_init_waiter();
            }
        });
    }

    /// Synchronous half of stop: invalidate the generation, unblock a parked
    /// start and stop streaming. Returns the subscription left to close.
    pub(crate) fn halt_pipeline(&self) -> (GenerationToken, Option<u64>) {
        let token = self.pipeline.generation.bump();
        log::debug!("[pipeline] stop (gen {})", token);
        self.pipeline.take_init_waiter();
        self.audio.stop_sending();
        self.audio.set_handler_id(None);
        let mut p = self.pipeline.lock();
        timer::cancel(&mut p.token_refresh);
        timer::cancel(&mut p.mute_timer);
        timer::cancel(&mut p.reconnect_timer);
        // An answer slot belongs to the run it was installed for.
        p.ask_callback = None;
        p.ask_handled = false;
        (token, p.subscription.take())
    }

    pub(crate) async fn stop_pipeline(&self) -> GenerationToken {
        let (token, subscription) = self.halt_pipeline();
        if let Some(id) = subscription {
            self.close_subscription(id).await;
        }
        token
    }

    pub(crate) async fn close_subscription(&self, id: u64) {
        if let Err(e) = self.transport.unsubscribe(id).await {
            log::debug!("[pipeline] unsubscribe {} failed: {}", id, e);
        }
    }

    pub(crate) fn detach_subscription(self: &Arc<Self>, id: u64) {
        let sat = self.clone();
        tokio::spawn(async move { sat.close_subscription(id).await });
    }

    /// Stop, then start a fresh wake-word run after `delay`. Re-entrant calls
    /// while a restart is pending are ignored.
    pub(crate) fn restart(self: &Arc<Self>, delay: Duration) {
        {
            let mut p = self.pipeline.lock();
            if p.restarting {
                log::debug!("[pipeline] Restart already in progress; skipping");
                return;
            }
            p.restarting = true;
            timer::cancel(&mut p.restart_timer);
        }
        let (token, subscription) = self.halt_pipeline();
        log::debug!("[pipeline] Restarting in {}ms", delay.as_millis());
        // Released outside the timer; a cancelled restart must not leak the run.
        if let Some(id) = subscription {
            self.detach_subscription(id);
        }

        let sat = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(async move {
                if !sat.pipeline.generation.is_current(token) {
                    log::debug!("[pipeline] Restart superseded (gen {})", token);
                    return;
                }
                {
                    let mut p = sat.pipeline.lock();
                    p.restart_timer = None;
                    p.restarting = false;
                }
                if let Err(e) = sat.start_pipeline(RunOptions::default()).await {
                    sat.on_restart_failed(e);
                }
            });
        });
        self.pipeline.lock().restart_timer = Some(handle);
    }

    fn on_restart_failed(self: &Arc<Self>, err: SatelliteError) {
        log::error!("[pipeline] Restart failed: {}", err);
        let first_failure = {
            let mut p = self.pipeline.lock();
            !std::mem::replace(&mut p.service_unavailable, true)
        };
        if first_failure {
            self.ui.show_error_bar();
        }
        self.set_state(Phase::Error);
        if err.is_config() {
            return;
        }
        let delay = self.next_retry_delay();
        self.restart(delay);
    }

    /// Restart straight into speech-to-text, optionally resuming a conversation.
    pub(crate) fn restart_continue(
        self: &Arc<Self>,
        conversation_id: Option<String>,
        options: ContinueOptions,
    ) {
        {
            let mut p = self.pipeline.lock();
            if p.restarting {
                log::debug!("[pipeline] Continue skipped; restart in progress");
                return;
            }
            p.restarting = true;
        }
        let (token, subscription) = self.halt_pipeline();
        self.pipeline.lock().ask_callback = options.on_stt_end.clone();

        let sat = self.clone();
        tokio::spawn(async move {
            if let Some(id) = subscription {
                sat.close_subscription(id).await;
            }
            {
                let mut p = sat.pipeline.lock();
                p.restarting = false;
                if !sat.pipeline.generation.is_current(token) {
                    return;
                }
                p.continue_mode = true;
            }
            let run = RunOptions {
                start_stage: Stage::Stt,
                end_stage: options.end_stage,
                conversation_id,
                extra_system_prompt: options.extra_system_prompt,
            };
            if let Err(e) = sat.start_pipeline(run).await {
                log::error!("[pipeline] Continue failed: {}", e);
                sat.pipeline.lock().ask_callback = None;
                sat.ui.clear_chat();
                sat.ui.hide_overlay(Overlay::Pipeline);
                sat.restart(Duration::ZERO);
            }
        });
    }

    /// Forget restart bookkeeping left over from before a pause.
    pub(crate) fn reset_for_resume(&self) {
        let mut p = self.pipeline.lock();
        p.restarting = false;
        p.continue_mode = false;
        timer::cancel(&mut p.restart_timer);
    }

    pub(crate) fn reset_retry_state(&self) {
        let mut p = self.pipeline.lock();
        p.retry_count = 0;
        timer::cancel(&mut p.restart_timer);
        p.restarting = false;
        p.service_unavailable = false;
    }

    /// Linear backoff: 5 s per consecutive failure, capped at 30 s.
    pub(crate) fn next_retry_delay(&self) -> Duration {
        let mut p = self.pipeline.lock();
        p.retry_count += 1;
        (RETRY_BASE * p.retry_count).min(MAX_RETRY)
    }

    pub(crate) fn take_continuation(&self) -> Option<String> {
        self.pipeline.lock().continuation.take()
    }

    pub(crate) fn clear_continuation(&self) {
        self.pipeline.lock().continuation = None;
    }

    /// Refresh the run before the streaming TTS token expires.
    pub(crate) fn start_token_refresh(self: &Arc<Self>) {
        if !self.has_streaming_url() {
            return;
        }
        let sat = self.clone();
        let handle = timer::after(TOKEN_REFRESH, async move {
            sat.pipeline.lock().token_refresh = None;
            if sat.phase() == Phase::Listening {
                log::info!("[pipeline] Refreshing run before the TTS token expires");
                sat.restart(Duration::ZERO);
            }
        });
        let mut p = self.pipeline.lock();
        timer::cancel(&mut p.token_refresh);
        p.token_refresh = Some(handle);
    }

    pub(crate) fn clear_token_refresh(&self) {
        timer::cancel(&mut self.pipeline.lock().token_refresh);
    }
}
