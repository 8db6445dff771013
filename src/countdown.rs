//! Voice timers ("set a timer for ten minutes"). The server keeps the list
//! in the satellite entity's `active_timers` attribute; this side counts the
//! timers down, raises a chiming alert when one finishes and lets a double
//! tap dismiss it.

use crate::chime::Chime;
use crate::connection::{self, commands};
use crate::satellite::Satellite;
use crate::state::lock;
use crate::timer;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const TICK: Duration = Duration::from_millis(1000);
pub const ALERT_CHIME_INTERVAL: Duration = Duration::from_millis(3000);
pub const ALERT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
struct RawTimer {
    id: String,
    #[serde(default)]
    name: String,
    total_seconds: u64,
    /// Unix seconds. Missing means "just now".
    #[serde(default)]
    started_at: Option<f64>,
}

/// What the front-end shows for one running timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerView {
    pub id: String,
    pub name: String,
    pub seconds_left: u64,
    pub total_seconds: u64,
}

#[derive(Debug)]
struct Countdown {
    id: String,
    name: String,
    total_seconds: u64,
    started: Instant,
}

impl Countdown {
    fn view(&self, now: Instant) -> TimerView {
        let elapsed = now.saturating_duration_since(self.started).as_secs();
        TimerView {
            id: self.id.clone(),
            name: self.name.clone(),
            seconds_left: self.total_seconds.saturating_sub(elapsed),
            total_seconds: self.total_seconds,
        }
    }
}

#[derive(Debug, Default)]
struct CountdownInner {
    timers: Vec<Countdown>,
    known_ids: Vec<String>,
    /// Last `active_timers` seen, to skip unrelated attribute updates.
    last_raw: Option<String>,
    alert_active: bool,
    tick: Option<JoinHandle<()>>,
    alert_chime: Option<JoinHandle<()>>,
    alert_timeout: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct CountdownState {
    inner: Mutex<CountdownInner>,
}

/// `HH:MM:SS`.
pub fn format_time(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Wall-clock seconds since `started_at`, capped at the timer's length.
fn elapsed_since(started_at: Option<f64>, total_seconds: u64) -> Duration {
    let Some(started_at) = started_at else {
        return Duration::ZERO;
    };
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let elapsed = (now - started_at).max(0.0).floor() as u64;
    Duration::from_secs(elapsed.min(total_seconds))
}

fn parse_timers(raw: &Value) -> Vec<RawTimer> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<RawTimer>(item.clone()) {
            Ok(timer) => Some(timer),
            Err(e) => {
                log::debug!("[timer] Skipping malformed timer {}: {}", item, e);
                None
            }
        })
        .collect()
}

impl Satellite {
    pub(crate) fn timer_alert_active(&self) -> bool {
        lock(&self.countdown.inner).alert_active
    }

    pub fn voice_timers(&self) -> Vec<TimerView> {
        let now = Instant::now();
        lock(&self.countdown.inner)
            .timers
            .iter()
            .map(|t| t.view(now))
            .collect()
    }

    /// Reconcile with the satellite entity's timer attributes. A timer that
    /// disappears while `last_timer_event` is `finished` raises the alert;
    /// any other removal is silent.
    pub(crate) fn sync_voice_timers(self: &Arc<Self>) {
        let attributes = self
            .entities
            .state_of(self.entity_id())
            .map(|s| s.attributes)
            .unwrap_or_default();
        let raw = attributes.get("active_timers").cloned().unwrap_or(Value::Null);
        let raw = if raw.is_array() { raw } else { Value::Array(Vec::new()) };
        let raw_json = raw.to_string();
        let last_event = attributes
            .get("last_timer_event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let finished = {
            let mut c = lock(&self.countdown.inner);
            if c.last_raw.as_deref() == Some(raw_json.as_str()) {
                return;
            }
            log::debug!("[timer] State changed: timers={} last_event={}", raw_json, last_event);
            c.last_raw = Some(raw_json);

            let incoming = parse_timers(&raw);
            let removed: Vec<String> = c
                .known_ids
                .iter()
                .filter(|id| !incoming.iter().any(|t| &t.id == *id))
                .cloned()
                .collect();
            c.known_ids = incoming.iter().map(|t| t.id.clone()).collect();

            let now = Instant::now();
            let previous = std::mem::take(&mut c.timers);
            c.timers = incoming
                .into_iter()
                .map(|item| {
                    let kept = previous
                        .iter()
                        .find(|t| t.id == item.id && t.total_seconds == item.total_seconds)
                        .map(|t| t.started);
                    let started = kept.unwrap_or_else(|| {
                        let elapsed = elapsed_since(item.started_at, item.total_seconds);
                        now.checked_sub(elapsed).unwrap_or(now)
                    });
                    Countdown {
                        id: item.id,
                        name: item.name,
                        total_seconds: item.total_seconds,
                        started,
                    }
                })
                .collect();
            if c.timers.is_empty() {
                timer::cancel(&mut c.tick);
            }
            !removed.is_empty() && last_event == "finished"
        };

        if finished {
            log::info!("[timer] Timer finished");
            self.show_timer_alert();
        }
        self.ui.show_timers(self.voice_timers());
        self.start_countdown_tick();
    }

    fn start_countdown_tick(self: &Arc<Self>) {
        let mut c = lock(&self.countdown.inner);
        if c.timers.is_empty() || timer::is_armed(&c.tick) {
            return;
        }
        let sat = self.clone();
        c.tick = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sat.ui.show_timers(sat.voice_timers());
            }
        }));
    }

    fn show_timer_alert(self: &Arc<Self>) {
        {
            let mut c = lock(&self.countdown.inner);
            if c.alert_active {
                log::debug!("[timer] Alert already active");
                return;
            }
            c.alert_active = true;
        }
        self.ui.set_timer_alert(true);

        let sat = self.clone();
        let chime = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALERT_CHIME_INTERVAL);
            loop {
                ticker.tick().await;
                sat.play_chime(Chime::Alert);
            }
        });
        let sat = self.clone();
        let timeout = timer::after(ALERT_TIMEOUT, async move {
            log::info!("[timer] Alert timed out");
            sat.clear_timer_alert();
        });
        let mut c = lock(&self.countdown.inner);
        timer::cancel(&mut c.alert_chime);
        timer::cancel(&mut c.alert_timeout);
        c.alert_chime = Some(chime);
        c.alert_timeout = Some(timeout);
    }

    /// Silence the alert and drop the countdowns it was shown over.
    pub(crate) fn clear_timer_alert(&self) {
        {
            let mut c = lock(&self.countdown.inner);
            if !c.alert_active {
                return;
            }
            c.alert_active = false;
            timer::cancel(&mut c.alert_chime);
            timer::cancel(&mut c.alert_timeout);
            timer::cancel(&mut c.tick);
            c.timers.clear();
        }
        self.ui.set_timer_alert(false);
        self.ui.show_timers(Vec::new());
        log::info!("[timer] Alert dismissed");
    }

    pub(crate) fn dismiss_timer_alert(self: &Arc<Self>) {
        self.play_chime(Chime::Done);
        self.clear_timer_alert();
    }

    /// Cancel a running timer on the server and drop it locally right away.
    pub fn cancel_voice_timer(self: &Arc<Self>, timer_id: &str) -> bool {
        let remaining = {
            let mut c = lock(&self.countdown.inner);
            let before = c.timers.len();
            c.timers.retain(|t| t.id != timer_id);
            if c.timers.len() == before {
                return false;
            }
            c.known_ids.retain(|id| id != timer_id);
            c.last_raw = None;
            if c.timers.is_empty() {
                timer::cancel(&mut c.tick);
            }
            c.timers.len()
        };
        log::info!("[timer] Cancelling timer {} ({} left)", timer_id, remaining);
        connection::send_and_forget(
            &self.transport,
            commands::cancel_timer(self.entity_id(), timer_id),
            "timer",
        );
        self.play_chime(Chime::Done);
        self.ui.show_timers(self.voice_timers());
        true
    }

    pub(crate) fn reset_voice_timers(&self) {
        self.clear_timer_alert();
        let mut c = lock(&self.countdown.inner);
        timer::cancel(&mut c.tick);
        c.timers.clear();
        c.known_ids.clear();
        c.last_raw = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_state::state;
    use crate::testing::{harness, settle, Harness};
    use serde_json::json;

    fn watched() -> Harness {
        let h = harness();
        h.sat.ensure_entity_watcher();
        h
    }

    async fn satellite_attributes(h: &Harness, attributes: Value) {
        h.entities
            .set_state(state("assist_satellite.kitchen", "idle", attributes));
        settle().await;
    }

    fn pasta() -> Value {
        json!({ "id": "t1", "name": "pasta", "total_seconds": 300 })
    }

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_time(0), "00:00:00");
        assert_eq!(format_time(299), "00:04:59");
        assert_eq!(format_time(3725), "01:02:05");
    }

    #[test]
    fn malformed_timers_are_skipped() {
        let parsed = parse_timers(&json!([pasta(), { "name": "no id" }]));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "t1");
        assert!(parse_timers(&json!("nope")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timers_count_down_from_the_entity() {
        let h = watched();
        satellite_attributes(&h, json!({ "active_timers": [pasta()] })).await;
        let timers = h.sat.voice_timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].name, "pasta");
        assert_eq!(timers[0].seconds_left, 300);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(h.sat.voice_timers()[0].seconds_left, 298);
        let ticks = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, crate::state::AppEvent::Timers(t) if !t.is_empty()))
            .count();
        assert!(ticks >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_goes_away_quietly() {
        let h = watched();
        satellite_attributes(&h, json!({ "active_timers": [pasta()] })).await;
        satellite_attributes(
            &h,
            json!({ "active_timers": [], "last_timer_event": "cancelled" }),
        )
        .await;
        assert!(h.sat.voice_timers().is_empty());
        assert!(!h.sat.timer_alert_active());
        assert!(h.player.chimes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_timer_chimes_until_double_tap() {
        let h = watched();
        satellite_attributes(&h, json!({ "active_timers": [pasta()] })).await;
        satellite_attributes(
            &h,
            json!({ "active_timers": [], "last_timer_event": "finished" }),
        )
        .await;
        assert!(h.sat.timer_alert_active());
        assert_eq!(h.player.chimes(), vec![Chime::Alert]);

        tokio::time::sleep(ALERT_CHIME_INTERVAL + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(h.player.chimes(), vec![Chime::Alert, Chime::Alert]);

        assert!(!h.sat.tap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.sat.tap());
        settle().await;
        assert!(!h.sat.timer_alert_active());
        assert_eq!(h.player.chimes().last(), Some(&Chime::Done));
        assert!(h.events().contains(&crate::state::AppEvent::TimerAlert(false)));

        let chimes = h.player.chimes().len();
        tokio::time::sleep(ALERT_CHIME_INTERVAL * 2).await;
        settle().await;
        assert_eq!(h.player.chimes().len(), chimes);
        assert_eq!(h.transport.subscriptions_of("voice_satellite/run_pipeline").len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_alert_times_out() {
        let h = watched();
        satellite_attributes(&h, json!({ "active_timers": [pasta()] })).await;
        satellite_attributes(
            &h,
            json!({ "active_timers": [], "last_timer_event": "finished" }),
        )
        .await;
        tokio::time::sleep(ALERT_TIMEOUT + Duration::from_millis(10)).await;
        settle().await;
        assert!(!h.sat.timer_alert_active());
        assert!(!h.player.chimes().contains(&Chime::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_sends_the_timer_id() {
        let h = watched();
        satellite_attributes(&h, json!({ "active_timers": [pasta()] })).await;
        assert!(h.sat.cancel_voice_timer("t1"));
        assert!(!h.sat.cancel_voice_timer("t1"));
        settle().await;
        let calls = h.transport.calls_of("voice_satellite/cancel_timer");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["timer_id"], "t1");
        assert_eq!(calls[0]["entity_id"], "assist_satellite.kitchen");
        assert!(h.sat.voice_timers().is_empty());
        assert_eq!(h.player.chimes(), vec![Chime::Done]);

        // The server's own removal afterwards raises nothing.
        satellite_attributes(
            &h,
            json!({ "active_timers": [], "last_timer_event": "cancelled" }),
        )
        .await;
        assert!(!h.sat.timer_alert_active());
    }
}
