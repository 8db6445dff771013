//! The satellite event subscription that carries notifications and media
//! commands. Failed subscribes retry with a capped backoff; an epoch counter
//! retires results from subscriptions that were torn down mid-flight.

use crate::connection::commands;
use crate::satellite::Satellite;
use crate::timer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_millis(2000),
    Duration::from_millis(4000),
    Duration::from_millis(8000),
    Duration::from_millis(16_000),
    Duration::from_millis(30_000),
];

#[derive(Debug, Default)]
pub(crate) struct SubscriptionState {
    enabled: bool,
    subscribed: bool,
    epoch: u64,
    id: Option<u64>,
    retry_timer: Option<JoinHandle<()>>,
    retry_count: usize,
}

impl Satellite {
    pub(crate) fn subscribe_satellite_events(self: &Arc<Self>) {
        if self.entity_id().is_empty() || !self.ownership.is_owner(self.id) {
            return;
        }
        {
            let mut s = self.notify.subscription();
            if s.subscribed {
                return;
            }
            s.enabled = true;
            s.subscribed = true;
        }
        self.do_subscribe();
    }

    fn do_subscribe(self: &Arc<Self>) {
        let epoch = self.notify.subscription().epoch;
        let sat = self.clone();
        tokio::spawn(async move {
            let message = commands::subscribe_satellite(sat.entity_id());
            let mut subscription = match sat.transport.subscribe(message).await {
                Ok(sub) => sub,
                Err(e) => {
                    let retry = {
                        let mut s = sat.notify.subscription();
                        s.subscribed = false;
                        s.epoch == epoch
                    };
                    log::error!("[satellite-notify] Failed to subscribe: {}", e);
                    if retry {
                        sat.schedule_subscription_retry();
                    }
                    return;
                }
            };
            let current = {
                let mut s = sat.notify.subscription();
                if s.epoch == epoch {
                    s.id = Some(subscription.id);
                    s.retry_count = 0;
                }
                s.epoch == epoch
            };
            if !current {
                log::debug!("[satellite-notify] Subscription outlived its epoch; dropping");
                let _ = sat.transport.unsubscribe(subscription.id).await;
                return;
            }
            log::info!("[satellite-notify] Subscribed to {}", sat.entity_id());
            while let Some(event) = subscription.events.recv().await {
                if sat.notify.subscription().epoch != epoch {
                    break;
                }
                sat.dispatch_satellite_event(event);
            }
        });
    }

    fn schedule_subscription_retry(self: &Arc<Self>) {
        let delay = {
            let mut s = self.notify.subscription();
            if timer::is_armed(&s.retry_timer) {
                return;
            }
            let delay = RETRY_DELAYS[s.retry_count.min(RETRY_DELAYS.len() - 1)];
            s.retry_count += 1;
            delay
        };
        log::info!("[satellite-notify] Retrying subscription in {}ms", delay.as_millis());
        let sat = self.clone();
        let handle = timer::after(delay, async move {
            {
                let mut s = sat.notify.subscription();
                s.retry_timer = None;
                if s.subscribed || !s.enabled {
                    return;
                }
            }
            sat.subscribe_satellite_events();
        });
        self.notify.subscription().retry_timer = Some(handle);
    }

    fn cleanup_satellite_subscription(&self) {
        let id = {
            let mut s = self.notify.subscription();
            timer::cancel(&mut s.retry_timer);
            s.retry_count = 0;
            s.epoch += 1;
            s.subscribed = false;
            s.id.take()
        };
        if let Some(id) = id {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.unsubscribe(id).await {
                    log::debug!("[satellite-notify] unsubscribe {} failed: {}", id, e);
                }
            });
        }
    }

    /// Re-subscribe, e.g. after the connection was re-established.
    pub(crate) fn refresh_satellite_subscription(self: &Arc<Self>) {
        if !self.notify.subscription().enabled {
            return;
        }
        self.cleanup_satellite_subscription();
        self.subscribe_satellite_events();
    }

    pub(crate) fn teardown_satellite_subscription(&self) {
        self.cleanup_satellite_subscription();
        self.notify.subscription().enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, settle};
    use serde_json::json;

    const SUBSCRIBE: &str = "voice_satellite/subscribe_events";

    #[tokio::test(start_paused = true)]
    async fn events_flow_until_torn_down() {
        let h = harness();
        h.sat.subscribe_satellite_events();
        h.sat.subscribe_satellite_events();
        settle().await;
        assert_eq!(h.transport.subscriptions_of(SUBSCRIBE).len(), 1);

        h.transport.emit_satellite("announcement", json!({ "id": 3, "message": "hi", "preannounce": false }));
        settle().await;
        assert!(h.sat.notify.lock().slot(crate::notify::NotificationKind::Announcement).playing);

        h.sat.teardown_satellite_subscription();
        settle().await;
        assert_eq!(h.transport.unsubscribed().len(), 1);
        h.sat.refresh_satellite_subscription();
        settle().await;
        assert_eq!(h.transport.subscriptions_of(SUBSCRIBE).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_retries_with_backoff() {
        let h = harness();
        h.transport.set_fail_subscribe(true);
        h.sat.subscribe_satellite_events();
        settle().await;
        assert_eq!(h.transport.subscriptions_of(SUBSCRIBE).len(), 1);

        tokio::time::sleep(Duration::from_millis(2010)).await;
        settle().await;
        assert_eq!(h.transport.subscriptions_of(SUBSCRIBE).len(), 2);

        h.transport.set_fail_subscribe(false);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        settle().await;
        assert_eq!(h.transport.subscriptions_of(SUBSCRIBE).len(), 2);
        tokio::time::sleep(Duration::from_millis(1010)).await;
        settle().await;
        assert_eq!(h.transport.subscriptions_of(SUBSCRIBE).len(), 3);
        assert_eq!(h.sat.notify.subscription().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_owner_does_not_subscribe() {
        let h = harness();
        h.sat.ownership.claim(crate::ownership::next_owner_id());
        h.sat.subscribe_satellite_events();
        settle().await;
        assert!(h.transport.subscriptions_of(SUBSCRIBE).is_empty());
    }
}
