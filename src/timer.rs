use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Run `action` after `delay`. Aborting the handle before the delay elapses
/// cancels it; once fired, the action runs detached and is not affected.
pub fn after<F>(delay: Duration, action: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        tokio::spawn(action);
    })
}

/// Cancel the timer held in `slot`, if any.
pub fn cancel(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

/// True while the timer in `slot` has not fired yet.
pub fn is_armed(slot: &Option<JoinHandle<()>>) -> bool {
    slot.as_ref().is_some_and(|h| !h.is_finished())
}
