//! Process-wide arbiter deciding which satellite instance owns the
//! microphone and the pipeline.

use crate::state::lock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type OwnerId = u64;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

pub fn next_owner_id() -> OwnerId {
    NEXT_OWNER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Default, Clone, Copy)]
struct OwnershipState {
    owner: Option<OwnerId>,
    active: bool,
    starting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlocked {
    OtherOwner,
    AlreadyStarting,
}

#[derive(Debug, Default)]
pub struct OwnershipArbiter {
    state: Mutex<OwnershipState>,
}

/// Clears the global `starting` flag when dropped.
pub struct StartGuard {
    arbiter: Arc<OwnershipArbiter>,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        lock(&self.arbiter.state).starting = false;
    }
}

impl OwnershipArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True when nobody owns the satellite yet, or `id` does.
    pub fn is_owner(&self, id: OwnerId) -> bool {
        let state = lock(&self.state);
        state.owner.is_none() || state.owner == Some(id)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    pub fn is_starting(&self) -> bool {
        lock(&self.state).starting
    }

    /// Enter the starting section. Only one instance may be starting at a time.
    pub fn begin_start(self: &Arc<Self>, id: OwnerId) -> Result<StartGuard, StartBlocked> {
        let mut state = lock(&self.state);
        if state.active && state.owner.is_some() && state.owner != Some(id) {
            return Err(StartBlocked::OtherOwner);
        }
        if state.starting {
            return Err(StartBlocked::AlreadyStarting);
        }
        state.starting = true;
        Ok(StartGuard {
            arbiter: self.clone(),
        })
    }

    pub fn claim(&self, id: OwnerId) {
        let mut state = lock(&self.state);
        state.owner = Some(id);
        state.active = true;
    }

    pub fn release(&self) {
        let mut state = lock(&self.state);
        state.owner = None;
        state.active = false;
        state.starting = false;
    }
}
