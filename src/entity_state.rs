//! Cached entity registry and states for the satellite's sibling entities
//! (mute and wake-sound switches, display-duration number, media player).
//! Every change is announced by entity id on a broadcast channel.

use crate::connection::{commands, Transport};
use crate::error::Result;
use crate::state::lock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};

const PLATFORM: &str = "voice_satellite";
const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    pub entity_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub translation_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

pub struct EntityStates {
    satellite: String,
    registry: Mutex<Vec<RegistryEntry>>,
    states: Mutex<HashMap<String, EntityState>>,
    changes: broadcast::Sender<String>,
}

impl EntityStates {
    pub fn new(satellite: &str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            satellite: satellite.to_string(),
            registry: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Ids of entities whose state changed. A lagging receiver should
    /// re-read whatever it follows.
    pub fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn announce(&self, entity_id: &str) {
        let _ = self.changes.send(entity_id.to_string());
    }

    pub fn set_registry(&self, entries: Vec<RegistryEntry>) {
        *lock(&self.registry) = entries;
    }

    pub fn set_state(&self, state: EntityState) {
        let entity_id = state.entity_id.clone();
        lock(&self.states).insert(entity_id.clone(), state);
        self.announce(&entity_id);
    }

    /// Fetch the registry and a full state snapshot.
    pub async fn load(&self, transport: &dyn Transport) -> Result<()> {
        let registry = transport.call(commands::entity_registry_list()).await?;
        let entries: Vec<RegistryEntry> = serde_json::from_value(registry)?;
        let states = transport.call(commands::get_states()).await?;
        let states: Vec<EntityState> = serde_json::from_value(states)?;
        log::info!(
            "[entities] loaded {} registry entries, {} states",
            entries.len(),
            states.len()
        );
        self.set_registry(entries);
        {
            let mut map = lock(&self.states);
            map.clear();
            for s in states {
                map.insert(s.entity_id.clone(), s);
            }
        }
        self.announce(&self.satellite);
        Ok(())
    }

    /// Apply a `state_changed` event payload.
    pub fn apply_event(&self, event: &Value) {
        let data = &event["data"];
        let Some(entity_id) = data["entity_id"].as_str() else {
            return;
        };
        match data.get("new_state") {
            Some(Value::Null) | None => {
                lock(&self.states).remove(entity_id);
                self.announce(entity_id);
            }
            Some(new_state) => match serde_json::from_value::<EntityState>(new_state.clone()) {
                Ok(state) => self.set_state(state),
                Err(e) => log::debug!("[entities] bad state for {}: {}", entity_id, e),
            },
        }
    }

    /// Keep the cache current: follow `state_changed` and reload after reconnects.
    pub fn track(self: Arc<Self>, transport: Arc<dyn Transport>) {
        tokio::spawn(async move {
            let mut ready = transport.ready();
            loop {
                match transport.subscribe(commands::subscribe_state_changes()).await {
                    Ok(mut sub) => {
                        while let Some(event) = sub.events.recv().await {
                            self.apply_event(&event);
                        }
                    }
                    Err(e) => log::warn!("[entities] state subscription failed: {}", e),
                }
                // Connection dropped or subscribe failed; wait for the next session.
                match ready.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
                if let Err(e) = self.load(transport.as_ref()).await {
                    log::warn!("[entities] reload failed: {}", e);
                }
            }
        });
    }

    fn device_id(&self) -> Option<String> {
        lock(&self.registry)
            .iter()
            .find(|e| e.entity_id == self.satellite)
            .and_then(|e| e.device_id.clone())
    }

    /// Sibling entity on the satellite's device, by translation key.
    fn sibling(&self, translation_key: &str) -> Option<String> {
        let device = self.device_id()?;
        lock(&self.registry)
            .iter()
            .find(|e| {
                e.device_id.as_deref() == Some(device.as_str())
                    && e.platform == PLATFORM
                    && e.translation_key.as_deref() == Some(translation_key)
            })
            .map(|e| e.entity_id.clone())
    }

    pub fn state_of(&self, entity_id: &str) -> Option<EntityState> {
        lock(&self.states).get(entity_id).cloned()
    }

    /// Switch state by translation key, falling back to the satellite's own
    /// attributes (`muted` for the mute switch).
    pub fn switch_state(&self, translation_key: &str) -> Option<bool> {
        if let Some(state) = self.sibling(translation_key).and_then(|id| self.state_of(&id)) {
            return Some(state.state == "on");
        }
        let attr = if translation_key == "mute" {
            "muted"
        } else {
            translation_key
        };
        self.state_of(&self.satellite)
            .and_then(|s| s.attributes.get(attr).and_then(Value::as_bool))
    }

    pub fn is_muted(&self) -> bool {
        self.switch_state("mute") == Some(true)
    }

    /// Enabled unless explicitly switched off.
    pub fn wake_sound_enabled(&self) -> bool {
        self.switch_state("wake_sound") != Some(false)
    }

    /// Entity picked by a sibling `select`, read from its `entity_id`
    /// attribute. None when unset or empty.
    pub fn selected_entity(&self, translation_key: &str) -> Option<String> {
        self.sibling(translation_key)
            .and_then(|id| self.state_of(&id))
            .and_then(|s| {
                s.attributes
                    .get("entity_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|id| !id.is_empty())
    }

    pub fn number_state(&self, translation_key: &str, default: f64) -> f64 {
        self.sibling(translation_key)
            .and_then(|id| self.state_of(&id))
            .and_then(|s| s.state.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }

    pub fn announcement_display_duration(&self) -> f64 {
        self.number_state("announcement_display_duration", 3.5)
    }

    /// The media_player entity exposed for this satellite, if any.
    pub fn media_player_entity(&self) -> Option<String> {
        let device = self.device_id()?;
        lock(&self.registry)
            .iter()
            .find(|e| {
                e.device_id.as_deref() == Some(device.as_str())
                    && e.platform == PLATFORM
                    && e.entity_id.starts_with("media_player.")
            })
            .map(|e| e.entity_id.clone())
    }

    pub fn attribute(&self, entity_id: &str, name: &str) -> Option<Value> {
        self.state_of(entity_id)
            .and_then(|s| s.attributes.get(name).cloned())
    }
}

#[cfg(test)]
pub(crate) fn entry(entity_id: &str, key: Option<&str>) -> RegistryEntry {
    RegistryEntry {
        entity_id: entity_id.into(),
        device_id: Some("dev1".into()),
        platform: PLATFORM.into(),
        translation_key: key.map(str::to_string),
    }
}

#[cfg(test)]
pub(crate) fn state(entity_id: &str, value: &str, attributes: Value) -> EntityState {
    EntityState {
        entity_id: entity_id.into(),
        state: value.into(),
        attributes: attributes.as_object().cloned().unwrap_or_default(),
    }
}
