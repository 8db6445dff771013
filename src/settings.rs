use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Home Assistant base URL, e.g. `http://homeassistant.local:8123`.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub access_token: String,
    /// The assist_satellite entity this client drives.
    #[serde(default)]
    pub satellite_entity: String,
    #[serde(default)]
    pub mic_device: String,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
    #[serde(default)]
    pub voice_isolation: bool,
    /// Log every pipeline event with its timestamp.
    #[serde(default)]
    pub debug: bool,
    /// Seconds to wait for the pipeline `init` message. 0 waits forever.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,
    /// `media_player` entity that speaks responses instead of the local
    /// output. Empty plays locally unless the satellite device selects one.
    #[serde(default)]
    pub tts_target: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: String::new(),
            access_token: String::new(),
            satellite_entity: String::new(),
            mic_device: String::new(),
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
            voice_isolation: false,
            debug: false,
            init_timeout_secs: default_init_timeout(),
            tts_target: String::new(),
        }
    }
}

impl Settings {
    /// Returns the first missing required field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.url.trim().is_empty() {
            Some("url")
        } else if self.access_token.trim().is_empty() {
            Some("access_token")
        } else if self.satellite_entity.trim().is_empty() {
            Some("satellite_entity")
        } else {
            None
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_init_timeout() -> u64 {
    10
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join("voice-satellite").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".voice-satellite").join("settings.json"));
    }
    Err("Failed to resolve config directory".into())
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    }
}

pub fn load_from(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[settings] Ignoring unreadable {}: {}", path.display(), e);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_from(&dir.path().join("nope.json"));
        assert!(s.noise_suppression && s.echo_cancellation && s.auto_gain_control);
        assert!(!s.debug);
        assert_eq!(s.missing_field(), Some("url"));
    }

    #[test]
    fn partial_file_keeps_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"url":"http://ha:8123","access_token":"abc","satellite_entity":"assist_satellite.kitchen","noise_suppression":false}"#,
        )
        .unwrap();
        let mut s = load_from(&path);
        assert_eq!(s.url, "http://ha:8123");
        assert!(!s.noise_suppression);
        assert!(s.echo_cancellation);
        assert_eq!(s.init_timeout_secs, 10);
        assert!(s.tts_target.is_empty());
        assert_eq!(s.missing_field(), None);

        s.tts_target = "media_player.living_room".into();
        save_to(&path, &s).unwrap();
        let reloaded = load_from(&path);
        assert_eq!(reloaded.satellite_entity, "assist_satellite.kitchen");
        assert_eq!(reloaded.tts_target, "media_player.living_room");
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_from(&path).missing_field(), Some("url"));
    }
}
