use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures while acquiring or running the capture device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("microphone access denied: {0}")]
    NotAllowed(String),
    #[error("no microphone found: {0}")]
    NotFound(String),
    #[error("microphone in use or not readable: {0}")]
    NotReadable(String),
    #[error("microphone error: {0}")]
    Other(String),
}

impl DeviceError {
    /// Reason shown next to the start button. `None` means the failure is
    /// transient and the caller should retry instead of asking the user.
    pub fn start_reason(&self) -> Option<&'static str> {
        match self {
            DeviceError::NotAllowed(_) => Some("not-allowed"),
            DeviceError::NotFound(_) => Some("not-found"),
            DeviceError::NotReadable(_) => Some("not-readable"),
            DeviceError::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SatelliteError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not connected to Home Assistant")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("settings error: {0}")]
    Settings(String),
}

impl SatelliteError {
    pub fn is_config(&self) -> bool {
        matches!(self, SatelliteError::Config(_))
    }
}

impl From<tungstenite::Error> for SatelliteError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                SatelliteError::Closed
            }
            other => SatelliteError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SatelliteError {
    fn from(err: serde_json::Error) -> Self {
        SatelliteError::Transport(format!("invalid JSON: {}", err))
    }
}

pub type Result<T, E = SatelliteError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_ask_for_a_gesture() {
        assert_eq!(
            DeviceError::NotAllowed("denied".into()).start_reason(),
            Some("not-allowed")
        );
        assert_eq!(
            DeviceError::NotReadable("busy".into()).start_reason(),
            Some("not-readable")
        );
        assert_eq!(DeviceError::Other("glitch".into()).start_reason(), None);
    }

    #[test]
    fn device_errors_convert() {
        let err: SatelliteError = DeviceError::NotFound("none".into()).into();
        assert!(matches!(err, SatelliteError::Device(DeviceError::NotFound(_))));
        assert!(!err.is_config());
    }
}
