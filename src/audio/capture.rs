use super::transport::AudioTransport;
use crate::error::DeviceError;
use crate::state::lock;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

const PREFERRED_RATE: u32 = 16_000;
const FALLBACK_RATE: u32 = 48_000;

/// Processing hints forwarded to the capture backend where supported.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub device: Option<String>,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub voice_isolation: bool,
}

#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the device and start feeding `sink`. Replaces any running stream.
    async fn start(
        &self,
        options: &CaptureOptions,
        sink: Arc<AudioTransport>,
    ) -> Result<(), DeviceError>;

    fn stop(&self);

    /// Mute or unmute the tracks without releasing the device.
    fn set_enabled(&self, enabled: bool);
}

struct CaptureThread {
    stop_tx: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

/// cpal input stream owned by a dedicated thread, since `cpal::Stream`
/// is not `Send` on every host.
pub struct CpalMicrophone {
    running: Mutex<Option<CaptureThread>>,
    enabled: Arc<AtomicBool>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn start(
        &self,
        options: &CaptureOptions,
        sink: Arc<AudioTransport>,
    ) -> Result<(), DeviceError> {
        self.stop();
        self.enabled.store(true, Ordering::SeqCst);
        if options.noise_suppression || options.echo_cancellation || options.auto_gain_control {
            log::debug!(
                "[audio] processing hints ns={} aec={} agc={} isolation={} (left to the OS)",
                options.noise_suppression,
                options.echo_cancellation,
                options.auto_gain_control,
                options.voice_isolation
            );
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = options.device.clone();
        let enabled = self.enabled.clone();
        let handle = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), sink, enabled) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("[audio] capture stopped");
            })
            .map_err(|e| DeviceError::Other(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                *lock(&self.running) = Some(CaptureThread { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Other("capture thread exited".into())),
        }
    }

    fn stop(&self) {
        if let Some(thread) = lock(&self.running).take() {
            let _ = thread.stop_tx.send(());
            let _ = thread.handle.join();
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

fn open_stream(
    device_name: Option<&str>,
    sink: Arc<AudioTransport>,
    enabled: Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| DeviceError::NotReadable(format!("Failed to list devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(format!("Device '{}' not found", name)))?
    } else {
        host.default_input_device()
            .ok_or_else(|| DeviceError::NotFound("No default input device".into()))?
    };

    let name = device.name().unwrap_or_else(|_| "unknown".into());
    log::info!("[audio] using device: {}", name);

    // Prefer the wire rate; otherwise capture natively and resample on flush.
    let config = match try_config(&device, PREFERRED_RATE) {
        Some(cfg) => cfg,
        None => match try_config(&device, FALLBACK_RATE) {
            Some(cfg) => cfg,
            None => {
                let default = device
                    .default_input_config()
                    .map_err(|e| DeviceError::NotReadable(format!("No input config: {}", e)))?;
                StreamConfig {
                    channels: default.channels(),
                    sample_rate: default.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                }
            }
        },
    };
    log::info!(
        "[audio] stream config: {}Hz, {}ch",
        config.sample_rate.0,
        config.channels
    );
    sink.set_input_rate(config.sample_rate.0);

    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !enabled.load(Ordering::Relaxed) {
                    return;
                }
                if channels > 1 {
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect();
                    sink.push(&mono);
                } else {
                    sink.push(data);
                }
            },
            |err| {
                log::error!("[audio] stream error: {}", err);
            },
            None,
        )
        .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| DeviceError::NotReadable(format!("Failed to start stream: {}", e)))?;
    Ok(stream)
}

fn map_build_error(err: cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::NotFound("device no longer available".into())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::NotReadable("stream config not supported".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => {
            let text = err.to_string();
            let lower = text.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") || lower.contains("access")
            {
                DeviceError::NotAllowed(text)
            } else {
                DeviceError::NotReadable(text)
            }
        }
        other => DeviceError::Other(other.to_string()),
    }
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported = device.supported_input_configs().ok()?;
    let mut fallback = None;
    for range in supported {
        if range.min_sample_rate().0 > rate || range.max_sample_rate().0 < rate {
            continue;
        }
        let config = StreamConfig {
            channels: range.channels(),
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };
        if range.channels() == 1 {
            return Some(config);
        }
        fallback.get_or_insert(config);
    }
    fallback
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_failures_map_to_not_allowed() {
        let err = map_build_error(cpal::BuildStreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "Permission denied".into(),
            },
        });
        assert!(matches!(err, DeviceError::NotAllowed(_)));
        assert!(matches!(
            map_build_error(cpal::BuildStreamError::DeviceNotAvailable),
            DeviceError::NotFound(_)
        ));
    }
}
