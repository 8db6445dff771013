use crate::connection::commands::PIPELINE_SAMPLE_RATE;
use crate::connection::Transport;
use crate::state::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Chunks held while no run is bound. Older audio is dropped first.
pub const MAX_BUFFERED_CHUNKS: usize = 128;

/// Buffers captured audio and ships it to the pipeline as tagged PCM frames.
pub struct AudioTransport {
    uplink: Arc<dyn Transport>,
    buffer: Mutex<VecDeque<Vec<f32>>>,
    resampler: Mutex<ResamplerState>,
    input_rate: AtomicU32,
    handler_id: Mutex<Option<u8>>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl AudioTransport {
    pub fn new(uplink: Arc<dyn Transport>) -> Self {
        Self {
            uplink,
            buffer: Mutex::new(VecDeque::with_capacity(MAX_BUFFERED_CHUNKS)),
            resampler: Mutex::new(ResamplerState::default()),
            input_rate: AtomicU32::new(PIPELINE_SAMPLE_RATE),
            handler_id: Mutex::new(None),
            sender: Mutex::new(None),
        }
    }

    /// Native rate of the capture device feeding `push`.
    pub fn set_input_rate(&self, rate: u32) {
        self.input_rate.store(rate.max(1), Ordering::SeqCst);
        *lock(&self.resampler) = ResamplerState::default();
    }

    pub fn push(&self, chunk: &[f32]) {
        if chunk.is_empty() {
            return;
        }
        let mut buffer = lock(&self.buffer);
        if buffer.len() == MAX_BUFFERED_CHUNKS {
            buffer.pop_front();
        }
        buffer.push_back(chunk.to_vec());
    }

    /// Drop buffered audio so residual chime or silence is never sent.
    pub fn clear(&self) {
        lock(&self.buffer).clear();
        *lock(&self.resampler) = ResamplerState::default();
    }

    pub fn buffered_chunks(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn handler_id(&self) -> Option<u8> {
        *lock(&self.handler_id)
    }

    pub fn set_handler_id(&self, id: Option<u8>) {
        *lock(&self.handler_id) = id;
    }

    pub fn is_sending(&self) -> bool {
        lock(&self.sender).is_some()
    }

    pub fn start_sending(self: &Arc<Self>) {
        self.stop_sending();
        let transport = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                transport.flush();
            }
        });
        *lock(&self.sender) = Some(handle);
    }

    pub fn stop_sending(&self) {
        if let Some(handle) = lock(&self.sender).take() {
            handle.abort();
        }
    }

    /// Send everything buffered as one frame. Without a handler id the
    /// newest `MAX_BUFFERED_CHUNKS` chunks are kept for later.
    pub fn flush(&self) -> bool {
        let Some(handler) = self.handler_id() else {
            return false;
        };
        let chunks = std::mem::take(&mut *lock(&self.buffer));
        if chunks.is_empty() {
            return false;
        }
        let samples: Vec<f32> = chunks.into_iter().flatten().collect();
        let rate = self.input_rate.load(Ordering::SeqCst);
        let samples = if rate == PIPELINE_SAMPLE_RATE {
            samples
        } else {
            resample_linear(
                &samples,
                rate,
                PIPELINE_SAMPLE_RATE,
                &mut lock(&self.resampler),
            )
        };
        self.uplink.send_binary(frame(handler, &samples))
    }
}

/// `[handler_id] ++ i16 LE PCM`.
pub fn frame(handler_id: u8, samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + samples.len() * 2);
    out.push(handler_id);
    for s in samples {
        out.extend_from_slice(&to_pcm16(*s).to_le_bytes());
    }
    out
}

pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

#[derive(Debug, Default)]
struct ResamplerState {
    /// Read position relative to `last_sample`.
    t: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut out = Vec::with_capacity((buf.len() as f64 / step) as usize + 2);
    let mut pos = state.t;
    while (pos as usize) + 1 < buf.len() {
        let i = pos as usize;
        let frac = (pos - i as f64) as f32;
        out.push(buf[i] + (buf[i + 1] - buf[i]) * frac);
        pos += step;
    }

    state.t = pos - (buf.len() - 1) as f64;
    state.last_sample = buf[buf.len() - 1];
    state.has_last = true;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    #[test]
    fn quantizes_asymmetrically() {
        assert_eq!(to_pcm16(1.0), 0x7FFF);
        assert_eq!(to_pcm16(-1.0), -0x8000);
        assert_eq!(to_pcm16(2.5), 0x7FFF);
        assert_eq!(to_pcm16(0.0), 0);
        assert_eq!(frame(3, &[1.0]), vec![3, 0xFF, 0x7F]);
    }

    #[test]
    fn downsamples_by_rate_ratio() {
        let mut state = ResamplerState::default();
        let input = vec![0.25f32; 4800];
        let first = resample_linear(&input, 48_000, 16_000, &mut state);
        assert_eq!(first.len(), 1600);
        let second = resample_linear(&input, 48_000, 16_000, &mut state);
        assert!((1599..=1601).contains(&second.len()));
        assert!(second.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_handler_id() {
        let fake = Arc::new(FakeTransport::new());
        let audio = Arc::new(AudioTransport::new(fake.clone()));
        audio.push(&[0.5; 160]);
        assert!(!audio.flush());
        assert_eq!(audio.buffered_chunks(), 1);

        audio.set_handler_id(Some(7));
        audio.start_sending();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let frames = fake.binary_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 7);
        assert_eq!(frames[0].len(), 1 + 320);
        assert_eq!(audio.buffered_chunks(), 0);

        audio.stop_sending();
        audio.push(&[0.5; 160]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fake.binary_frames().len(), 1);
    }

    #[test]
    fn unbound_buffer_keeps_only_the_newest_chunks() {
        let fake = Arc::new(FakeTransport::new());
        let audio = AudioTransport::new(fake.clone());
        for _ in 0..6000 {
            audio.push(&[0.0; 160]);
        }
        audio.push(&[1.0; 160]);
        assert_eq!(audio.buffered_chunks(), MAX_BUFFERED_CHUNKS);

        audio.set_handler_id(Some(2));
        assert!(audio.flush());
        let frame = &fake.binary_frames()[0];
        assert_eq!(frame.len(), 1 + MAX_BUFFERED_CHUNKS * 160 * 2);
        assert_eq!(&frame[frame.len() - 2..], &[0xFF, 0x7F]);
    }

    #[test]
    fn resamples_before_framing() {
        let fake = Arc::new(FakeTransport::new());
        let audio = AudioTransport::new(fake.clone());
        audio.set_input_rate(48_000);
        audio.set_handler_id(Some(1));
        audio.push(&[0.0; 480]);
        audio.push(&[0.0; 480]);
        assert!(audio.flush());
        assert_eq!(fake.binary_frames()[0].len(), 1 + 320 * 2);
    }
}
