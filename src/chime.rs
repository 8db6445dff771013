//! Synthesized feedback tones.

use std::f32::consts::TAU;
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 48_000;

const SILENCE_FLOOR: f32 = 0.001;
const ATTACK_SECS: f32 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chime {
    Wake,
    Error,
    Done,
    Announce,
    Alert,
}

#[derive(Debug, Clone, Copy)]
enum Wave {
    Sine,
    Square,
}

impl Wave {
    fn sample(self, phase: f32) -> f32 {
        let s = phase.sin();
        match self {
            Wave::Sine => s,
            Wave::Square => {
                if s >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }
}

enum Pattern {
    /// One oscillator stepping through `(hz, start_secs)` under a single decay.
    Stepped {
        wave: Wave,
        steps: &'static [(f32, f32)],
        duration: f32,
        volume_scale: f32,
    },
    /// Independent `(hz, start_secs, end_secs)` notes, each with its own
    /// attack and decay.
    Notes {
        wave: Wave,
        notes: &'static [(f32, f32, f32)],
        total_ms: u64,
    },
}

impl Chime {
    fn pattern(self) -> Pattern {
        match self {
            Chime::Wake => Pattern::Stepped {
                wave: Wave::Sine,
                steps: &[(523.0, 0.0), (659.0, 0.08), (784.0, 0.16)],
                duration: 0.25,
                volume_scale: 1.0,
            },
            Chime::Error => Pattern::Stepped {
                wave: Wave::Square,
                steps: &[(300.0, 0.0), (200.0, 0.08)],
                duration: 0.15,
                volume_scale: 0.3,
            },
            Chime::Done => Pattern::Stepped {
                wave: Wave::Sine,
                steps: &[(784.0, 0.0), (659.0, 0.08)],
                duration: 0.25,
                volume_scale: 1.0,
            },
            Chime::Announce => Pattern::Notes {
                wave: Wave::Sine,
                notes: &[(784.0, 0.0, 0.15), (587.0, 0.18, 0.4)],
                total_ms: 500,
            },
            Chime::Alert => Pattern::Notes {
                wave: Wave::Sine,
                notes: &[(880.0, 0.0, 0.15), (660.0, 0.18, 0.33), (880.0, 0.36, 0.55)],
                total_ms: 600,
            },
        }
    }

    pub fn duration(self) -> Duration {
        match self.pattern() {
            Pattern::Stepped { duration, .. } => Duration::from_secs_f32(duration),
            Pattern::Notes { total_ms, .. } => Duration::from_millis(total_ms),
        }
    }

    /// Render mono samples. `volume` is the media player's effective volume.
    pub fn render(self, volume: f32, sample_rate: u32) -> Vec<f32> {
        let sr = sample_rate as f32;
        match self.pattern() {
            Pattern::Stepped {
                wave,
                steps,
                duration,
                volume_scale,
            } => {
                let len = (duration * sr).round() as usize;
                let vol = volume * 0.5 * volume_scale;
                if vol <= SILENCE_FLOOR {
                    return vec![0.0; len];
                }
                let mut out = Vec::with_capacity(len);
                let mut phase = 0.0f32;
                for i in 0..len {
                    let t = i as f32 / sr;
                    let hz = steps
                        .iter()
                        .rev()
                        .find(|(_, start)| t >= *start)
                        .map(|(hz, _)| *hz)
                        .unwrap_or(steps[0].0);
                    phase = (phase + TAU * hz / sr) % TAU;
                    let gain = vol * (SILENCE_FLOOR / vol).powf(t / duration);
                    out.push(wave.sample(phase) * gain);
                }
                out
            }
            Pattern::Notes {
                wave,
                notes,
                total_ms,
            } => {
                let last_end = notes.iter().fold(0.0f32, |acc, n| acc.max(n.2));
                let total = (total_ms as f32 / 1000.0).max(last_end);
                let mut out = vec![0.0f32; (total * sr).round() as usize];
                let vol = volume * 0.25;
                if vol <= SILENCE_FLOOR {
                    return out;
                }
                for &(hz, start, end) in notes {
                    let first = (start * sr).round() as usize;
                    let last = ((end * sr).round() as usize).min(out.len());
                    let decay = (end - start - ATTACK_SECS).max(f32::EPSILON);
                    for (i, slot) in out.iter_mut().enumerate().take(last).skip(first) {
                        let local = i as f32 / sr - start;
                        let gain = if local < ATTACK_SECS {
                            vol * local / ATTACK_SECS
                        } else {
                            vol * (SILENCE_FLOOR / vol).powf((local - ATTACK_SECS) / decay)
                        };
                        *slot += wave.sample(TAU * hz * local) * gain;
                    }
                }
                out
            }
        }
    }
}
