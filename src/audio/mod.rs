pub mod capture;
pub mod transport;

pub use capture::{CaptureOptions, CpalMicrophone, Microphone};
pub use transport::AudioTransport;
