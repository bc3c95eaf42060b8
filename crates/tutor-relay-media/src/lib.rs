//! Media pipeline: WAV framing and the streaming recognition/synthesis upstreams.

pub mod retry;
pub mod stt;
pub mod tts;
pub mod wav;
pub mod ws;

pub use retry::RetryPolicy;
pub use stt::{SttEvent, SttHandle, SttWorker, VadProfile};
pub use tts::{SynthesisTracker, TtsEvent, TtsHandle, TtsWorker};
