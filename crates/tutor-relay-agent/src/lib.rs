//! Tutor turn generation.
//!
//! A turn takes the scenario, tier, and history, streams a reply from the
//! LLM, and splits it into spoken text (forwarded sentence by sentence to
//! synthesis) and the structured [`TutorResponse`] that follows it.
//!
//! [`TutorResponse`]: tutor_relay_core::types::TutorResponse

pub mod prompt;
pub mod segmenter;
pub mod streamer;
pub mod transcript;

pub use segmenter::{SentenceChunker, Segmented, TextSegmenter};
pub use streamer::{GenerationEvent, LlmStreamer, Turn};
