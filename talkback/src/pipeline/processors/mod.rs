//! External collaborators of the reply pipeline.

pub mod command;
mod lipsync;
mod reply;
mod speech;
mod traits;
mod transcode;

pub use lipsync::{RhubarbExtractor, parse_cues};
pub use reply::{MAX_SEGMENTS, OpenAiConfig, OpenAiReplyGenerator, parse_reply};
pub use speech::{ElevenLabsConfig, ElevenLabsSynthesizer};
pub use traits::{
    AudioTranscoder, LipSyncExtractor, ReplyGenerator, ReplySegment, SpeechSynthesizer,
};
pub use transcode::FfmpegTranscoder;
