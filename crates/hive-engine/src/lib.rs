//! Conversation engine: the per-message pipeline, trigger post-scan,
//! prompt assembly, start/attribution handling, audio transcription, and
//! the owner debug commands.

pub mod audio;
pub mod debug;
pub mod ingest;
pub mod pipeline;
pub mod prompt;
pub mod start;
pub mod triggers;

pub use audio::{ProcessAudioHandler, PROCESS_AUDIO_TASK};
pub use ingest::{
    ManagerUpdateHandler, UpdateRouterHandler, MANAGER_UPDATE_TASK, PROCESS_UPDATE_TASK,
};
pub use pipeline::{EngineCtx, ProcessMessageHandler, PROCESS_MESSAGE_TASK};
