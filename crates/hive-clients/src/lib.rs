//! Outbound client adapters: Telegram Bot API, LLM chat completions,
//! Whisper transcription, and the PIX payment gateway. Every call carries a
//! timeout and flows through a circuit breaker; errors are classified into
//! the platform taxonomy at this edge.

pub mod breaker;
pub mod error;
pub mod llm;
pub mod pix;
pub mod telegram;
pub mod whisper;

pub use breaker::CircuitBreaker;
pub use llm::{ChatMessage, ChatUsage, LlmClient, LlmReply};
pub use pix::{PixCharge, PixClient, PixStatus};
pub use telegram::{MediaPayload, SentMedia, TelegramClient};
pub use whisper::WhisperClient;
