//! Block-sender runtime: ordered delivery of content blocks with per-block
//! delay, typing indicators, cross-bot media caching with identifier
//! re-resolution, `{pix}` substitution, and scheduler-owned auto-delete.

pub mod delete;
pub mod registry;
pub mod sender;

pub use registry::BotRegistry;
pub use sender::{BlockSender, SendOptions};
