//! `/start` handling: tracker attribution and versioned template delivery.

use chrono::Utc;
use tracing::{debug, info};

use hive_blocks::SendOptions;
use hive_core::Result;
use hive_store::types::{Container, ContainerKind};

use crate::pipeline::EngineCtx;

/// TTL for the KV attribution mirror (the store row is canonical).
const ATTR_MIRROR_TTL_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Required tracked start and no valid code: drop with no reply.
    Dropped,
    /// Template delivered this turn; the pipeline ends here.
    TemplateSent,
    /// Already had this template version; normal flow continues.
    Continue,
}

/// Handle `/start [code]`. Records attribution when the code resolves, then
/// delivers the start template unless the user already received the current
/// version.
pub async fn handle_start(
    ctx: &EngineCtx,
    bot_id: i64,
    user_tg_id: i64,
    code: Option<&str>,
) -> Result<StartOutcome> {
    let tracking = ctx.store.tracking_config(bot_id)?;

    let mut attributed = false;
    if let Some(code) = code.filter(|c| !c.is_empty()) {
        if let Some(tracker) = ctx.store.get_tracker_by_code(bot_id, code)? {
            ctx.store.attribute_user(bot_id, user_tg_id, tracker.id)?;
            ctx.kv
                .set_ttl(
                    &format!("trk:attr:{bot_id}:{user_tg_id}"),
                    &tracker.id.to_string(),
                    ATTR_MIRROR_TTL_SECS,
                )
                .await?;
            let day = Utc::now().date_naive().to_string();
            ctx.store.bump_tracker_start(bot_id, tracker.id, &day)?;
            attributed = true;
            info!(bot_id, user_tg_id, tracker_id = tracker.id, "start attributed");
        } else {
            debug!(bot_id, user_tg_id, code, "unknown tracker code");
        }
    }

    if tracking.require_tracked_start && !attributed {
        // Also honor an attribution recorded on a previous tracked start.
        let prior = ctx.store.attribution_of(bot_id, user_tg_id)?;
        if prior.is_none() {
            info!(bot_id, user_tg_id, "untracked start dropped");
            return Ok(StartOutcome::Dropped);
        }
    }

    let version = ctx.store.start_template_version(bot_id)?;
    if ctx.store.start_status(bot_id, user_tg_id)? == Some(version) {
        debug!(bot_id, user_tg_id, version, "start template already delivered");
        return Ok(StartOutcome::Continue);
    }

    let sent = ctx
        .sender
        .send_container(
            bot_id,
            user_tg_id,
            Container::new(ContainerKind::Start, bot_id),
            &SendOptions::default(),
        )
        .await?;
    ctx.store.record_start_delivery(bot_id, user_tg_id, version)?;
    info!(bot_id, user_tg_id, version, blocks = sent, "start template delivered");
    Ok(StartOutcome::TemplateSent)
}

/// Split "/start abc12345" into its optional payload.
pub fn parse_start_payload(text: &str) -> Option<Option<&str>> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix("/start")?;
    if rest.is_empty() {
        return Some(None);
    }
    if !rest.starts_with(char::is_whitespace) {
        // "/startsomething" is not the start command.
        return None;
    }
    Some(Some(rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_payload_parsing() {
        assert_eq!(parse_start_payload("/start"), Some(None));
        assert_eq!(parse_start_payload("/start abc12345"), Some(Some("abc12345")));
        assert_eq!(parse_start_payload("/start   abc "), Some(Some("abc")));
        assert_eq!(parse_start_payload("/starting"), None);
        assert_eq!(parse_start_payload("oi"), None);
    }
}
