//! Error classification at the adapter edge. HTTP and Telegram failures are
//! mapped into the platform taxonomy here so the task runtime can decide
//! retry vs. dead-letter without inspecting raw errors.

use hive_core::HiveError;

/// Map a reqwest transport error.
pub fn classify_reqwest(service: &str, e: reqwest::Error) -> HiveError {
    if e.is_timeout() {
        return HiveError::Timeout { ms: 0 };
    }
    HiveError::TransientExternal {
        service: service.to_string(),
        reason: e.to_string(),
    }
}

/// Map an HTTP status + body: 429 → rate-limited, 5xx → transient,
/// other 4xx → permanent.
pub fn classify_status(
    service: &str,
    status: u16,
    retry_after_secs: Option<u64>,
    body: &str,
) -> HiveError {
    if status == 429 {
        return HiveError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(5),
        };
    }
    let reason = format!("{status}: {}", truncate(body, 300));
    if status >= 500 {
        HiveError::TransientExternal {
            service: service.to_string(),
            reason,
        }
    } else {
        HiveError::PermanentExternal {
            service: service.to_string(),
            reason,
        }
    }
}

/// Map a teloxide request error.
pub fn classify_telegram(e: teloxide::RequestError) -> HiveError {
    use teloxide::RequestError;
    match e {
        RequestError::RetryAfter(secs) => HiveError::RateLimited {
            retry_after_secs: secs.seconds() as u64,
        },
        RequestError::Network(inner) => {
            if inner.is_timeout() {
                HiveError::Timeout { ms: 0 }
            } else {
                HiveError::TransientExternal {
                    service: "telegram".to_string(),
                    reason: inner.to_string(),
                }
            }
        }
        RequestError::Io(inner) => HiveError::TransientExternal {
            service: "telegram".to_string(),
            reason: inner.to_string(),
        },
        RequestError::Api(api) => HiveError::PermanentExternal {
            service: "telegram".to_string(),
            reason: api.to_string(),
        },
        other => HiveError::TransientExternal {
            service: "telegram".to_string(),
            reason: other.to_string(),
        },
    }
}

/// Whether a Telegram error is the "expired / wrong file identifier" class
/// that invalidates a cached media id.
pub fn is_stale_file_id(e: &HiveError) -> bool {
    match e {
        HiveError::PermanentExternal { service, reason } if service == "telegram" => {
            let lower = reason.to_lowercase();
            lower.contains("wrong file identifier")
                || lower.contains("wrong remote file identifier")
                || lower.contains("file reference expired")
                || lower.contains("invalid file_id")
        }
        _ => false,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::ErrorKind;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status("llm", 429, Some(12), "").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_status("llm", 502, None, "bad gateway").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_status("llm", 401, None, "bad key").kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn stale_file_id_detection() {
        let stale = HiveError::PermanentExternal {
            service: "telegram".into(),
            reason: "Bad Request: wrong file identifier/HTTP URL specified".into(),
        };
        assert!(is_stale_file_id(&stale));

        let other = HiveError::PermanentExternal {
            service: "telegram".into(),
            reason: "Bad Request: chat not found".into(),
        };
        assert!(!is_stale_file_id(&other));

        let wrong_service = HiveError::PermanentExternal {
            service: "pix".into(),
            reason: "wrong file identifier".into(),
        };
        assert!(!is_stale_file_id(&wrong_service));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "aéééé";
        let t = truncate(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
    }
}
