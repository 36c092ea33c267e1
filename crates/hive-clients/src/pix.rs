//! PIX payment gateway client: charge creation, status lookup, and webhook
//! signature verification. Charges are created synchronously; status is
//! confirmed by the poll task and, when configured, by the inbound webhook.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use hive_core::{HiveError, Result};

use crate::breaker::CircuitBreaker;
use crate::error::{classify_reqwest, classify_status};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct PixCharge {
    /// Gateway-side transaction id.
    pub external_id: String,
    /// Copy-paste PIX code shown to the buyer (substituted into `{pix}`).
    pub pix_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

pub struct PixClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(alias = "qr_code", alias = "pix_code")]
    qr_code: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

impl PixClient {
    pub fn new(
        base_url: &str,
        token: &str,
        timeout_secs: u64,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout: Duration::from_secs(timeout_secs),
            breaker,
        }
    }

    pub async fn create_charge(
        &self,
        amount_cents: i64,
        webhook_url: Option<&str>,
    ) -> Result<PixCharge> {
        self.breaker
            .guard(self.create_inner(amount_cents, webhook_url))
            .await
    }

    async fn create_inner(
        &self,
        amount_cents: i64,
        webhook_url: Option<&str>,
    ) -> Result<PixCharge> {
        let url = format!("{}/api/pix/cashIn", self.base_url);
        let mut body = serde_json::json!({"value": amount_cents});
        if let Some(hook) = webhook_url {
            body["webhook_url"] = serde_json::Value::String(hook.to_string());
        }
        debug!(amount_cents, "pix charge create");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("content-type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest("pix", e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "pix gateway error");
            return Err(classify_status("pix", status, None, &text));
        }

        let parsed: CreateResponse = resp.json().await.map_err(|e| HiveError::PermanentExternal {
            service: "pix".to_string(),
            reason: format!("undecodable response: {e}"),
        })?;
        Ok(PixCharge {
            external_id: parsed.id,
            pix_code: parsed.qr_code,
        })
    }

    pub async fn charge_status(&self, external_id: &str) -> Result<PixStatus> {
        self.breaker.guard(self.status_inner(external_id)).await
    }

    async fn status_inner(&self, external_id: &str) -> Result<PixStatus> {
        let url = format!("{}/api/transactions/{external_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest("pix", e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status("pix", status, None, &text));
        }

        let parsed: StatusResponse = resp.json().await.map_err(|e| HiveError::PermanentExternal {
            service: "pix".to_string(),
            reason: format!("undecodable response: {e}"),
        })?;
        Ok(parse_status(&parsed.status))
    }
}

fn parse_status(raw: &str) -> PixStatus {
    match raw.to_lowercase().as_str() {
        "paid" | "approved" | "completed" => PixStatus::Paid,
        "expired" | "canceled" | "cancelled" => PixStatus::Expired,
        "failed" | "refused" | "error" => PixStatus::Failed,
        _ => PixStatus::Pending,
    }
}

/// Verify a gateway webhook callback: hex HMAC-SHA256 of the raw body.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_covers_gateway_vocabulary() {
        assert_eq!(parse_status("paid"), PixStatus::Paid);
        assert_eq!(parse_status("APPROVED"), PixStatus::Paid);
        assert_eq!(parse_status("created"), PixStatus::Pending);
        assert_eq!(parse_status("pending"), PixStatus::Pending);
        assert_eq!(parse_status("expired"), PixStatus::Expired);
        assert_eq!(parse_status("refused"), PixStatus::Failed);
    }

    #[test]
    fn webhook_signature_roundtrip() {
        let secret = "whsec";
        let body = br#"{"id":"ext-1","status":"paid"}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook_signature(secret, body, &sig));
        assert!(!verify_webhook_signature(secret, b"tampered", &sig));
        assert!(!verify_webhook_signature(secret, body, "deadbeef"));
        assert!(!verify_webhook_signature(secret, body, "not-hex"));
    }
}
