//! Token encryption at rest and signed callback tokens.
//!
//! Bot tokens are sealed with AES-256-GCM under a single versioned key; the
//! stored blob is `version || nonce || ciphertext+tag`, base64url encoded.
//! Callback tokens are `base64url(payload_json || mac[0..8])` where the MAC is
//! HMAC-SHA256 over the payload JSON with the same 32-byte key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{HiveError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Current encryption key version, stored as the first byte of every blob.
const KEY_VERSION: u8 = 1;

/// Truncated MAC length appended to callback payloads.
const MAC_LEN: usize = 8;

/// Callback token TTL bounds, seconds. Actions pick a TTL inside this range.
pub const CALLBACK_TTL_MIN_SECS: i64 = 300;
pub const CALLBACK_TTL_MAX_SECS: i64 = 900;

fn decode_key(key_b64: &str) -> Result<[u8; 32]> {
    let raw = URL_SAFE_NO_PAD
        .decode(key_b64.trim_end_matches('='))
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(key_b64))
        .map_err(|_| HiveError::Config("ENCRYPTION_KEY is not valid base64".into()))?;
    let key: [u8; 32] = raw
        .try_into()
        .map_err(|_| HiveError::Config("ENCRYPTION_KEY must decode to 32 bytes".into()))?;
    Ok(key)
}

/// Symmetric cipher for bot tokens at rest.
pub struct TokenCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl TokenCipher {
    pub fn new(key_b64: &str) -> Result<Self> {
        let key_bytes = decode_key(key_b64)?;
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| HiveError::Config("failed to build AEAD key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| HiveError::Internal("nonce generation failed".into()))?;

        let mut buf = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buf,
            )
            .map_err(|_| HiveError::Internal("AEAD seal failed".into()))?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + buf.len());
        out.push(KEY_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&buf);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let raw = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|_| HiveError::Auth("encrypted token is not valid base64".into()))?;
        if raw.len() < 1 + NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(HiveError::Auth("encrypted token too short".into()));
        }
        if raw[0] != KEY_VERSION {
            return Err(HiveError::Auth(format!(
                "unknown encryption key version {}",
                raw[0]
            )));
        }

        let nonce_bytes: [u8; NONCE_LEN] = raw[1..1 + NONCE_LEN].try_into().unwrap();
        let mut buf = raw[1 + NONCE_LEN..].to_vec();
        let plain = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buf,
            )
            .map_err(|_| HiveError::Auth("token decryption failed".into()))?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| HiveError::Auth("decrypted token is not UTF-8".into()))
    }
}

/// Payload carried inside a signed callback token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackPayload {
    pub action: String,
    /// Telegram user id allowed to invoke this callback.
    pub uid: i64,
    /// Issue time, unix seconds.
    pub ts: i64,
    pub nonce: String,
    /// Action-specific target ids.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub target: serde_json::Value,
}

/// Signer/verifier for ephemeral admin-menu callback tokens.
pub struct CallbackSigner {
    key: [u8; 32],
    rng: SystemRandom,
}

impl CallbackSigner {
    pub fn new(key_b64: &str) -> Result<Self> {
        Ok(Self {
            key: decode_key(key_b64)?,
            rng: SystemRandom::new(),
        })
    }

    /// Mint a signed token for `action` bound to `uid`.
    pub fn sign(&self, action: &str, uid: i64, target: serde_json::Value) -> Result<String> {
        let mut nonce = [0u8; 8];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| HiveError::Internal("nonce generation failed".into()))?;
        let payload = CallbackPayload {
            action: action.to_string(),
            uid,
            ts: chrono::Utc::now().timestamp(),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            target,
        };
        self.sign_payload(&payload)
    }

    fn sign_payload(&self, payload: &CallbackPayload) -> Result<String> {
        let json = serde_json::to_vec(payload)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| HiveError::Internal("invalid HMAC key length".into()))?;
        mac.update(&json);
        let tag = mac.finalize().into_bytes();

        let mut out = json;
        out.extend_from_slice(&tag[..MAC_LEN]);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Verify MAC (constant time), TTL, and that `uid` matches the invoker.
    pub fn verify(&self, token: &str, invoker_uid: i64, ttl_secs: i64) -> Result<CallbackPayload> {
        self.verify_at(token, invoker_uid, ttl_secs, chrono::Utc::now().timestamp())
    }

    /// TTL check against an explicit `now` (unix seconds).
    pub fn verify_at(
        &self,
        token: &str,
        invoker_uid: i64,
        ttl_secs: i64,
        now: i64,
    ) -> Result<CallbackPayload> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| HiveError::Auth("callback token is not valid base64".into()))?;
        if raw.len() <= MAC_LEN {
            return Err(HiveError::Auth("callback token too short".into()));
        }
        let (json, given_mac) = raw.split_at(raw.len() - MAC_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| HiveError::Internal("invalid HMAC key length".into()))?;
        mac.update(json);
        let tag = mac.finalize().into_bytes();
        ring::constant_time::verify_slices_are_equal(&tag[..MAC_LEN], given_mac)
            .map_err(|_| HiveError::Auth("callback token MAC mismatch".into()))?;

        let payload: CallbackPayload = serde_json::from_slice(json)
            .map_err(|_| HiveError::Auth("callback token payload is malformed".into()))?;

        let ttl = ttl_secs.clamp(CALLBACK_TTL_MIN_SECS, CALLBACK_TTL_MAX_SECS);
        if now - payload.ts > ttl {
            return Err(HiveError::Auth("callback token expired".into()));
        }
        if payload.uid != invoker_uid {
            return Err(HiveError::Auth("callback token bound to another user".into()));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"; // 32 zero bytes

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = TokenCipher::new(KEY).unwrap();
        let token = "1234567890:AAEhBOweik6ad9r_QXMENQjcrGbqCr4K-pM";
        let blob = cipher.encrypt(token).unwrap();
        assert_ne!(blob, token);
        assert_eq!(cipher.decrypt(&blob).unwrap(), token);
    }

    #[test]
    fn distinct_nonces_produce_distinct_blobs() {
        let cipher = TokenCipher::new(KEY).unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let cipher = TokenCipher::new(KEY).unwrap();
        let blob = cipher.encrypt("secret").unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn callback_sign_verify_roundtrip() {
        let signer = CallbackSigner::new(KEY).unwrap();
        let token = signer
            .sign("offer_preview", 777, serde_json::json!({"offer_id": 3}))
            .unwrap();
        let payload = signer.verify(&token, 777, 600).unwrap();
        assert_eq!(payload.action, "offer_preview");
        assert_eq!(payload.target["offer_id"], 3);
    }

    #[test]
    fn callback_rejects_wrong_uid() {
        let signer = CallbackSigner::new(KEY).unwrap();
        let token = signer.sign("x", 1, serde_json::Value::Null).unwrap();
        assert!(signer.verify(&token, 2, 600).is_err());
    }

    #[test]
    fn callback_rejects_beyond_ttl() {
        let signer = CallbackSigner::new(KEY).unwrap();
        let token = signer.sign("x", 1, serde_json::Value::Null).unwrap();
        let far_future = chrono::Utc::now().timestamp() + 10_000;
        assert!(signer.verify_at(&token, 1, 600, far_future).is_err());
    }

    #[test]
    fn callback_rejects_single_byte_tamper() {
        let signer = CallbackSigner::new(KEY).unwrap();
        let token = signer.sign("x", 1, serde_json::Value::Null).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        raw[0] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(signer.verify(&tampered, 1, 600).is_err());
    }

    #[test]
    fn ttl_is_clamped_into_documented_range() {
        let signer = CallbackSigner::new(KEY).unwrap();
        let token = signer.sign("x", 1, serde_json::Value::Null).unwrap();
        // A caller asking for a 1-second TTL still gets the 300s floor.
        let now = chrono::Utc::now().timestamp() + 200;
        assert!(signer.verify_at(&token, 1, 1, now).is_ok());
    }
}
