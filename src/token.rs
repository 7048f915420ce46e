//! Signed bearer tokens issued by the token server.
//!
//! A token is an opaque string carried as the Hawk credentials id.  The
//! payload is a fixed-width binary record (version byte, uid, expiry)
//! tagged with an HMAC-SHA256 MAC under one of the server's pre-shared
//! secrets.  The Hawk signing key for the request is not the secret
//! itself but an HKDF-derived key salted with the payload, so a leaked
//! request key never exposes the pre-shared secret.
//!
//! The codec is pure: no clock access except the expiry check, no I/O.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token wire format version.
const TOKEN_VERSION: u8 = 1;

/// Payload length: version byte + uid (u64 BE) + expires (u64 BE).
const PAYLOAD_LEN: usize = 1 + 8 + 8;

/// MAC length (HMAC-SHA256).
const MAC_LEN: usize = 32;

/// HKDF info string binding derived keys to this protocol.
const DERIVE_INFO: &[u8] = b"syncstore/token/v1/derived-secret";

/// Why a token failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Malformed encoding, unknown version, or MAC mismatch.
    #[error("token is invalid")]
    Invalid,

    /// The MAC verified but the token's expiry is in the past.
    #[error("token is expired")]
    Expired,
}

/// A verified token: the uid it names and the Hawk key derived for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// User id the token was issued for.
    pub uid: u64,
    /// Expiry as unix seconds.
    pub expires: u64,
    /// HKDF-derived Hawk signing key.
    pub derived_secret: [u8; 32],
}

impl Token {
    /// Encode a token id for `uid` expiring at `expires` (unix seconds),
    /// signed with `secret`.
    pub fn encode(secret: &[u8], uid: u64, expires: u64) -> String {
        let payload = payload_bytes(uid, expires);
        let mac = hmac_sha256(secret, &payload);

        let mut raw = Vec::with_capacity(PAYLOAD_LEN + MAC_LEN);
        raw.extend_from_slice(&payload);
        raw.extend_from_slice(&mac);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode and verify `token_id` against `secret`.
    ///
    /// Returns [`TokenError::Invalid`] for any malformed or forged token
    /// and [`TokenError::Expired`] when the MAC is good but the expiry
    /// has passed `now` (unix seconds).
    pub fn parse_at(secret: &[u8], token_id: &str, now: u64) -> Result<Token, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token_id)
            .map_err(|_| TokenError::Invalid)?;

        if raw.len() != PAYLOAD_LEN + MAC_LEN {
            return Err(TokenError::Invalid);
        }

        let (payload, mac) = raw.split_at(PAYLOAD_LEN);
        if payload[0] != TOKEN_VERSION {
            return Err(TokenError::Invalid);
        }

        let expected = hmac_sha256(secret, payload);
        if expected.ct_eq(mac).unwrap_u8() != 1 {
            return Err(TokenError::Invalid);
        }

        let uid = u64::from_be_bytes(payload[1..9].try_into().expect("fixed width"));
        let expires = u64::from_be_bytes(payload[9..17].try_into().expect("fixed width"));

        if expires < now {
            return Err(TokenError::Expired);
        }

        Ok(Token {
            uid,
            expires,
            derived_secret: derive_secret(secret, payload),
        })
    }

    /// [`Token::parse_at`] against the system clock.
    pub fn parse(secret: &[u8], token_id: &str) -> Result<Token, TokenError> {
        Token::parse_at(secret, token_id, unix_now())
    }

    /// Try every configured secret in order and return the first success.
    ///
    /// If no secret verifies: `Expired` when at least one secret produced
    /// a valid-but-expired parse, `Invalid` otherwise.
    pub fn parse_any(secrets: &[String], token_id: &str) -> Result<Token, TokenError> {
        let now = unix_now();
        let mut last = TokenError::Invalid;

        for secret in secrets {
            match Token::parse_at(secret.as_bytes(), token_id, now) {
                Ok(token) => return Ok(token),
                Err(TokenError::Expired) => last = TokenError::Expired,
                Err(TokenError::Invalid) => {}
            }
        }

        Err(last)
    }
}

/// Serialise the deterministic token payload.
fn payload_bytes(uid: u64, expires: u64) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[0] = TOKEN_VERSION;
    payload[1..9].copy_from_slice(&uid.to_be_bytes());
    payload[9..17].copy_from_slice(&expires.to_be_bytes());
    payload
}

/// Derive the per-token Hawk key: HKDF-SHA256 salted with the payload.
fn derive_secret(secret: &[u8], payload: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(payload), secret);
    let mut out = [0u8; 32];
    hk.expand(DERIVE_INFO, &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FUTURE: u64 = 4_102_444_800; // 2100-01-01

    // ── encode / parse ──────────────────────────────────────────────

    #[test]
    fn test_roundtrip() {
        let id = Token::encode(b"sekret", 42, FUTURE);
        let token = Token::parse(b"sekret", &id).unwrap();
        assert_eq!(token.uid, 42);
        assert_eq!(token.expires, FUTURE);
    }

    #[test]
    fn test_derived_secret_is_deterministic_and_bound_to_payload() {
        let a = Token::parse(b"sekret", &Token::encode(b"sekret", 42, FUTURE)).unwrap();
        let b = Token::parse(b"sekret", &Token::encode(b"sekret", 42, FUTURE)).unwrap();
        let c = Token::parse(b"sekret", &Token::encode(b"sekret", 43, FUTURE)).unwrap();
        assert_eq!(a.derived_secret, b.derived_secret);
        assert_ne!(a.derived_secret, c.derived_secret);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let id = Token::encode(b"sekret", 42, FUTURE);
        assert_eq!(Token::parse(b"other", &id), Err(TokenError::Invalid));
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert_eq!(Token::parse(b"sekret", "not base64 !!"), Err(TokenError::Invalid));
        assert_eq!(Token::parse(b"sekret", "YWJj"), Err(TokenError::Invalid));
        assert_eq!(Token::parse(b"sekret", ""), Err(TokenError::Invalid));
    }

    #[test]
    fn test_tampered_payload_is_invalid() {
        let id = Token::encode(b"sekret", 42, FUTURE);
        let mut raw = URL_SAFE_NO_PAD.decode(&id).unwrap();
        raw[3] ^= 0xff; // flip a uid byte
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(Token::parse(b"sekret", &tampered), Err(TokenError::Invalid));
    }

    #[test]
    fn test_expired() {
        let id = Token::encode(b"sekret", 42, 1000);
        assert_eq!(
            Token::parse_at(b"sekret", &id, 1001),
            Err(TokenError::Expired)
        );
        // Not expired exactly at the boundary.
        assert!(Token::parse_at(b"sekret", &id, 1000).is_ok());
    }

    // ── parse_any ───────────────────────────────────────────────────

    fn secrets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_any_first_success_wins() {
        let id = Token::encode(b"rotated", 7, FUTURE);
        let token = Token::parse_any(&secrets(&["active", "rotated"]), &id).unwrap();
        assert_eq!(token.uid, 7);
    }

    #[test]
    fn test_parse_any_all_invalid() {
        let id = Token::encode(b"decommissioned", 7, FUTURE);
        assert_eq!(
            Token::parse_any(&secrets(&["active", "rotated"]), &id),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_parse_any_expired_outranks_invalid() {
        // Signed by a configured secret but expired: the caller should
        // see "expired", not "invalid", regardless of secret order.
        let id = Token::encode(b"rotated", 7, 1000);
        assert_eq!(
            Token::parse_any(&secrets(&["active", "rotated"]), &id),
            Err(TokenError::Expired)
        );
        assert_eq!(
            Token::parse_any(&secrets(&["rotated", "active"]), &id),
            Err(TokenError::Expired)
        );
    }
}
