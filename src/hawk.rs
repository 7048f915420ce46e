//! Hawk request authentication.
//!
//! Implements the Hawk MAC scheme directly: header parsing, the
//! `hawk.1.header` normalized request string, and the `hawk.1.payload`
//! body hash.  Only what the Sync 1.5 token server hands out is
//! supported: HMAC-SHA256 with a binary key, no `app`/`dlg` extension.
//!
//! The flow mirrors SigV4-style verification:
//! 1. Parse the Authorization header into its attributes
//! 2. Build the normalized request string
//! 3. Compute and compare the MAC in constant time

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock difference between client and server, in seconds.
const MAX_TIMESTAMP_SKEW: u64 = 60;

/// A parse failure, naming the offending header field.
#[derive(Debug, Clone, Error)]
#[error("field {field}: {message}")]
pub struct HawkFormatError {
    pub field: String,
    pub message: String,
}

fn format_err(field: &str, message: &str) -> HawkFormatError {
    HawkFormatError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Parsed attributes of a `Hawk` Authorization header.
#[derive(Debug, Clone)]
pub struct HawkHeader {
    /// Credentials id (the bearer token).
    pub id: String,
    /// Client timestamp, unix seconds.
    pub ts: u64,
    /// Client nonce.
    pub nonce: String,
    /// Optional payload hash, base64.
    pub hash: Option<String>,
    /// Optional application extension data.
    pub ext: Option<String>,
    /// Request MAC, base64.
    pub mac: String,
}

impl HawkHeader {
    /// Parse an Authorization header value of the form
    /// `Hawk id="...", ts="...", nonce="...", [hash="..."], [ext="..."], mac="..."`.
    pub fn parse(header: &str) -> Result<HawkHeader, HawkFormatError> {
        let rest = header
            .trim()
            .strip_prefix("Hawk ")
            .ok_or_else(|| format_err("scheme", "not a Hawk header"))?;

        let mut id = None;
        let mut ts = None;
        let mut nonce = None;
        let mut hash = None;
        let mut ext = None;
        let mut mac = None;

        for part in rest.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, raw) = part
                .split_once('=')
                .ok_or_else(|| format_err(part, "missing '='"))?;
            let value = raw
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| format_err(key, "value not quoted"))?;

            let slot = match key {
                "id" => &mut id,
                "ts" => &mut ts,
                "nonce" => &mut nonce,
                "hash" => &mut hash,
                "ext" => &mut ext,
                "mac" => &mut mac,
                other => return Err(format_err(other, "unknown attribute")),
            };
            if slot.is_some() {
                return Err(format_err(key, "duplicate attribute"));
            }
            *slot = Some(value.to_string());
        }

        let ts = ts
            .ok_or_else(|| format_err("ts", "missing"))?
            .parse::<u64>()
            .map_err(|_| format_err("ts", "not an integer"))?;

        Ok(HawkHeader {
            id: id.ok_or_else(|| format_err("id", "missing"))?,
            ts,
            nonce: nonce.ok_or_else(|| format_err("nonce", "missing"))?,
            hash,
            ext,
            mac: mac.ok_or_else(|| format_err("mac", "missing"))?,
        })
    }

    /// Verify the request MAC against `key` for the given request line.
    ///
    /// `resource` is the path plus query exactly as the client signed it.
    /// Also enforces the ±60 s timestamp window around `now`.
    pub fn verify(
        &self,
        key: &[u8],
        method: &str,
        resource: &str,
        host: &str,
        port: u16,
        now: u64,
    ) -> bool {
        if now.abs_diff(self.ts) > MAX_TIMESTAMP_SKEW {
            return false;
        }

        let expected = request_mac(
            key,
            self.ts,
            &self.nonce,
            method,
            resource,
            host,
            port,
            self.hash.as_deref(),
            self.ext.as_deref(),
        );

        constant_time_eq(&expected, &self.mac)
    }
}

/// Compute the base64 request MAC over the `hawk.1.header` normalized
/// string.
#[allow(clippy::too_many_arguments)]
pub fn request_mac(
    key: &[u8],
    ts: u64,
    nonce: &str,
    method: &str,
    resource: &str,
    host: &str,
    port: u16,
    hash: Option<&str>,
    ext: Option<&str>,
) -> String {
    let normalized = format!(
        "hawk.1.header\n{ts}\n{nonce}\n{method}\n{resource}\n{host}\n{port}\n{hash}\n{ext}\n",
        method = method.to_uppercase(),
        host = host.to_lowercase(),
        hash = hash.unwrap_or(""),
        ext = ext.unwrap_or(""),
    );

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(normalized.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Compute the base64 `hawk.1.payload` hash for a request body.
///
/// `content_type` is reduced to its lowercased media type, parameters
/// stripped, before hashing.
pub fn payload_hash(content_type: &str, body: &[u8]) -> String {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(b"hawk.1.payload\n");
    hasher.update(media_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.update(b"\n");
    STANDARD.encode(hasher.finalize())
}

/// Split a `Host` header into host and port (default 80).
pub fn split_host_port(host_header: &str) -> (String, u16) {
    match host_header.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (host_header.to_string(), 80),
        },
        None => (host_header.to_string(), 80),
    }
}

/// Compare two base64 MAC strings in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
