//! Report marshalling, signing and delivery.

pub mod pipeline;
pub mod sender;

pub use pipeline::{parse_retry_spec, Pipeline, StageConfig};
pub use sender::{ReportClient, ReportSink, SendOutcome};

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Outer envelope of every report: the capture timestamp in nanoseconds
/// since the epoch, and the stat body.
#[derive(Debug, Serialize)]
pub struct Report<T> {
    pub time: i64,
    pub report: T,
}

/// Nanoseconds since the Unix epoch, for report timestamps.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// Wire name of a report kind; selects the coordinator endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Ping,
    Mtr,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Ping => "ping",
            ReportKind::Mtr => "mtr",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A marshaled, signed report awaiting delivery. Immutable once built.
#[derive(Debug, Clone)]
pub struct ReportContainer {
    kind: ReportKind,
    target: String,
    body: Vec<u8>,
    signature: String,
}

impl ReportContainer {
    pub fn new(kind: ReportKind, target: String, body: Vec<u8>, secret: &[u8]) -> Self {
        let signature = sign(secret, &body);
        ReportContainer {
            kind,
            target,
            body,
            signature,
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Check `signature` against `payload` in constant time.
pub fn verify(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let Ok(raw) = hex::decode(signature) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&raw).is_ok()
}
