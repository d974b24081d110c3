//! Request and result envelopes exchanged with callers and the signer.

mod dedupe;

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;

pub use self::dedupe::{DedupeKey, content_fingerprint};

/// NIP-55 operations the signer front-end performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    GetPublicKey,
    SignEvent,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
    DecryptZapEvent,
}

impl RequestType {
    pub const ALL: [RequestType; 7] = [
        Self::GetPublicKey,
        Self::SignEvent,
        Self::Nip04Encrypt,
        Self::Nip04Decrypt,
        Self::Nip44Encrypt,
        Self::Nip44Decrypt,
        Self::DecryptZapEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetPublicKey => "get_public_key",
            Self::SignEvent => "sign_event",
            Self::Nip04Encrypt => "nip04_encrypt",
            Self::Nip04Decrypt => "nip04_decrypt",
            Self::Nip44Encrypt => "nip44_encrypt",
            Self::Nip44Decrypt => "nip44_decrypt",
            Self::DecryptZapEvent => "decrypt_zap_event",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown request type '{value}'"))
    }
}

/// One signing request as submitted by an external caller.
///
/// `id` is caller-supplied (or generated) and only used for correlation;
/// deduplication goes through [`DedupeKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub calling_app: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl SignRequest {
    /// Build a request with a freshly generated id.
    pub fn new(request_type: RequestType, calling_app: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_type,
            calling_app: calling_app.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::derive(self)
    }
}

/// Outcome of one execution, possibly delivered to many waiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResult {
    pub ok: bool,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Kind-specific output: signature, public key, ciphertext or plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Signed event JSON for `sign_event`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

/// Reason fragments executors use for "try again later" conditions.
const TRANSIENT_REASON_MARKERS: &[&str] = &[
    "not ready",
    "offline",
    "unavailable",
    "timed out",
    "timeout",
];

impl SignResult {
    pub fn success(request: &SignRequest, result: impl Into<String>) -> Self {
        Self {
            ok: true,
            request_type: request.request_type,
            id: request.id.clone(),
            reason: None,
            result: Some(result.into()),
            event: None,
            failure: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Failure with the kind's default reason.
    pub fn failure(request: &SignRequest, kind: FailureKind) -> Self {
        Self::failure_with_reason(request, kind, kind.default_reason())
    }

    pub fn failure_with_reason(
        request: &SignRequest,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::rejected(request.request_type, request.id.clone(), kind, reason)
    }

    /// Failure for a request known only by type and id.
    pub fn rejected(
        request_type: RequestType,
        id: impl Into<String>,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ok: false,
            request_type,
            id: id.into(),
            reason: Some(reason.into()),
            result: None,
            event: None,
            failure: Some(kind),
        }
    }

    /// Success produced outside the executor, e.g. by an approval flow.
    pub fn approved(
        request_type: RequestType,
        id: impl Into<String>,
        result: Option<String>,
        event: Option<String>,
    ) -> Self {
        Self {
            ok: true,
            request_type,
            id: id.into(),
            reason: None,
            result,
            event,
            failure: None,
        }
    }

    /// Copy of this result addressed to another request id.
    pub fn for_request(&self, request_id: &str) -> Self {
        let mut result = self.clone();
        result.id = request_id.to_string();
        result
    }

    /// Whether this failure reflects signer state rather than the request.
    pub fn is_transient_failure(&self) -> bool {
        if self.ok {
            return false;
        }
        if self.failure.is_some_and(FailureKind::is_transient) {
            return true;
        }
        let lowered = self
            .reason
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        TRANSIENT_REASON_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
    }
}
