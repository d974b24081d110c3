//! Dedup key derivation.
//!
//! Callers such as Amethyst regenerate the top-level request id on every retry
//! of an otherwise identical operation, so the key is built from what the
//! request *does* (caller, operation, payload identity), never from its id.

use serde::Serialize;
use serde_json::Value;

use super::{RequestType, SignRequest};

/// Stable identity of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// `<calling_app>:<type>:<fingerprint>`.
    pub fn derive(request: &SignRequest) -> Self {
        Self(format!(
            "{}:{}:{}",
            request.calling_app,
            request.request_type,
            content_fingerprint(request)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content identity of a request's payload.
pub fn content_fingerprint(request: &SignRequest) -> String {
    match request.request_type {
        RequestType::GetPublicKey => "pubkey".to_string(),
        RequestType::SignEvent | RequestType::DecryptZapEvent => match request.param("event") {
            Some(raw) => event_fingerprint(raw),
            None => params_fingerprint(request),
        },
        RequestType::Nip04Encrypt | RequestType::Nip44Encrypt => {
            cipher_fingerprint(request, "plaintext")
        }
        RequestType::Nip04Decrypt | RequestType::Nip44Decrypt => {
            cipher_fingerprint(request, "ciphertext")
        }
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Prefer the event id embedded in the payload; fall back to the canonical
/// NIP-01 content tuple so unsigned drafts still collapse.
fn event_fingerprint(raw: &str) -> String {
    let Ok(Value::Object(event)) = serde_json::from_str::<Value>(raw) else {
        return format!("raw:{}", hash_hex(raw.trim().as_bytes()));
    };

    if let Some(id) = event.get("id").and_then(Value::as_str)
        && !id.trim().is_empty()
    {
        return format!("event:{}", id.trim());
    }

    let field = |name: &str| event.get(name).cloned().unwrap_or(Value::Null);
    let canonical = Value::Array(vec![
        field("pubkey"),
        field("kind"),
        field("created_at"),
        field("tags"),
        field("content"),
    ]);
    format!("content:{}", hash_hex(canonical.to_string().as_bytes()))
}

fn cipher_fingerprint(request: &SignRequest, payload_param: &str) -> String {
    match (request.param("pubkey"), request.param(payload_param)) {
        (Some(pubkey), Some(payload)) => {
            format!("{}:{}", pubkey.trim(), hash_hex(payload.as_bytes()))
        }
        _ => params_fingerprint(request),
    }
}

/// Canonical hash over every param except a nested `id`.
fn params_fingerprint(request: &SignRequest) -> String {
    let canonical: serde_json::Map<String, Value> = request
        .params
        .iter()
        .filter(|(key, _)| key.as_str() != "id")
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();
    format!(
        "params:{}",
        hash_hex(Value::Object(canonical).to_string().as_bytes())
    )
}
