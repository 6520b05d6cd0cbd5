//! Idempotency key generation.
//!
//! Keys are either supplied by the caller or derived from the call content.
//! Derived keys hash the RFC 8785 canonical JSON of the tagged request
//! (`{"tool_name": ..., "arguments": {...}}`), so field order, whitespace and
//! number formatting never influence the key and absent optional fields are
//! simply omitted.

use crate::error::{DispatchError, DispatchResult};
use crate::tool::{ToolCall, ToolRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

const DERIVED_PREFIX: &str = "idem:";
const CALLER_PREFIX: &str = "idem:caller:";

static CALLER_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:-]{1,128}$").expect("valid key pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild a key previously handed out by [`KeyGenerator`], e.g. from a
    /// transport path segment.
    pub fn parse(raw: &str) -> DispatchResult<Self> {
        if !raw.starts_with(DERIVED_PREFIX) || raw.len() <= DERIVED_PREFIX.len() {
            return Err(DispatchError::ValidationError(format!(
                "'{}' is not an idempotency key",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct KeyGenerator;

impl KeyGenerator {
    /// Key for a call: the caller's key if one was supplied, otherwise one
    /// derived from the call content.
    pub fn key_for(call: &ToolCall) -> DispatchResult<IdempotencyKey> {
        match call.idempotency_key() {
            Some(supplied) => Self::caller_key(supplied),
            None => Self::derive(call.request()),
        }
    }

    pub fn caller_key(supplied: &str) -> DispatchResult<IdempotencyKey> {
        let supplied = supplied.trim();
        if !CALLER_KEY_PATTERN.is_match(supplied) {
            return Err(DispatchError::ValidationError(
                "Idempotency key must be 1-128 characters of [A-Za-z0-9._:-]".to_string(),
            ));
        }
        Ok(IdempotencyKey(format!("{}{}", CALLER_PREFIX, supplied)))
    }

    pub fn derive(request: &ToolRequest) -> DispatchResult<IdempotencyKey> {
        let canonical = serde_jcs::to_string(request)?;
        Ok(IdempotencyKey(format!(
            "{}{}",
            DERIVED_PREFIX,
            sha256_hex(canonical.as_bytes())
        )))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
