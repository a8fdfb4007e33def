//! Structural identity of a computation call.
//!
//! An [`Identity`] is a SHA-256 digest over the computation kind tag and a
//! canonical encoding of the call parameters. Sequences keep their order and
//! object keys are sorted, so two calls with equal parameters hash the same
//! regardless of how the parameters were built.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::CacheResult;

/// Stable identity of one (computation kind, parameters) pair.
///
/// Used both as the registry key and as the store key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Derive the identity for `kind` called with `params`.
    ///
    /// # Errors
    /// Returns a serialization error if `params` cannot be represented as
    /// JSON (for example a map with non-string keys).
    pub fn derive<P>(kind: &str, params: &P) -> CacheResult<Self>
    where
        P: Serialize + ?Sized,
    {
        let value = serde_json::to_value(params)?;

        let mut hasher = Sha256::new();
        write_str(&mut hasher, kind);
        write_canonical(&mut hasher, &value);

        Ok(Self(hasher.finalize().into()))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell identities apart in logs.
        write!(f, "Identity({})", &self.to_hex()[..12])
    }
}

/// Every value is tagged and every variable-length item is length-prefixed,
/// so distinct values never share an encoding.
fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2u8]);
            write_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            write_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                write_canonical(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            hasher.update((map.len() as u64).to_le_bytes());
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, item) in entries {
                write_str(hasher, key);
                write_canonical(hasher, item);
            }
        }
    }
}

fn write_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Dynamic call parameters: ordered positional arguments plus named ones.
///
/// Computations can use any `Serialize` type as their parameters; this type
/// is for callers that build argument lists at runtime.
///
/// ```rust
/// use compute_cache::Parameters;
///
/// let params = Parameters::new().arg(42).arg("books").named("limit", 10);
/// assert_eq!(params.positional().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl Parameters {
    /// Create an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument, replacing any previous value for `name`.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    /// Positional arguments in call order.
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Look up a named argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// Named arguments, sorted by name.
    pub fn named_args(&self) -> &BTreeMap<String, Value> {
        &self.named
    }
}
