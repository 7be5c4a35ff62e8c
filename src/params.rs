//! Dotted-key build parameters: grouping, type coercion, canonical form,
//! and the fingerprint digest derived from it.
//!
//! Clients send the full parameter set as query parameters of the form
//! `group.name=value` (e.g. `magnafpm.RotorDiskRadius=150`). Grouping and
//! coercion together form a total, deterministic canonicalization; the
//! fingerprint is a digest of the canonical JSON, so two requests with the
//! same parameters in any order identify the same build.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Parameter groups accepted when the configuration does not override them.
pub const DEFAULT_ALLOWED_GROUPS: &[&str] = &["magnafpm", "furling", "user"];

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter group '{0}'")]
    UnknownGroup(String),
    #[error("parameter '{0}' is not of the form group.name")]
    UngroupedKey(String),
}

/// A single coerced parameter value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Coerce one query token: `true`/`false` become booleans, integer
    /// tokens become integers, finite float tokens become floats, anything
    /// else stays a string.
    pub fn coerce(token: &str) -> ParamValue {
        if token.eq_ignore_ascii_case("true") {
            return ParamValue::Bool(true);
        }
        if token.eq_ignore_ascii_case("false") {
            return ParamValue::Bool(false);
        }
        if let Ok(int) = token.parse::<i64>() {
            return ParamValue::Int(int);
        }
        if let Ok(float) = token.parse::<f64>() {
            // inf/NaN have no JSON form; leave them as strings
            if float.is_finite() {
                return ParamValue::Float(float);
            }
        }
        ParamValue::Str(token.to_owned())
    }
}

/// The grouped parameter set of one build request. Groups and names are
/// kept sorted so serialization is canonical by construction.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParameterSet(BTreeMap<String, BTreeMap<String, ParamValue>>);

impl ParameterSet {
    /// Group dotted `group.name=value` pairs into nested sorted maps,
    /// coercing each value. Unknown groups and undotted keys are rejected;
    /// a repeated key keeps its last value.
    pub fn from_query<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        allowed_groups: &[String],
    ) -> Result<ParameterSet, ParamError> {
        let mut groups: BTreeMap<String, BTreeMap<String, ParamValue>> = BTreeMap::new();
        for (key, value) in pairs {
            let Some((group, name)) = key.split_once('.') else {
                return Err(ParamError::UngroupedKey(key.to_owned()));
            };
            if !allowed_groups.iter().any(|allowed| allowed == group) {
                return Err(ParamError::UnknownGroup(group.to_owned()));
            }
            groups
                .entry(group.to_owned())
                .or_default()
                .insert(name.to_owned(), ParamValue::coerce(value));
        }
        Ok(ParameterSet(groups))
    }

    /// Stable textual encoding: JSON with sorted group and parameter names
    /// and values in their coerced native types.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("parameter set serializes")
    }
}

/// Stable, collision-resistant digest of a canonical form. Equal canonical
/// forms produce equal fingerprints by construction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn digest(canonical: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// short form for log lines
impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", &self.0[..8])
    }
}
