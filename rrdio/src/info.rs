//! Reconstruction of nested database metadata from flat info records.
//!
//! The engine reports metadata as an ordered list of `(key, value)` records
//! whose keys encode structure with a single bracketed token:
//!
//! ```text
//! step                      = 300            -> scalar field "step"
//! rra[0].cf                 = "AVERAGE"      -> element 0 of sequence "rra.cf"
//! rra[1].cf                 = "MAX"          -> element 1 of sequence "rra.cf"
//! ds[temp].type             = "GAUGE"        -> key "temp" of mapping "ds.type"
//! rra[0].cdp_prep[0].value  = 1.5            -> element 0 of "rra.cdp_prep[0].value"
//! ```
//!
//! Only the first `[...]` pair in a key is interpreted. The text before and
//! after it forms the field name; the token inside selects an index (when it
//! is a non-negative integer) or a sub-key. Fields whose name starts with
//! `ds.` always treat the token as a sub-key, even when it is numeric.
//!
//! Parsing is a pure function of its input: [`parse_info`] keeps no state
//! between calls.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::Serialize;

use crate::error::{IntegrityError, Result};

/// Prefix of fields whose bracket token is always a sub-key.
const DS_PREFIX: &str = "ds.";

/// Largest sequence index accepted from an info key.
///
/// Keys are produced by the engine, so anything above this indicates a
/// corrupted record rather than a real archive or data source count.
pub const MAX_INFO_INDEX: usize = 1 << 20;

/// A typed leaf value reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Floating point value (may be NaN for unknown).
    Float(f64),
    /// Unsigned counter.
    Unsigned(u64),
    /// Signed integer.
    Int(i64),
    /// Text.
    Str(String),
    /// Opaque bytes; fragments for one key are concatenated.
    Blob(Vec<u8>),
}

impl Scalar {
    /// Returns the value as `f64` when it is numeric.
    #[allow(clippy::cast_precision_loss)] // Info counters are well below 2^52
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Unsigned(v) => Some(*v as f64),
            Self::Int(v) => Some(*v as f64),
            Self::Str(_) | Self::Blob(_) => None,
        }
    }

    /// Returns the value as `u64` when it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Returns the value as text when it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as bytes when it is a blob.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// One flat record as emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoRecord {
    /// The raw key, possibly containing a bracketed token.
    pub key: String,
    /// The typed value.
    pub value: Scalar,
}

impl InfoRecord {
    /// Creates a record.
    pub fn new(key: impl Into<String>, value: Scalar) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A node of the reconstructed tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InfoValue {
    /// A leaf.
    Scalar(Scalar),
    /// An index-addressed sequence; `None` marks a slot no record filled.
    Sequence(Vec<Option<InfoValue>>),
    /// A sub-key addressed mapping.
    Map(BTreeMap<String, InfoValue>),
}

impl InfoValue {
    /// Returns the leaf, if this is one.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the sequence slots, if this is a sequence.
    pub fn as_sequence(&self) -> Option<&[Option<InfoValue>]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the mapping, if this is one.
    pub fn as_mapping(&self) -> Option<&BTreeMap<String, InfoValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Sequence(_) => "sequence",
            Self::Map(_) => "mapping",
        }
    }
}

/// Structural meaning of a single info key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoKey {
    /// A plain field.
    Scalar(String),
    /// Element `index` of the sequence named `base`.
    Indexed {
        /// Field name with the bracket token removed.
        base: String,
        /// Position in the sequence.
        index: usize,
    },
    /// Entry `key` of the mapping named `base`.
    Keyed {
        /// Field name with the bracket token removed.
        base: String,
        /// Sub-key inside the mapping.
        key: String,
    },
}

/// Decomposes an info key into its field name and bracket token.
///
/// A key without a `[` followed later by a `]` is a plain field, as is a key
/// whose bracket token is empty.
///
/// ```rust
/// use rrdio::info::{InfoKey, parse_key};
///
/// assert_eq!(
///     parse_key("rra[2].rows"),
///     InfoKey::Indexed { base: "rra.rows".to_string(), index: 2 }
/// );
/// assert_eq!(
///     parse_key("ds[0].type"),
///     InfoKey::Keyed { base: "ds.type".to_string(), key: "0".to_string() }
/// );
/// assert_eq!(parse_key("step"), InfoKey::Scalar("step".to_string()));
/// ```
pub fn parse_key(key: &str) -> InfoKey {
    let Some(open) = key.find('[') else {
        return InfoKey::Scalar(key.to_string());
    };
    let Some(close) = key[open + 1..].find(']').map(|c| c + open + 1) else {
        return InfoKey::Scalar(key.to_string());
    };

    let base = format!("{}{}", &key[..open], &key[close + 1..]);
    let token = &key[open + 1..close];

    if token.is_empty() {
        return InfoKey::Scalar(base);
    }
    if !base.starts_with(DS_PREFIX)
        && let Ok(index) = token.parse::<usize>()
    {
        return InfoKey::Indexed { base, index };
    }
    InfoKey::Keyed {
        base,
        key: token.to_string(),
    }
}

/// Metadata about one database, reconstructed from info records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InfoTree {
    fields: BTreeMap<String, InfoValue>,
}

impl InfoTree {
    /// Returns the number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns whether the tree has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a top-level field.
    pub fn get(&self, field: &str) -> Option<&InfoValue> {
        self.fields.get(field)
    }

    /// Iterates over top-level fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &InfoValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Looks up a scalar field.
    pub fn scalar(&self, field: &str) -> Option<&Scalar> {
        self.get(field).and_then(InfoValue::as_scalar)
    }

    /// Looks up an unsigned scalar field such as `step` or `last_update`.
    pub fn unsigned(&self, field: &str) -> Option<u64> {
        self.scalar(field).and_then(Scalar::as_u64)
    }

    /// Looks up a numeric scalar field.
    pub fn float(&self, field: &str) -> Option<f64> {
        self.scalar(field).and_then(Scalar::as_f64)
    }

    /// Looks up a text scalar field.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.scalar(field).and_then(Scalar::as_str)
    }

    /// Looks up a sequence field such as `rra.cf`.
    pub fn sequence(&self, field: &str) -> Option<&[Option<InfoValue>]> {
        self.get(field).and_then(InfoValue::as_sequence)
    }

    /// Looks up a mapping field such as `ds.type`.
    pub fn mapping(&self, field: &str) -> Option<&BTreeMap<String, InfoValue>> {
        self.get(field).and_then(InfoValue::as_mapping)
    }

    /// Returns data source names ordered by their `ds.index` position.
    ///
    /// Names without an index sort last, alphabetically.
    pub fn ds_names(&self) -> Vec<String> {
        let Some(index) = self.mapping("ds.index") else {
            return Vec::new();
        };
        let mut names: Vec<(u64, &String)> = index
            .iter()
            .map(|(name, v)| {
                let pos = v.as_scalar().and_then(Scalar::as_u64).unwrap_or(u64::MAX);
                (pos, name)
            })
            .collect();
        names.sort();
        names.into_iter().map(|(_, name)| name.clone()).collect()
    }

    /// Consumes the tree and returns its fields.
    pub fn into_inner(self) -> BTreeMap<String, InfoValue> {
        self.fields
    }
}

/// Builds an [`InfoTree`] from records in engine order.
///
/// # Errors
///
/// Returns [`IntegrityError::InfoShapeConflict`] when two keys address the
/// same field with different shapes (for example `x` and later `x[0]`), and
/// [`IntegrityError::InfoIndexOutOfRange`] for indices above
/// [`MAX_INFO_INDEX`].
pub fn parse_info<I>(records: I) -> Result<InfoTree>
where
    I: IntoIterator<Item = InfoRecord>,
{
    let mut fields = BTreeMap::new();

    for InfoRecord { key, value } in records {
        match parse_key(&key) {
            InfoKey::Scalar(name) => assign_entry(&mut fields, name, value, &key)?,
            InfoKey::Indexed { base, index } => {
                if index > MAX_INFO_INDEX {
                    return Err(IntegrityError::InfoIndexOutOfRange {
                        key,
                        index,
                        max: MAX_INFO_INDEX,
                    }
                    .into());
                }
                let items = match fields
                    .entry(base)
                    .or_insert_with(|| InfoValue::Sequence(Vec::new()))
                {
                    InfoValue::Sequence(items) => items,
                    other => return Err(shape_conflict(&key, "sequence", other).into()),
                };
                if items.len() <= index {
                    items.resize(index + 1, None);
                }
                let slot = &mut items[index];
                match slot {
                    Some(existing) => merge_into(existing, value, &key)?,
                    None => *slot = Some(InfoValue::Scalar(value)),
                }
            }
            InfoKey::Keyed { base, key: sub_key } => {
                let map = match fields
                    .entry(base)
                    .or_insert_with(|| InfoValue::Map(BTreeMap::new()))
                {
                    InfoValue::Map(map) => map,
                    other => return Err(shape_conflict(&key, "mapping", other).into()),
                };
                assign_entry(map, sub_key, value, &key)?;
            }
        }
    }

    tracing::trace!(fields = fields.len(), "parsed info records");
    Ok(InfoTree { fields })
}

/// Stores `value` under `name`, merging with any existing leaf.
fn assign_entry(
    map: &mut BTreeMap<String, InfoValue>,
    name: String,
    value: Scalar,
    key: &str,
) -> std::result::Result<(), IntegrityError> {
    match map.entry(name) {
        Entry::Vacant(slot) => {
            slot.insert(InfoValue::Scalar(value));
            Ok(())
        }
        Entry::Occupied(mut slot) => merge_into(slot.get_mut(), value, key),
    }
}

/// Blobs append to an existing blob; every other leaf overwrites.
fn merge_into(
    existing: &mut InfoValue,
    value: Scalar,
    key: &str,
) -> std::result::Result<(), IntegrityError> {
    match (existing, value) {
        (InfoValue::Scalar(Scalar::Blob(bytes)), Scalar::Blob(more)) => {
            bytes.extend_from_slice(&more);
        }
        (InfoValue::Scalar(current), value) => *current = value,
        (other, _) => return Err(shape_conflict(key, "scalar", other)),
    }
    Ok(())
}

fn shape_conflict(key: &str, expected: &'static str, found: &InfoValue) -> IntegrityError {
    let field = match parse_key(key) {
        InfoKey::Scalar(name) => name,
        InfoKey::Indexed { base, .. } | InfoKey::Keyed { base, .. } => base,
    };
    IntegrityError::InfoShapeConflict {
        key: key.to_string(),
        field,
        expected,
        found: found.shape(),
    }
}
