//! Property values and the wire codec used on the resource-monitor
//! boundary.
//!
//! Property maps flow between the language runtime and the engine as
//! `google.protobuf.Struct` payloads. Two things make the codec more than a
//! plain JSON mapping: *unknown* values (outputs that have not been computed
//! yet, preserved across the wire as a sentinel string) and *asset*
//! references (content handles that are digested while marshaling).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sentinel carried on the wire in place of a value that is not yet known.
pub const UNKNOWN_PROPERTY_VALUE: &str = "7d1f5e2c-9f64-4d2a-b1a3-cc4b0e6dd8aa";

/// Reserved object key marking an encoded asset. The value names the asset
/// kind (`text`, `file`, or `uri`).
pub const ASSET_KIND_KEY: &str = "@asset";

const ASSET_HASH_KEY: &str = "hash";

/// A resource property map. Ordered so marshaling is deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A single property value as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Object(PropertyMap),
    Asset(Asset),
    /// A value the program has declared but not yet computed. Only
    /// representable on the wire when unknowns are kept.
    Computed,
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// A content handle attached to a resource property. The digest is filled in
/// while marshaling when `compute_asset_hashes` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub source: AssetSource,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssetSource {
    /// Literal content.
    Text(String),
    /// A file on the local machine.
    Path(PathBuf),
    /// A remote location. Never fetched by this crate.
    Uri(String),
}

impl Asset {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            source: AssetSource::Text(text.into()),
            hash: None,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: AssetSource::Path(path.into()),
            hash: None,
        }
    }

    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            source: AssetSource::Uri(uri.into()),
            hash: None,
        }
    }

    fn digest(&self, key: &str) -> Result<Option<String>, PropertyError> {
        match &self.source {
            AssetSource::Text(text) => Ok(Some(sha256_hex(text.as_bytes()))),
            AssetSource::Path(path) => {
                let bytes = fs::read(path).map_err(|source| PropertyError::AssetIo {
                    key: key.to_string(),
                    path: path.clone(),
                    source,
                })?;
                Ok(Some(sha256_hex(&bytes)))
            }
            AssetSource::Uri(_) => Ok(self.hash.clone()),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Controls how property maps cross the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarshalOptions {
    /// Preserve unknown-value sentinels instead of rejecting them.
    pub keep_unknowns: bool,
    /// Digest text and file assets while marshaling.
    pub compute_asset_hashes: bool,
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("property '{0}' is unknown and unknowns are not being kept")]
    UnexpectedUnknown(String),
    #[error("property '{key}' is not a valid asset: {reason}")]
    InvalidAsset { key: String, reason: String },
    #[error("failed to read asset file '{path}' for property '{key}'")]
    AssetIo {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Encode a property map as a wire `Struct`.
pub fn marshal_properties(
    props: &PropertyMap,
    opts: MarshalOptions,
) -> Result<Struct, PropertyError> {
    let mut fields = BTreeMap::new();
    for (key, value) in props {
        fields.insert(key.clone(), marshal_value(key, value, opts)?);
    }
    Ok(Struct { fields })
}

/// Decode a wire `Struct` back into a property map.
pub fn unmarshal_properties(
    object: &Struct,
    opts: MarshalOptions,
) -> Result<PropertyMap, PropertyError> {
    let mut props = PropertyMap::new();
    for (key, value) in &object.fields {
        props.insert(key.clone(), unmarshal_value(key, value, opts)?);
    }
    Ok(props)
}

fn marshal_value(
    key: &str,
    value: &PropertyValue,
    opts: MarshalOptions,
) -> Result<Value, PropertyError> {
    let kind = match value {
        PropertyValue::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        PropertyValue::Bool(b) => Kind::BoolValue(*b),
        PropertyValue::Number(n) => Kind::NumberValue(*n),
        PropertyValue::String(s) => Kind::StringValue(s.clone()),
        PropertyValue::Array(items) => {
            let values = items
                .iter()
                .map(|item| marshal_value(key, item, opts))
                .collect::<Result<Vec<_>, _>>()?;
            Kind::ListValue(ListValue { values })
        }
        PropertyValue::Object(map) => Kind::StructValue(marshal_properties(map, opts)?),
        PropertyValue::Asset(asset) => Kind::StructValue(marshal_asset(key, asset, opts)?),
        PropertyValue::Computed => {
            if !opts.keep_unknowns {
                return Err(PropertyError::UnexpectedUnknown(key.to_string()));
            }
            Kind::StringValue(UNKNOWN_PROPERTY_VALUE.to_string())
        }
    };
    Ok(Value { kind: Some(kind) })
}

fn unmarshal_value(
    key: &str,
    value: &Value,
    opts: MarshalOptions,
) -> Result<PropertyValue, PropertyError> {
    let Some(kind) = &value.kind else {
        return Ok(PropertyValue::Null);
    };
    let prop = match kind {
        Kind::NullValue(_) => PropertyValue::Null,
        Kind::BoolValue(b) => PropertyValue::Bool(*b),
        Kind::NumberValue(n) => PropertyValue::Number(*n),
        Kind::StringValue(s) => {
            if opts.keep_unknowns && s == UNKNOWN_PROPERTY_VALUE {
                PropertyValue::Computed
            } else {
                PropertyValue::String(s.clone())
            }
        }
        Kind::ListValue(list) => PropertyValue::Array(
            list.values
                .iter()
                .map(|item| unmarshal_value(key, item, opts))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Kind::StructValue(object) => {
            if object.fields.contains_key(ASSET_KIND_KEY) {
                PropertyValue::Asset(unmarshal_asset(key, object)?)
            } else {
                PropertyValue::Object(unmarshal_properties(object, opts)?)
            }
        }
    };
    Ok(prop)
}

fn marshal_asset(
    key: &str,
    asset: &Asset,
    opts: MarshalOptions,
) -> Result<Struct, PropertyError> {
    let (kind, content_key, content) = match &asset.source {
        AssetSource::Text(text) => ("text", "text", text.clone()),
        AssetSource::Path(path) => ("file", "path", path.display().to_string()),
        AssetSource::Uri(uri) => ("uri", "uri", uri.clone()),
    };

    let hash = if opts.compute_asset_hashes {
        asset.digest(key)?
    } else {
        asset.hash.clone()
    };

    let mut fields = BTreeMap::new();
    fields.insert(ASSET_KIND_KEY.to_string(), string_value(kind));
    fields.insert(content_key.to_string(), string_value(&content));
    if let Some(hash) = hash {
        fields.insert(ASSET_HASH_KEY.to_string(), string_value(&hash));
    }
    Ok(Struct { fields })
}

fn unmarshal_asset(key: &str, object: &Struct) -> Result<Asset, PropertyError> {
    let kind = string_field(object, ASSET_KIND_KEY).ok_or_else(|| PropertyError::InvalidAsset {
        key: key.to_string(),
        reason: format!("'{ASSET_KIND_KEY}' must be a string"),
    })?;

    let source = match kind.as_str() {
        "text" => AssetSource::Text(require_string_field(key, object, "text")?),
        "file" => AssetSource::Path(PathBuf::from(require_string_field(key, object, "path")?)),
        "uri" => AssetSource::Uri(require_string_field(key, object, "uri")?),
        other => {
            return Err(PropertyError::InvalidAsset {
                key: key.to_string(),
                reason: format!("unrecognized asset kind '{other}'"),
            })
        }
    };

    Ok(Asset {
        source,
        hash: string_field(object, ASSET_HASH_KEY),
    })
}

fn require_string_field(key: &str, object: &Struct, field: &str) -> Result<String, PropertyError> {
    string_field(object, field).ok_or_else(|| PropertyError::InvalidAsset {
        key: key.to_string(),
        reason: format!("missing '{field}' field"),
    })
}

fn string_field(object: &Struct, field: &str) -> Option<String> {
    match object.fields.get(field)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn string_value(s: &str) -> Value {
    Value {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}
