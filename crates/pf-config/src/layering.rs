//! Layered configuration files and their canonical hash.
//!
//! A deployment is described by a stack of YAML files applied in order:
//! mappings merge key-by-key, anything else (scalars, arrays) is replaced by
//! the later layer. The merged tree is rendered into a canonical compact
//! JSON form — object keys emitted in sorted order regardless of the map
//! backing — and that exact byte sequence is what gets SHA-256 hashed and
//! persisted, so two runs agree on "same config" iff they agree on content.

use anyhow::{bail, Context, Result};
use serde_json::map::Entry;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;

/// A fully merged configuration stack.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged tree, for typed deserialization and pointer lookups.
    pub config_json: Value,
    /// Canonical compact rendering; the hash input, byte for byte.
    pub canonical_json: String,
    /// Hex SHA-256 of `canonical_json`.
    pub config_hash: String,
}

impl LoadedConfig {
    /// Read, merge, and hash a layer stack. Paths apply in order; each file
    /// must be a YAML mapping at the top level.
    pub fn load(paths: &[&str]) -> Result<Self> {
        let mut merged = Map::new();

        for path in paths {
            let text =
                fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(&text).with_context(|| format!("parse yaml: {path}"))?;
            let layer = serde_json::to_value(parsed)
                .with_context(|| format!("yaml->json conversion failed: {path}"))?;

            let Value::Object(layer) = layer else {
                bail!("config layer {path} must be a mapping at the top level");
            };
            apply_layer(&mut merged, layer);
        }

        let config_json = Value::Object(merged);
        let mut canonical_json = String::new();
        render_canonical(&config_json, &mut canonical_json);

        let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

        Ok(Self {
            config_json,
            canonical_json,
            config_hash,
        })
    }
}

/// Merge one layer into the accumulated tree. Nested mappings recurse;
/// every other collision lets the newer layer win.
fn apply_layer(base: &mut Map<String, Value>, layer: Map<String, Value>) {
    for (key, incoming) in layer {
        match base.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), incoming) {
                (Value::Object(existing), Value::Object(overlay)) => {
                    apply_layer(existing, overlay);
                }
                (other, incoming) => *other = incoming,
            },
        }
    }
}

/// Append the canonical rendering of `value` to `out`.
///
/// Objects are written with keys in sorted order at write time, so the
/// output does not depend on how the underlying map happens to be ordered
/// (serde_json's `preserve_order` feature can be switched on by any crate
/// in the build graph). Scalars and strings defer to serde_json so escaping
/// and number formatting stay standard.
fn render_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_canonical(&Value::String(key.clone()), out);
                out.push(':');
                render_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&scalar.to_string());
        }
    }
}
