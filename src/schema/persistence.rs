//! # Schema Metadata Persistence
//!
//! The registry is serialised to a single JSON document, `_metadata.json`,
//! at the root of every data directory. The document is a keyed mapping
//! from type name to entry; every entry carries a `kind` from the closed
//! set {primitive, alias, array, string, boolean, set, dictionary,
//! composite, interface, enum, bigint, biguint, fraction}, plus the stable
//! `type_ids` table that keeps interface-typed slots meaningful across
//! restarts.
//!
//! Values that exceed 64-bit integer range (128-bit primitives, big
//! numerics, fractions) are serialised as decimal strings; everything else
//! uses the native JSON form. Default-value decoding is type-directed: the
//! declared field type is resolved against the document itself, so entries
//! may appear in any order.
//!
//! A registry holding unpopulated forward stubs cannot be committed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use serde::{Deserialize, Serialize};

use super::def::{
    EnumVariant, FieldDef, OverflowPolicy, PrimitiveType, TypeDef, TypeKind,
};
use super::registry::SchemaRegistry;
use crate::types::{BigNum, Value};

pub const METADATA_FILE: &str = "_metadata.json";

pub fn metadata_path(data_dir: &Path) -> PathBuf {
    data_dir.join(METADATA_FILE)
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDoc {
    types: BTreeMap<String, TypeEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    type_ids: BTreeMap<String, u16>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TypeEntry {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    primitive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    element_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entry_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    variants: Vec<VariantEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backing_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_explicit_values: Option<bool>,
}

impl TypeEntry {
    fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            primitive: None,
            base_type: None,
            element_type: None,
            key_type: None,
            value_type: None,
            entry_type: None,
            parent: None,
            parents: Vec::new(),
            interfaces: Vec::new(),
            fields: Vec::new(),
            variants: Vec::new(),
            backing_type: None,
            has_explicit_values: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldEntry {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overflow: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VariantEntry {
    name: String,
    discriminant: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldEntry>,
}

/// Writes the registry as `_metadata.json` under `data_dir`.
pub fn save_metadata(registry: &SchemaRegistry, data_dir: &Path) -> Result<()> {
    let stubs = registry.unpopulated_stubs();
    ensure!(
        stubs.is_empty(),
        "cannot commit schema with unpopulated forward stubs: {:?}",
        stubs
    );

    let mut types = BTreeMap::new();
    for name in registry.sorted_names() {
        let def = registry.get(&name)?;
        types.insert(name, encode_type(def)?);
    }

    let doc = MetadataDoc {
        types,
        type_ids: registry
            .type_ids()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect(),
    };

    let json = serde_json::to_string_pretty(&doc).wrap_err("failed to serialise metadata")?;
    let path = metadata_path(data_dir);
    std::fs::write(&path, json)
        .wrap_err_with(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}

/// Rebuilds a registry from `_metadata.json` under `data_dir`.
pub fn load_metadata(data_dir: &Path) -> Result<SchemaRegistry> {
    let path = metadata_path(data_dir);
    let json = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;
    let doc: MetadataDoc = serde_json::from_str(&json)
        .wrap_err_with(|| format!("malformed metadata document '{}'", path.display()))?;

    let mut registry = SchemaRegistry::new();
    for (name, entry) in &doc.types {
        // Builtins already live in the fresh registry.
        if registry.contains(name) {
            continue;
        }
        let def = decode_type(name, entry, &doc.types)?;
        registry.insert_unchecked(def);
    }

    for (name, id) in &doc.type_ids {
        registry.restore_type_id(name, *id);
    }

    registry.validate_all()?;
    registry.assign_missing_type_ids()?;

    let stubs = registry.unpopulated_stubs();
    ensure!(
        stubs.is_empty(),
        "metadata document contains unpopulated stubs: {:?}",
        stubs
    );

    Ok(registry)
}

fn encode_type(def: &TypeDef) -> Result<TypeEntry> {
    let entry = match &def.kind {
        TypeKind::Primitive(PrimitiveType::Boolean) => TypeEntry::bare("boolean"),
        TypeKind::Primitive(p) => {
            let mut e = TypeEntry::bare("primitive");
            e.primitive = Some(p.name().to_string());
            e
        }
        TypeKind::Alias { target } => {
            let mut e = TypeEntry::bare("alias");
            e.base_type = Some(target.clone());
            e
        }
        TypeKind::StringType => {
            let mut e = TypeEntry::bare("string");
            e.element_type = Some("character".to_string());
            e
        }
        TypeKind::Array { element } => {
            let mut e = TypeEntry::bare("array");
            e.element_type = Some(element.clone());
            e
        }
        TypeKind::Set { element } => {
            let mut e = TypeEntry::bare("set");
            e.element_type = Some(element.clone());
            e
        }
        TypeKind::Dictionary { key, value, entry } => {
            let mut e = TypeEntry::bare("dictionary");
            e.key_type = Some(key.clone());
            e.value_type = Some(value.clone());
            e.entry_type = Some(entry.clone());
            e
        }
        TypeKind::Composite {
            fields,
            parent,
            interfaces,
        } => {
            let mut e = TypeEntry::bare("composite");
            e.fields = fields.iter().map(encode_field).collect::<Result<_>>()?;
            e.parent = parent.clone();
            e.interfaces = interfaces.clone();
            e
        }
        TypeKind::Interface { fields, parents } => {
            let mut e = TypeEntry::bare("interface");
            e.fields = fields.iter().map(encode_field).collect::<Result<_>>()?;
            e.parents = parents.clone();
            e
        }
        TypeKind::Enum {
            variants,
            backing,
            has_explicit_values,
        } => {
            let mut e = TypeEntry::bare("enum");
            e.variants = variants
                .iter()
                .map(|v| {
                    Ok(VariantEntry {
                        name: v.name.clone(),
                        discriminant: v.discriminant,
                        fields: v.fields.iter().map(encode_field).collect::<Result<_>>()?,
                    })
                })
                .collect::<Result<_>>()?;
            e.backing_type = backing.map(|b| b.name().to_string());
            e.has_explicit_values = Some(*has_explicit_values);
            e
        }
        TypeKind::BigInt => TypeEntry::bare("bigint"),
        TypeKind::BigUInt => TypeEntry::bare("biguint"),
        TypeKind::Fraction => TypeEntry::bare("fraction"),
        TypeKind::Stub => bail!("stub '{}' reached serialisation", def.name),
    };
    Ok(entry)
}

fn encode_field(field: &FieldDef) -> Result<FieldEntry> {
    Ok(FieldEntry {
        name: field.name.clone(),
        type_name: field.type_name.clone(),
        default: field.default.as_ref().map(value_to_json).transpose()?,
        overflow: field.overflow.map(|p| p.name().to_string()),
    })
}

fn decode_type(
    name: &str,
    entry: &TypeEntry,
    all: &BTreeMap<String, TypeEntry>,
) -> Result<TypeDef> {
    let kind = match entry.kind.as_str() {
        "boolean" => TypeKind::Primitive(PrimitiveType::Boolean),
        "primitive" => {
            let prim = entry
                .primitive
                .as_deref()
                .and_then(PrimitiveType::parse)
                .ok_or_else(|| eyre::eyre!("bad primitive entry for '{}'", name))?;
            TypeKind::Primitive(prim)
        }
        "alias" => TypeKind::Alias {
            target: required(&entry.base_type, name, "base_type")?,
        },
        "string" => TypeKind::StringType,
        "array" => TypeKind::Array {
            element: required(&entry.element_type, name, "element_type")?,
        },
        "set" => TypeKind::Set {
            element: required(&entry.element_type, name, "element_type")?,
        },
        "dictionary" => TypeKind::Dictionary {
            key: required(&entry.key_type, name, "key_type")?,
            value: required(&entry.value_type, name, "value_type")?,
            entry: required(&entry.entry_type, name, "entry_type")?,
        },
        "composite" => TypeKind::Composite {
            fields: entry
                .fields
                .iter()
                .map(|f| decode_field(f, all))
                .collect::<Result<_>>()?,
            parent: entry.parent.clone(),
            interfaces: entry.interfaces.clone(),
        },
        "interface" => TypeKind::Interface {
            fields: entry
                .fields
                .iter()
                .map(|f| decode_field(f, all))
                .collect::<Result<_>>()?,
            parents: entry.parents.clone(),
        },
        "enum" => TypeKind::Enum {
            variants: entry
                .variants
                .iter()
                .map(|v| {
                    Ok(EnumVariant {
                        name: v.name.clone(),
                        discriminant: v.discriminant,
                        fields: v
                            .fields
                            .iter()
                            .map(|f| decode_field(f, all))
                            .collect::<Result<_>>()?,
                    })
                })
                .collect::<Result<_>>()?,
            backing: entry
                .backing_type
                .as_deref()
                .map(|b| {
                    PrimitiveType::parse(b)
                        .ok_or_else(|| eyre::eyre!("bad backing type '{}' for '{}'", b, name))
                })
                .transpose()?,
            has_explicit_values: entry.has_explicit_values.unwrap_or(false),
        },
        "bigint" => TypeKind::BigInt,
        "biguint" => TypeKind::BigUInt,
        "fraction" => TypeKind::Fraction,
        other => bail!("unknown kind '{}' for type '{}'", other, name),
    };

    Ok(TypeDef {
        name: name.to_string(),
        kind,
    })
}

fn required(value: &Option<String>, name: &str, key: &str) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| eyre::eyre!("type '{}' is missing '{}'", name, key))
}

fn decode_field(field: &FieldEntry, all: &BTreeMap<String, TypeEntry>) -> Result<FieldDef> {
    let overflow = field
        .overflow
        .as_deref()
        .map(|p| {
            OverflowPolicy::parse(p)
                .ok_or_else(|| eyre::eyre!("bad overflow policy '{}' on '{}'", p, field.name))
        })
        .transpose()?;

    let default = field
        .default
        .as_ref()
        .map(|json| value_from_json(json, &field.type_name, all))
        .transpose()?;

    Ok(FieldDef {
        name: field.name.clone(),
        type_name: field.type_name.clone(),
        default,
        overflow,
    })
}

/// Encodes a default value. 128-bit integers, big numerics, and fractions
/// go out as decimal strings.
fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    use serde_json::json;

    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => json!(v),
        Value::Char(c) => json!(c.to_string()),
        Value::Int(v) => {
            if let Ok(small) = i64::try_from(*v) {
                json!(small)
            } else {
                json!(v.to_string())
            }
        }
        Value::UInt(v) => {
            if let Ok(small) = u64::try_from(*v) {
                json!(small)
            } else {
                json!(v.to_string())
            }
        }
        Value::Float(v) => json!(v),
        Value::Str(s) => json!(s),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect::<Result<_>>()?)
        }
        Value::Enum { variant, fields } => {
            if fields.is_empty() {
                json!(variant)
            } else {
                let mut map = serde_json::Map::new();
                map.insert("_variant".to_string(), json!(variant));
                for (name, value) in fields {
                    map.insert(name.clone(), value_to_json(value)?);
                }
                serde_json::Value::Object(map)
            }
        }
        Value::BigInt(v) => json!(v.to_decimal_string()),
        Value::Fraction { num, den } => {
            json!(format!("{}/{}", num.to_decimal_string(), den.to_decimal_string()))
        }
        other => bail!("unsupported default value kind '{}'", other.kind_name()),
    })
}

/// Resolves a type name through alias entries of the document.
fn resolve_entry<'a>(
    type_name: &str,
    all: &'a BTreeMap<String, TypeEntry>,
) -> Result<(String, Option<&'a TypeEntry>)> {
    let mut current = type_name.to_string();
    let mut hops = 0;
    loop {
        match all.get(&current) {
            Some(entry) if entry.kind == "alias" => {
                current = required(&entry.base_type, &current, "base_type")?;
                hops += 1;
                ensure!(hops <= all.len() + 16, "alias cycle through '{}'", type_name);
            }
            other => return Ok((current, other)),
        }
    }
}

/// Decodes a default value using the declared type for disambiguation
/// (character vs string vs decimal-string numerics).
fn value_from_json(
    json: &serde_json::Value,
    type_name: &str,
    all: &BTreeMap<String, TypeEntry>,
) -> Result<Value> {
    if json.is_null() {
        return Ok(Value::Null);
    }

    let (resolved, entry) = resolve_entry(type_name, all)?;

    // Builtins may be absent from older documents; fall back to the name.
    let kind = entry.map(|e| e.kind.as_str()).unwrap_or(match resolved.as_str() {
        "string" => "string",
        "boolean" => "boolean",
        "bigint" => "bigint",
        "biguint" => "biguint",
        "fraction" => "fraction",
        _ => "primitive",
    });

    match kind {
        "boolean" => Ok(Value::Bool(
            json.as_bool()
                .ok_or_else(|| eyre::eyre!("expected boolean default for '{}'", type_name))?,
        )),
        "primitive" => {
            let prim = entry
                .and_then(|e| e.primitive.as_deref())
                .or(Some(resolved.as_str()))
                .and_then(PrimitiveType::parse)
                .ok_or_else(|| eyre::eyre!("unknown primitive '{}'", resolved))?;
            decode_primitive_default(json, prim, type_name)
        }
        "string" => Ok(Value::Str(
            json.as_str()
                .ok_or_else(|| eyre::eyre!("expected string default for '{}'", type_name))?
                .to_string(),
        )),
        "bigint" | "biguint" => {
            let text = match json {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => bail!("expected decimal string default for '{}'", type_name),
            };
            Ok(Value::BigInt(BigNum::from_decimal_str(&text)?))
        }
        "fraction" => {
            let text = json
                .as_str()
                .ok_or_else(|| eyre::eyre!("expected 'num/den' default for '{}'", type_name))?;
            let (num, den) = text
                .split_once('/')
                .ok_or_else(|| eyre::eyre!("expected 'num/den' default for '{}'", type_name))?;
            Ok(Value::Fraction {
                num: BigNum::from_decimal_str(num)?,
                den: BigNum::from_decimal_str(den)?,
            })
        }
        "array" | "set" => {
            let element = entry
                .and_then(|e| e.element_type.clone())
                .ok_or_else(|| eyre::eyre!("array entry '{}' missing element type", resolved))?;
            let items = json
                .as_array()
                .ok_or_else(|| eyre::eyre!("expected array default for '{}'", type_name))?;
            Ok(Value::Array(
                items
                    .iter()
                    .map(|item| value_from_json(item, &element, all))
                    .collect::<Result<_>>()?,
            ))
        }
        "enum" => {
            let entry = entry.unwrap();
            match json {
                serde_json::Value::String(variant) => Ok(Value::enum_bare(variant.clone())),
                serde_json::Value::Object(map) => {
                    let variant = map
                        .get("_variant")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| eyre::eyre!("enum default missing '_variant'"))?;
                    let variant_entry = entry
                        .variants
                        .iter()
                        .find(|v| v.name == variant)
                        .ok_or_else(|| {
                            eyre::eyre!("unknown variant '{}' in default for '{}'", variant, resolved)
                        })?;
                    let mut fields = Vec::new();
                    for field in &variant_entry.fields {
                        if let Some(v) = map.get(&field.name) {
                            fields.push((
                                field.name.clone(),
                                value_from_json(v, &field.type_name, all)?,
                            ));
                        }
                    }
                    Ok(Value::Enum {
                        variant: variant.to_string(),
                        fields,
                    })
                }
                _ => bail!("bad enum default for '{}'", type_name),
            }
        }
        other => bail!(
            "defaults of kind '{}' are not supported (field type '{}')",
            other,
            type_name
        ),
    }
}

fn decode_primitive_default(
    json: &serde_json::Value,
    prim: PrimitiveType,
    type_name: &str,
) -> Result<Value> {
    match prim {
        PrimitiveType::Boolean => Ok(Value::Bool(
            json.as_bool()
                .ok_or_else(|| eyre::eyre!("expected boolean default for '{}'", type_name))?,
        )),
        PrimitiveType::Character => {
            let s = json
                .as_str()
                .ok_or_else(|| eyre::eyre!("expected character default for '{}'", type_name))?;
            let mut chars = s.chars();
            let c = chars
                .next()
                .ok_or_else(|| eyre::eyre!("empty character default for '{}'", type_name))?;
            ensure!(
                chars.next().is_none(),
                "character default for '{}' has more than one character",
                type_name
            );
            Ok(Value::Char(c))
        }
        PrimitiveType::Float32 | PrimitiveType::Float64 => Ok(Value::Float(
            json.as_f64()
                .ok_or_else(|| eyre::eyre!("expected float default for '{}'", type_name))?,
        )),
        p if p.is_signed() => match json {
            serde_json::Value::Number(n) => Ok(Value::Int(
                n.as_i64()
                    .ok_or_else(|| eyre::eyre!("bad integer default for '{}'", type_name))?
                    as i128,
            )),
            serde_json::Value::String(s) => Ok(Value::Int(s.parse::<i128>().wrap_err_with(
                || format!("bad int128 default for '{}'", type_name),
            )?)),
            _ => bail!("expected integer default for '{}'", type_name),
        },
        _ => match json {
            serde_json::Value::Number(n) => Ok(Value::UInt(
                n.as_u64()
                    .ok_or_else(|| eyre::eyre!("bad integer default for '{}'", type_name))?
                    as u128,
            )),
            serde_json::Value::String(s) => Ok(Value::UInt(s.parse::<u128>().wrap_err_with(
                || format!("bad uint128 default for '{}'", type_name),
            )?)),
            _ => bail!("expected integer default for '{}'", type_name),
        },
    }
}
