//! # Reference Resolver
//!
//! Translates between `Value`s and slot bytes, in both directions, for
//! every field kind. The write direction interns variable-length data into
//! the shared element stores and nested records into their catalogs; the
//! read direction reconstructs values, recovering dangling references as
//! logical nulls with a diagnostic.
//!
//! ## Nested Variable-Length Elements
//!
//! A string is already an array of characters, so an array of strings is
//! an array of arrays: the writer interns each inner string into the
//! `character` store first, then interns the run of `(start, length)`
//! pairs into the `string` store, and only that outer run lands in the
//! slot. The same discipline applies recursively to arrays of arrays,
//! sets of strings, and dictionary keys; the reader re-enters the
//! resolver per element to undo it.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::warn;
use zerocopy::IntoBytes;

use crate::schema::{PrimitiveType, SchemaRegistry, TypeKind};
use crate::storage::store_set::{BIGINT_STORE, BIGUINT_STORE, FRAC_DEN_STORE, FRAC_NUM_STORE};
use crate::storage::{RunRef, StoreSet};
use crate::types::{normalize_fraction, BigNum, Value};

use super::layout::{element_store_key, RecordLayout, SlotDesc, SlotShape};
use super::overflow::integer_slot_bits;

/// Sentinel variant-record index for bare variants of payload enums.
pub const NO_PAYLOAD: u32 = u32::MAX;

/// One projection produced by a type-faceted query.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetHit {
    pub composite: String,
    pub index: u32,
    pub field: String,
    pub value: Value,
}

// ---------------------------------------------------------------------------
// Write direction
// ---------------------------------------------------------------------------

/// Interns a composite record from a field-value map and returns its index.
pub fn intern_record(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    composite: &str,
    fields: &[(String, Value)],
) -> Result<u32> {
    let layout = RecordLayout::for_composite(registry, composite)?;
    let record = build_record(registry, stores, &layout, fields)?;
    let table = stores.table(composite, layout.record_size)?;
    let index = table.append(&record)?;
    ensure!(
        index <= u32::MAX as u64,
        "table '{}' overflowed the 32-bit index space",
        composite
    );
    Ok(index as u32)
}

/// Builds the record bytes for a field-value map: null bitmap first, then
/// slots in declaration order. Omitted fields take their default, else
/// null; explicit nulls stay null; unknown names are value errors.
pub fn build_record(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    layout: &RecordLayout,
    provided: &[(String, Value)],
) -> Result<Vec<u8>> {
    for (name, _) in provided {
        ensure!(
            layout.slot(name).is_some(),
            "'{}' has no field named '{}'",
            layout.type_name,
            name
        );
    }

    let mut record = vec![0u8; layout.record_size];
    for (i, slot) in layout.slots.iter().enumerate() {
        let supplied = provided.iter().find(|(n, _)| n == &slot.name).map(|(_, v)| v);
        let value = match supplied {
            Some(v) => v.clone(),
            None => match &slot.default {
                Some(default) => default.clone(),
                None => Value::Null,
            },
        };

        if value.is_null() {
            record[i / 8] |= 1 << (i % 8);
            continue;
        }

        let mut slot_buf = vec![0u8; slot.width];
        write_slot(registry, stores, slot, &value, &mut slot_buf)?;
        record[slot.offset..slot.offset + slot.width].copy_from_slice(&slot_buf);
    }
    Ok(record)
}

/// Applies field changes to an existing record in place. Variable-length
/// data re-interns at the element-store tail; the old runs become garbage
/// until compaction.
pub fn apply_changes(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    layout: &RecordLayout,
    record: &mut [u8],
    changes: &[(String, Value)],
) -> Result<()> {
    for (name, value) in changes {
        let slot_index = layout
            .slots
            .iter()
            .position(|s| &s.name == name)
            .ok_or_else(|| eyre::eyre!("'{}' has no field named '{}'", layout.type_name, name))?;
        let slot = layout.slots[slot_index].clone();

        if value.is_null() {
            layout.set_null(record, slot_index);
            continue;
        }

        let mut slot_buf = vec![0u8; slot.width];
        write_slot(registry, stores, &slot, value, &mut slot_buf)?;
        layout.clear_null(record, slot_index);
        record[slot.offset..slot.offset + slot.width].copy_from_slice(&slot_buf);
    }
    Ok(())
}

fn write_slot(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    slot: &SlotDesc,
    value: &Value,
    out: &mut [u8],
) -> Result<()> {
    match &slot.shape {
        SlotShape::Primitive(p) => {
            let bytes = pack_primitive(*p, slot.overflow, value, &slot.name)?;
            out.copy_from_slice(&bytes);
        }
        SlotShape::Str => {
            let text = value
                .as_str()
                .map_err(|_| eyre::eyre!("field '{}' expects a string value", slot.name))?;
            let run = intern_string(stores, text)?;
            out.copy_from_slice(run.as_bytes());
        }
        SlotShape::Run { element, unique } => {
            let items = coerce_items(registry, element, value, &slot.name)?;
            let run = write_element_run(registry, stores, element, &items, *unique)?;
            out.copy_from_slice(run.as_bytes());
        }
        SlotShape::Dict { entry, .. } => {
            let Value::Dict(entries) = value else {
                bail!(
                    "field '{}' expects a dictionary, found {}",
                    slot.name,
                    value.kind_name()
                );
            };
            let run = write_dict(registry, stores, entry, entries)?;
            out.copy_from_slice(run.as_bytes());
        }
        SlotShape::CompositeRef { target } => {
            let index = intern_composite_ref(registry, stores, target, value)?;
            out.copy_from_slice(&index.to_le_bytes());
        }
        SlotShape::InterfaceRef { interface } => {
            let (type_id, index) = intern_interface_ref(registry, stores, interface, value)?;
            out[..2].copy_from_slice(&type_id.to_le_bytes());
            out[2..6].copy_from_slice(&index.to_le_bytes());
        }
        SlotShape::BareEnum { enum_name, width } => {
            let disc = bare_enum_discriminant(registry, enum_name, value)?;
            out.copy_from_slice(&disc.to_le_bytes()[..*width]);
        }
        SlotShape::PayloadEnum {
            enum_name,
            disc_width,
        } => {
            let (disc, index) = intern_enum_payload(registry, stores, enum_name, value)?;
            out[..*disc_width].copy_from_slice(&disc.to_le_bytes()[..*disc_width]);
            out[*disc_width..*disc_width + 4].copy_from_slice(&index.to_le_bytes());
        }
        SlotShape::BigInt { signed } => {
            let run = write_bignum(stores, *signed, value, &slot.name)?;
            out.copy_from_slice(run.as_bytes());
        }
        SlotShape::Fraction => {
            let (num_run, den_run) = write_fraction(stores, value, &slot.name)?;
            out[..8].copy_from_slice(num_run.as_bytes());
            out[8..].copy_from_slice(den_run.as_bytes());
        }
    }
    Ok(())
}

/// A string value is a legal array of characters; everything else must be
/// an array literal.
fn coerce_items(
    registry: &SchemaRegistry,
    element: &str,
    value: &Value,
    field: &str,
) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Str(s)
            if matches!(
                registry.resolve(element)?.kind,
                TypeKind::Primitive(PrimitiveType::Character)
            ) =>
        {
            Ok(s.chars().map(Value::Char).collect())
        }
        other => bail!(
            "field '{}' expects an array of '{}', found {}",
            field,
            element,
            other.kind_name()
        ),
    }
}

fn intern_string(stores: &mut StoreSet, text: &str) -> Result<RunRef> {
    if text.is_empty() {
        return Ok(RunRef::empty());
    }
    let mut bytes = Vec::with_capacity(text.chars().count() * 4);
    for ch in text.chars() {
        bytes.extend_from_slice(&(ch as u32).to_le_bytes());
    }
    stores.element("character", 4)?.insert_run(&bytes)
}

/// Interns a run of elements, recursing through nested variable-length
/// element types first.
fn write_element_run(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    element_type: &str,
    items: &[Value],
    unique: bool,
) -> Result<RunRef> {
    let deduped: Vec<Value>;
    let items: &[Value] = if unique {
        let mut seen: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !seen.contains(item) {
                seen.push(item.clone());
            }
        }
        deduped = seen;
        &deduped
    } else {
        items
    };

    if items.is_empty() {
        return Ok(RunRef::empty());
    }

    let resolved = registry.resolve(element_type)?.clone();
    let (store_key, width) = element_store_key(registry, element_type)?;
    let mut bytes = Vec::with_capacity(items.len() * width);

    match &resolved.kind {
        TypeKind::Primitive(p) => {
            for item in items {
                let packed =
                    pack_primitive(*p, crate::schema::OverflowPolicy::Error, item, element_type)?;
                bytes.extend_from_slice(&packed);
            }
        }
        TypeKind::StringType => {
            for item in items {
                let text = item
                    .as_str()
                    .map_err(|_| eyre::eyre!("string element expected, found {}", item.kind_name()))?;
                let run = intern_string(stores, text)?;
                bytes.extend_from_slice(run.as_bytes());
            }
        }
        TypeKind::Array { element: inner } | TypeKind::Set { element: inner } => {
            let inner_unique = matches!(resolved.kind, TypeKind::Set { .. });
            for item in items {
                let inner_items = coerce_items(registry, inner, item, element_type)?;
                let run = write_element_run(registry, stores, inner, &inner_items, inner_unique)?;
                bytes.extend_from_slice(run.as_bytes());
            }
        }
        TypeKind::Composite { .. } => {
            for item in items {
                let index = intern_composite_ref(registry, stores, &resolved.name, item)?;
                bytes.extend_from_slice(&index.to_le_bytes());
            }
        }
        TypeKind::Interface { .. } => {
            for item in items {
                let (type_id, index) =
                    intern_interface_ref(registry, stores, &resolved.name, item)?;
                bytes.extend_from_slice(&type_id.to_le_bytes());
                bytes.extend_from_slice(&index.to_le_bytes());
            }
        }
        TypeKind::Enum { .. } => {
            let disc_width = resolved.discriminant_width()?;
            for item in items {
                if resolved.has_payload() {
                    let (disc, index) =
                        intern_enum_payload(registry, stores, &resolved.name, item)?;
                    bytes.extend_from_slice(&disc.to_le_bytes()[..disc_width]);
                    bytes.extend_from_slice(&index.to_le_bytes());
                } else {
                    let disc = bare_enum_discriminant(registry, &resolved.name, item)?;
                    bytes.extend_from_slice(&disc.to_le_bytes()[..disc_width]);
                }
            }
        }
        _ => bail!("'{}' cannot be an element type", element_type),
    }

    stores.element(&store_key, width)?.insert_run(&bytes)
}

fn write_dict(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    entry_composite: &str,
    entries: &[(Value, Value)],
) -> Result<RunRef> {
    for (i, (key, _)) in entries.iter().enumerate() {
        ensure!(
            !entries[..i].iter().any(|(k, _)| k == key),
            "duplicate dictionary key {}",
            key
        );
    }

    if entries.is_empty() {
        return Ok(RunRef::empty());
    }

    let mut bytes = Vec::with_capacity(entries.len() * 4);
    for (key, value) in entries {
        let fields = vec![
            ("key".to_string(), key.clone()),
            ("value".to_string(), value.clone()),
        ];
        let index = intern_record(registry, stores, entry_composite, &fields)?;
        bytes.extend_from_slice(&index.to_le_bytes());
    }
    stores.element("uint32", 4)?.insert_run(&bytes)
}

fn intern_composite_ref(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    target: &str,
    value: &Value,
) -> Result<u32> {
    match value {
        Value::Record { type_name, fields } => {
            ensure!(
                type_name == target,
                "field of type '{}' cannot hold a '{}' record",
                target,
                type_name
            );
            intern_record(registry, stores, target, fields)
        }
        Value::Ref { type_name, index } => {
            ensure!(
                type_name == target,
                "field of type '{}' cannot reference a '{}' record",
                target,
                type_name
            );
            Ok(*index)
        }
        other => bail!(
            "field of type '{}' expects a record or reference, found {}",
            target,
            other.kind_name()
        ),
    }
}

fn intern_interface_ref(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    interface: &str,
    value: &Value,
) -> Result<(u16, u32)> {
    let (concrete, index) = match value {
        Value::Record { type_name, fields } => {
            ensure!(
                registry.implements(type_name, interface)?,
                "'{}' does not implement interface '{}'",
                type_name,
                interface
            );
            let index = intern_record(registry, stores, type_name, fields)?;
            (type_name.clone(), index)
        }
        Value::Ref { type_name, index } => {
            ensure!(
                registry.implements(type_name, interface)?,
                "'{}' does not implement interface '{}'",
                type_name,
                interface
            );
            (type_name.clone(), *index)
        }
        other => bail!(
            "interface '{}' field expects a record or reference, found {}",
            interface,
            other.kind_name()
        ),
    };
    Ok((registry.type_id(&concrete)?, index))
}

fn bare_enum_discriminant(
    registry: &SchemaRegistry,
    enum_name: &str,
    value: &Value,
) -> Result<u32> {
    let Value::Enum { variant, fields } = value else {
        bail!(
            "enum '{}' field expects an enum value, found {}",
            enum_name,
            value.kind_name()
        );
    };
    ensure!(
        fields.is_empty(),
        "variant '{}' of enum '{}' takes no fields",
        variant,
        enum_name
    );
    let def = registry.get(enum_name)?;
    let variant_def = def
        .variant(variant)
        .ok_or_else(|| eyre::eyre!("enum '{}' has no variant '{}'", enum_name, variant))?;
    Ok(variant_def.discriminant)
}

fn intern_enum_payload(
    registry: &SchemaRegistry,
    stores: &mut StoreSet,
    enum_name: &str,
    value: &Value,
) -> Result<(u32, u32)> {
    let Value::Enum { variant, fields } = value else {
        bail!(
            "enum '{}' field expects an enum value, found {}",
            enum_name,
            value.kind_name()
        );
    };
    let def = registry.get(enum_name)?;
    let variant_def = def
        .variant(variant)
        .ok_or_else(|| eyre::eyre!("enum '{}' has no variant '{}'", enum_name, variant))?;

    if variant_def.fields.is_empty() {
        ensure!(
            fields.is_empty(),
            "variant '{}' of enum '{}' takes no fields",
            variant,
            enum_name
        );
        return Ok((variant_def.discriminant, NO_PAYLOAD));
    }

    let layout = RecordLayout::for_variant(registry, enum_name, variant)?;
    let record = build_record(registry, stores, &layout, fields)?;
    let file = stores.variant(enum_name, variant, layout.record_size)?;
    let index = file.append(&record)?;
    ensure!(
        index < NO_PAYLOAD as u64,
        "variant catalog '{}::{}' overflowed the 32-bit index space",
        enum_name,
        variant
    );
    Ok((variant_def.discriminant, index as u32))
}

fn write_bignum(
    stores: &mut StoreSet,
    signed: bool,
    value: &Value,
    field: &str,
) -> Result<RunRef> {
    let big = match value {
        Value::BigInt(b) => b.clone(),
        Value::Int(v) => BigNum::from_i128(*v),
        Value::UInt(v) => BigNum::from_u128(*v),
        other => bail!(
            "field '{}' expects an integer value, found {}",
            field,
            other.kind_name()
        ),
    };

    if signed {
        let bytes = big.to_twos_complement();
        if bytes.is_empty() {
            return Ok(RunRef::empty());
        }
        stores.element(BIGINT_STORE, 1)?.insert_run(&bytes)
    } else {
        ensure!(
            !big.is_negative(),
            "field '{}' is unsigned but the value is negative",
            field
        );
        let bytes = big.to_unsigned_bytes()?;
        if bytes.is_empty() {
            return Ok(RunRef::empty());
        }
        stores.element(BIGUINT_STORE, 1)?.insert_run(&bytes)
    }
}

fn write_fraction(
    stores: &mut StoreSet,
    value: &Value,
    field: &str,
) -> Result<(RunRef, RunRef)> {
    let (num, den) = match value {
        Value::Fraction { num, den } => (num.clone(), den.clone()),
        Value::Int(v) => (BigNum::from_i128(*v), BigNum::from_u128(1)),
        Value::BigInt(b) => (b.clone(), BigNum::from_u128(1)),
        other => bail!(
            "field '{}' expects a fraction, found {}",
            field,
            other.kind_name()
        ),
    };

    let (num, den) = normalize_fraction(num, den)?;

    let num_bytes = num.to_twos_complement();
    let num_run = if num_bytes.is_empty() {
        RunRef::empty()
    } else {
        stores.element(FRAC_NUM_STORE, 1)?.insert_run(&num_bytes)?
    };

    let den_bytes = den.to_unsigned_bytes()?;
    let den_run = if den_bytes.is_empty() {
        RunRef::empty()
    } else {
        stores.element(FRAC_DEN_STORE, 1)?.insert_run(&den_bytes)?
    };

    Ok((num_run, den_run))
}

fn pack_primitive(
    prim: PrimitiveType,
    policy: crate::schema::OverflowPolicy,
    value: &Value,
    field: &str,
) -> Result<SmallVec<[u8; 16]>> {
    let mut out: SmallVec<[u8; 16]> = SmallVec::new();
    match prim {
        PrimitiveType::Boolean => {
            let Value::Bool(v) = value else {
                bail!("field '{}' expects boolean, found {}", field, value.kind_name());
            };
            out.push(*v as u8);
        }
        PrimitiveType::Character => {
            let Value::Char(c) = value else {
                bail!("field '{}' expects character, found {}", field, value.kind_name());
            };
            out.extend_from_slice(&(*c as u32).to_le_bytes());
        }
        PrimitiveType::Float32 => {
            let Value::Float(v) = value else {
                bail!("field '{}' expects float32, found {}", field, value.kind_name());
            };
            out.extend_from_slice(&(*v as f32).to_le_bytes());
        }
        PrimitiveType::Float64 => {
            let Value::Float(v) = value else {
                bail!("field '{}' expects float64, found {}", field, value.kind_name());
            };
            out.extend_from_slice(&v.to_le_bytes());
        }
        p => {
            let bits = integer_slot_bits(p, policy, value, field)?;
            out.extend_from_slice(&bits.to_le_bytes()[..p.width()]);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Read direction
// ---------------------------------------------------------------------------

/// Reads a live record as `Value::Record` with every effective field.
pub fn read_record(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    composite: &str,
    index: u32,
) -> Result<Value> {
    let layout = RecordLayout::for_composite(registry, composite)?;
    let count = stores
        .table_ref(composite)
        .map(|t| t.count())
        .unwrap_or(0);
    ensure!(
        (index as u64) < count,
        "record {} out of bounds (count={}) in '{}'",
        index,
        count,
        composite
    );

    let table = stores.table_ref(composite).unwrap();
    ensure!(
        !table.is_tombstoned(index as u64)?,
        "record {} in '{}' is deleted",
        index,
        composite
    );

    let bytes = table.read(index as u64)?.to_vec();
    let fields = read_record_fields(registry, stores, &layout, &bytes)?;
    Ok(Value::Record {
        type_name: composite.to_string(),
        fields,
    })
}

pub fn read_record_fields(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    layout: &RecordLayout,
    record: &[u8],
) -> Result<Vec<(String, Value)>> {
    let mut fields = Vec::with_capacity(layout.slots.len());
    for (i, slot) in layout.slots.iter().enumerate() {
        let value = if layout.is_null(record, i) {
            Value::Null
        } else {
            read_slot(registry, stores, slot, layout.slot_bytes(record, i))?
        };
        fields.push((slot.name.clone(), value));
    }
    Ok(fields)
}

pub fn read_slot(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    slot: &SlotDesc,
    bytes: &[u8],
) -> Result<Value> {
    match &slot.shape {
        SlotShape::Primitive(p) => unpack_primitive(*p, bytes),
        SlotShape::Str => {
            let run = RunRef::from_slot(bytes)?;
            Ok(Value::Str(read_string(stores, run)?))
        }
        SlotShape::Run { element, .. } => {
            let run = RunRef::from_slot(bytes)?;
            Ok(Value::Array(read_element_run(
                registry, stores, element, run,
            )?))
        }
        SlotShape::Dict { entry, .. } => {
            let run = RunRef::from_slot(bytes)?;
            read_dict(registry, stores, entry, run)
        }
        SlotShape::CompositeRef { target } => {
            let index = u32::from_le_bytes(bytes[..4].try_into().unwrap());
            Ok(composite_ref_or_null(stores, target, index))
        }
        SlotShape::InterfaceRef { .. } => {
            let type_id = u16::from_le_bytes(bytes[..2].try_into().unwrap());
            let index = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
            let Some(concrete) = registry.type_name_by_id(type_id) else {
                warn!(type_id, "interface slot names an unknown type-id; reading as null");
                return Ok(Value::Null);
            };
            Ok(composite_ref_or_null(stores, concrete, index))
        }
        SlotShape::BareEnum { enum_name, width } => {
            let disc = read_discriminant(bytes, *width);
            let def = registry.get(enum_name)?;
            let variant = def.variant_by_discriminant(disc).ok_or_else(|| {
                eyre::eyre!("discriminant {} not present in enum '{}'", disc, enum_name)
            })?;
            Ok(Value::enum_bare(variant.name.clone()))
        }
        SlotShape::PayloadEnum {
            enum_name,
            disc_width,
        } => {
            let disc = read_discriminant(bytes, *disc_width);
            let index = u32::from_le_bytes(bytes[*disc_width..*disc_width + 4].try_into().unwrap());
            read_enum_payload(registry, stores, enum_name, disc, index)
        }
        SlotShape::BigInt { signed } => {
            let run = RunRef::from_slot(bytes)?;
            let store_key = if *signed { BIGINT_STORE } else { BIGUINT_STORE };
            let raw = read_byte_run(stores, store_key, run)?;
            let big = if *signed {
                BigNum::from_twos_complement(&raw)
            } else {
                BigNum::from_unsigned_bytes(&raw)
            };
            Ok(Value::BigInt(big))
        }
        SlotShape::Fraction => {
            let num_run = RunRef::from_slot(&bytes[..8])?;
            let den_run = RunRef::from_slot(&bytes[8..])?;
            let num = BigNum::from_twos_complement(&read_byte_run(stores, FRAC_NUM_STORE, num_run)?);
            let den = BigNum::from_unsigned_bytes(&read_byte_run(stores, FRAC_DEN_STORE, den_run)?);
            // An all-zero slot decodes as 0/0 only for corrupted data; the
            // writer always stores a normalised denominator >= 1.
            let den = if den.is_zero() && num.is_zero() {
                BigNum::from_u128(1)
            } else {
                den
            };
            Ok(Value::Fraction { num, den })
        }
    }
}

fn composite_ref_or_null(stores: &StoreSet, target: &str, index: u32) -> Value {
    if index == NO_PAYLOAD {
        warn!(table = target, "dangling element sentinel; reading as null");
        return Value::Null;
    }
    match stores.table_ref(target) {
        Some(table) if (index as u64) < table.count() => {
            match table.is_tombstoned(index as u64) {
                Ok(false) => Value::reference(target, index),
                _ => {
                    warn!(table = target, index, "reference to deleted record; reading as null");
                    Value::Null
                }
            }
        }
        _ => {
            warn!(table = target, index, "dangling reference; reading as null");
            Value::Null
        }
    }
}

fn read_discriminant(bytes: &[u8], width: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(&bytes[..width]);
    u32::from_le_bytes(buf)
}

fn read_enum_payload(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    enum_name: &str,
    disc: u32,
    index: u32,
) -> Result<Value> {
    let def = registry.get(enum_name)?;
    let variant = def.variant_by_discriminant(disc).ok_or_else(|| {
        eyre::eyre!("discriminant {} not present in enum '{}'", disc, enum_name)
    })?;

    if index == NO_PAYLOAD {
        return Ok(Value::enum_bare(variant.name.clone()));
    }

    let layout = RecordLayout::for_variant(registry, enum_name, &variant.name)?;
    let Some(file) = stores.variant_ref(enum_name, &variant.name) else {
        warn!(enum_name, variant = %variant.name, "missing variant catalog; reading as null");
        return Ok(Value::Null);
    };
    if (index as u64) >= file.count() || file.is_tombstoned(index as u64)? {
        warn!(enum_name, variant = %variant.name, index, "dangling variant record; reading as null");
        return Ok(Value::Null);
    }

    let bytes = file.read(index as u64)?.to_vec();
    let fields = read_record_fields(registry, stores, &layout, &bytes)?;
    Ok(Value::Enum {
        variant: variant.name.clone(),
        fields,
    })
}

fn read_string(stores: &StoreSet, run: RunRef) -> Result<String> {
    if run.is_empty() {
        return Ok(String::new());
    }
    let store = stores
        .element_ref("character")
        .ok_or_else(|| eyre::eyre!("character store missing but a string run is non-empty"))?;
    let bytes = store.read_run(run)?;
    let mut text = String::with_capacity(run.len() as usize);
    for chunk in bytes.chunks_exact(4) {
        let code = u32::from_le_bytes(chunk.try_into().unwrap());
        let ch = char::from_u32(code)
            .ok_or_else(|| eyre::eyre!("invalid character code point {:#x}", code))?;
        text.push(ch);
    }
    Ok(text)
}

fn read_byte_run(stores: &StoreSet, store_key: &str, run: RunRef) -> Result<Vec<u8>> {
    if run.is_empty() {
        return Ok(Vec::new());
    }
    let store = stores
        .element_ref(store_key)
        .ok_or_else(|| eyre::eyre!("byte store '{}' missing but a run is non-empty", store_key))?;
    store.read_run(run)
}

/// Reconstructs a run of elements, re-entering the resolver for nested
/// variable-length element types.
pub fn read_element_run(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    element_type: &str,
    run: RunRef,
) -> Result<Vec<Value>> {
    if run.is_empty() {
        return Ok(Vec::new());
    }

    let resolved = registry.resolve(element_type)?.clone();
    let (store_key, width) = element_store_key(registry, element_type)?;
    let store = stores.element_ref(&store_key).ok_or_else(|| {
        eyre::eyre!("element store '{}' missing but a run is non-empty", store_key)
    })?;
    let bytes = store.read_run(run)?;

    let mut values = Vec::with_capacity(run.len() as usize);
    for chunk in bytes.chunks_exact(width) {
        let value = match &resolved.kind {
            TypeKind::Primitive(p) => unpack_primitive(*p, chunk)?,
            TypeKind::StringType => {
                let inner = RunRef::from_slot(chunk)?;
                Value::Str(read_string(stores, inner)?)
            }
            TypeKind::Array { element: inner } | TypeKind::Set { element: inner } => {
                let inner_run = RunRef::from_slot(chunk)?;
                Value::Array(read_element_run(registry, stores, inner, inner_run)?)
            }
            TypeKind::Composite { .. } => {
                let index = u32::from_le_bytes(chunk[..4].try_into().unwrap());
                composite_ref_or_null(stores, &resolved.name, index)
            }
            TypeKind::Interface { .. } => {
                let type_id = u16::from_le_bytes(chunk[..2].try_into().unwrap());
                let index = u32::from_le_bytes(chunk[2..6].try_into().unwrap());
                match registry.type_name_by_id(type_id) {
                    Some(concrete) => composite_ref_or_null(stores, concrete, index),
                    None => {
                        warn!(type_id, "interface element names an unknown type-id; null");
                        Value::Null
                    }
                }
            }
            TypeKind::Enum { .. } => {
                let disc_width = resolved.discriminant_width()?;
                let disc = read_discriminant(chunk, disc_width);
                if resolved.has_payload() {
                    let index =
                        u32::from_le_bytes(chunk[disc_width..disc_width + 4].try_into().unwrap());
                    read_enum_payload(registry, stores, &resolved.name, disc, index)?
                } else {
                    let variant = resolved.variant_by_discriminant(disc).ok_or_else(|| {
                        eyre::eyre!(
                            "discriminant {} not present in enum '{}'",
                            disc,
                            resolved.name
                        )
                    })?;
                    Value::enum_bare(variant.name.clone())
                }
            }
            _ => bail!("'{}' cannot be an element type", element_type),
        };
        values.push(value);
    }
    Ok(values)
}

fn read_dict(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    entry_composite: &str,
    run: RunRef,
) -> Result<Value> {
    if run.is_empty() {
        return Ok(Value::Dict(Vec::new()));
    }

    let index_store = stores
        .element_ref("uint32")
        .ok_or_else(|| eyre::eyre!("uint32 store missing but a dictionary run is non-empty"))?;
    let bytes = index_store.read_run(run)?;

    let mut entries = Vec::with_capacity(run.len() as usize);
    for chunk in bytes.chunks_exact(4) {
        let index = u32::from_le_bytes(chunk.try_into().unwrap());
        match read_record(registry, stores, entry_composite, index) {
            Ok(record) => {
                let key = record.field("key").cloned().unwrap_or(Value::Null);
                let value = record.field("value").cloned().unwrap_or(Value::Null);
                entries.push((key, value));
            }
            Err(_) => {
                warn!(entry_composite, index, "dangling dictionary entry; skipping");
            }
        }
    }
    Ok(Value::Dict(entries))
}

fn unpack_primitive(prim: PrimitiveType, bytes: &[u8]) -> Result<Value> {
    let bytes = &bytes[..prim.width()];
    Ok(match prim {
        PrimitiveType::Boolean => Value::Bool(bytes[0] != 0),
        PrimitiveType::Character => {
            let code = u32::from_le_bytes(bytes.try_into().unwrap());
            Value::Char(
                char::from_u32(code)
                    .ok_or_else(|| eyre::eyre!("invalid character code point {:#x}", code))?,
            )
        }
        PrimitiveType::Float32 => {
            Value::Float(f32::from_le_bytes(bytes.try_into().unwrap()) as f64)
        }
        PrimitiveType::Float64 => Value::Float(f64::from_le_bytes(bytes.try_into().unwrap())),
        p if p.is_signed() => {
            let mut buf = [0u8; 16];
            buf[..bytes.len()].copy_from_slice(bytes);
            // Sign-extend from the slot width.
            if bytes.last().is_some_and(|&b| b >= 0x80) {
                buf[bytes.len()..].fill(0xFF);
            }
            Value::Int(i128::from_le_bytes(buf))
        }
        _ => {
            let mut buf = [0u8; 16];
            buf[..bytes.len()].copy_from_slice(bytes);
            Value::UInt(u128::from_le_bytes(buf))
        }
    })
}

// ---------------------------------------------------------------------------
// Type-faceted queries
// ---------------------------------------------------------------------------

/// Walks every composite with a field whose effective type resolves to
/// `target` and yields each live projection of that field.
pub fn values_of(
    registry: &SchemaRegistry,
    stores: &StoreSet,
    target: &str,
) -> Result<Vec<FacetHit>> {
    let resolved_target = registry.resolve(target)?.clone();
    ensure!(
        !resolved_target.is_composite(),
        "type-faceted queries apply to non-composite types; '{}' is a composite",
        target
    );

    let mut hits = Vec::new();
    for name in registry.sorted_names() {
        if !registry.get(&name)?.is_composite() {
            continue;
        }
        // Zero-field marker composites have no layout and no records.
        if registry.effective_fields(&name)?.is_empty() {
            continue;
        }
        let layout = RecordLayout::for_composite(registry, &name)?;
        let projected: Vec<usize> = layout
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                registry
                    .resolve(&slot.type_name)
                    .map(|r| r.name == resolved_target.name)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        if projected.is_empty() {
            continue;
        }

        let Some(table) = stores.table_ref(&name) else {
            continue;
        };
        let live: Vec<(u64, Vec<u8>)> = table
            .iter_live()
            .map(|(i, bytes)| (i, bytes.to_vec()))
            .collect();

        for (index, record) in live {
            for &slot_index in &projected {
                let slot = &layout.slots[slot_index];
                let value = if layout.is_null(&record, slot_index) {
                    Value::Null
                } else {
                    read_slot(registry, stores, slot, layout.slot_bytes(&record, slot_index))?
                };
                hits.push(FacetHit {
                    composite: name.clone(),
                    index: index as u32,
                    field: slot.name.clone(),
                    value,
                });
            }
        }
    }
    Ok(hits)
}
