//! # Composite Record Layout
//!
//! A composite record is `[null bitmap][slot 0][slot 1]…` with the bitmap
//! occupying ⌈N/8⌉ bytes and slots packed in effective-field declaration
//! order. Layouts are computed from the registry on demand; field lists are
//! immutable after registration, so a layout never goes stale.
//!
//! Bit `i` of the bitmap is `i % 8` within byte `i / 8`. A set bit means
//! null and forces the slot's bytes to zero; readers consult the bitmap
//! before interpreting any slot. The unused high bits of the final bitmap
//! byte stay zero, which is what keeps the all-0xFF tombstone sentinel
//! unambiguous.

use eyre::{bail, ensure, Result};

use crate::schema::{OverflowPolicy, PrimitiveType, SchemaRegistry, TypeKind};
use crate::storage::RUN_REF_SIZE;
use crate::types::Value;

/// How a slot's bytes are interpreted, after alias resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotShape {
    Primitive(PrimitiveType),
    /// `(uint32 start, uint32 length)` run of characters.
    Str,
    /// `(start, length)` run in the element store of `element`; `unique`
    /// marks set semantics (first-occurrence dedup on write).
    Run { element: String, unique: bool },
    /// `(start, length)` run of uint32 entry indices into the synthetic
    /// entry composite.
    Dict {
        key: String,
        value: String,
        entry: String,
    },
    /// uint32 index into the target composite's catalog.
    CompositeRef { target: String },
    /// `(uint16 type-id, uint32 index)` tagged reference.
    InterfaceRef { interface: String },
    /// Discriminant only.
    BareEnum { enum_name: String, width: usize },
    /// Discriminant + uint32 variant-record index (0xFFFFFFFF for bare
    /// variants).
    PayloadEnum {
        enum_name: String,
        disc_width: usize,
    },
    /// `(start, length)` run in the signed or unsigned byte store.
    BigInt { signed: bool },
    /// Numerator and denominator runs, 16 bytes.
    Fraction,
}

#[derive(Debug, Clone)]
pub struct SlotDesc {
    pub name: String,
    pub type_name: String,
    pub shape: SlotShape,
    pub offset: usize,
    pub width: usize,
    pub default: Option<Value>,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub type_name: String,
    pub bitmap_bytes: usize,
    pub slots: Vec<SlotDesc>,
    pub record_size: usize,
}

impl RecordLayout {
    /// Layout of a composite's records from its effective fields.
    pub fn for_composite(registry: &SchemaRegistry, name: &str) -> Result<Self> {
        let def = registry.get(name)?;
        ensure!(def.is_composite(), "'{}' is not a composite", name);
        let fields = registry.effective_fields(name)?;
        Self::for_fields(registry, name, &fields)
    }

    /// Layout of an enum variant's payload records.
    pub fn for_variant(registry: &SchemaRegistry, enum_name: &str, variant: &str) -> Result<Self> {
        let def = registry.get(enum_name)?;
        let variant_def = def
            .variant(variant)
            .ok_or_else(|| eyre::eyre!("unknown variant '{}' on enum '{}'", variant, enum_name))?;
        ensure!(
            !variant_def.fields.is_empty(),
            "variant '{}::{}' has no payload",
            enum_name,
            variant
        );
        Self::for_fields(
            registry,
            &format!("{}::{}", enum_name, variant),
            &variant_def.fields,
        )
    }

    pub fn for_fields(
        registry: &SchemaRegistry,
        owner: &str,
        fields: &[crate::schema::FieldDef],
    ) -> Result<Self> {
        ensure!(!fields.is_empty(), "'{}' has no fields to lay out", owner);

        let bitmap_bytes = fields.len().div_ceil(8);
        let mut slots = Vec::with_capacity(fields.len());
        let mut offset = bitmap_bytes;

        for field in fields {
            let (shape, width) = shape_of(registry, &field.type_name)?;
            slots.push(SlotDesc {
                name: field.name.clone(),
                type_name: field.type_name.clone(),
                shape,
                offset,
                width,
                default: field.default.clone(),
                overflow: field.overflow.unwrap_or_default(),
            });
            offset += width;
        }

        Ok(Self {
            type_name: owner.to_string(),
            bitmap_bytes,
            slots,
            record_size: offset,
        })
    }

    pub fn slot(&self, name: &str) -> Option<&SlotDesc> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn is_null(&self, record: &[u8], slot_index: usize) -> bool {
        record[slot_index / 8] & (1 << (slot_index % 8)) != 0
    }

    pub fn set_null(&self, record: &mut [u8], slot_index: usize) {
        record[slot_index / 8] |= 1 << (slot_index % 8);
        let slot = &self.slots[slot_index];
        record[slot.offset..slot.offset + slot.width].fill(0);
    }

    pub fn clear_null(&self, record: &mut [u8], slot_index: usize) {
        record[slot_index / 8] &= !(1 << (slot_index % 8));
    }

    pub fn slot_bytes<'r>(&self, record: &'r [u8], slot_index: usize) -> &'r [u8] {
        let slot = &self.slots[slot_index];
        &record[slot.offset..slot.offset + slot.width]
    }

    pub fn slot_bytes_mut<'r>(&self, record: &'r mut [u8], slot_index: usize) -> &'r mut [u8] {
        let slot = &self.slots[slot_index];
        &mut record[slot.offset..slot.offset + slot.width]
    }

    /// An all-null record: every bitmap bit set, every slot zeroed.
    pub fn null_record(&self) -> Vec<u8> {
        let mut record = vec![0u8; self.record_size];
        for i in 0..self.slots.len() {
            record[i / 8] |= 1 << (i % 8);
        }
        record
    }
}

/// Resolves a declared field type to its slot shape and width.
pub fn shape_of(registry: &SchemaRegistry, type_name: &str) -> Result<(SlotShape, usize)> {
    let resolved = registry.resolve(type_name)?;
    let shape = match &resolved.kind {
        TypeKind::Primitive(p) => SlotShape::Primitive(*p),
        TypeKind::StringType => SlotShape::Str,
        TypeKind::Array { element } => SlotShape::Run {
            element: element.clone(),
            unique: false,
        },
        TypeKind::Set { element } => SlotShape::Run {
            element: element.clone(),
            unique: true,
        },
        TypeKind::Dictionary { key, value, entry } => SlotShape::Dict {
            key: key.clone(),
            value: value.clone(),
            entry: entry.clone(),
        },
        TypeKind::Composite { .. } => SlotShape::CompositeRef {
            target: resolved.name.clone(),
        },
        TypeKind::Interface { .. } => SlotShape::InterfaceRef {
            interface: resolved.name.clone(),
        },
        TypeKind::Enum { .. } => {
            let disc = resolved.discriminant_width()?;
            if resolved.has_payload() {
                SlotShape::PayloadEnum {
                    enum_name: resolved.name.clone(),
                    disc_width: disc,
                }
            } else {
                SlotShape::BareEnum {
                    enum_name: resolved.name.clone(),
                    width: disc,
                }
            }
        }
        TypeKind::BigInt => SlotShape::BigInt { signed: true },
        TypeKind::BigUInt => SlotShape::BigInt { signed: false },
        TypeKind::Fraction => SlotShape::Fraction,
        TypeKind::Alias { .. } => unreachable!("resolve() strips aliases"),
        TypeKind::Stub => bail!("field type '{}' is an unpopulated forward stub", type_name),
    };
    let width = resolved.slot_width()?;
    Ok((shape, width))
}

/// The element store serving runs of `element_type`, as `(key, width)`.
/// Composite elements share the `uint32` index store; everything else is
/// keyed by its resolved type name.
pub fn element_store_key(
    registry: &SchemaRegistry,
    element_type: &str,
) -> Result<(String, usize)> {
    let resolved = registry.resolve(element_type)?;
    match &resolved.kind {
        TypeKind::Primitive(p) => Ok((p.name().to_string(), p.width())),
        TypeKind::StringType => Ok(("string".to_string(), RUN_REF_SIZE)),
        TypeKind::Array { .. } | TypeKind::Set { .. } => {
            Ok((resolved.name.clone(), RUN_REF_SIZE))
        }
        TypeKind::Composite { .. } => Ok(("uint32".to_string(), 4)),
        TypeKind::Interface { .. } => Ok((resolved.name.clone(), 6)),
        TypeKind::Enum { .. } => Ok((resolved.name.clone(), resolved.element_width()?)),
        _ => bail!("'{}' cannot be an element type", element_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, SchemaRegistry, TypeDef};

    fn registry_with_person() -> SchemaRegistry {
        let mut reg = SchemaRegistry::new();
        reg.ensure_array("string").unwrap();
        reg.register(TypeDef::composite(
            "Person",
            vec![
                FieldDef::new("age", "uint8"),
                FieldDef::new("name", "string"),
                FieldDef::new("tags", "string[]"),
                FieldDef::new("friend", "Person"),
            ],
        ))
        .unwrap();
        reg
    }

    #[test]
    fn offsets_follow_declaration_order() {
        let reg = registry_with_person();
        let layout = RecordLayout::for_composite(&reg, "Person").unwrap();

        assert_eq!(layout.bitmap_bytes, 1);
        assert_eq!(layout.slots[0].offset, 1); // age: u8
        assert_eq!(layout.slots[1].offset, 2); // name: run
        assert_eq!(layout.slots[2].offset, 10); // tags: run
        assert_eq!(layout.slots[3].offset, 18); // friend: u32 index
        assert_eq!(layout.record_size, 22);
    }

    #[test]
    fn bitmap_grows_with_field_count() {
        let mut reg = SchemaRegistry::new();
        let fields: Vec<FieldDef> = (0..9)
            .map(|i| FieldDef::new(format!("f{}", i), "uint8"))
            .collect();
        reg.register(TypeDef::composite("Wide", fields)).unwrap();

        let layout = RecordLayout::for_composite(&reg, "Wide").unwrap();
        assert_eq!(layout.bitmap_bytes, 2);
        assert_eq!(layout.record_size, 2 + 9);
    }

    #[test]
    fn null_bits_zero_their_slots() {
        let reg = registry_with_person();
        let layout = RecordLayout::for_composite(&reg, "Person").unwrap();

        let mut record = vec![0xAAu8; layout.record_size];
        record[0] = 0;
        layout.set_null(&mut record, 2);

        assert!(layout.is_null(&record, 2));
        assert!(!layout.is_null(&record, 0));
        assert!(layout.slot_bytes(&record, 2).iter().all(|&b| b == 0));
        assert!(layout.slot_bytes(&record, 1).iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn null_record_is_not_a_tombstone() {
        let reg = registry_with_person();
        let layout = RecordLayout::for_composite(&reg, "Person").unwrap();
        let record = layout.null_record();
        // Bitmap has its four low bits set, slots are zero; the record can
        // never read as all-0xFF.
        assert_eq!(record[0], 0b0000_1111);
        assert!(record[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn element_store_routing() {
        let mut reg = registry_with_person();
        reg.ensure_array("uint8").unwrap();
        reg.ensure_array("uint8[]").unwrap();

        assert_eq!(
            element_store_key(&reg, "uint8").unwrap(),
            ("uint8".to_string(), 1)
        );
        assert_eq!(
            element_store_key(&reg, "string").unwrap(),
            ("string".to_string(), 8)
        );
        assert_eq!(
            element_store_key(&reg, "uint8[]").unwrap(),
            ("uint8[]".to_string(), 8)
        );
        assert_eq!(
            element_store_key(&reg, "Person").unwrap(),
            ("uint32".to_string(), 4)
        );
        assert!(element_store_key(&reg, "bigint").is_err());
    }

    #[test]
    fn interface_slots_are_six_bytes() {
        let mut reg = SchemaRegistry::new();
        reg.register(TypeDef::interface("Named", vec![FieldDef::new("name", "string")], vec![]))
            .unwrap();
        reg.register(TypeDef::composite_with(
            "Person",
            vec![FieldDef::new("extra", "uint8")],
            None,
            vec!["Named".into()],
        ))
        .unwrap();
        reg.register(TypeDef::composite(
            "Badge",
            vec![FieldDef::new("owner", "Named")],
        ))
        .unwrap();

        let layout = RecordLayout::for_composite(&reg, "Badge").unwrap();
        assert_eq!(layout.slots[0].width, 6);
        assert_eq!(layout.record_size, 1 + 6);
    }
}
