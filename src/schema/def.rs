//! # Type Definitions
//!
//! The closed set of schema entities: primitives, aliases, strings, arrays,
//! sets, dictionaries, composites, interfaces, enums, and the big-numeric
//! kinds. A `TypeDef` is immutable once registered; forward stubs are the
//! only entities a later registration may replace.
//!
//! ## Slot Widths
//!
//! A composite record packs one fixed-width slot per field after its null
//! bitmap. The width is a function of the field's resolved type:
//!
//! | Resolved kind            | Width | Contents                          |
//! |--------------------------|-------|-----------------------------------|
//! | primitive                | 1-16  | little-endian value               |
//! | composite                | 4     | uint32 index into the catalog     |
//! | interface                | 6     | (uint16 type-id, uint32 index)    |
//! | string / array / set     | 8     | (uint32 start, uint32 length)     |
//! | dictionary               | 8     | run of entry indices              |
//! | enum (bare)              | 1/2/4 | discriminant                      |
//! | enum (payload)           | +4    | discriminant + variant index      |
//! | bigint / biguint         | 8     | run into the byte store           |
//! | fraction                 | 16    | two runs (numerator, denominator) |

use eyre::{bail, ensure, Result};

use crate::types::Value;

/// Built-in fixed-width scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Character,
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    UInt128,
    Int128,
    Float32,
    Float64,
}

pub const ALL_PRIMITIVES: [PrimitiveType; 14] = [
    PrimitiveType::Boolean,
    PrimitiveType::Character,
    PrimitiveType::UInt8,
    PrimitiveType::Int8,
    PrimitiveType::UInt16,
    PrimitiveType::Int16,
    PrimitiveType::UInt32,
    PrimitiveType::Int32,
    PrimitiveType::UInt64,
    PrimitiveType::Int64,
    PrimitiveType::UInt128,
    PrimitiveType::Int128,
    PrimitiveType::Float32,
    PrimitiveType::Float64,
];

impl PrimitiveType {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Character => "character",
            PrimitiveType::UInt8 => "uint8",
            PrimitiveType::Int8 => "int8",
            PrimitiveType::UInt16 => "uint16",
            PrimitiveType::Int16 => "int16",
            PrimitiveType::UInt32 => "uint32",
            PrimitiveType::Int32 => "int32",
            PrimitiveType::UInt64 => "uint64",
            PrimitiveType::Int64 => "int64",
            PrimitiveType::UInt128 => "uint128",
            PrimitiveType::Int128 => "int128",
            PrimitiveType::Float32 => "float32",
            PrimitiveType::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ALL_PRIMITIVES.iter().copied().find(|p| p.name() == name)
    }

    /// Storage width in bytes. Characters store a Unicode scalar as UTF-32.
    pub fn width(self) -> usize {
        match self {
            PrimitiveType::Boolean | PrimitiveType::UInt8 | PrimitiveType::Int8 => 1,
            PrimitiveType::UInt16 | PrimitiveType::Int16 => 2,
            PrimitiveType::Character
            | PrimitiveType::UInt32
            | PrimitiveType::Int32
            | PrimitiveType::Float32 => 4,
            PrimitiveType::UInt64 | PrimitiveType::Int64 | PrimitiveType::Float64 => 8,
            PrimitiveType::UInt128 | PrimitiveType::Int128 => 16,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveType::UInt8
                | PrimitiveType::Int8
                | PrimitiveType::UInt16
                | PrimitiveType::Int16
                | PrimitiveType::UInt32
                | PrimitiveType::Int32
                | PrimitiveType::UInt64
                | PrimitiveType::Int64
                | PrimitiveType::UInt128
                | PrimitiveType::Int128
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveType::Int8
                | PrimitiveType::Int16
                | PrimitiveType::Int32
                | PrimitiveType::Int64
                | PrimitiveType::Int128
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveType::Float32 | PrimitiveType::Float64)
    }
}

/// Behaviour when an integer write falls outside its field's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    Error,
    Saturating,
    Wrapping,
}

impl OverflowPolicy {
    pub fn name(self) -> &'static str {
        match self {
            OverflowPolicy::Error => "error",
            OverflowPolicy::Saturating => "saturating",
            OverflowPolicy::Wrapping => "wrapping",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "error" => Some(OverflowPolicy::Error),
            "saturating" => Some(OverflowPolicy::Saturating),
            "wrapping" => Some(OverflowPolicy::Wrapping),
            _ => None,
        }
    }
}

/// A single field of a composite, interface, or enum variant.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub type_name: String,
    pub default: Option<Value>,
    pub overflow: Option<OverflowPolicy>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
            overflow: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = Some(policy);
        self
    }
}

/// An enum variant with its resolved discriminant. Bare variants have an
/// empty field list.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub name: String,
    pub discriminant: u32,
    pub fields: Vec<FieldDef>,
}

/// Input to enum construction: an optional explicit discriminant, resolved
/// to sequential values by [`build_enum_variants`].
#[derive(Debug, Clone)]
pub struct VariantSpec {
    pub name: String,
    pub discriminant: Option<u32>,
    pub fields: Vec<FieldDef>,
}

impl VariantSpec {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discriminant: None,
            fields: Vec::new(),
        }
    }

    pub fn with_discriminant(name: impl Into<String>, discriminant: u32) -> Self {
        Self {
            name: name.into(),
            discriminant: Some(discriminant),
            fields: Vec::new(),
        }
    }

    pub fn with_fields(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            discriminant: None,
            fields,
        }
    }
}

/// Resolves variant specs to concrete discriminants. Explicit values set
/// the counter and must be strictly increasing; a variant may not carry
/// both an explicit discriminant and payload fields.
pub fn build_enum_variants(specs: Vec<VariantSpec>) -> Result<(Vec<EnumVariant>, bool)> {
    ensure!(!specs.is_empty(), "enum must declare at least one variant");

    let mut variants = Vec::with_capacity(specs.len());
    let mut next = 0u32;
    let mut has_explicit = false;

    for spec in specs {
        let discriminant = match spec.discriminant {
            Some(value) => {
                ensure!(
                    spec.fields.is_empty(),
                    "variant '{}' cannot have both an explicit discriminant and fields",
                    spec.name
                );
                ensure!(
                    value >= next,
                    "variant '{}' discriminant {} is not increasing",
                    spec.name,
                    value
                );
                has_explicit = true;
                value
            }
            None => next,
        };

        next = discriminant
            .checked_add(1)
            .ok_or_else(|| eyre::eyre!("variant '{}' discriminant overflows", spec.name))?;

        variants.push(EnumVariant {
            name: spec.name,
            discriminant,
            fields: spec.fields,
        });
    }

    Ok((variants, has_explicit))
}

/// The closed variant set of schema entities.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Primitive(PrimitiveType),
    Alias {
        target: String,
    },
    /// `string` behaves as an array of `character` in storage and as a
    /// single unit at the value level.
    StringType,
    Array {
        element: String,
    },
    Set {
        element: String,
    },
    Dictionary {
        key: String,
        value: String,
        /// Name of the synthetic entry composite `Dict_<K>_<V>`.
        entry: String,
    },
    Composite {
        fields: Vec<FieldDef>,
        parent: Option<String>,
        interfaces: Vec<String>,
    },
    Interface {
        fields: Vec<FieldDef>,
        parents: Vec<String>,
    },
    Enum {
        variants: Vec<EnumVariant>,
        backing: Option<PrimitiveType>,
        has_explicit_values: bool,
    },
    BigInt,
    BigUInt,
    Fraction,
    /// Forward declaration; must be populated before metadata commit.
    Stub,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
}

/// Builtin non-primitive type names.
pub const STRING: &str = "string";
pub const BIGINT: &str = "bigint";
pub const BIGUINT: &str = "biguint";
pub const FRACTION: &str = "fraction";

pub fn array_name(element: &str) -> String {
    format!("{}[]", element)
}

pub fn set_name(element: &str) -> String {
    format!("set<{}>", element)
}

pub fn dictionary_name(key: &str, value: &str) -> String {
    format!("dictionary<{},{}>", key, value)
}

pub fn dict_entry_name(key: &str, value: &str) -> String {
    format!("Dict_{}_{}", key, value)
}

impl TypeDef {
    pub fn composite(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Composite {
                fields,
                parent: None,
                interfaces: Vec::new(),
            },
        }
    }

    pub fn composite_with(
        name: impl Into<String>,
        fields: Vec<FieldDef>,
        parent: Option<String>,
        interfaces: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Composite {
                fields,
                parent,
                interfaces,
            },
        }
    }

    pub fn interface(
        name: impl Into<String>,
        fields: Vec<FieldDef>,
        parents: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Interface { fields, parents },
        }
    }

    pub fn alias(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Alias {
                target: target.into(),
            },
        }
    }

    pub fn enum_type(
        name: impl Into<String>,
        specs: Vec<VariantSpec>,
        backing: Option<PrimitiveType>,
    ) -> Result<Self> {
        let (variants, has_explicit_values) = build_enum_variants(specs)?;
        Ok(Self {
            name: name.into(),
            kind: TypeKind::Enum {
                variants,
                backing,
                has_explicit_values,
            },
        })
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.kind, TypeKind::Stub)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, TypeKind::Composite { .. })
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.kind, TypeKind::Interface { .. })
    }

    /// Width of the discriminant for an enum definition: the declared
    /// backing width, else the narrowest of {1, 2, 4} that fits the
    /// largest discriminant.
    pub fn discriminant_width(&self) -> Result<usize> {
        let TypeKind::Enum {
            variants, backing, ..
        } = &self.kind
        else {
            bail!("'{}' is not an enum", self.name);
        };

        if let Some(backing) = backing {
            return Ok(backing.width());
        }

        let max = variants.iter().map(|v| v.discriminant).max().unwrap_or(0);
        Ok(if max <= u8::MAX as u32 {
            1
        } else if max <= u16::MAX as u32 {
            2
        } else {
            4
        })
    }

    /// True when any variant carries payload fields; such enums store a
    /// uint32 variant-record index beside the discriminant.
    pub fn has_payload(&self) -> bool {
        match &self.kind {
            TypeKind::Enum { variants, .. } => variants.iter().any(|v| !v.fields.is_empty()),
            _ => false,
        }
    }

    pub fn variant(&self, name: &str) -> Option<&EnumVariant> {
        match &self.kind {
            TypeKind::Enum { variants, .. } => variants.iter().find(|v| v.name == name),
            _ => None,
        }
    }

    pub fn variant_by_discriminant(&self, discriminant: u32) -> Option<&EnumVariant> {
        match &self.kind {
            TypeKind::Enum { variants, .. } => {
                variants.iter().find(|v| v.discriminant == discriminant)
            }
            _ => None,
        }
    }

    /// Slot width of a field whose type resolves to this definition.
    /// Aliases and stubs must be resolved before asking.
    pub fn slot_width(&self) -> Result<usize> {
        match &self.kind {
            TypeKind::Primitive(p) => Ok(p.width()),
            TypeKind::Composite { .. } => Ok(4),
            TypeKind::Interface { .. } => Ok(6),
            TypeKind::StringType
            | TypeKind::Array { .. }
            | TypeKind::Set { .. }
            | TypeKind::Dictionary { .. } => Ok(8),
            TypeKind::Enum { .. } => {
                let disc = self.discriminant_width()?;
                Ok(if self.has_payload() { disc + 4 } else { disc })
            }
            TypeKind::BigInt | TypeKind::BigUInt => Ok(8),
            TypeKind::Fraction => Ok(16),
            TypeKind::Alias { .. } => bail!("alias '{}' must be resolved first", self.name),
            TypeKind::Stub => bail!("forward stub '{}' has no storage layout", self.name),
        }
    }

    /// Record width when this resolved type is an array/set element.
    /// Dictionaries and big numerics are invalid element types; their
    /// element records would collide with the dedicated byte stores.
    pub fn element_width(&self) -> Result<usize> {
        match &self.kind {
            TypeKind::Primitive(p) => Ok(p.width()),
            TypeKind::StringType | TypeKind::Array { .. } | TypeKind::Set { .. } => {
                Ok(crate::storage::RUN_REF_SIZE)
            }
            TypeKind::Composite { .. } => Ok(4),
            TypeKind::Interface { .. } => Ok(6),
            TypeKind::Enum { .. } => {
                let disc = self.discriminant_width()?;
                Ok(if self.has_payload() { disc + 4 } else { disc })
            }
            TypeKind::Dictionary { .. } | TypeKind::BigInt | TypeKind::BigUInt | TypeKind::Fraction => {
                bail!("'{}' cannot be used as an array or set element", self.name)
            }
            TypeKind::Alias { .. } => bail!("alias '{}' must be resolved first", self.name),
            TypeKind::Stub => bail!("forward stub '{}' has no storage layout", self.name),
        }
    }
}
