//! # Schema Layer
//!
//! Type definitions, the registry, and metadata persistence.

pub mod def;
pub mod persistence;
pub mod registry;

pub use def::{
    array_name, dict_entry_name, dictionary_name, set_name, EnumVariant, FieldDef,
    OverflowPolicy, PrimitiveType, TypeDef, TypeKind, VariantSpec, BIGINT, BIGUINT, FRACTION,
    STRING,
};
pub use persistence::{load_metadata, metadata_path, save_metadata, METADATA_FILE};
pub use registry::SchemaRegistry;
