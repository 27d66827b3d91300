//! # Integer Overflow Policies
//!
//! A field's overflow policy governs what happens when an integer write
//! falls outside the representable range of its declared type:
//!
//! - `error` (the default): the write fails and nothing changes.
//! - `saturating`: the value clamps to the type's min/max.
//! - `wrapping`: the value reduces modulo the type's cardinality, keeping
//!   two's-complement semantics for signed kinds.
//!
//! The functions here produce the little-endian bit pattern that lands in
//! the slot. Kind mismatches (a float into an integer field, a boolean
//! into a character) are always hard errors regardless of policy.

use eyre::{bail, Result};

use crate::schema::{OverflowPolicy, PrimitiveType};
use crate::types::Value;

fn mask(bits: u32) -> u128 {
    if bits == 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

fn signed_bounds(bits: u32) -> (i128, i128) {
    if bits == 128 {
        (i128::MIN, i128::MAX)
    } else {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    }
}

/// The truncated bit pattern for an integer write, under `policy`.
/// The caller packs the low `width` bytes little-endian.
pub fn integer_slot_bits(
    prim: PrimitiveType,
    policy: OverflowPolicy,
    value: &Value,
    field: &str,
) -> Result<u128> {
    debug_assert!(prim.is_integer());
    let bits = prim.width() as u32 * 8;

    if prim.is_signed() {
        let (min, max) = signed_bounds(bits);

        // A u128 source beyond i128::MAX is out of range for every signed
        // kind; handle it before narrowing to i128.
        let v: i128 = match value {
            Value::Int(v) => *v,
            Value::UInt(u) if *u <= i128::MAX as u128 => *u as i128,
            Value::UInt(u) => {
                return match policy {
                    OverflowPolicy::Error => bail!(
                        "value {} overflows {} field '{}'",
                        u,
                        prim.name(),
                        field
                    ),
                    OverflowPolicy::Saturating => Ok(max as u128 & mask(bits)),
                    OverflowPolicy::Wrapping => Ok(u & mask(bits)),
                };
            }
            other => bail!(
                "field '{}' expects {}, found {}",
                field,
                prim.name(),
                other.kind_name()
            ),
        };

        if v < min || v > max {
            return match policy {
                OverflowPolicy::Error => {
                    bail!("value {} overflows {} field '{}'", v, prim.name(), field)
                }
                OverflowPolicy::Saturating => {
                    Ok((if v < min { min } else { max }) as u128 & mask(bits))
                }
                OverflowPolicy::Wrapping => Ok(v as u128 & mask(bits)),
            };
        }
        Ok(v as u128 & mask(bits))
    } else {
        let max = mask(bits);

        let v: u128 = match value {
            Value::UInt(u) => *u,
            Value::Int(v) if *v >= 0 => *v as u128,
            Value::Int(v) => {
                return match policy {
                    OverflowPolicy::Error => bail!(
                        "value {} overflows {} field '{}'",
                        v,
                        prim.name(),
                        field
                    ),
                    OverflowPolicy::Saturating => Ok(0),
                    OverflowPolicy::Wrapping => Ok(*v as u128 & mask(bits)),
                };
            }
            other => bail!(
                "field '{}' expects {}, found {}",
                field,
                prim.name(),
                other.kind_name()
            ),
        };

        if v > max {
            return match policy {
                OverflowPolicy::Error => {
                    bail!("value {} overflows {} field '{}'", v, prim.name(), field)
                }
                OverflowPolicy::Saturating => Ok(max),
                OverflowPolicy::Wrapping => Ok(v & mask(bits)),
            };
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_policy_rejects_out_of_range() {
        let err = integer_slot_bits(
            PrimitiveType::Int8,
            OverflowPolicy::Error,
            &Value::Int(200),
            "z",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overflows"));

        assert!(integer_slot_bits(
            PrimitiveType::UInt8,
            OverflowPolicy::Error,
            &Value::Int(-1),
            "z",
        )
        .is_err());
    }

    #[test]
    fn saturating_clamps_to_bounds() {
        // int8: 200 -> 127
        let bits = integer_slot_bits(
            PrimitiveType::Int8,
            OverflowPolicy::Saturating,
            &Value::Int(200),
            "x",
        )
        .unwrap();
        assert_eq!(bits as u8 as i8, 127);

        // int8: -200 -> -128
        let bits = integer_slot_bits(
            PrimitiveType::Int8,
            OverflowPolicy::Saturating,
            &Value::Int(-200),
            "x",
        )
        .unwrap();
        assert_eq!(bits as u8 as i8, -128);

        // uint8: -5 -> 0
        let bits = integer_slot_bits(
            PrimitiveType::UInt8,
            OverflowPolicy::Saturating,
            &Value::Int(-5),
            "x",
        )
        .unwrap();
        assert_eq!(bits, 0);
    }

    #[test]
    fn wrapping_reduces_modulo_cardinality() {
        // uint8: 257 -> 1
        let bits = integer_slot_bits(
            PrimitiveType::UInt8,
            OverflowPolicy::Wrapping,
            &Value::Int(257),
            "y",
        )
        .unwrap();
        assert_eq!(bits, 1);

        // int8: 130 -> -126 (two's complement)
        let bits = integer_slot_bits(
            PrimitiveType::Int8,
            OverflowPolicy::Wrapping,
            &Value::Int(130),
            "y",
        )
        .unwrap();
        assert_eq!(bits as u8 as i8, -126);

        // uint8: -1 -> 255
        let bits = integer_slot_bits(
            PrimitiveType::UInt8,
            OverflowPolicy::Wrapping,
            &Value::Int(-1),
            "y",
        )
        .unwrap();
        assert_eq!(bits, 255);
    }

    #[test]
    fn in_range_values_pass_through() {
        let bits = integer_slot_bits(
            PrimitiveType::Int64,
            OverflowPolicy::Error,
            &Value::Int(-42),
            "v",
        )
        .unwrap();
        assert_eq!(bits as u64 as i64, -42);

        let bits = integer_slot_bits(
            PrimitiveType::UInt128,
            OverflowPolicy::Error,
            &Value::UInt(u128::MAX),
            "v",
        )
        .unwrap();
        assert_eq!(bits, u128::MAX);
    }

    #[test]
    fn kind_mismatch_is_always_an_error() {
        for policy in [
            OverflowPolicy::Error,
            OverflowPolicy::Saturating,
            OverflowPolicy::Wrapping,
        ] {
            assert!(integer_slot_bits(
                PrimitiveType::Int32,
                policy,
                &Value::Float(1.5),
                "f",
            )
            .is_err());
        }
    }

    #[test]
    fn huge_unsigned_into_signed_field() {
        let err = integer_slot_bits(
            PrimitiveType::Int64,
            OverflowPolicy::Error,
            &Value::UInt(u128::MAX),
            "w",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overflows"));

        let bits = integer_slot_bits(
            PrimitiveType::Int64,
            OverflowPolicy::Wrapping,
            &Value::UInt(u128::MAX),
            "w",
        )
        .unwrap();
        assert_eq!(bits as u64 as i64, -1);
    }
}
