//! Runtime values and arbitrary-precision numerics.

pub mod bignum;
pub mod value;

pub use bignum::{normalize_fraction, BigNum};
pub use value::Value;
