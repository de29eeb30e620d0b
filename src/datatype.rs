//! Reducible element types and their wire encoding.
//!
//! This module provides the [`TeamDatatype`] trait, a sealed trait that maps Rust
//! primitive types to a type tag, a little-endian wire encoding and the combine
//! step of every [`ReduceOp`].
//!
//! # Supported Types
//!
//! | Rust Type | C equivalent        | Tag Value |
//! |-----------|---------------------|-----------|
//! | `f32`     | `float`             | 0         |
//! | `f64`     | `double`            | 1         |
//! | `i32`     | `int`               | 2         |
//! | `i64`     | `long`, `long long` | 3         |
//! | `u8`      | `unsigned char`     | 4         |
//! | `u32`     | `unsigned int`      | 5         |
//! | `u64`     | `unsigned long`     | 6         |
//! | `i16`     | `short`             | 7         |
//!
//! Bitwise operators ([`ReduceOp::And`], [`ReduceOp::Or`], [`ReduceOp::Xor`])
//! are only defined for the integer types.

use crate::ReduceOp;
use std::fmt::Debug;

/// Internal module to seal the trait — prevents external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Tag values carried in every reduction message header.
///
/// A peer that reduces a different element type is caught on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatatypeTag {
    /// 32-bit floating point
    F32 = 0,
    /// 64-bit floating point
    F64 = 1,
    /// 32-bit signed integer
    I32 = 2,
    /// 64-bit signed integer
    I64 = 3,
    /// 8-bit unsigned integer
    U8 = 4,
    /// 32-bit unsigned integer
    U32 = 5,
    /// 64-bit unsigned integer
    U64 = 6,
    /// 16-bit signed integer
    I16 = 7,
}

/// Trait for types that can be reduced across a team.
///
/// This is a **sealed trait** — it cannot be implemented outside this crate.
/// Supported types: [`i16`], [`i32`], [`i64`], [`u8`], [`u32`], [`u64`],
/// [`f32`], [`f64`].
pub trait TeamDatatype: sealed::Sealed + Copy + PartialEq + Debug + Send + 'static {
    /// The tag identifying this type on the wire.
    const TAG: DatatypeTag;
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Fill value for freshly created work buffers.
    const ZERO: Self;
    /// Whether bitwise operators apply.
    const IS_INTEGER: bool;

    /// Combine two operands. Callers check [`supports`](Self::supports) first;
    /// unsupported pairs return `a` unchanged.
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;

    /// Append the little-endian encoding of `self` to `out`.
    fn encode(self, out: &mut Vec<u8>);

    /// Decode one value from exactly [`SIZE`](Self::SIZE) bytes.
    fn decode(bytes: &[u8]) -> Self;

    /// Whether `op` is defined for this type.
    fn supports(op: ReduceOp) -> bool {
        Self::IS_INTEGER || !op.is_bitwise()
    }
}

macro_rules! impl_codec {
    ($ty:ty) => {
        fn encode(self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.to_le_bytes());
        }

        fn decode(bytes: &[u8]) -> Self {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
            <$ty>::from_le_bytes(raw)
        }
    };
}

macro_rules! impl_integer_datatype {
    ($ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl TeamDatatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();
            const ZERO: Self = 0;
            const IS_INTEGER: bool = true;

            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::And => a & b,
                    ReduceOp::Or => a | b,
                    ReduceOp::Xor => a ^ b,
                    ReduceOp::Sum => a.wrapping_add(b),
                    ReduceOp::Prod => a.wrapping_mul(b),
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                }
            }

            impl_codec!($ty);
        }
    };
}

macro_rules! impl_float_datatype {
    ($ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl TeamDatatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();
            const ZERO: Self = 0.0;
            const IS_INTEGER: bool = false;

            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Prod => a * b,
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::And | ReduceOp::Or | ReduceOp::Xor => a,
                }
            }

            impl_codec!($ty);
        }
    };
}

impl_float_datatype!(f32, DatatypeTag::F32);
impl_float_datatype!(f64, DatatypeTag::F64);
impl_integer_datatype!(i32, DatatypeTag::I32);
impl_integer_datatype!(i64, DatatypeTag::I64);
impl_integer_datatype!(u8, DatatypeTag::U8);
impl_integer_datatype!(u32, DatatypeTag::U32);
impl_integer_datatype!(u64, DatatypeTag::U64);
impl_integer_datatype!(i16, DatatypeTag::I16);

/// Encode a slice of elements into a fresh byte vector, after `header`.
pub(crate) fn encode_slice<T: TeamDatatype>(header: &[u8], values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + values.len() * T::SIZE);
    out.extend_from_slice(header);
    for &v in values {
        v.encode(&mut out);
    }
    out
}

/// Decode `out.len()` elements from `bytes`. Returns `false` on a length mismatch.
pub(crate) fn decode_into<T: TeamDatatype>(bytes: &[u8], out: &mut [T]) -> bool {
    if bytes.len() != out.len() * T::SIZE {
        return false;
    }
    for (slot, raw) in out.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
        *slot = T::decode(raw);
    }
    true
}
