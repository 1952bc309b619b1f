//! The typed number of the concrete interpreter.
//!
//! A value is either a mathematical integer or a two's-complement
//! bit-vector of a declared width; one global choice governs a run.
//! Booleans are one-bit vectors in both modes. Arithmetic reports traps
//! (division by zero, bounded signed overflow, out-of-range shifts)
//! instead of silently substituting a value.

use crate::error::TrapKind;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Integer {
    Unbounded(BigInt),
    /// Two's-complement storage masked to `bits`.
    Bounded { bits: u32, raw: u64 },
}

pub type ArithResult = Result<Integer, TrapKind>;

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn to_signed(raw: u64, bits: u32) -> i64 {
    if bits >= 64 {
        raw as i64
    } else if raw & (1u64 << (bits - 1)) != 0 {
        (raw | !mask(bits)) as i64
    } else {
        raw as i64
    }
}

impl Integer {
    pub fn unbounded(value: impl Into<BigInt>) -> Integer {
        Integer::Unbounded(value.into())
    }

    pub fn bounded(bits: u32, value: i64) -> Integer {
        Integer::Bounded {
            bits,
            raw: (value as u64) & mask(bits),
        }
    }

    /// Booleans are one-bit vectors in both semantics.
    pub fn boolean(value: bool) -> Integer {
        Integer::Bounded {
            bits: 1,
            raw: value as u64,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Integer::Bounded { bits: 1, .. })
    }

    pub fn to_bool(&self) -> bool {
        !self.signed().is_zero()
    }

    /// The signed mathematical value.
    pub fn signed(&self) -> BigInt {
        match self {
            Integer::Unbounded(v) => v.clone(),
            Integer::Bounded { bits, raw } => BigInt::from(to_signed(*raw, *bits)),
        }
    }

    /// The unsigned reading; identical to `signed` for mathematical
    /// integers.
    pub fn unsigned(&self) -> BigInt {
        match self {
            Integer::Unbounded(v) => v.clone(),
            Integer::Bounded { raw, .. } => BigInt::from(*raw),
        }
    }

    fn rebuild(&self, value: BigInt) -> ArithResult {
        match self {
            Integer::Unbounded(_) => Ok(Integer::Unbounded(value)),
            Integer::Bounded { bits, .. } => {
                let bits = *bits;
                let min = -(BigInt::from(1) << (bits - 1));
                let max = (BigInt::from(1) << (bits - 1)) - 1;
                if value < min || value > max {
                    Err(TrapKind::SignedOverflow)
                } else {
                    let v = value.to_i64().ok_or(TrapKind::SignedOverflow)?;
                    Ok(Integer::bounded(bits, v))
                }
            }
        }
    }

    pub fn add(&self, rhs: &Integer) -> ArithResult {
        self.rebuild(self.signed() + rhs.signed())
    }

    pub fn sub(&self, rhs: &Integer) -> ArithResult {
        self.rebuild(self.signed() - rhs.signed())
    }

    pub fn mul(&self, rhs: &Integer) -> ArithResult {
        self.rebuild(self.signed() * rhs.signed())
    }

    pub fn sdiv(&self, rhs: &Integer) -> ArithResult {
        let d = rhs.signed();
        if d.is_zero() {
            return Err(TrapKind::DivisionByZero);
        }
        // BigInt division truncates toward zero, matching C.
        self.rebuild(self.signed() / d)
    }

    pub fn srem(&self, rhs: &Integer) -> ArithResult {
        let d = rhs.signed();
        if d.is_zero() {
            return Err(TrapKind::DivisionByZero);
        }
        self.rebuild(self.signed() % d)
    }

    pub fn udiv(&self, rhs: &Integer) -> ArithResult {
        let d = rhs.unsigned();
        if d.is_zero() {
            return Err(TrapKind::DivisionByZero);
        }
        match self {
            Integer::Unbounded(v) => Ok(Integer::Unbounded(v / d)),
            Integer::Bounded { bits, raw } => {
                let rd = d.to_u64().ok_or(TrapKind::SignedOverflow)?;
                Ok(Integer::Bounded {
                    bits: *bits,
                    raw: raw / rd,
                })
            }
        }
    }

    pub fn urem(&self, rhs: &Integer) -> ArithResult {
        let d = rhs.unsigned();
        if d.is_zero() {
            return Err(TrapKind::DivisionByZero);
        }
        match self {
            Integer::Unbounded(v) => Ok(Integer::Unbounded(v % d)),
            Integer::Bounded { bits, raw } => {
                let rd = d.to_u64().ok_or(TrapKind::SignedOverflow)?;
                Ok(Integer::Bounded {
                    bits: *bits,
                    raw: raw % rd,
                })
            }
        }
    }

    fn shift_amount(&self, rhs: &Integer) -> Result<u32, TrapKind> {
        let amount = rhs.signed();
        if amount.is_negative() {
            return Err(TrapKind::ShiftOutOfRange);
        }
        let amount = amount.to_u32().ok_or(TrapKind::ShiftOutOfRange)?;
        match self {
            Integer::Bounded { bits, .. } if amount >= *bits => Err(TrapKind::ShiftOutOfRange),
            _ if amount > (1u32 << 20) => Err(TrapKind::ShiftOutOfRange),
            _ => Ok(amount),
        }
    }

    pub fn shl(&self, rhs: &Integer) -> ArithResult {
        let amount = self.shift_amount(rhs)?;
        match self {
            Integer::Unbounded(v) => Ok(Integer::Unbounded(v << amount)),
            Integer::Bounded { bits, raw } => Ok(Integer::Bounded {
                bits: *bits,
                raw: (raw << amount) & mask(*bits),
            }),
        }
    }

    pub fn lshr(&self, rhs: &Integer) -> ArithResult {
        let amount = self.shift_amount(rhs)?;
        match self {
            Integer::Unbounded(v) => Ok(Integer::Unbounded(v >> amount)),
            Integer::Bounded { bits, raw } => Ok(Integer::Bounded {
                bits: *bits,
                raw: raw >> amount,
            }),
        }
    }

    pub fn ashr(&self, rhs: &Integer) -> ArithResult {
        let amount = self.shift_amount(rhs)?;
        match self {
            Integer::Unbounded(v) => Ok(Integer::Unbounded(v >> amount)),
            Integer::Bounded { bits, raw } => {
                let shifted = to_signed(*raw, *bits) >> amount;
                Ok(Integer::bounded(*bits, shifted))
            }
        }
    }

    pub fn bitand(&self, rhs: &Integer) -> ArithResult {
        self.bitwise(rhs, |a, b| a & b)
    }

    pub fn bitor(&self, rhs: &Integer) -> ArithResult {
        self.bitwise(rhs, |a, b| a | b)
    }

    pub fn bitxor(&self, rhs: &Integer) -> ArithResult {
        self.bitwise(rhs, |a, b| a ^ b)
    }

    fn bitwise(&self, rhs: &Integer, f: impl Fn(u64, u64) -> u64) -> ArithResult {
        match (self, rhs) {
            (Integer::Bounded { bits, raw }, Integer::Bounded { raw: r2, .. }) => {
                Ok(Integer::Bounded {
                    bits: *bits,
                    raw: f(*raw, *r2) & mask(*bits),
                })
            }
            _ => {
                // Mathematical integers restrict bit operations to values
                // that fit a machine word.
                let a = self.signed().to_i64().ok_or(TrapKind::SignedOverflow)? as u64;
                let b = rhs.signed().to_i64().ok_or(TrapKind::SignedOverflow)? as u64;
                Ok(Integer::Unbounded(BigInt::from(f(a, b) as i64)))
            }
        }
    }

    pub fn eq_val(&self, rhs: &Integer) -> bool {
        self.signed() == rhs.signed()
    }

    pub fn slt(&self, rhs: &Integer) -> bool {
        self.signed() < rhs.signed()
    }

    pub fn sle(&self, rhs: &Integer) -> bool {
        self.signed() <= rhs.signed()
    }

    pub fn ult(&self, rhs: &Integer) -> bool {
        self.unsigned() < rhs.unsigned()
    }

    pub fn ule(&self, rhs: &Integer) -> bool {
        self.unsigned() <= rhs.unsigned()
    }

    pub fn zext(&self, bits: u32) -> Integer {
        match self {
            Integer::Unbounded(v) => Integer::Unbounded(v.clone()),
            Integer::Bounded { raw, .. } => Integer::Bounded {
                bits,
                raw: raw & mask(bits),
            },
        }
    }

    pub fn sext(&self, bits: u32) -> Integer {
        match self {
            Integer::Unbounded(v) => Integer::Unbounded(v.clone()),
            Integer::Bounded { bits: from, raw } => {
                Integer::bounded(bits, to_signed(*raw, *from))
            }
        }
    }

    pub fn trunc(&self, bits: u32) -> Integer {
        match self {
            Integer::Unbounded(v) => Integer::Unbounded(v.clone()),
            Integer::Bounded { raw, .. } => Integer::Bounded {
                bits,
                raw: raw & mask(bits),
            },
        }
    }
}

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_arithmetic_is_exact() {
        let a = Integer::unbounded(1i64 << 62);
        let b = a.mul(&a).unwrap();
        assert_eq!(b.signed(), BigInt::from(1i64 << 62) * BigInt::from(1i64 << 62));
    }

    #[test]
    fn bounded_overflow_traps() {
        let max = Integer::bounded(32, i32::MAX as i64);
        let one = Integer::bounded(32, 1);
        assert_eq!(max.add(&one), Err(TrapKind::SignedOverflow));
    }

    #[test]
    fn division_by_zero_traps() {
        let a = Integer::unbounded(7);
        let z = Integer::unbounded(0);
        assert_eq!(a.sdiv(&z), Err(TrapKind::DivisionByZero));
    }

    #[test]
    fn bounded_negative_roundtrip() {
        let v = Integer::bounded(8, -3);
        assert_eq!(v.signed(), BigInt::from(-3));
        assert_eq!(v.unsigned(), BigInt::from(253));
    }

    #[test]
    fn shift_out_of_range_traps() {
        let v = Integer::bounded(8, 1);
        assert_eq!(v.shl(&Integer::bounded(8, 9)), Err(TrapKind::ShiftOutOfRange));
    }

    #[test]
    fn signed_and_unsigned_compare_differ() {
        let a = Integer::bounded(8, -1);
        let b = Integer::bounded(8, 1);
        assert!(a.slt(&b));
        assert!(!a.ult(&b));
    }

    #[test]
    fn truncation_keeps_low_bits() {
        let v = Integer::bounded(32, 0x1ff);
        assert_eq!(v.trunc(8).unsigned(), BigInt::from(0xff));
    }
}
