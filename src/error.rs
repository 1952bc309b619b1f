//! Failure kinds of the generator and the dynamic core.
//!
//! Hard errors abort the run before any SMT output is written; the dynamic
//! core additionally records per-item failures without aborting the whole
//! collection.

use crate::mark::Mark;
use std::fmt;

/// Cause of an arithmetic trap during concrete interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    DivisionByZero,
    SignedOverflow,
    ShiftOutOfRange,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapKind::DivisionByZero => write!(f, "division by zero"),
            TrapKind::SignedOverflow => write!(f, "signed overflow"),
            TrapKind::ShiftOutOfRange => write!(f, "shift out of range"),
        }
    }
}

/// Everything that can go wrong, propagated to the driver without recovery.
#[derive(Debug)]
pub enum Error {
    /// The front-end produced no usable module.
    FrontEnd(String),
    /// Syntax error in the textual IR.
    Parse { line: usize, message: String },
    /// The two modules define different numbers of functions, or a matched
    /// pair disagrees on parameter count.
    ArityMismatch(String),
    /// A function defined in one module has no counterpart in the other.
    MissingCounterpart(String),
    /// A block is reachable under two different marks.
    MarkConflict {
        block: String,
        first: Mark,
        second: Mark,
    },
    /// A loop whose header carries no mark; path enumeration cannot
    /// terminate through it.
    UnmarkedCycle { block: String },
    /// The interpreter or encoder met an instruction it has no semantics
    /// for.
    UnsupportedInstr { opcode: String, program: u8 },
    /// Arithmetic trap in the dynamic core.
    ArithTrap(TrapKind),
    /// The interpreter step budget ran out.
    BudgetExceeded,
    /// A `/*@ ... @*/` directive did not parse.
    AnnotationParse { kind: String, line: usize },
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FrontEnd(msg) => write!(f, "FrontEndFailure: {}", msg),
            Error::Parse { line, message } => {
                write!(f, "FrontEndFailure: line {}: {}", line, message)
            }
            Error::ArityMismatch(msg) => write!(f, "ArityMismatch: {}", msg),
            Error::MissingCounterpart(name) => {
                write!(f, "MissingCounterpart: no function matching '{}'", name)
            }
            Error::MarkConflict {
                block,
                first,
                second,
            } => write!(
                f,
                "MarkConflict: block '{}' is annotated with both {} and {}",
                block, first, second
            ),
            Error::UnmarkedCycle { block } => write!(
                f,
                "UnmarkedCycle: loop through block '{}' has no mark on its header",
                block
            ),
            Error::UnsupportedInstr { opcode, program } => write!(
                f,
                "UnsupportedInstruction: '{}' in program {}",
                opcode, program
            ),
            Error::ArithTrap(kind) => write!(f, "ArithTrap: {}", kind),
            Error::BudgetExceeded => {
                write!(f, "BudgetExceeded: interpreter step budget exhausted")
            }
            Error::AnnotationParse { kind, line } => {
                write!(f, "AnnotationParseError: {} directive at line {}", kind, line)
            }
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
