//! Mark analysis.
//!
//! A block belongs to mark `k` iff its branch condition carries a conjunct
//! `__mark(k)`; the front-end lowers that conjunct to a call feeding the
//! condition through `and`s and zero-extensions, so detection scans the
//! block for calls to the intrinsic. Entry and exit blocks are force-mapped
//! to the reserved `ENTRY` and `EXIT` marks. The result is a bidirectional
//! map between blocks and marks.

use crate::error::{Error, Result};
use crate::ir::{BlockId, Constant, InstrOp, Operand, Procedure};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// The intrinsic whose calls carry synchronisation labels.
pub const MARK_INTRINSIC: &str = "__mark";

/// A synchronisation label. User marks are non-negative; the reserved
/// values mark the entry block, the exit block and the absence of a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mark(i64);

impl Mark {
    pub const ENTRY: Mark = Mark(-1);
    pub const EXIT: Mark = Mark(-2);
    pub const NONE: Mark = Mark(-3);

    pub fn number(k: i64) -> Mark {
        Mark(k)
    }

    pub fn is_special(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Mark::ENTRY => write!(f, "ENTRY"),
            Mark::EXIT => write!(f, "EXIT"),
            Mark::NONE => write!(f, "NONE"),
            Mark(k) => write!(f, "{}", k),
        }
    }
}

/// Bidirectional block/mark map for one procedure.
#[derive(Debug, Clone, Default)]
pub struct MarkMap {
    block_marks: HashMap<BlockId, Mark>,
    mark_blocks: BTreeMap<Mark, BTreeSet<BlockId>>,
}

impl MarkMap {
    pub fn mark_of(&self, block: BlockId) -> Mark {
        self.block_marks.get(&block).copied().unwrap_or(Mark::NONE)
    }

    pub fn blocks_of(&self, mark: Mark) -> impl Iterator<Item = BlockId> + '_ {
        self.mark_blocks
            .get(&mark)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// All marks with at least one block, in ascending numeric order
    /// (reserved marks first).
    pub fn marks(&self) -> impl Iterator<Item = Mark> + '_ {
        self.mark_blocks.keys().copied()
    }

    fn insert(&mut self, block: BlockId, mark: Mark) {
        self.block_marks.insert(block, mark);
        self.mark_blocks.entry(mark).or_default().insert(block);
    }
}

/// The marks declared inside one block, deduplicated and sorted.
fn declared_marks(proc: &Procedure, block: BlockId) -> Vec<i64> {
    let mut found = Vec::new();
    for instr in &proc.block(block).instrs {
        if let InstrOp::Call { callee, args } = &instr.op {
            if callee == MARK_INTRINSIC {
                if let Some(Operand::Const(Constant::Int { value, .. })) = args.first() {
                    found.push(*value);
                }
            }
        }
    }
    found.sort_unstable();
    found.dedup();
    found
}

/// Partition the procedure's reachable blocks into marks.
///
/// Runs after exit unification, so the returning block is unique. A block
/// annotated with two different marks, or a user mark on the entry or exit
/// block, is a `MarkConflict`.
pub fn analyze(proc: &Procedure) -> Result<MarkMap> {
    let mut map = MarkMap::default();
    let exit = proc.exit_block();

    for block_id in proc.reachable_blocks() {
        let block = proc.block(block_id);
        let found = declared_marks(proc, block_id);

        let user_mark = match found.as_slice() {
            [] => None,
            [k] => Some(Mark::number(*k)),
            [k1, k2, ..] => {
                return Err(Error::MarkConflict {
                    block: block.name.clone(),
                    first: Mark::number(*k1),
                    second: Mark::number(*k2),
                })
            }
        };

        // The exit wins over the entry when both coincide; a user
        // annotation on either reserved block is contradictory.
        let reserved = if Some(block_id) == exit {
            Some(Mark::EXIT)
        } else if block_id == proc.entry {
            Some(Mark::ENTRY)
        } else {
            None
        };

        match (reserved, user_mark) {
            (Some(r), Some(u)) => {
                return Err(Error::MarkConflict {
                    block: block.name.clone(),
                    first: r,
                    second: u,
                })
            }
            (Some(r), None) => map.insert(block_id, r),
            (None, Some(u)) => map.insert(block_id, u),
            (None, None) => {}
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn entry_and_exit_are_reserved() {
        let m = parse_module("define @f(%x: i32) -> i32 {\nentry:\n  br done\ndone:\n  ret %x\n}")
            .unwrap();
        let marks = analyze(&m.procedures[0]).unwrap();
        assert_eq!(marks.mark_of(BlockId(0)), Mark::ENTRY);
        assert_eq!(marks.mark_of(BlockId(1)), Mark::EXIT);
        assert_eq!(marks.blocks_of(Mark::ENTRY).count(), 1);
        assert_eq!(marks.blocks_of(Mark::EXIT).count(), 1);
    }

    #[test]
    fn exit_wins_a_shared_block() {
        let m = parse_module("define @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}").unwrap();
        let marks = analyze(&m.procedures[0]).unwrap();
        assert_eq!(marks.mark_of(BlockId(0)), Mark::EXIT);
    }

    #[test]
    fn finds_mark_in_and_chain() {
        let src = "
define @f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [loop: %i1]
  %m = call @__mark(3)
  %c = icmp slt %i, %n
  %g = and %m, %c
  br %g, loop2, done
loop2:
  %i1 = add %i, 1
  br loop
done:
  ret %i
}";
        let m = parse_module(src).unwrap();
        let marks = analyze(&m.procedures[0]).unwrap();
        assert_eq!(marks.mark_of(BlockId(1)), Mark::number(3));
    }

    #[test]
    fn finds_mark_through_zext_lowering() {
        let src = "
define @f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [loop: %i1]
  %m = call i1 @__mark(7)
  %mz = zext %m to i32
  %c = icmp slt %i, %n
  %cz = zext %c to i32
  %g = and %mz, %cz
  %gb = icmp ne %g, 0
  br %gb, loop2, done
loop2:
  %i1 = add %i, 1
  br loop
done:
  ret %i
}";
        let m = parse_module(src).unwrap();
        let marks = analyze(&m.procedures[0]).unwrap();
        assert_eq!(marks.mark_of(BlockId(1)), Mark::number(7));
    }

    #[test]
    fn conflicting_marks_are_rejected() {
        let src = "
define @f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [loop: %i1]
  %m1 = call @__mark(1)
  %m2 = call @__mark(2)
  %g0 = and %m1, %m2
  %c = icmp slt %i, %n
  %g = and %g0, %c
  br %g, loop2, done
loop2:
  %i1 = add %i, 1
  br loop
done:
  ret %i
}";
        let m = parse_module(src).unwrap();
        let err = analyze(&m.procedures[0]).unwrap_err();
        assert!(err.to_string().contains("MarkConflict"));
    }
}
