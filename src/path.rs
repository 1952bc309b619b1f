//! Enumeration of mark-to-mark acyclic paths.
//!
//! For every mark `m` and every block carrying `m`, a depth-first traversal
//! follows control-flow edges and terminates a branch as soon as it reaches
//! a marked block again (including `m` itself after at least one step).
//! Intermediate blocks are unmarked by construction; an unmarked cycle means
//! a loop header without a mark, which is reported instead of diverging.
//!
//! Paths are yielded in DFS order with the successor index as secondary
//! key, so the output order is stable across runs.

use crate::error::{Error, Result};
use crate::ir::{BlockId, Operand, Procedure, Terminator};
use crate::mark::{Mark, MarkMap};
use std::collections::BTreeMap;

/// Condition attached to a control-flow edge.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeCond {
    /// The branch condition holds.
    CondTrue(Operand),
    /// The branch condition does not hold.
    CondFalse(Operand),
    /// A switch case matched.
    Case(Operand, i64),
    /// No switch case matched; carries the excluded values.
    Default(Operand, Vec<i64>),
}

/// One step of a path: the condition under which it is taken and the block
/// it enters.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub cond: Option<EdgeCond>,
    pub target: BlockId,
}

/// A finite edge sequence between two marked blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub start: BlockId,
    pub edges: Vec<Edge>,
    pub end_mark: Mark,
}

impl Path {
    /// The block this path ends in.
    pub fn end(&self) -> BlockId {
        self.edges.last().map(|e| e.target).unwrap_or(self.start)
    }
}

/// All mark-to-mark paths of one procedure, keyed by start mark.
#[derive(Debug, Clone, Default)]
pub struct PathMap {
    map: BTreeMap<Mark, Vec<Path>>,
}

impl PathMap {
    pub fn paths_from(&self, mark: Mark) -> &[Path] {
        self.map.get(&mark).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Paths from `from` whose end mark is `to`, in enumeration order.
    pub fn paths_between(&self, from: Mark, to: Mark) -> Vec<&Path> {
        self.paths_from(from)
            .iter()
            .filter(|p| p.end_mark == to)
            .collect()
    }

    /// Start marks in ascending order.
    pub fn start_marks(&self) -> impl Iterator<Item = Mark> + '_ {
        self.map.keys().copied()
    }

    /// End marks reachable from `from`, deduplicated, in ascending order.
    pub fn end_marks(&self, from: Mark) -> Vec<Mark> {
        let mut ends: Vec<Mark> = self.paths_from(from).iter().map(|p| p.end_mark).collect();
        ends.sort();
        ends.dedup();
        ends
    }
}

/// The outgoing edges of a block, in terminator order.
pub fn successor_edges(proc: &Procedure, block: BlockId) -> Vec<Edge> {
    match &proc.block(block).term {
        Terminator::Br { target } => vec![Edge {
            cond: None,
            target: *target,
        }],
        Terminator::CondBr {
            cond,
            then_block,
            else_block,
        } => vec![
            Edge {
                cond: Some(EdgeCond::CondTrue(cond.clone())),
                target: *then_block,
            },
            Edge {
                cond: Some(EdgeCond::CondFalse(cond.clone())),
                target: *else_block,
            },
        ],
        Terminator::Switch {
            cond,
            cases,
            default,
        } => {
            let mut edges: Vec<Edge> = cases
                .iter()
                .map(|(val, target)| Edge {
                    cond: Some(EdgeCond::Case(cond.clone(), *val)),
                    target: *target,
                })
                .collect();
            edges.push(Edge {
                cond: Some(EdgeCond::Default(
                    cond.clone(),
                    cases.iter().map(|(v, _)| *v).collect(),
                )),
                target: *default,
            });
            edges
        }
        Terminator::Ret { .. } | Terminator::Unreachable => Vec::new(),
    }
}

fn dfs(
    proc: &Procedure,
    marks: &MarkMap,
    start: BlockId,
    current: BlockId,
    trail: &mut Vec<Edge>,
    on_stack: &mut Vec<BlockId>,
    out: &mut Vec<Path>,
) -> Result<()> {
    for edge in successor_edges(proc, current) {
        let target = edge.target;
        let target_mark = marks.mark_of(target);
        if target_mark != Mark::NONE {
            let mut edges = trail.clone();
            edges.push(edge);
            out.push(Path {
                start,
                edges,
                end_mark: target_mark,
            });
        } else if on_stack.contains(&target) {
            return Err(Error::UnmarkedCycle {
                block: proc.block(target).name.clone(),
            });
        } else {
            trail.push(edge);
            on_stack.push(target);
            dfs(proc, marks, start, target, trail, on_stack, out)?;
            on_stack.pop();
            trail.pop();
        }
    }
    Ok(())
}

/// Enumerate all mark-to-mark paths of `proc`.
pub fn analyze(proc: &Procedure, marks: &MarkMap) -> Result<PathMap> {
    let mut map: BTreeMap<Mark, Vec<Path>> = BTreeMap::new();

    // Degenerate case: the entry block is itself the exit. The only path is
    // the empty one from ENTRY ending at EXIT.
    if marks.mark_of(proc.entry) == Mark::EXIT {
        map.entry(Mark::ENTRY).or_default().push(Path {
            start: proc.entry,
            edges: Vec::new(),
            end_mark: Mark::EXIT,
        });
        return Ok(PathMap { map });
    }

    let start_marks: Vec<Mark> = marks.marks().filter(|m| *m != Mark::EXIT).collect();
    for mark in start_marks {
        let mut paths = Vec::new();
        for block in marks.blocks_of(mark) {
            let mut trail = Vec::new();
            let mut on_stack = Vec::new();
            dfs(proc, marks, block, block, &mut trail, &mut on_stack, &mut paths)?;
        }
        map.insert(mark, paths);
    }
    Ok(PathMap { map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark;
    use crate::parser::parse_module;

    fn loop_proc() -> crate::ir::Module {
        parse_module(
            "
define @sum(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [body: %i1]
  %s = phi [entry: 0], [body: %s1]
  %m = call @__mark(1)
  %c = icmp sle %i, %n
  %g = and %m, %c
  br %g, body, done
body:
  %i1 = add %i, 1
  %s1 = add %s, %i
  br loop
done:
  ret %s
}",
        )
        .unwrap()
    }

    #[test]
    fn loop_paths_are_complete() {
        let module = loop_proc();
        let proc = &module.procedures[0];
        let marks = mark::analyze(proc).unwrap();
        let paths = analyze(proc, &marks).unwrap();

        // ENTRY reaches the loop header; the header loops to itself and
        // exits to EXIT.
        assert_eq!(paths.paths_between(Mark::ENTRY, Mark::number(1)).len(), 1);
        let looping = paths.paths_between(Mark::number(1), Mark::number(1));
        assert_eq!(looping.len(), 1);
        assert_eq!(looping[0].edges.len(), 2);
        assert_eq!(paths.paths_between(Mark::number(1), Mark::EXIT).len(), 1);
    }

    #[test]
    fn path_ends_carry_the_target_mark() {
        let module = loop_proc();
        let proc = &module.procedures[0];
        let marks = mark::analyze(proc).unwrap();
        let paths = analyze(proc, &marks).unwrap();
        for m in paths.start_marks() {
            for p in paths.paths_from(m) {
                assert_eq!(marks.mark_of(p.end()), p.end_mark);
            }
        }
    }

    #[test]
    fn single_block_has_the_empty_entry_path() {
        let module = parse_module("define @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}").unwrap();
        let proc = &module.procedures[0];
        let marks = mark::analyze(proc).unwrap();
        let paths = analyze(proc, &marks).unwrap();
        let entry_paths = paths.paths_from(Mark::ENTRY);
        assert_eq!(entry_paths.len(), 1);
        assert!(entry_paths[0].edges.is_empty());
        assert_eq!(entry_paths[0].end_mark, Mark::EXIT);
    }

    #[test]
    fn unmarked_loop_is_an_error() {
        let module = parse_module(
            "
define @f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [loop: %i1]
  %c = icmp slt %i, %n
  %i1 = add %i, 1
  br %c, loop, done
done:
  ret %i
}",
        )
        .unwrap();
        let proc = &module.procedures[0];
        let marks = mark::analyze(proc).unwrap();
        let err = analyze(proc, &marks).unwrap_err();
        assert!(err.to_string().contains("UnmarkedCycle"));
    }
}
