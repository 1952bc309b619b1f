//! Deterministic small-step interpreter over the IR.
//!
//! Runs a preprocessed procedure on concrete inputs, producing a `CallTrace`
//! with the entry state, the return state and one `BlockStep` per visited
//! block holding the post-phi state snapshot. The step budget counts blocks
//! visited and is passed down through calls; exceeding it, or tripping an
//! arithmetic trap, surfaces as `early_exit` with a diagnostic. Unsupported
//! instructions fail hard; the interpreter never substitutes a value.

use crate::error::{Error, Result, TrapKind};
use crate::integer::Integer;
use crate::ir::{
    BinOp, BlockId, CastKind, Constant, InstrOp, Module, Operand, Predicate, Procedure,
    Terminator, Type,
};
use crate::opts::{IntSemantics, Options};
use num_bigint::BigInt;
use std::collections::BTreeMap;

/// Sparse memory: a background value assumed at every address not
/// explicitly written, plus an override map. Reads materialise the
/// background so traces enumerate the touched cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Heap {
    pub background: Integer,
    pub cells: BTreeMap<BigInt, Integer>,
}

impl Heap {
    pub fn new(background: Integer) -> Heap {
        Heap {
            background,
            cells: BTreeMap::new(),
        }
    }

    pub fn read(&mut self, addr: &BigInt) -> Integer {
        self.cells
            .entry(addr.clone())
            .or_insert_with(|| self.background.clone())
            .clone()
    }

    pub fn write(&mut self, addr: BigInt, value: Integer) {
        self.cells.insert(addr, value);
    }
}

/// Variable environment plus memory at one point in time. Variables are
/// keyed by their (suffixed) SSA names.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub vars: BTreeMap<String, Integer>,
    pub heap: Heap,
}

/// One visited block: its name, the state right after the phis, and the
/// calls its body performed.
#[derive(Debug, Clone)]
pub struct BlockStep {
    pub block: String,
    pub state: State,
    pub calls: Vec<CallTrace>,
}

/// A complete (or truncated) run of one procedure.
#[derive(Debug, Clone)]
pub struct CallTrace {
    pub name: String,
    pub entry: State,
    pub ret: State,
    pub result: Option<Integer>,
    pub steps: Vec<BlockStep>,
    pub early_exit: bool,
    pub blocks_visited: u32,
    pub trap: Option<TrapKind>,
}

/// Immutable interpretation context shared by all frames.
pub struct InterpCtx<'a> {
    pub module: &'a Module,
    pub opts: &'a Options,
    /// Addresses of this program's globals, keyed by base name.
    pub globals: &'a BTreeMap<String, i64>,
}

enum Exit {
    Finished(Option<Integer>),
    Budget,
    Trap(TrapKind),
}

fn int_of(value: i64, bits: u32, semantics: IntSemantics) -> Integer {
    match semantics {
        IntSemantics::Unbounded => Integer::unbounded(value),
        IntSemantics::Bounded => Integer::bounded(bits, value),
    }
}

/// Coerce a loaded value to the declared width under bounded semantics.
fn coerce(value: Integer, ty: &Type, semantics: IntSemantics) -> Integer {
    match (semantics, &value) {
        (IntSemantics::Bounded, Integer::Bounded { bits, .. }) => {
            let want = ty.bits();
            if *bits > want {
                value.trunc(want)
            } else if *bits < want {
                value.sext(want)
            } else {
                value
            }
        }
        _ => value,
    }
}

fn resolve(ctx: &InterpCtx, proc: &Procedure, state: &State, operand: &Operand) -> Result<Integer> {
    match operand {
        Operand::Value(id) => {
            let name = proc.value_name(*id);
            state.vars.get(name).cloned().ok_or_else(|| {
                Error::UnsupportedInstr {
                    opcode: format!("read of undefined value %{}", name),
                    program: 0,
                }
            })
        }
        Operand::Const(Constant::Int { value, ty }) => {
            Ok(int_of(*value, ty.bits(), ctx.opts.int_semantics))
        }
        Operand::Const(Constant::Bool(b)) => Ok(Integer::boolean(*b)),
        Operand::Const(Constant::Null) => Ok(int_of(0, 64, ctx.opts.int_semantics)),
        Operand::Global(name) => {
            let addr = ctx.globals.get(name).copied().ok_or_else(|| {
                Error::UnsupportedInstr {
                    opcode: format!("reference to unknown global @{}", name),
                    program: 0,
                }
            })?;
            Ok(int_of(addr, 64, ctx.opts.int_semantics))
        }
    }
}

fn eval_binary(
    op: BinOp,
    result_is_bool: bool,
    lhs: &Integer,
    rhs: &Integer,
) -> std::result::Result<Integer, TrapKind> {
    if result_is_bool {
        let a = lhs.to_bool();
        let b = rhs.to_bool();
        let r = match op {
            BinOp::And => a && b,
            BinOp::Or => a || b,
            BinOp::Xor => a ^ b,
            _ => return Err(TrapKind::SignedOverflow),
        };
        return Ok(Integer::boolean(r));
    }
    match op {
        BinOp::Add => lhs.add(rhs),
        BinOp::Sub => lhs.sub(rhs),
        BinOp::Mul => lhs.mul(rhs),
        BinOp::SDiv => lhs.sdiv(rhs),
        BinOp::UDiv => lhs.udiv(rhs),
        BinOp::SRem => lhs.srem(rhs),
        BinOp::URem => lhs.urem(rhs),
        BinOp::Shl => lhs.shl(rhs),
        BinOp::LShr => lhs.lshr(rhs),
        BinOp::AShr => lhs.ashr(rhs),
        BinOp::And => lhs.bitand(rhs),
        BinOp::Or => lhs.bitor(rhs),
        BinOp::Xor => lhs.bitxor(rhs),
    }
}

fn eval_predicate(pred: Predicate, lhs: &Integer, rhs: &Integer) -> bool {
    match pred {
        Predicate::Eq => lhs.eq_val(rhs),
        Predicate::Ne => !lhs.eq_val(rhs),
        Predicate::Slt => lhs.slt(rhs),
        Predicate::Sle => lhs.sle(rhs),
        Predicate::Sgt => rhs.slt(lhs),
        Predicate::Sge => rhs.sle(lhs),
        Predicate::Ult => lhs.ult(rhs),
        Predicate::Ule => lhs.ule(rhs),
        Predicate::Ugt => rhs.ult(lhs),
        Predicate::Uge => rhs.ule(lhs),
    }
}

/// Build the entry state binding parameter names to argument values.
pub fn entry_state(proc: &Procedure, args: &[Integer], heap: Heap) -> State {
    let vars = proc
        .params
        .iter()
        .zip(args.iter())
        .map(|(id, v)| (proc.value_name(*id).to_string(), v.clone()))
        .collect();
    State { vars, heap }
}

/// Interpret a procedure on the given arguments and initial heap.
pub fn interpret(
    ctx: &InterpCtx,
    proc: &Procedure,
    args: &[Integer],
    heap: Heap,
    max_steps: u32,
) -> Result<CallTrace> {
    let mut frame_base: i64 = 1 << 20;
    interpret_frame(ctx, proc, entry_state(proc, args, heap), max_steps, &mut frame_base)
}

fn interpret_frame(
    ctx: &InterpCtx,
    proc: &Procedure,
    entry: State,
    max_steps: u32,
    frame_base: &mut i64,
) -> Result<CallTrace> {
    let semantics = ctx.opts.int_semantics;
    let mut state = entry.clone();
    let mut steps: Vec<BlockStep> = Vec::new();
    let mut visited: u32 = 0;
    let mut prev: Option<BlockId> = None;
    let mut block = proc.entry;

    let exit = 'run: loop {
        visited += 1;
        if visited > max_steps {
            break 'run Exit::Budget;
        }

        // Phis read the pre-phi state simultaneously.
        if let Some(prev_block) = prev {
            let mut updates = Vec::new();
            for phi in &proc.block(block).phis {
                let operand = phi
                    .incoming
                    .iter()
                    .find(|(from, _)| *from == prev_block)
                    .map(|(_, op)| op);
                match operand {
                    Some(op) => updates.push((
                        proc.value_name(phi.result).to_string(),
                        resolve(ctx, proc, &state, op)?,
                    )),
                    None => {
                        return Err(Error::UnsupportedInstr {
                            opcode: format!(
                                "phi in block '{}' lacks an edge from '{}'",
                                proc.block(block).name,
                                proc.block(prev_block).name
                            ),
                            program: 0,
                        })
                    }
                }
            }
            for (name, value) in updates {
                state.vars.insert(name, value);
            }
        }

        let snapshot = state.clone();
        let mut calls: Vec<CallTrace> = Vec::new();

        for instr in &proc.block(block).instrs {
            let result_name = instr.result.map(|r| proc.value_name(r).to_string());
            match &instr.op {
                InstrOp::Binary { op, lhs, rhs } => {
                    let result_is_bool = instr
                        .result
                        .map(|r| proc.value(r).ty.is_bool())
                        .unwrap_or(false);
                    let l = resolve(ctx, proc, &state, lhs)?;
                    let r = resolve(ctx, proc, &state, rhs)?;
                    match eval_binary(*op, result_is_bool, &l, &r) {
                        Ok(v) => {
                            if let Some(name) = result_name {
                                state.vars.insert(name, v);
                            }
                        }
                        Err(trap) => {
                            steps.push(BlockStep {
                                block: proc.block(block).name.clone(),
                                state: snapshot,
                                calls,
                            });
                            break 'run Exit::Trap(trap);
                        }
                    }
                }
                InstrOp::Cmp { pred, lhs, rhs } => {
                    let l = resolve(ctx, proc, &state, lhs)?;
                    let r = resolve(ctx, proc, &state, rhs)?;
                    if let Some(name) = result_name {
                        state
                            .vars
                            .insert(name, Integer::boolean(eval_predicate(*pred, &l, &r)));
                    }
                }
                InstrOp::Cast { kind, value } => {
                    let v = resolve(ctx, proc, &state, value)?;
                    let target = instr.result.map(|r| proc.value(r).ty.clone());
                    let target_bits = target.as_ref().map(|t| t.bits()).unwrap_or(64);
                    let out = if v.is_bool() && target_bits > 1 {
                        int_of(i64::from(v.to_bool()), target_bits, semantics)
                    } else {
                        match (semantics, kind) {
                            (IntSemantics::Unbounded, _) => v,
                            (IntSemantics::Bounded, CastKind::SExt) => v.sext(target_bits),
                            (IntSemantics::Bounded, CastKind::Trunc) => v.trunc(target_bits),
                            (IntSemantics::Bounded, _) => v.zext(target_bits),
                        }
                    };
                    if let Some(name) = result_name {
                        state.vars.insert(name, out);
                    }
                }
                InstrOp::Select {
                    cond,
                    then_value,
                    else_value,
                } => {
                    let c = resolve(ctx, proc, &state, cond)?;
                    let chosen = if c.to_bool() { then_value } else { else_value };
                    let v = resolve(ctx, proc, &state, chosen)?;
                    if let Some(name) = result_name {
                        state.vars.insert(name, v);
                    }
                }
                InstrOp::Load { addr, .. } => {
                    let a = resolve(ctx, proc, &state, addr)?.signed();
                    let loaded = state.heap.read(&a);
                    let ty = instr
                        .result
                        .map(|r| proc.value(r).ty.clone())
                        .unwrap_or(Type::Int(64));
                    if let Some(name) = result_name {
                        state.vars.insert(name, coerce(loaded, &ty, semantics));
                    }
                }
                InstrOp::Store { addr, value, .. } => {
                    let a = resolve(ctx, proc, &state, addr)?.signed();
                    let v = resolve(ctx, proc, &state, value)?;
                    state.heap.write(a, v);
                }
                InstrOp::Gep { base, offsets } => {
                    let mut addr = resolve(ctx, proc, &state, base)?.signed();
                    for (scale, idx) in offsets {
                        let i = resolve(ctx, proc, &state, idx)?.signed();
                        addr += BigInt::from(*scale) * i;
                    }
                    if let Some(name) = result_name {
                        let out = match semantics {
                            IntSemantics::Unbounded => Integer::Unbounded(addr),
                            IntSemantics::Bounded => {
                                use num_traits::ToPrimitive;
                                Integer::bounded(64, addr.to_i64().unwrap_or(0))
                            }
                        };
                        state.vars.insert(name, out);
                    }
                }
                InstrOp::Alloca { cells } => {
                    let addr = *frame_base;
                    *frame_base += *cells as i64;
                    if let Some(name) = result_name {
                        state.vars.insert(name, int_of(addr, 64, semantics));
                    }
                }
                InstrOp::Call { callee, args } => {
                    let target = ctx.module.procedure(callee).ok_or_else(|| {
                        Error::UnsupportedInstr {
                            opcode: format!("call @{}", callee),
                            program: 0,
                        }
                    })?;
                    let mut arg_values = Vec::new();
                    for a in args {
                        arg_values.push(resolve(ctx, proc, &state, a)?);
                    }
                    let sub_entry =
                        entry_state(target, &arg_values, state.heap.clone());
                    let remaining = max_steps.saturating_sub(visited);
                    let sub = interpret_frame(ctx, target, sub_entry, remaining, frame_base)?;
                    visited += sub.blocks_visited;
                    let stopped = sub.early_exit;
                    let sub_trap = sub.trap;
                    state.heap = sub.ret.heap.clone();
                    if let (Some(name), Some(value)) = (result_name, sub.result.clone()) {
                        state.vars.insert(name, value);
                    }
                    calls.push(sub);
                    if stopped {
                        steps.push(BlockStep {
                            block: proc.block(block).name.clone(),
                            state: snapshot,
                            calls,
                        });
                        break 'run match sub_trap {
                            Some(trap) => Exit::Trap(trap),
                            None => Exit::Budget,
                        };
                    }
                }
            }
        }

        // Terminator.
        let term = proc.block(block).term.clone();
        steps.push(BlockStep {
            block: proc.block(block).name.clone(),
            state: snapshot,
            calls,
        });
        match term {
            Terminator::Ret { value } => {
                let result = match value {
                    Some(operand) => Some(resolve(ctx, proc, &state, &operand)?),
                    None => Some(int_of(0, 64, semantics)),
                };
                break 'run Exit::Finished(result);
            }
            Terminator::Br { target } => {
                prev = Some(block);
                block = target;
            }
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let c = resolve(ctx, proc, &state, &cond)?;
                prev = Some(block);
                block = if c.to_bool() { then_block } else { else_block };
            }
            Terminator::Switch {
                cond,
                cases,
                default,
            } => {
                let c = resolve(ctx, proc, &state, &cond)?.signed();
                prev = Some(block);
                block = cases
                    .iter()
                    .find(|(v, _)| BigInt::from(*v) == c)
                    .map(|(_, b)| *b)
                    .unwrap_or(default);
            }
            Terminator::Unreachable => {
                return Err(Error::UnsupportedInstr {
                    opcode: "unreachable".to_string(),
                    program: 0,
                })
            }
        }
    };

    let (early_exit, trap, result) = match exit {
        Exit::Finished(result) => (false, None, result),
        Exit::Budget => (true, None, None),
        Exit::Trap(kind) => (true, Some(kind), None),
    };
    Ok(CallTrace {
        name: proc.name.clone(),
        entry,
        ret: state,
        result,
        steps,
        early_exit,
        blocks_visited: visited.min(max_steps),
        trap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;
    use crate::preprocess;

    fn run(src: &str, args: Vec<i64>) -> CallTrace {
        let mut module = parse_module(src).unwrap();
        preprocess::preprocess(&mut module, 1);
        for p in &mut module.procedures {
            preprocess::finalize(p);
        }
        let opts = Options::default();
        let globals = BTreeMap::new();
        let ctx = InterpCtx {
            module: &module,
            opts: &opts,
            globals: &globals,
        };
        let proc = &ctx.module.procedures[0];
        let arg_values: Vec<Integer> = args.into_iter().map(|v| Integer::unbounded(v)).collect();
        interpret(
            &ctx,
            proc,
            &arg_values,
            Heap::new(Integer::unbounded(0)),
            1000,
        )
        .unwrap()
    }

    const SUM: &str = "
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
}";

    #[test]
    fn sums_a_range() {
        let trace = run(SUM, vec![5]);
        assert!(!trace.early_exit);
        assert_eq!(trace.result.unwrap().signed(), BigInt::from(15));
    }

    #[test]
    fn records_post_phi_snapshots() {
        let trace = run(SUM, vec![2]);
        let loop_states: Vec<&State> = trace
            .steps
            .iter()
            .filter(|s| s.block == "loop")
            .map(|s| &s.state)
            .collect();
        // i = 0, 1, 2, 3 at successive loop headers.
        assert_eq!(loop_states.len(), 4);
        assert_eq!(loop_states[2].vars["i$1"].signed(), BigInt::from(2));
    }

    #[test]
    fn budget_exhaustion_is_an_early_exit() {
        let src = "
define @spin(%n: i32) -> i32 {
entry:
  br loop
loop:
  %m = call @__mark(1)
  %c = icmp sle 0, 0
  %g = and %m, %c
  br %g, loop2, done
loop2:
  br loop
done:
  ret 0
}";
        let mut module = parse_module(src).unwrap();
        preprocess::preprocess(&mut module, 1);
        for p in &mut module.procedures {
            preprocess::finalize(p);
        }
        let opts = Options::default();
        let globals = BTreeMap::new();
        let ctx = InterpCtx {
            module: &module,
            opts: &opts,
            globals: &globals,
        };
        let trace = interpret(
            &ctx,
            &ctx.module.procedures[0],
            &[Integer::unbounded(0)],
            Heap::new(Integer::unbounded(0)),
            50,
        )
        .unwrap();
        assert!(trace.early_exit);
        assert!(trace.trap.is_none());
    }

    #[test]
    fn division_by_zero_traps_with_diagnostic() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %q = sdiv %x, 0
  ret %q
}";
        let trace = run(src, vec![4]);
        assert!(trace.early_exit);
        assert_eq!(trace.trap, Some(TrapKind::DivisionByZero));
    }

    #[test]
    fn heap_roundtrip() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %a = alloca 4
  %p = gep %a, 1 x 1
  store %x, %p
  %v = load %p
  ret %v
}";
        let trace = run(src, vec![42]);
        assert_eq!(trace.result.unwrap().signed(), BigInt::from(42));
    }

    #[test]
    fn calls_recurse_and_thread_the_budget() {
        let src = "
define @fac(%n: i32) -> i32 {
entry:
  %c = icmp sle %n, 1
  br %c, base, rec
base:
  ret 1
rec:
  %n1 = sub %n, 1
  %r = call @fac(%n1)
  %p = mul %n, %r
  ret %p
}";
        let trace = run(src, vec![5]);
        assert!(!trace.early_exit);
        assert_eq!(trace.result.unwrap().signed(), BigInt::from(120));
    }

    #[test]
    fn identical_runs_produce_identical_traces() {
        let a = run(SUM, vec![7]);
        let b = run(SUM, vec![7]);
        assert_eq!(a.result, b.result);
        assert_eq!(a.blocks_visited, b.blocks_visited);
        let names_a: Vec<&String> = a.steps.iter().map(|s| &s.block).collect();
        let names_b: Vec<&String> = b.steps.iter().map(|s| &s.block).collect();
        assert_eq!(names_a, names_b);
    }
}
