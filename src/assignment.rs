//! Lowering of instructions and edges into SMT definitions.
//!
//! A straight-line block body becomes a sequence of `DefOrCall` items:
//! plain definitions feed the let-nesting of the transition formula, calls
//! interrupt it because their results are constrained by summary
//! predicates rather than defined. Loads and stores are routed through the
//! per-program heap or stack array.

use crate::error::{Error, Result};
use crate::ir::{
    BinOp, BlockId, CastKind, Constant, InstrOp, Operand, Predicate, Procedure, Terminator, Type,
};
use crate::opts::{IntSemantics, MemoryModel, Options};
use crate::path::EdgeCond;
use crate::smt::{self, binop, eq, int, not, op, var, SmtExp, SmtType};
use num_bigint::BigInt;
use std::collections::BTreeSet;

/// One SMT-level definition: `name` is bound to `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub value: SmtExp,
}

/// A call interrupting the definition chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub assigned_to: String,
    pub callee: String,
    pub args: Vec<SmtExp>,
    pub extern_call: bool,
    pub result_ty: SmtType,
}

/// Elements of a path's transition formula, in program order.
#[derive(Debug, Clone, PartialEq)]
pub enum DefOrCall {
    Def(Assignment),
    Call(CallInfo),
    /// A name constrained nowhere; quantified at the clause level
    /// (unpromoted stack slot addresses).
    Fresh(String, SmtType),
}

/// The SMT sort of an IR type under the chosen integer semantics.
pub fn smt_type(ty: &Type, opts: &Options) -> SmtType {
    match (ty, opts.int_semantics) {
        (Type::Bool, _) | (Type::Int(1), _) => SmtType::Bool,
        (Type::Int(w), IntSemantics::Bounded) => SmtType::BitVec(*w),
        (Type::Pointer, IntSemantics::Bounded) => SmtType::BitVec(64),
        // Floats stay uninterpreted mathematical values.
        (_, IntSemantics::Unbounded) => SmtType::Int,
        (Type::Float(_), IntSemantics::Bounded) => SmtType::Int,
        (Type::Array(..), IntSemantics::Bounded) => memory_type(opts),
    }
}

/// The sort of the threaded memory arrays.
pub fn memory_type(opts: &Options) -> SmtType {
    match opts.int_semantics {
        IntSemantics::Unbounded => {
            SmtType::Array(Box::new(SmtType::Int), Box::new(SmtType::Int))
        }
        IntSemantics::Bounded => SmtType::Array(
            Box::new(SmtType::BitVec(64)),
            Box::new(SmtType::BitVec(64)),
        ),
    }
}

pub fn heap_name(program: u8) -> String {
    format!("HEAP${}", program)
}

pub fn stack_name(program: u8) -> String {
    format!("STACK${}", program)
}

pub fn result_name(program: u8) -> String {
    format!("result${}", program)
}

/// Which array a memory access goes through.
fn array_name(stack_access: bool, memory: &MemoryModel, program: u8) -> String {
    if stack_access && memory.stack {
        stack_name(program)
    } else {
        heap_name(program)
    }
}

fn int_literal(value: &BigInt, width: u32, opts: &Options) -> SmtExp {
    match opts.int_semantics {
        IntSemantics::Unbounded => SmtExp::IntLit(value.clone()),
        IntSemantics::Bounded => SmtExp::BvLit {
            value: value.clone(),
            width,
        },
    }
}

/// Translate an operand to a term. Globals become their per-program
/// address constants.
pub fn operand_exp(proc: &Procedure, operand: &Operand, opts: &Options, program: u8) -> SmtExp {
    match operand {
        Operand::Value(id) => var(proc.value_name(*id)),
        Operand::Const(Constant::Bool(b)) => SmtExp::BoolLit(*b),
        Operand::Const(Constant::Int { value, ty }) => {
            int_literal(&BigInt::from(*value), ty.bits(), opts)
        }
        Operand::Const(Constant::Null) => int_literal(&BigInt::from(0), 64, opts),
        Operand::Global(name) => var(format!("{}${}", name, program)),
    }
}

/// An operand in boolean position; integer-typed conditions compare
/// against zero.
pub fn bool_exp(proc: &Procedure, operand: &Operand, opts: &Options, program: u8) -> SmtExp {
    let is_bool = match operand {
        Operand::Value(id) => proc.value(*id).ty.is_bool(),
        Operand::Const(Constant::Bool(_)) => true,
        _ => false,
    };
    let exp = operand_exp(proc, operand, opts, program);
    if is_bool {
        exp
    } else {
        not(eq(exp, int_literal(&BigInt::from(0), operand_bits(proc, operand), opts)))
    }
}

fn operand_bits(proc: &Procedure, operand: &Operand) -> u32 {
    match operand {
        Operand::Value(id) => proc.value(*id).ty.bits(),
        Operand::Const(Constant::Int { ty, .. }) => ty.bits(),
        _ => 64,
    }
}

/// The condition attached to a path edge.
pub fn edge_condition(
    proc: &Procedure,
    cond: &EdgeCond,
    opts: &Options,
    program: u8,
) -> SmtExp {
    match cond {
        EdgeCond::CondTrue(operand) => bool_exp(proc, operand, opts, program),
        EdgeCond::CondFalse(operand) => not(bool_exp(proc, operand, opts, program)),
        EdgeCond::Case(operand, value) => eq(
            operand_exp(proc, operand, opts, program),
            int_literal(&BigInt::from(*value), operand_bits(proc, operand), opts),
        ),
        EdgeCond::Default(operand, excluded) => smt::and_all(
            excluded
                .iter()
                .map(|value| {
                    not(eq(
                        operand_exp(proc, operand, opts, program),
                        int_literal(&BigInt::from(*value), operand_bits(proc, operand), opts),
                    ))
                })
                .collect(),
        ),
    }
}

fn binop_name(op: BinOp, semantics: IntSemantics) -> Option<&'static str> {
    match semantics {
        IntSemantics::Unbounded => match op {
            BinOp::Add => Some("+"),
            BinOp::Sub => Some("-"),
            BinOp::Mul => Some("*"),
            BinOp::SDiv | BinOp::UDiv => Some("div"),
            BinOp::SRem | BinOp::URem => Some("mod"),
            _ => None,
        },
        IntSemantics::Bounded => match op {
            BinOp::Add => Some("bvadd"),
            BinOp::Sub => Some("bvsub"),
            BinOp::Mul => Some("bvmul"),
            BinOp::SDiv => Some("bvsdiv"),
            BinOp::UDiv => Some("bvudiv"),
            BinOp::SRem => Some("bvsrem"),
            BinOp::URem => Some("bvurem"),
            BinOp::Shl => Some("bvshl"),
            BinOp::LShr => Some("bvlshr"),
            BinOp::AShr => Some("bvashr"),
            BinOp::And => Some("bvand"),
            BinOp::Or => Some("bvor"),
            BinOp::Xor => Some("bvxor"),
        },
    }
}

fn predicate_exp(pred: Predicate, lhs: SmtExp, rhs: SmtExp, semantics: IntSemantics) -> SmtExp {
    match semantics {
        IntSemantics::Unbounded => match pred {
            Predicate::Eq => eq(lhs, rhs),
            Predicate::Ne => not(eq(lhs, rhs)),
            Predicate::Slt | Predicate::Ult => binop("<", lhs, rhs),
            Predicate::Sle | Predicate::Ule => binop("<=", lhs, rhs),
            Predicate::Sgt | Predicate::Ugt => binop(">", lhs, rhs),
            Predicate::Sge | Predicate::Uge => binop(">=", lhs, rhs),
        },
        IntSemantics::Bounded => match pred {
            Predicate::Eq => eq(lhs, rhs),
            Predicate::Ne => not(eq(lhs, rhs)),
            Predicate::Slt => binop("bvslt", lhs, rhs),
            Predicate::Sle => binop("bvsle", lhs, rhs),
            Predicate::Sgt => binop("bvsgt", lhs, rhs),
            Predicate::Sge => binop("bvsge", lhs, rhs),
            Predicate::Ult => binop("bvult", lhs, rhs),
            Predicate::Ule => binop("bvule", lhs, rhs),
            Predicate::Ugt => binop("bvugt", lhs, rhs),
            Predicate::Uge => binop("bvuge", lhs, rhs),
        },
    }
}

fn power_of_two(exp_value: i64) -> Option<BigInt> {
    if (0..=62).contains(&exp_value) {
        Some(BigInt::from(1i64) << exp_value as u32)
    } else {
        None
    }
}

/// Widen or narrow a bounded term between bit widths.
fn resize_bv(exp: SmtExp, from: u32, to: u32, signed: bool) -> SmtExp {
    use std::cmp::Ordering;
    match from.cmp(&to) {
        Ordering::Equal => exp,
        Ordering::Less => {
            let ext = if signed { "sign_extend" } else { "zero_extend" };
            op(format!("(_ {} {})", ext, to - from), vec![exp])
        }
        Ordering::Greater => op(format!("(_ extract {} 0)", to - 1), vec![exp]),
    }
}

/// Phi assignments of `block` for the edge coming from `prev`.
pub fn phi_assignments(
    proc: &Procedure,
    block: BlockId,
    prev: BlockId,
    opts: &Options,
    program: u8,
) -> Vec<DefOrCall> {
    proc.block(block)
        .phis
        .iter()
        .filter_map(|phi| {
            phi.incoming
                .iter()
                .find(|(from, _)| *from == prev)
                .map(|(_, operand)| {
                    DefOrCall::Def(Assignment {
                        name: proc.value_name(phi.result).to_string(),
                        value: operand_exp(proc, operand, opts, program),
                    })
                })
        })
        .collect()
}

/// Definitions for the straight-line body of a block. `defined` names the
/// functions with bodies, used to tag extern calls.
pub fn body_assignments(
    proc: &Procedure,
    block: BlockId,
    defined: &BTreeSet<String>,
    opts: &Options,
    program: u8,
) -> Result<Vec<DefOrCall>> {
    let mut items = Vec::new();
    let unsupported = |opcode: &InstrOp| Error::UnsupportedInstr {
        opcode: opcode.mnemonic(),
        program,
    };

    for instr in &proc.block(block).instrs {
        let name = instr
            .result
            .map(|r| proc.value_name(r).to_string());
        match &instr.op {
            InstrOp::Binary { op: bin, lhs, rhs } => {
                let name = name.ok_or_else(|| unsupported(&instr.op))?;
                let result_ty = &proc.value(instr.result.unwrap()).ty;
                let value = if result_ty.is_bool() {
                    let l = bool_exp(proc, lhs, opts, program);
                    let r = bool_exp(proc, rhs, opts, program);
                    match bin {
                        BinOp::And => binop("and", l, r),
                        BinOp::Or => binop("or", l, r),
                        BinOp::Xor => binop("xor", l, r),
                        _ => return Err(unsupported(&instr.op)),
                    }
                } else {
                    let l = operand_exp(proc, lhs, opts, program);
                    let r = operand_exp(proc, rhs, opts, program);
                    match binop_name(*bin, opts.int_semantics) {
                        Some(op_name) => binop(op_name, l, r),
                        None => {
                            // Mathematical integers have no shifts; constant
                            // shift amounts become scaling.
                            let amount = match rhs {
                                Operand::Const(Constant::Int { value, .. }) => {
                                    power_of_two(*value)
                                }
                                _ => None,
                            };
                            match (bin, amount) {
                                (BinOp::Shl, Some(p)) => binop("*", l, SmtExp::IntLit(p)),
                                (BinOp::LShr, Some(p)) | (BinOp::AShr, Some(p)) => {
                                    binop("div", l, SmtExp::IntLit(p))
                                }
                                _ => return Err(unsupported(&instr.op)),
                            }
                        }
                    }
                };
                items.push(DefOrCall::Def(Assignment { name, value }));
            }
            InstrOp::Cmp { pred, lhs, rhs } => {
                let name = name.ok_or_else(|| unsupported(&instr.op))?;
                let l = operand_exp(proc, lhs, opts, program);
                let r = operand_exp(proc, rhs, opts, program);
                items.push(DefOrCall::Def(Assignment {
                    name,
                    value: predicate_exp(*pred, l, r, opts.int_semantics),
                }));
            }
            InstrOp::Cast { kind, value } => {
                let result = instr.result.ok_or_else(|| unsupported(&instr.op))?;
                let name = proc.value_name(result).to_string();
                let to_ty = &proc.value(result).ty;
                let from_bool = matches!(value, Operand::Value(id) if proc.value(*id).ty.is_bool())
                    || matches!(value, Operand::Const(Constant::Bool(_)));
                let exp = operand_exp(proc, value, opts, program);
                let lowered = match opts.int_semantics {
                    IntSemantics::Unbounded => {
                        if from_bool && !to_ty.is_bool() {
                            op("ite", vec![exp, int(1), int(0)])
                        } else {
                            // Width changes are identities over mathematical
                            // integers.
                            exp
                        }
                    }
                    IntSemantics::Bounded => {
                        let to = to_ty.bits();
                        let exp = if from_bool {
                            op(
                                "ite",
                                vec![
                                    exp,
                                    SmtExp::BvLit {
                                        value: BigInt::from(1),
                                        width: 1,
                                    },
                                    SmtExp::BvLit {
                                        value: BigInt::from(0),
                                        width: 1,
                                    },
                                ],
                            )
                        } else {
                            exp
                        };
                        let from = if from_bool {
                            1
                        } else {
                            operand_bits(proc, value)
                        };
                        match kind {
                            CastKind::SExt => resize_bv(exp, from, to, true),
                            CastKind::ZExt | CastKind::Trunc | CastKind::PtrToInt
                            | CastKind::IntToPtr => resize_bv(exp, from, to, false),
                        }
                    }
                };
                items.push(DefOrCall::Def(Assignment {
                    name,
                    value: lowered,
                }));
            }
            InstrOp::Select {
                cond,
                then_value,
                else_value,
            } => {
                let name = name.ok_or_else(|| unsupported(&instr.op))?;
                items.push(DefOrCall::Def(Assignment {
                    name,
                    value: op(
                        "ite",
                        vec![
                            bool_exp(proc, cond, opts, program),
                            operand_exp(proc, then_value, opts, program),
                            operand_exp(proc, else_value, opts, program),
                        ],
                    ),
                }));
            }
            InstrOp::Load { addr, stack } => {
                let name = name.ok_or_else(|| unsupported(&instr.op))?;
                let array = array_name(*stack, &opts.memory, program);
                items.push(DefOrCall::Def(Assignment {
                    name,
                    value: binop(
                        "select",
                        var(array),
                        operand_exp(proc, addr, opts, program),
                    ),
                }));
            }
            InstrOp::Store { addr, value, stack } => {
                let array = array_name(*stack, &opts.memory, program);
                items.push(DefOrCall::Def(Assignment {
                    name: array.clone(),
                    value: op(
                        "store",
                        vec![
                            var(array),
                            operand_exp(proc, addr, opts, program),
                            operand_exp(proc, value, opts, program),
                        ],
                    ),
                }));
            }
            InstrOp::Gep { base, offsets } => {
                let name = name.ok_or_else(|| unsupported(&instr.op))?;
                let mut exp = operand_exp(proc, base, opts, program);
                let (add, mul) = match opts.int_semantics {
                    IntSemantics::Unbounded => ("+", "*"),
                    IntSemantics::Bounded => ("bvadd", "bvmul"),
                };
                for (scale, index) in offsets {
                    let mut idx = operand_exp(proc, index, opts, program);
                    if opts.int_semantics == IntSemantics::Bounded {
                        idx = resize_bv(idx, operand_bits(proc, index), 64, true);
                    }
                    let term = if *scale == 1 {
                        idx
                    } else {
                        binop(mul, int_literal(&BigInt::from(*scale), 64, opts), idx)
                    };
                    exp = binop(add, exp, term);
                }
                items.push(DefOrCall::Def(Assignment { name, value: exp }));
            }
            InstrOp::Alloca { .. } => {
                let result = instr.result.ok_or_else(|| unsupported(&instr.op))?;
                items.push(DefOrCall::Fresh(
                    proc.value_name(result).to_string(),
                    smt_type(&Type::Pointer, opts),
                ));
            }
            InstrOp::Call { callee, args } => {
                let assigned_to = name.unwrap_or_else(|| format!("{}$ret{}", callee, program));
                let result_ty = match instr.result {
                    Some(r) => smt_type(&proc.value(r).ty, opts),
                    None => smt_type(&Type::Int(32), opts),
                };
                items.push(DefOrCall::Call(CallInfo {
                    assigned_to,
                    callee: callee.clone(),
                    args: args
                        .iter()
                        .map(|a| operand_exp(proc, a, opts, program))
                        .collect(),
                    extern_call: !defined.contains(callee),
                    result_ty,
                }));
            }
        }
    }

    if let Terminator::Ret { value } = &proc.block(block).term {
        let value = match value {
            Some(operand) => operand_exp(proc, operand, opts, program),
            None => int_literal(&BigInt::from(0), 64, opts),
        };
        items.push(DefOrCall::Def(Assignment {
            name: result_name(program),
            value,
        }));
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn options() -> Options {
        Options::default()
    }

    #[test]
    fn lowers_arithmetic_and_compare() {
        let m = parse_module(
            "define @f(%x: i32) -> i32 {\nentry:\n  %y = add %x, 1\n  %c = icmp slt %y, 10\n  %z = select %c, %y, %x\n  ret %z\n}",
        )
        .unwrap();
        let proc = &m.procedures[0];
        let items =
            body_assignments(proc, BlockId(0), &BTreeSet::new(), &options(), 1).unwrap();
        let printed: Vec<String> = items
            .iter()
            .map(|i| match i {
                DefOrCall::Def(a) => format!("{} := {}", a.name, a.value),
                _ => String::new(),
            })
            .collect();
        assert_eq!(printed[0], "y := (+ x 1)");
        assert_eq!(printed[1], "c := (< y 10)");
        assert_eq!(printed[2], "z := (ite c y x)");
        assert_eq!(printed[3], "result$1 := z");
    }

    #[test]
    fn routes_stores_through_the_heap() {
        let m = parse_module(
            "define @f(%p: ptr) -> i32 {\nentry:\n  store 5, %p\n  %v = load %p\n  ret %v\n}",
        )
        .unwrap();
        let proc = &m.procedures[0];
        let mut opts = options();
        opts.memory.heap = true;
        let items = body_assignments(proc, BlockId(0), &BTreeSet::new(), &opts, 2).unwrap();
        match &items[0] {
            DefOrCall::Def(a) => {
                assert_eq!(a.name, "HEAP$2");
                assert_eq!(a.value.to_sexpr(), "(store HEAP$2 p 5)");
            }
            other => panic!("expected a heap update, got {:?}", other),
        }
        match &items[1] {
            DefOrCall::Def(a) => assert_eq!(a.value.to_sexpr(), "(select HEAP$2 p)"),
            other => panic!("expected a heap select, got {:?}", other),
        }
    }

    #[test]
    fn unbounded_shift_by_constant_scales() {
        let m = parse_module(
            "define @f(%x: i32) -> i32 {\nentry:\n  %y = shl %x, 3\n  ret %y\n}",
        )
        .unwrap();
        let proc = &m.procedures[0];
        let items =
            body_assignments(proc, BlockId(0), &BTreeSet::new(), &options(), 1).unwrap();
        match &items[0] {
            DefOrCall::Def(a) => assert_eq!(a.value.to_sexpr(), "(* x 8)"),
            other => panic!("expected a definition, got {:?}", other),
        }
    }

    #[test]
    fn unbounded_variable_shift_is_unsupported() {
        let m = parse_module(
            "define @f(%x: i32, %n: i32) -> i32 {\nentry:\n  %y = shl %x, %n\n  ret %y\n}",
        )
        .unwrap();
        let proc = &m.procedures[0];
        let err =
            body_assignments(proc, BlockId(0), &BTreeSet::new(), &options(), 1).unwrap_err();
        assert!(err.to_string().contains("UnsupportedInstruction"));
    }

    #[test]
    fn bounded_semantics_uses_bitvector_operators() {
        let m = parse_module(
            "define @f(%x: i32) -> i32 {\nentry:\n  %y = add %x, 1\n  %c = icmp ult %y, %x\n  %z = select %c, %y, %x\n  ret %z\n}",
        )
        .unwrap();
        let proc = &m.procedures[0];
        let opts = Options {
            int_semantics: IntSemantics::Bounded,
            ..Options::default()
        };
        let items = body_assignments(proc, BlockId(0), &BTreeSet::new(), &opts, 1).unwrap();
        match &items[0] {
            DefOrCall::Def(a) => assert_eq!(a.value.to_sexpr(), "(bvadd x (_ bv1 32))"),
            other => panic!("expected a definition, got {:?}", other),
        }
        match &items[1] {
            DefOrCall::Def(a) => assert_eq!(a.value.to_sexpr(), "(bvult y x)"),
            other => panic!("expected a definition, got {:?}", other),
        }
    }
}
