//! The relational encoder.
//!
//! Couples two preprocessed procedures path-by-path and renders constrained
//! Horn clauses between mark predicates `INV_MAIN_<k>`. Paths starting at
//! `ENTRY` take the relational precondition inline as antecedent; paths
//! ending at `EXIT` conclude the exit predicate, which a separate clause
//! connects to the relational postcondition. Loops that cannot stay in
//! lock-step (or any loop under `--off-by-n`) additionally get one-sided
//! stutter clauses.
//!
//! Calls are abstracted by summary predicates: a call occurring at the same
//! call index with the same callee in both paths becomes one relational
//! summary application, anything else two one-sided ones. Summary
//! predicates of defined functions are given defining clauses generated
//! from their own paths, guarded by a `_PRE` predicate that call sites are
//! obliged to establish.

use crate::abstraction;
use crate::annot::Annotations;
use crate::assignment::{
    self, heap_name, memory_type, result_name, stack_name, CallInfo, DefOrCall,
};
use crate::error::{Error, Result};
use crate::ir::{Module, Operand, Procedure, Terminator, ValueId};
use crate::mark::{self, Mark, MarkMap};
use crate::opts::Options;
use crate::path::{self, Path, PathMap};
use crate::preprocess;
use crate::smt::{and_all, eq, forall, implies, op, var, SmtExp, SmtType, SortedVar};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Cached per-procedure analysis results.
#[derive(Debug, Clone)]
pub struct ProcAnalysis {
    pub marks: MarkMap,
    pub paths: PathMap,
    pub free_vars: BTreeMap<Mark, Vec<SortedVar>>,
}

/// Both modules preprocessed, with per-pair analyses.
#[derive(Debug)]
pub struct PreparedPair {
    pub mod1: Module,
    pub mod2: Module,
    /// Coupled function names, in first-module order.
    pub pairs: Vec<String>,
    pub analyses: BTreeMap<String, (ProcAnalysis, ProcAnalysis)>,
}

/// Check that the two modules' defined functions match up by name and
/// arity.
fn zip_procedures(mod1: &Module, mod2: &Module) -> Result<Vec<String>> {
    if mod1.procedures.len() != mod2.procedures.len() {
        return Err(Error::ArityMismatch(format!(
            "program 1 defines {} functions, program 2 defines {}",
            mod1.procedures.len(),
            mod2.procedures.len()
        )));
    }
    let mut pairs = Vec::new();
    for p1 in &mod1.procedures {
        let p2 = mod2
            .procedure(&p1.name)
            .ok_or_else(|| Error::MissingCounterpart(p1.name.clone()))?;
        if p1.params.len() != p2.params.len() {
            return Err(Error::ArityMismatch(format!(
                "function '{}' takes {} parameters in program 1 but {} in program 2",
                p1.name,
                p1.params.len(),
                p2.params.len()
            )));
        }
        pairs.push(p1.name.clone());
    }
    Ok(pairs)
}

/// Preprocess both modules and run mark, path and free-variable analysis on
/// every coupled pair.
pub fn prepare(mut mod1: Module, mut mod2: Module, opts: &Options) -> Result<PreparedPair> {
    if mod1.procedures.is_empty() || mod2.procedures.is_empty() {
        return Err(Error::FrontEnd(
            "an input contains no function definitions".to_string(),
        ));
    }
    preprocess::preprocess(&mut mod1, 1);
    preprocess::preprocess(&mut mod2, 2);
    let pairs = zip_procedures(&mod1, &mod2)?;

    let mut analyses = BTreeMap::new();
    for name in &pairs {
        let a1 = analyze_procedure(
            mod1.procedures.iter_mut().find(|p| &p.name == name).unwrap(),
            opts,
            1,
        )?;
        let a2 = analyze_procedure(
            mod2.procedures.iter_mut().find(|p| &p.name == name).unwrap(),
            opts,
            2,
        )?;
        analyses.insert(name.clone(), (a1, a2));
    }
    Ok(PreparedPair {
        mod1,
        mod2,
        pairs,
        analyses,
    })
}

fn analyze_procedure(proc: &mut Procedure, opts: &Options, program: u8) -> Result<ProcAnalysis> {
    let marks = mark::analyze(proc)?;
    preprocess::finalize(proc);
    let paths = path::analyze(proc, &marks)?;
    let free_vars = free_vars(proc, &marks, &paths, opts, program);
    Ok(ProcAnalysis {
        marks,
        paths,
        free_vars,
    })
}

/* ------------------------------------------------------------------ */
/* Free variables at marks                                             */

fn operand_values(operand: &Operand, out: &mut Vec<ValueId>) {
    if let Operand::Value(id) = operand {
        out.push(*id);
    }
}

/// Values a path reads before defining, and values it defines.
fn path_uses_defs(proc: &Procedure, p: &Path) -> (BTreeSet<ValueId>, BTreeSet<ValueId>) {
    let mut uses = BTreeSet::new();
    let mut defs = BTreeSet::new();
    let mut record = |operands: Vec<ValueId>, defs: &BTreeSet<ValueId>, uses: &mut BTreeSet<ValueId>| {
        for v in operands {
            if !defs.contains(&v) {
                uses.insert(v);
            }
        }
    };

    let body = |block: crate::ir::BlockId,
                with_ret: bool,
                uses: &mut BTreeSet<ValueId>,
                defs: &mut BTreeSet<ValueId>| {
        for instr in &proc.block(block).instrs {
            let mut operands = Vec::new();
            match &instr.op {
                crate::ir::InstrOp::Binary { lhs, rhs, .. }
                | crate::ir::InstrOp::Cmp { lhs, rhs, .. } => {
                    operand_values(lhs, &mut operands);
                    operand_values(rhs, &mut operands);
                }
                crate::ir::InstrOp::Cast { value, .. } => operand_values(value, &mut operands),
                crate::ir::InstrOp::Select {
                    cond,
                    then_value,
                    else_value,
                } => {
                    operand_values(cond, &mut operands);
                    operand_values(then_value, &mut operands);
                    operand_values(else_value, &mut operands);
                }
                crate::ir::InstrOp::Load { addr, .. } => operand_values(addr, &mut operands),
                crate::ir::InstrOp::Store { addr, value, .. } => {
                    operand_values(addr, &mut operands);
                    operand_values(value, &mut operands);
                }
                crate::ir::InstrOp::Gep { base, offsets } => {
                    operand_values(base, &mut operands);
                    for (_, idx) in offsets {
                        operand_values(idx, &mut operands);
                    }
                }
                crate::ir::InstrOp::Alloca { .. } => {}
                crate::ir::InstrOp::Call { args, .. } => {
                    for a in args {
                        operand_values(a, &mut operands);
                    }
                }
            }
            for v in operands {
                if !defs.contains(&v) {
                    uses.insert(v);
                }
            }
            if let Some(r) = instr.result {
                defs.insert(r);
            }
        }
        let mut term_operands = Vec::new();
        match &proc.block(block).term {
            Terminator::CondBr { cond, .. } | Terminator::Switch { cond, .. } => {
                operand_values(cond, &mut term_operands)
            }
            Terminator::Ret { value: Some(v) } if with_ret => {
                operand_values(v, &mut term_operands)
            }
            _ => {}
        }
        for v in term_operands {
            if !defs.contains(&v) {
                uses.insert(v);
            }
        }
    };

    let exit_body = p.end_mark == Mark::EXIT;
    if p.edges.is_empty() {
        body(p.start, exit_body, &mut uses, &mut defs);
        return (uses, defs);
    }

    body(p.start, false, &mut uses, &mut defs);
    let mut prev = p.start;
    for (i, edge) in p.edges.iter().enumerate() {
        let target = edge.target;
        // Phi reads happen against the pre-phi state of the edge.
        let mut phi_defs = Vec::new();
        for phi in &proc.block(target).phis {
            if let Some((_, operand)) = phi.incoming.iter().find(|(from, _)| *from == prev) {
                let mut operands = Vec::new();
                operand_values(operand, &mut operands);
                record(operands, &defs, &mut uses);
            }
            phi_defs.push(phi.result);
        }
        defs.extend(phi_defs);
        let last = i + 1 == p.edges.len();
        if !last || exit_body {
            body(target, exit_body && last, &mut uses, &mut defs);
        }
        prev = target;
    }
    (uses, defs)
}

/// Live variables at each mark, closed over the mark graph, with the
/// procedure's parameters always included. At `EXIT` the list is the result
/// variable (plus, in dynamic mode, the parameters, so fitted equations may
/// mention the inputs).
fn free_vars(
    proc: &Procedure,
    marks: &MarkMap,
    paths: &PathMap,
    opts: &Options,
    program: u8,
) -> BTreeMap<Mark, Vec<SortedVar>> {
    let mut all_marks: BTreeSet<Mark> = marks.marks().collect();
    all_marks.remove(&Mark::NONE);
    for m in paths.start_marks() {
        all_marks.insert(m);
        for p in paths.paths_from(m) {
            all_marks.insert(p.end_mark);
        }
    }

    let mut per_path: BTreeMap<Mark, Vec<(Mark, BTreeSet<ValueId>, BTreeSet<ValueId>)>> =
        BTreeMap::new();
    let mut free: BTreeMap<Mark, BTreeSet<ValueId>> = BTreeMap::new();
    for &m in &all_marks {
        free.insert(m, BTreeSet::new());
    }
    for m in paths.start_marks() {
        let mut infos = Vec::new();
        for p in paths.paths_from(m) {
            let (uses, defs) = path_uses_defs(proc, p);
            free.entry(m).or_default().extend(uses.iter().copied());
            infos.push((p.end_mark, uses, defs));
        }
        per_path.insert(m, infos);
    }

    loop {
        let mut changed = false;
        for (&m, infos) in &per_path {
            for (end, _, defs) in infos {
                let needed: Vec<ValueId> = free
                    .get(end)
                    .map(|s| s.iter().copied().filter(|v| !defs.contains(v)).collect())
                    .unwrap_or_default();
                let entry = free.get_mut(&m).unwrap();
                for v in needed {
                    changed |= entry.insert(v);
                }
            }
        }
        if !changed {
            break;
        }
    }

    let mut result = BTreeMap::new();
    for &m in &all_marks {
        let mut vars: Vec<SortedVar> = Vec::new();
        if m == Mark::EXIT {
            if opts.dynamic {
                let mut params: Vec<&ValueId> = proc.params.iter().collect();
                params.sort_by_key(|id| (proc.value_name(**id).to_string(), **id));
                for id in params {
                    vars.push(SortedVar::new(
                        proc.value_name(*id),
                        assignment::smt_type(&proc.value(*id).ty, opts),
                    ));
                }
            }
            vars.push(SortedVar::new(
                result_name(program),
                assignment::smt_type(&proc.ret_ty, opts),
            ));
        } else {
            let mut ids: BTreeSet<ValueId> = free.get(&m).cloned().unwrap_or_default();
            ids.extend(proc.params.iter().copied());
            let mut sorted: Vec<ValueId> = ids.into_iter().collect();
            sorted.sort_by_key(|id| (proc.value_name(*id).to_string(), *id));
            for id in sorted {
                vars.push(SortedVar::new(
                    proc.value_name(id),
                    assignment::smt_type(&proc.value(id).ty, opts),
                ));
            }
        }
        result.insert(m, vars);
    }
    result
}

/* ------------------------------------------------------------------ */
/* Clause assembly                                                     */

/// Transition-formula elements after call resolution.
#[derive(Debug, Clone)]
enum Item {
    Def(String, SmtExp),
    Cond(SmtExp),
    Fresh(String, SmtType),
}

/// Raw path elements before calls are resolved against the other program.
#[derive(Debug, Clone)]
enum RawItem {
    Plain(DefOrCall),
    Cond(SmtExp),
}

/// A `_PRE` obligation generated at a call site: a clause over the items
/// preceding `position`.
struct PreObligation {
    position: usize,
    app: SmtExp,
}

fn path_raw_items(
    proc: &Procedure,
    p: &Path,
    defined: &BTreeSet<String>,
    opts: &Options,
    program: u8,
) -> Result<Vec<RawItem>> {
    let mut items = Vec::new();
    let exit_body = p.end_mark == Mark::EXIT;

    for d in assignment::body_assignments(proc, p.start, defined, opts, program)? {
        items.push(RawItem::Plain(d));
    }
    if p.edges.is_empty() {
        return Ok(items);
    }

    let mut prev = p.start;
    for (i, edge) in p.edges.iter().enumerate() {
        if let Some(cond) = &edge.cond {
            items.push(RawItem::Cond(assignment::edge_condition(
                proc, cond, opts, program,
            )));
        }
        let target = edge.target;
        for d in assignment::phi_assignments(proc, target, prev, opts, program) {
            items.push(RawItem::Plain(d));
        }
        let last = i + 1 == p.edges.len();
        if !last || exit_body {
            for d in assignment::body_assignments(proc, target, defined, opts, program)? {
                items.push(RawItem::Plain(d));
            }
        }
        prev = target;
    }
    Ok(items)
}

/// Names of the summary predicates.
fn rec_name(g: &str) -> String {
    format!("INV_REC_{}", g)
}
fn rec_pre_name(g: &str) -> String {
    format!("{}_PRE", rec_name(g))
}
fn rec_mark_name(g: &str, m: Mark) -> String {
    format!("{}_{}", rec_name(g), m)
}
fn rec_single_name(g: &str, program: u8) -> String {
    format!("{}__{}", rec_name(g), program)
}
fn rec_single_pre_name(g: &str, program: u8) -> String {
    format!("{}_PRE", rec_single_name(g, program))
}
fn rec_single_mark_name(g: &str, program: u8, m: Mark) -> String {
    format!("{}_{}", rec_single_name(g, program), m)
}

/// A coupled call's first-program half, waiting for its match in the
/// second program's item walk.
struct CallInput {
    capture: Option<String>,
    result: String,
    heap_out: Option<String>,
    info: CallInfo,
}

/// Resolve the calls of one or two raw item lists into summary
/// applications. `rel_ok` lists callees with a usable relational summary.
/// `raw_a` belongs to `program_a`; a second list is always program 2.
fn resolve_calls(
    raw_a: Vec<RawItem>,
    program_a: u8,
    raw_b: Option<Vec<RawItem>>,
    defined: &BTreeSet<String>,
    rel_ok: &BTreeSet<String>,
    opts: &Options,
) -> (Vec<Item>, Vec<PreObligation>) {
    let heap = opts.memory.heap;
    let two_sided = raw_b.is_some();
    let calls_of = |raw: &[RawItem]| {
        raw.iter()
            .filter_map(|i| match i {
                RawItem::Plain(DefOrCall::Call(ci)) => Some(ci.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    let calls_a = calls_of(&raw_a);
    let calls_b = raw_b.as_deref().map(calls_of).unwrap_or_default();
    let coupled: Vec<bool> = calls_a
        .iter()
        .enumerate()
        .map(|(k, a)| {
            two_sided
                && k < calls_b.len()
                && a.callee == calls_b[k].callee
                && a.args.len() == calls_b[k].args.len()
                && rel_ok.contains(&a.callee)
        })
        .collect();

    let mut items: Vec<Item> = Vec::new();
    let mut obligations: Vec<PreObligation> = Vec::new();
    let mut pending: Vec<Option<CallInput>> = Vec::new();

    let mut emit = |raw: Vec<RawItem>,
                    program: u8,
                    first_side: bool,
                    items: &mut Vec<Item>,
                    obligations: &mut Vec<PreObligation>,
                    pending: &mut Vec<Option<CallInput>>| {
        let mut k = 0usize;
        for raw_item in raw {
            match raw_item {
                RawItem::Cond(c) => items.push(Item::Cond(c)),
                RawItem::Plain(DefOrCall::Def(a)) => items.push(Item::Def(a.name, a.value)),
                RawItem::Plain(DefOrCall::Fresh(name, ty)) => items.push(Item::Fresh(name, ty)),
                RawItem::Plain(DefOrCall::Call(ci)) => {
                    let cap = format!("{}_call{}", heap_name(program), k);
                    let heap_res = format!("{}_res{}", heap_name(program), k);
                    if heap {
                        items.push(Item::Def(cap.clone(), var(heap_name(program))));
                    }
                    items.push(Item::Fresh(ci.assigned_to.clone(), ci.result_ty.clone()));
                    if heap {
                        items.push(Item::Fresh(heap_res.clone(), memory_type(opts)));
                    }
                    let is_coupled = two_sided && coupled.get(k).copied().unwrap_or(false);
                    if first_side && is_coupled {
                        // The relational application is emitted when the
                        // second program reaches its matching call.
                        pending.push(Some(CallInput {
                            capture: heap.then(|| cap.clone()),
                            result: ci.assigned_to.clone(),
                            heap_out: heap.then(|| heap_res.clone()),
                            info: ci.clone(),
                        }));
                    } else if !first_side && is_coupled {
                        let first = pending[k].take().expect("matching call input");
                        let mut pre_args = first.info.args.clone();
                        pre_args.extend(ci.args.clone());
                        if let Some(c) = &first.capture {
                            pre_args.push(var(c.clone()));
                        }
                        if heap {
                            pre_args.push(var(cap.clone()));
                        }
                        let mut full = pre_args.clone();
                        full.push(var(first.result.clone()));
                        full.push(var(ci.assigned_to.clone()));
                        if let Some(h) = &first.heap_out {
                            full.push(var(h.clone()));
                        }
                        if heap {
                            full.push(var(heap_res.clone()));
                        }
                        if defined.contains(&ci.callee) {
                            obligations.push(PreObligation {
                                position: items.len(),
                                app: op(rec_pre_name(&ci.callee), pre_args),
                            });
                        }
                        items.push(Item::Cond(op(rec_name(&ci.callee), full)));
                    } else {
                        let mut pre_args = ci.args.clone();
                        if heap {
                            pre_args.push(var(cap.clone()));
                        }
                        let mut full = pre_args.clone();
                        full.push(var(ci.assigned_to.clone()));
                        if heap {
                            full.push(var(heap_res.clone()));
                        }
                        if defined.contains(&ci.callee) {
                            obligations.push(PreObligation {
                                position: items.len(),
                                app: op(rec_single_pre_name(&ci.callee, program), pre_args),
                            });
                        }
                        items.push(Item::Cond(op(
                            rec_single_name(&ci.callee, program),
                            full,
                        )));
                        if first_side && two_sided {
                            pending.push(None);
                        }
                    }
                    if heap {
                        items.push(Item::Def(heap_name(program), var(heap_res)));
                    }
                    k += 1;
                }
            }
        }
    };

    emit(
        raw_a,
        program_a,
        true,
        &mut items,
        &mut obligations,
        &mut pending,
    );
    if let Some(raw2_items) = raw_b {
        emit(
            raw2_items,
            2,
            false,
            &mut items,
            &mut obligations,
            &mut pending,
        );
    }
    (items, obligations)
}

/// Fold items into nested lets and implications around the consequent,
/// quantify, and assert.
fn build_clause(
    antecedent: SmtExp,
    items: &[Item],
    consequent: SmtExp,
    base_vars: &[SortedVar],
) -> SmtExp {
    let mut quantified: Vec<SortedVar> = Vec::new();
    for v in base_vars {
        if !quantified.iter().any(|q| q.name == v.name) {
            quantified.push(v.clone());
        }
    }
    for item in items {
        if let Item::Fresh(name, ty) = item {
            if !quantified.iter().any(|q| &q.name == name) {
                quantified.push(SortedVar::new(name.clone(), ty.clone()));
            }
        }
    }
    let mut exp = consequent;
    for item in items.iter().rev() {
        exp = match item {
            Item::Def(name, value) => SmtExp::Let {
                defs: vec![(name.clone(), value.clone())],
                body: Box::new(exp),
            },
            Item::Cond(c) => implies(c.clone(), exp),
            Item::Fresh(..) => exp,
        };
    }
    if !matches!(antecedent, SmtExp::BoolLit(true)) {
        exp = implies(antecedent, exp);
    }
    SmtExp::Assert(Box::new(forall(quantified, exp)))
}

/// The memory arrays appended to every relational predicate signature.
fn heap_pair_vars(opts: &Options) -> Vec<SortedVar> {
    let mut vars = Vec::new();
    if opts.memory.heap {
        vars.push(SortedVar::new(heap_name(1), memory_type(opts)));
        vars.push(SortedVar::new(heap_name(2), memory_type(opts)));
    }
    if opts.memory.stack {
        vars.push(SortedVar::new(stack_name(1), memory_type(opts)));
        vars.push(SortedVar::new(stack_name(2), memory_type(opts)));
    }
    vars
}

fn heap_single_vars(opts: &Options, program: u8) -> Vec<SortedVar> {
    let mut vars = Vec::new();
    if opts.memory.heap {
        vars.push(SortedVar::new(heap_name(program), memory_type(opts)));
    }
    if opts.memory.stack {
        vars.push(SortedVar::new(stack_name(program), memory_type(opts)));
    }
    vars
}

fn apply(name: &str, vars: &[SortedVar]) -> SmtExp {
    op(name, vars.iter().map(|v| var(v.name.clone())).collect())
}

fn pred_name(m: Mark) -> String {
    format!("INV_MAIN_{}", m)
}

/// Full argument list of `INV_MAIN_<m>`.
fn pred_sig(a1: &ProcAnalysis, a2: &ProcAnalysis, m: Mark, opts: &Options) -> Vec<SortedVar> {
    let mut sig = Vec::new();
    sig.extend(a1.free_vars.get(&m).cloned().unwrap_or_default());
    sig.extend(a2.free_vars.get(&m).cloned().unwrap_or_default());
    sig.extend(heap_pair_vars(opts));
    sig
}

fn param_vars(proc: &Procedure, opts: &Options) -> Vec<SortedVar> {
    proc.params
        .iter()
        .map(|id| {
            SortedVar::new(
                proc.value_name(*id),
                assignment::smt_type(&proc.value(*id).ty, opts),
            )
        })
        .collect()
}

/// Default relational precondition: pairwise parameter equality, plus heap
/// equality when the heap is threaded.
fn default_rel_in(p1: &Procedure, p2: &Procedure, opts: &Options) -> SmtExp {
    let mut conjuncts: Vec<SmtExp> = p1
        .params
        .iter()
        .zip(p2.params.iter())
        .map(|(a, b)| eq(var(p1.value_name(*a)), var(p2.value_name(*b))))
        .collect();
    if opts.memory.heap {
        conjuncts.push(eq(var(heap_name(1)), var(heap_name(2))));
    }
    and_all(conjuncts)
}

/// Default relational postcondition: equal results, plus equal heaps when
/// threaded. `heap_suffix` names the heap version the results live in.
fn default_rel_out(opts: &Options, heap1: &str, heap2: &str) -> SmtExp {
    let mut conjuncts = vec![eq(var(result_name(1)), var(result_name(2)))];
    if opts.memory.heap {
        conjuncts.push(eq(var(heap1), var(heap2)));
    }
    and_all(conjuncts)
}

/* ------------------------------------------------------------------ */
/* Top-level generation                                                */

/// The coupled function selected by `--fun`, defaulting to the first.
pub fn selected_pair(prepared: &PreparedPair, opts: &Options) -> Result<String> {
    match &opts.fun {
        Some(name) => {
            if prepared.pairs.contains(name) {
                Ok(name.clone())
            } else {
                Err(Error::MissingCounterpart(name.clone()))
            }
        }
        None => prepared
            .pairs
            .first()
            .cloned()
            .ok_or_else(|| Error::FrontEnd("no functions to couple".to_string())),
    }
}

/// Generate the complete SMT artifact. `invariants` supplies fitted
/// predicate bodies in dynamic mode; mark predicates are then defined
/// rather than declared.
pub fn generate(
    prepared: &PreparedPair,
    annotations: &Annotations,
    opts: &Options,
    invariants: Option<&BTreeMap<Mark, SmtExp>>,
) -> Result<Vec<SmtExp>> {
    let selected = selected_pair(prepared, opts)?;
    let defined: BTreeSet<String> = prepared.pairs.iter().cloned().collect();
    let rel_externs = abstraction::relational_externs(&prepared.mod1, &prepared.mod2);
    let mut rel_ok = defined.clone();
    rel_ok.extend(rel_externs.iter().cloned());

    let p1_sel = prepared.mod1.procedure(&selected).unwrap();
    let p2_sel = prepared.mod2.procedure(&selected).unwrap();
    let (a1_sel, a2_sel) = &prepared.analyses[&selected];

    warn_on_floats(p1_sel, 1);
    warn_on_floats(p2_sel, 2);

    // Functions encoded through summaries: every non-selected pair, plus
    // the selected one when it recurses or `--only-rec` asks for it.
    let selected_recurses =
        p1_sel.calls_defined(&defined) || p2_sel.calls_defined(&defined);
    let mut summarized: Vec<String> = prepared
        .pairs
        .iter()
        .filter(|n| **n != selected)
        .cloned()
        .collect();
    if selected_recurses || opts.only_rec {
        summarized.push(selected.clone());
    }

    let mut out: Vec<SmtExp> = vec![SmtExp::SetLogic("HORN".to_string())];
    out.extend(abstraction::global_definitions(
        &prepared.mod1,
        &prepared.mod2,
        opts,
    ));
    out.extend(abstraction::extern_definitions(
        &prepared.mod1,
        &prepared.mod2,
        annotations,
        opts,
    ));

    // Summary predicate declarations.
    for name in &summarized {
        let g1 = prepared.mod1.procedure(name).unwrap();
        let g2 = prepared.mod2.procedure(name).unwrap();
        let (ga1, ga2) = &prepared.analyses[name];
        out.extend(summary_declarations(name, g1, g2, ga1, ga2, opts));
    }

    // Mark predicates of the selected pair.
    let mut all_marks: BTreeSet<Mark> = a1_sel.marks.marks().chain(a2_sel.marks.marks()).collect();
    all_marks.remove(&Mark::NONE);
    all_marks.remove(&Mark::ENTRY);
    for &m in &all_marks {
        let sig = pred_sig(a1_sel, a2_sel, m, opts);
        let types: Vec<SmtType> = sig.iter().map(|v| v.ty.clone()).collect();
        match invariants {
            Some(bodies) => {
                let body = bodies
                    .get(&m)
                    .cloned()
                    .unwrap_or(SmtExp::BoolLit(false));
                out.push(SmtExp::FunDef {
                    name: pred_name(m),
                    args: sig,
                    ret: SmtType::Bool,
                    body: Box::new(body),
                });
            }
            None => out.push(SmtExp::FunDecl {
                name: pred_name(m),
                arg_types: types,
                ret: SmtType::Bool,
            }),
        }
    }

    // Assertions.
    if opts.only_rec {
        out.extend(only_rec_clauses(
            &selected, p1_sel, p2_sel, annotations, opts,
        ));
    } else {
        out.extend(main_clauses(
            p1_sel,
            p2_sel,
            a1_sel,
            a2_sel,
            annotations,
            &defined,
            &rel_ok,
            opts,
        )?);
    }
    for name in &summarized {
        let g1 = prepared.mod1.procedure(name).unwrap();
        let g2 = prepared.mod2.procedure(name).unwrap();
        let (ga1, ga2) = &prepared.analyses[name];
        out.extend(summary_clauses(name, g1, g2, ga1, ga2, &defined, &rel_ok, opts)?);
    }

    out.push(SmtExp::CheckSat);
    out.push(SmtExp::GetModel);
    Ok(out)
}

fn warn_on_floats(proc: &Procedure, program: u8) {
    if proc
        .values
        .iter()
        .any(|v| matches!(v.ty, crate::ir::Type::Float(_)))
    {
        warn!(
            "program {}: floating point in '{}' is treated as uninterpreted",
            program, proc.name
        );
    }
}

/// Iterative coupling of the selected pair.
#[allow(clippy::too_many_arguments)]
fn main_clauses(
    p1: &Procedure,
    p2: &Procedure,
    a1: &ProcAnalysis,
    a2: &ProcAnalysis,
    annotations: &Annotations,
    defined: &BTreeSet<String>,
    rel_ok: &BTreeSet<String>,
    opts: &Options,
) -> Result<Vec<SmtExp>> {
    let rel_in = annotations
        .rel_in
        .clone()
        .unwrap_or_else(|| default_rel_in(p1, p2, opts));
    let rel_out = annotations
        .rel_out
        .clone()
        .unwrap_or_else(|| default_rel_out(opts, &heap_name(1), &heap_name(2)));

    let mut clauses = Vec::new();
    let start_marks: BTreeSet<Mark> = a1
        .paths
        .start_marks()
        .chain(a2.paths.start_marks())
        .collect();

    for &m in &start_marks {
        let sig_m = pred_sig(a1, a2, m, opts);
        let antecedent = || {
            if m == Mark::ENTRY {
                rel_in.clone()
            } else {
                apply(&pred_name(m), &sig_m)
            }
        };

        if m != Mark::ENTRY
            && ((a1.free_vars.get(&m).is_none()) ^ (a2.free_vars.get(&m).is_none()))
        {
            warn!("mark {} appears in only one program; its loops are not coupled", m);
        }

        let mut end_marks: BTreeSet<Mark> = a1.paths.end_marks(m).into_iter().collect();
        end_marks.extend(a2.paths.end_marks(m));

        // Joint steps first.
        for &end in &end_marks {
            let sig_end = pred_sig(a1, a2, end, opts);
            for path1 in a1.paths.paths_between(m, end) {
                for path2 in a2.paths.paths_between(m, end) {
                    let raw1 = path_raw_items(p1, path1, defined, opts, 1)?;
                    let raw2 = path_raw_items(p2, path2, defined, opts, 2)?;
                    let (items, obligations) =
                        resolve_calls(raw1, 1, Some(raw2), defined, rel_ok, opts);
                    for obligation in &obligations {
                        clauses.push(build_clause(
                            antecedent(),
                            &items[..obligation.position],
                            obligation.app.clone(),
                            &sig_m,
                        ));
                    }
                    clauses.push(build_clause(
                        antecedent(),
                        &items,
                        apply(&pred_name(end), &sig_end),
                        &sig_m,
                    ));
                }
            }
        }

        // Stutter steps: mandatory when the other program cannot loop at
        // this mark, optional everywhere under off-by-n.
        if m != Mark::ENTRY {
            let loops1 = a1.paths.paths_between(m, m);
            let loops2 = a2.paths.paths_between(m, m);
            let emit1 = !loops1.is_empty() && (opts.off_by_n || loops2.is_empty());
            let emit2 = !loops2.is_empty() && (opts.off_by_n || loops1.is_empty());
            if emit1 {
                for path1 in &loops1 {
                    let raw1 = path_raw_items(p1, path1, defined, opts, 1)?;
                    let (items, obligations) =
                        resolve_calls(raw1, 1, None, defined, rel_ok, opts);
                    for obligation in &obligations {
                        clauses.push(build_clause(
                            antecedent(),
                            &items[..obligation.position],
                            obligation.app.clone(),
                            &sig_m,
                        ));
                    }
                    clauses.push(build_clause(
                        antecedent(),
                        &items,
                        apply(&pred_name(m), &sig_m),
                        &sig_m,
                    ));
                }
            }
            if emit2 {
                for path2 in &loops2 {
                    let raw2 = path_raw_items(p2, path2, defined, opts, 2)?;
                    let (items, obligations) =
                        resolve_calls(raw2, 2, None, defined, rel_ok, opts);
                    for obligation in &obligations {
                        clauses.push(build_clause(
                            antecedent(),
                            &items[..obligation.position],
                            obligation.app.clone(),
                            &sig_m,
                        ));
                    }
                    clauses.push(build_clause(
                        antecedent(),
                        &items,
                        apply(&pred_name(m), &sig_m),
                        &sig_m,
                    ));
                }
            }
        }
    }

    // The exit predicate discharges the relational postcondition.
    if a1.free_vars.contains_key(&Mark::EXIT) || a2.free_vars.contains_key(&Mark::EXIT) {
        let sig_exit = pred_sig(a1, a2, Mark::EXIT, opts);
        clauses.push(build_clause(
            apply(&pred_name(Mark::EXIT), &sig_exit),
            &[],
            rel_out,
            &sig_exit,
        ));
    }
    Ok(clauses)
}

/// `--only-rec`: abstract the selected pair entirely by its summary.
fn only_rec_clauses(
    name: &str,
    p1: &Procedure,
    p2: &Procedure,
    annotations: &Annotations,
    opts: &Options,
) -> Vec<SmtExp> {
    let rel_in = annotations
        .rel_in
        .clone()
        .unwrap_or_else(|| default_rel_in(p1, p2, opts));
    let heap = opts.memory.heap;
    let res_heap1 = format!("{}_res", heap_name(1));
    let res_heap2 = format!("{}_res", heap_name(2));
    let rel_out = annotations
        .rel_out
        .clone()
        .unwrap_or_else(|| default_rel_out(opts, &res_heap1, &res_heap2));

    let mut vars = param_vars(p1, opts);
    vars.extend(param_vars(p2, opts));
    let mut heap_vars = Vec::new();
    if heap {
        heap_vars.push(SortedVar::new(heap_name(1), memory_type(opts)));
        heap_vars.push(SortedVar::new(heap_name(2), memory_type(opts)));
    }

    let mut pre_vars = vars.clone();
    pre_vars.extend(heap_vars.clone());
    let pre_clause = SmtExp::Assert(Box::new(forall(
        pre_vars.clone(),
        implies(rel_in.clone(), apply(&rec_pre_name(name), &pre_vars)),
    )));

    let mut full_vars = pre_vars.clone();
    full_vars.push(SortedVar::new(
        result_name(1),
        assignment::smt_type(&p1.ret_ty, opts),
    ));
    full_vars.push(SortedVar::new(
        result_name(2),
        assignment::smt_type(&p2.ret_ty, opts),
    ));
    if heap {
        full_vars.push(SortedVar::new(res_heap1, memory_type(opts)));
        full_vars.push(SortedVar::new(res_heap2, memory_type(opts)));
    }
    let summary_app = apply(&rec_name(name), &full_vars);
    let out_clause = SmtExp::Assert(Box::new(forall(
        full_vars,
        implies(and_all(vec![rel_in, summary_app]), rel_out),
    )));
    vec![pre_clause, out_clause]
}

/* ------------------------------------------------------------------ */
/* Summary encodings                                                   */

fn heap_old_vars(opts: &Options, programs: &[u8]) -> Vec<SortedVar> {
    let mut vars = Vec::new();
    if opts.memory.heap {
        for &p in programs {
            vars.push(SortedVar::new(
                format!("{}_old", heap_name(p)),
                memory_type(opts),
            ));
        }
    }
    vars
}

/// Signature pieces of the relational summary predicates of `g`.
struct SummarySig {
    pre: Vec<SortedVar>,
    finals: Vec<SortedVar>,
}

fn relational_summary_sig(
    g1: &Procedure,
    g2: &Procedure,
    opts: &Options,
) -> SummarySig {
    let mut params = param_vars(g1, opts);
    params.extend(param_vars(g2, opts));
    let mut pre = params.clone();
    if opts.memory.heap {
        pre.push(SortedVar::new(heap_name(1), memory_type(opts)));
        pre.push(SortedVar::new(heap_name(2), memory_type(opts)));
    }
    let mut finals = params;
    finals.extend(heap_old_vars(opts, &[1, 2]));
    finals.push(SortedVar::new(
        result_name(1),
        assignment::smt_type(&g1.ret_ty, opts),
    ));
    finals.push(SortedVar::new(
        result_name(2),
        assignment::smt_type(&g2.ret_ty, opts),
    ));
    if opts.memory.heap {
        finals.push(SortedVar::new(heap_name(1), memory_type(opts)));
        finals.push(SortedVar::new(heap_name(2), memory_type(opts)));
    }
    SummarySig { pre, finals }
}

fn intermediate_sig(
    a1: &ProcAnalysis,
    a2: &ProcAnalysis,
    m: Mark,
    opts: &Options,
) -> Vec<SortedVar> {
    let mut sig = Vec::new();
    sig.extend(a1.free_vars.get(&m).cloned().unwrap_or_default());
    sig.extend(a2.free_vars.get(&m).cloned().unwrap_or_default());
    sig.extend(heap_old_vars(opts, &[1, 2]));
    sig.extend(heap_pair_vars(opts));
    sig
}

fn single_summary_sig(g: &Procedure, program: u8, opts: &Options) -> SummarySig {
    let params = param_vars(g, opts);
    let mut pre = params.clone();
    if opts.memory.heap {
        pre.push(SortedVar::new(heap_name(program), memory_type(opts)));
    }
    let mut finals = params;
    finals.extend(heap_old_vars(opts, &[program]));
    finals.push(SortedVar::new(
        result_name(program),
        assignment::smt_type(&g.ret_ty, opts),
    ));
    if opts.memory.heap {
        finals.push(SortedVar::new(heap_name(program), memory_type(opts)));
    }
    SummarySig { pre, finals }
}

fn single_intermediate_sig(
    a: &ProcAnalysis,
    m: Mark,
    program: u8,
    opts: &Options,
) -> Vec<SortedVar> {
    let mut sig = a.free_vars.get(&m).cloned().unwrap_or_default();
    sig.extend(heap_old_vars(opts, &[program]));
    sig.extend(heap_single_vars(opts, program));
    sig
}

fn decl(name: String, sig: &[SortedVar]) -> SmtExp {
    SmtExp::FunDecl {
        name,
        arg_types: sig.iter().map(|v| v.ty.clone()).collect(),
        ret: SmtType::Bool,
    }
}

fn inner_marks(a1: &ProcAnalysis, a2: &ProcAnalysis) -> BTreeSet<Mark> {
    a1.marks
        .marks()
        .chain(a2.marks.marks())
        .filter(|m| !m.is_special())
        .collect()
}

/// Declarations for all summary predicates of pair `g`.
fn summary_declarations(
    name: &str,
    g1: &Procedure,
    g2: &Procedure,
    a1: &ProcAnalysis,
    a2: &ProcAnalysis,
    opts: &Options,
) -> Vec<SmtExp> {
    let mut out = Vec::new();
    let rel = relational_summary_sig(g1, g2, opts);
    out.push(decl(rec_pre_name(name), &rel.pre));
    out.push(decl(rec_name(name), &rel.finals));
    for m in inner_marks(a1, a2) {
        out.push(decl(
            rec_mark_name(name, m),
            &intermediate_sig(a1, a2, m, opts),
        ));
    }
    for (g, a, program) in [(g1, a1, 1u8), (g2, a2, 2u8)] {
        let single = single_summary_sig(g, program, opts);
        out.push(decl(rec_single_pre_name(name, program), &single.pre));
        out.push(decl(rec_single_name(name, program), &single.finals));
        for m in a.marks.marks().filter(|m| !m.is_special()) {
            out.push(decl(
                rec_single_mark_name(name, program, m),
                &single_intermediate_sig(a, m, program, opts),
            ));
        }
    }
    out
}

/// Initial-heap captures at the head of an entry path.
fn entry_captures(opts: &Options, programs: &[u8]) -> Vec<Item> {
    let mut items = Vec::new();
    if opts.memory.heap {
        for &p in programs {
            items.push(Item::Def(
                format!("{}_old", heap_name(p)),
                var(heap_name(p)),
            ));
        }
    }
    items
}

/// Defining clauses of the relational and one-sided summaries of pair `g`.
#[allow(clippy::too_many_arguments)]
fn summary_clauses(
    name: &str,
    g1: &Procedure,
    g2: &Procedure,
    a1: &ProcAnalysis,
    a2: &ProcAnalysis,
    defined: &BTreeSet<String>,
    rel_ok: &BTreeSet<String>,
    opts: &Options,
) -> Result<Vec<SmtExp>> {
    let mut clauses = Vec::new();
    let rel = relational_summary_sig(g1, g2, opts);

    let consequent_for = |end: Mark| -> (String, Vec<SortedVar>) {
        if end == Mark::EXIT {
            (rec_name(name), rel.finals.clone())
        } else {
            (rec_mark_name(name, end), intermediate_sig(a1, a2, end, opts))
        }
    };

    let start_marks: BTreeSet<Mark> = a1
        .paths
        .start_marks()
        .chain(a2.paths.start_marks())
        .collect();
    for &m in &start_marks {
        let entry = m == Mark::ENTRY;
        let sig_m = if entry {
            rel.pre.clone()
        } else {
            intermediate_sig(a1, a2, m, opts)
        };
        let antecedent_name = if entry {
            rec_pre_name(name)
        } else {
            rec_mark_name(name, m)
        };

        let mut end_marks: BTreeSet<Mark> = a1.paths.end_marks(m).into_iter().collect();
        end_marks.extend(a2.paths.end_marks(m));
        for &end in &end_marks {
            let (cons_name, cons_sig) = consequent_for(end);
            for path1 in a1.paths.paths_between(m, end) {
                for path2 in a2.paths.paths_between(m, end) {
                    let raw1 = path_raw_items(g1, path1, defined, opts, 1)?;
                    let raw2 = path_raw_items(g2, path2, defined, opts, 2)?;
                    let (mut items, obligations) =
                        resolve_calls(raw1, 1, Some(raw2), defined, rel_ok, opts);
                    let prefix = if entry {
                        entry_captures(opts, &[1, 2])
                    } else {
                        Vec::new()
                    };
                    let offset = prefix.len();
                    let mut full = prefix;
                    full.append(&mut items);
                    for obligation in &obligations {
                        clauses.push(build_clause(
                            apply(&antecedent_name, &sig_m),
                            &full[..obligation.position + offset],
                            obligation.app.clone(),
                            &sig_m,
                        ));
                    }
                    clauses.push(build_clause(
                        apply(&antecedent_name, &sig_m),
                        &full,
                        apply(&cons_name, &cons_sig),
                        &sig_m,
                    ));
                }
            }
        }

        if !entry {
            let loops1 = a1.paths.paths_between(m, m);
            let loops2 = a2.paths.paths_between(m, m);
            let emit1 = !loops1.is_empty() && (opts.off_by_n || loops2.is_empty());
            let emit2 = !loops2.is_empty() && (opts.off_by_n || loops1.is_empty());
            for (emit, paths_p, proc_p, program) in
                [(emit1, &loops1, g1, 1u8), (emit2, &loops2, g2, 2u8)]
            {
                if !emit {
                    continue;
                }
                for p in paths_p {
                    let raw = path_raw_items(proc_p, p, defined, opts, program)?;
                    let (items, obligations) =
                        resolve_calls(raw, program, None, defined, rel_ok, opts);
                    for obligation in &obligations {
                        clauses.push(build_clause(
                            apply(&antecedent_name, &sig_m),
                            &items[..obligation.position],
                            obligation.app.clone(),
                            &sig_m,
                        ));
                    }
                    clauses.push(build_clause(
                        apply(&antecedent_name, &sig_m),
                        &items,
                        apply(&antecedent_name, &sig_m),
                        &sig_m,
                    ));
                }
            }
        }
    }

    // One-sided summaries, used by uncoupled call sites and stutter paths.
    for (g, a, program) in [(g1, a1, 1u8), (g2, a2, 2u8)] {
        let single = single_summary_sig(g, program, opts);
        let consequent_for = |end: Mark| -> (String, Vec<SortedVar>) {
            if end == Mark::EXIT {
                (rec_single_name(name, program), single.finals.clone())
            } else {
                (
                    rec_single_mark_name(name, program, end),
                    single_intermediate_sig(a, end, program, opts),
                )
            }
        };
        for m in a.paths.start_marks() {
            let entry = m == Mark::ENTRY;
            let sig_m = if entry {
                single.pre.clone()
            } else {
                single_intermediate_sig(a, m, program, opts)
            };
            let antecedent_name = if entry {
                rec_single_pre_name(name, program)
            } else {
                rec_single_mark_name(name, program, m)
            };
            for p in a.paths.paths_from(m) {
                let (cons_name, cons_sig) = consequent_for(p.end_mark);
                let raw = path_raw_items(g, p, defined, opts, program)?;
                let (mut items, obligations) =
                    resolve_calls(raw, program, None, defined, rel_ok, opts);
                let prefix = if entry {
                    entry_captures(opts, &[program])
                } else {
                    Vec::new()
                };
                let offset = prefix.len();
                let mut full = prefix;
                full.append(&mut items);
                for obligation in &obligations {
                    clauses.push(build_clause(
                        apply(&antecedent_name, &sig_m),
                        &full[..obligation.position + offset],
                        obligation.app.clone(),
                        &sig_m,
                    ));
                }
                clauses.push(build_clause(
                    apply(&antecedent_name, &sig_m),
                    &full,
                    apply(&cons_name, &cons_sig),
                    &sig_m,
                ));
            }
        }
    }

    Ok(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn prepare_sources(src1: &str, src2: &str, opts: &Options) -> PreparedPair {
        let m1 = parse_module(src1).unwrap();
        let m2 = parse_module(src2).unwrap();
        prepare(m1, m2, opts).unwrap()
    }

    const IDENTITY: &str = "define @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}";

    #[test]
    fn identity_entry_clause_matches_expected_shape() {
        let opts = Options::default();
        let prepared = prepare_sources(IDENTITY, IDENTITY, &opts);
        let out = generate(&prepared, &Annotations::default(), &opts, None).unwrap();
        let text: Vec<String> = out
            .iter()
            .map(|e| e.rename_assignments().compress_lets().to_sexpr())
            .collect();
        assert!(text.iter().any(|l| l
            == "(assert (forall ((x$1 Int) (x$2 Int)) (=> (= x$1 x$2) (INV_MAIN_EXIT x$1 x$2))))"));
        assert!(text.contains(&"(check-sat)".to_string()));
        assert!(text.contains(&"(get-model)".to_string()));
    }

    #[test]
    fn identity_has_exit_to_postcondition_clause() {
        let opts = Options::default();
        let prepared = prepare_sources(IDENTITY, IDENTITY, &opts);
        let out = generate(&prepared, &Annotations::default(), &opts, None).unwrap();
        let text: Vec<String> = out
            .iter()
            .map(|e| e.rename_assignments().compress_lets().to_sexpr())
            .collect();
        assert!(text.iter().any(|l| l.contains("(=> (INV_MAIN_EXIT")
            && l.contains("(= result$1 result$2)")));
    }

    #[test]
    fn mismatched_arity_is_rejected() {
        let src2 = "define @f(%x: i32, %y: i32) -> i32 {\nentry:\n  ret %x\n}";
        let m1 = parse_module(IDENTITY).unwrap();
        let m2 = parse_module(src2).unwrap();
        let err = prepare(m1, m2, &Options::default()).unwrap_err();
        assert!(err.to_string().contains("ArityMismatch"));
    }

    #[test]
    fn missing_counterpart_is_rejected() {
        let src2 = "define @g(%x: i32) -> i32 {\nentry:\n  ret %x\n}";
        let m1 = parse_module(IDENTITY).unwrap();
        let m2 = parse_module(src2).unwrap();
        let err = prepare(m1, m2, &Options::default()).unwrap_err();
        assert!(err.to_string().contains("MissingCounterpart"));
    }
}
