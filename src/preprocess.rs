//! Per-procedure normalisation passes.
//!
//! The pipeline mirrors the preparation the encoder expects: stack slots are
//! promoted to SSA registers, trivial forwarding blocks disappear, returns
//! are funnelled into a single exit block and every SSA name receives the
//! program-index suffix. Mark-intrinsic removal and stack annotation run
//! separately after mark analysis has read the annotations.

use crate::ir::{
    BinOp, Block, BlockId, CastKind, Constant, InstrOp, Module, Operand, Phi, Procedure,
    Terminator, Type, ValueId, ValueKind,
};
use crate::mark::MARK_INTRINSIC;
use std::collections::{BTreeSet, HashMap};

/// Run the structural passes on every procedure of a module and suffix all
/// SSA names with `$<program>`.
pub fn preprocess(module: &mut Module, program: u8) {
    for proc in &mut module.procedures {
        promote_allocas(proc);
        simplify_cfg(proc);
        unify_exits(proc);
        uniquify_names(proc, program);
    }
}

/// Passes that run after mark analysis: delete the mark intrinsic calls and
/// annotate stack-routed memory accesses.
pub fn finalize(proc: &mut Procedure) {
    remove_marks(proc);
    annotate_stack(proc);
}

/* ------------------------------------------------------------------ */
/* Operand rewriting                                                   */

fn rewrite_operand(op: &mut Operand, subst: &HashMap<ValueId, Operand>) {
    if let Operand::Value(id) = op {
        if let Some(replacement) = subst.get(id) {
            *op = replacement.clone();
            // Chase chains introduced by store-to-load forwarding.
            rewrite_operand(op, subst);
        }
    }
}

/// Replace every use of the substituted values across the procedure.
fn apply_substitution(proc: &mut Procedure, subst: &HashMap<ValueId, Operand>) {
    if subst.is_empty() {
        return;
    }
    for block in &mut proc.blocks {
        for phi in &mut block.phis {
            for (_, op) in &mut phi.incoming {
                rewrite_operand(op, subst);
            }
        }
        for instr in &mut block.instrs {
            match &mut instr.op {
                InstrOp::Binary { lhs, rhs, .. } | InstrOp::Cmp { lhs, rhs, .. } => {
                    rewrite_operand(lhs, subst);
                    rewrite_operand(rhs, subst);
                }
                InstrOp::Cast { value, .. } => rewrite_operand(value, subst),
                InstrOp::Select {
                    cond,
                    then_value,
                    else_value,
                } => {
                    rewrite_operand(cond, subst);
                    rewrite_operand(then_value, subst);
                    rewrite_operand(else_value, subst);
                }
                InstrOp::Load { addr, .. } => rewrite_operand(addr, subst),
                InstrOp::Store { addr, value, .. } => {
                    rewrite_operand(addr, subst);
                    rewrite_operand(value, subst);
                }
                InstrOp::Gep { base, offsets } => {
                    rewrite_operand(base, subst);
                    for (_, idx) in offsets {
                        rewrite_operand(idx, subst);
                    }
                }
                InstrOp::Alloca { .. } => {}
                InstrOp::Call { args, .. } => {
                    for a in args {
                        rewrite_operand(a, subst);
                    }
                }
            }
        }
        match &mut block.term {
            Terminator::CondBr { cond, .. } => rewrite_operand(cond, subst),
            Terminator::Switch { cond, .. } => rewrite_operand(cond, subst),
            Terminator::Ret { value: Some(v) } => rewrite_operand(v, subst),
            _ => {}
        }
    }
}

/* ------------------------------------------------------------------ */
/* Dominance                                                           */

/// Immediate dominators over the reachable blocks (Cooper-Harvey-Kennedy).
/// Returns (reverse postorder, idom keyed by block index).
fn dominators(proc: &Procedure) -> (Vec<BlockId>, HashMap<BlockId, BlockId>) {
    // Postorder over reachable blocks.
    let mut postorder = Vec::new();
    let mut seen = BTreeSet::new();
    fn walk(proc: &Procedure, b: BlockId, seen: &mut BTreeSet<BlockId>, out: &mut Vec<BlockId>) {
        if !seen.insert(b) {
            return;
        }
        for s in proc.successors(b) {
            walk(proc, s, seen, out);
        }
        out.push(b);
    }
    walk(proc, proc.entry, &mut seen, &mut postorder);

    let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();
    let order_index: HashMap<BlockId, usize> =
        rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
    let preds = proc.predecessors();

    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(proc.entry, proc.entry);

    let intersect = |idom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
        while a != b {
            while order_index[&a] > order_index[&b] {
                a = idom[&a];
            }
            while order_index[&b] > order_index[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom = None;
            for &p in &preds[b.0 as usize] {
                if !order_index.contains_key(&p) || !idom.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, cur, p),
                });
            }
            if let Some(d) = new_idom {
                if idom.get(&b) != Some(&d) {
                    idom.insert(b, d);
                    changed = true;
                }
            }
        }
    }
    (rpo, idom)
}

fn dominance_frontiers(
    proc: &Procedure,
    rpo: &[BlockId],
    idom: &HashMap<BlockId, BlockId>,
) -> HashMap<BlockId, BTreeSet<BlockId>> {
    let preds = proc.predecessors();
    let mut df: HashMap<BlockId, BTreeSet<BlockId>> =
        rpo.iter().map(|b| (*b, BTreeSet::new())).collect();
    for &b in rpo {
        let bp: Vec<BlockId> = preds[b.0 as usize]
            .iter()
            .copied()
            .filter(|p| idom.contains_key(p))
            .collect();
        if bp.len() >= 2 {
            for p in bp {
                let mut runner = p;
                while runner != idom[&b] {
                    df.get_mut(&runner).unwrap().insert(b);
                    runner = idom[&runner];
                }
            }
        }
    }
    df
}

/* ------------------------------------------------------------------ */
/* Pass 1: stack promotion                                             */

/// True if the alloca result is only ever used as a plain load/store
/// address.
fn promotable(proc: &Procedure, id: ValueId) -> bool {
    let used_as = |op: &Operand| matches!(op, Operand::Value(v) if *v == id);
    for block in &proc.blocks {
        for phi in &block.phis {
            if phi.incoming.iter().any(|(_, op)| used_as(op)) {
                return false;
            }
        }
        for instr in &block.instrs {
            match &instr.op {
                InstrOp::Load { addr, .. } => {
                    if used_as(addr) {
                        continue;
                    }
                }
                InstrOp::Store { addr, value, .. } => {
                    if used_as(value) {
                        return false;
                    }
                    if used_as(addr) {
                        continue;
                    }
                }
                _ => {}
            }
            let mut escapes = false;
            match &instr.op {
                InstrOp::Binary { lhs, rhs, .. } | InstrOp::Cmp { lhs, rhs, .. } => {
                    escapes = used_as(lhs) || used_as(rhs)
                }
                InstrOp::Cast { value, .. } => escapes = used_as(value),
                InstrOp::Select {
                    cond,
                    then_value,
                    else_value,
                } => escapes = used_as(cond) || used_as(then_value) || used_as(else_value),
                InstrOp::Gep { base, offsets } => {
                    escapes = used_as(base) || offsets.iter().any(|(_, op)| used_as(op))
                }
                InstrOp::Call { args, .. } => escapes = args.iter().any(used_as),
                InstrOp::Load { .. } | InstrOp::Store { .. } | InstrOp::Alloca { .. } => {}
            }
            if escapes {
                return false;
            }
        }
        match &block.term {
            Terminator::CondBr { cond, .. } | Terminator::Switch { cond, .. } => {
                if used_as(cond) {
                    return false;
                }
            }
            Terminator::Ret { value: Some(v) } => {
                if used_as(v) {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Promote single-cell stack slots into SSA registers, inserting phi nodes
/// at dominance frontiers. Unpromotable slots (escaping pointers, arrays
/// addressed through `gep`) are left for the stack memory model.
pub fn promote_allocas(proc: &mut Procedure) {
    let allocas: Vec<ValueId> = proc
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .filter_map(|i| match (&i.op, i.result) {
            (InstrOp::Alloca { cells: 1 }, Some(r)) => Some(r),
            _ => None,
        })
        .collect();
    let allocas: Vec<ValueId> = allocas
        .into_iter()
        .filter(|a| promotable(proc, *a))
        .collect();
    if allocas.is_empty() {
        return;
    }

    let (rpo, idom) = dominators(proc);
    let df = dominance_frontiers(proc, &rpo, &idom);

    let mut subst: HashMap<ValueId, Operand> = HashMap::new();
    let mut dead: BTreeSet<ValueId> = BTreeSet::new();

    for alloca in allocas {
        dead.insert(alloca);
        let slot_name = proc.value_name(alloca).to_string();

        // Blocks that store into the slot.
        let mut def_blocks: BTreeSet<BlockId> = BTreeSet::new();
        for b in proc.block_ids() {
            for instr in &proc.block(b).instrs {
                if let InstrOp::Store { addr: Operand::Value(a), .. } = &instr.op {
                    if *a == alloca {
                        def_blocks.insert(b);
                    }
                }
            }
        }

        // Iterated dominance frontier.
        let mut phi_blocks: BTreeSet<BlockId> = BTreeSet::new();
        let mut work: Vec<BlockId> = def_blocks.iter().copied().collect();
        while let Some(b) = work.pop() {
            for &f in df.get(&b).map(|s| s.iter()).into_iter().flatten() {
                if phi_blocks.insert(f) {
                    work.push(f);
                }
            }
        }

        // Materialise the phis.
        let mut slot_phis: HashMap<BlockId, ValueId> = HashMap::new();
        for (n, &b) in phi_blocks.iter().enumerate() {
            let id = proc.push_value(
                format!("{}.{}", slot_name, n),
                Type::Int(32),
                ValueKind::Instruction { block: b },
            );
            proc.block_mut(b).phis.push(Phi {
                result: id,
                incoming: Vec::new(),
            });
            slot_phis.insert(b, id);
        }

        // Rename along the dominator tree.
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for &b in &rpo {
            if b != proc.entry {
                children.entry(idom[&b]).or_default().push(b);
            }
        }
        let resolve = |op: &Operand, subst: &HashMap<ValueId, Operand>| {
            let mut op = op.clone();
            rewrite_operand(&mut op, subst);
            op
        };

        let mut stack: Vec<(BlockId, Operand)> = vec![(
            proc.entry,
            Operand::Const(Constant::Int {
                value: 0,
                ty: Type::Int(32),
            }),
        )];
        while let Some((b, mut current)) = stack.pop() {
            if let Some(&phi) = slot_phis.get(&b) {
                current = Operand::Value(phi);
            }
            for instr in &proc.block(b).instrs {
                match (&instr.op, instr.result) {
                    (InstrOp::Load { addr: Operand::Value(a), .. }, Some(r)) if *a == alloca => {
                        subst.insert(r, resolve(&current, &subst));
                        dead.insert(r);
                    }
                    (InstrOp::Store { addr: Operand::Value(a), value, .. }, _) if *a == alloca => {
                        current = resolve(value, &subst);
                    }
                    _ => {}
                }
            }
            for s in proc.successors(b) {
                if let Some(&phi) = slot_phis.get(&s) {
                    let val = resolve(&current, &subst);
                    let phi_node = proc.blocks[s.0 as usize]
                        .phis
                        .iter_mut()
                        .find(|p| p.result == phi)
                        .unwrap();
                    phi_node.incoming.push((b, val));
                }
            }
            for &c in children.get(&b).map(|v| v.as_slice()).unwrap_or(&[]) {
                stack.push((c, current.clone()));
            }
        }

        // Drop the promoted loads, stores and the slot itself.
        for b in 0..proc.blocks.len() {
            proc.blocks[b].instrs.retain(|i| match &i.op {
                InstrOp::Alloca { .. } => i.result != Some(alloca),
                InstrOp::Load { addr: Operand::Value(a), .. } => *a != alloca,
                InstrOp::Store { addr: Operand::Value(a), .. } => *a != alloca,
                _ => true,
            });
        }
    }

    apply_substitution(proc, &subst);
}

/* ------------------------------------------------------------------ */
/* Pass 2: control-flow simplification                                 */

/// Remove empty forwarding blocks (no phis, no instructions, unconditional
/// branch), re-pointing predecessors at the target. Mark-carrying blocks
/// contain the intrinsic call and are therefore never empty.
pub fn simplify_cfg(proc: &mut Procedure) {
    loop {
        let mut removed = false;
        for b in proc.block_ids() {
            if b == proc.entry {
                continue;
            }
            let target = match &proc.block(b).term {
                Terminator::Br { target } if *target != b => *target,
                _ => continue,
            };
            if !proc.block(b).phis.is_empty() || !proc.block(b).instrs.is_empty() {
                continue;
            }
            let preds: Vec<BlockId> = proc.predecessors()[b.0 as usize].clone();
            if preds.is_empty() {
                continue;
            }
            // Refuse when the rewiring would produce conflicting phi rows.
            let conflict = proc.block(target).phis.iter().any(|phi| {
                preds
                    .iter()
                    .any(|p| phi.incoming.iter().any(|(from, _)| from == p))
            });
            if conflict {
                continue;
            }
            for p in &preds {
                retarget(proc.block_mut(*p), b, target);
            }
            for phi in &mut proc.blocks[target.0 as usize].phis {
                let rows: Vec<(BlockId, Operand)> = phi
                    .incoming
                    .iter()
                    .filter(|(from, _)| *from == b)
                    .map(|(_, v)| v.clone())
                    .flat_map(|v| preds.iter().map(move |p| (*p, v.clone())))
                    .collect();
                phi.incoming.retain(|(from, _)| *from != b);
                phi.incoming.extend(rows);
            }
            // Leave the block in place but unreachable; compaction strips it.
            proc.block_mut(b).term = Terminator::Unreachable;
            removed = true;
        }
        if !removed {
            break;
        }
    }
    compact_blocks(proc);
}

fn retarget(block: &mut Block, from: BlockId, to: BlockId) {
    let patch = |t: &mut BlockId| {
        if *t == from {
            *t = to;
        }
    };
    match &mut block.term {
        Terminator::Br { target } => patch(target),
        Terminator::CondBr {
            then_block,
            else_block,
            ..
        } => {
            patch(then_block);
            patch(else_block);
        }
        Terminator::Switch { cases, default, .. } => {
            for (_, t) in cases {
                patch(t);
            }
            patch(default);
        }
        _ => {}
    }
}

/// Rebuild the block arena keeping only reachable blocks, remapping every
/// block reference.
fn compact_blocks(proc: &mut Procedure) {
    let reachable = proc.reachable_blocks();
    if reachable.len() == proc.blocks.len() {
        return;
    }
    let remap: HashMap<BlockId, BlockId> = reachable
        .iter()
        .enumerate()
        .map(|(i, b)| (*b, BlockId(i as u32)))
        .collect();

    let old_blocks = std::mem::take(&mut proc.blocks);
    let mut new_blocks = Vec::with_capacity(reachable.len());
    for &old_id in &reachable {
        let mut block = old_blocks[old_id.0 as usize].clone();
        for phi in &mut block.phis {
            phi.incoming.retain(|(from, _)| remap.contains_key(from));
            for (from, _) in &mut phi.incoming {
                *from = remap[from];
            }
        }
        let patch = |t: &mut BlockId| *t = remap[t];
        match &mut block.term {
            Terminator::Br { target } => patch(target),
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => {
                patch(then_block);
                patch(else_block);
            }
            Terminator::Switch { cases, default, .. } => {
                for (_, t) in cases {
                    patch(t);
                }
                patch(default);
            }
            _ => {}
        }
        new_blocks.push(block);
    }
    proc.blocks = new_blocks;
    for v in &mut proc.values {
        if let ValueKind::Instruction { block } = &mut v.kind {
            if let Some(new) = remap.get(block) {
                *block = *new;
            } else {
                *block = BlockId(0);
            }
        }
    }
    proc.entry = remap[&proc.entry];
}

/* ------------------------------------------------------------------ */
/* Pass 3: exit unification                                            */

/// Funnel all returning blocks into a single exit block, merging return
/// values through a phi.
pub fn unify_exits(proc: &mut Procedure) {
    let ret_blocks: Vec<BlockId> = proc
        .reachable_blocks()
        .into_iter()
        .filter(|b| matches!(proc.block(*b).term, Terminator::Ret { .. }))
        .collect();
    if ret_blocks.len() <= 1 {
        return;
    }

    let exit_id = BlockId(proc.blocks.len() as u32);
    let mut incoming = Vec::new();
    let mut returns_value = false;
    for &b in &ret_blocks {
        if let Terminator::Ret { value } = proc.block(b).term.clone() {
            if let Some(v) = value {
                returns_value = true;
                incoming.push((b, v));
            } else {
                incoming.push((
                    b,
                    Operand::Const(Constant::Int {
                        value: 0,
                        ty: Type::Int(32),
                    }),
                ));
            }
        }
        proc.block_mut(b).term = Terminator::Br { target: exit_id };
    }

    let (phis, ret_value) = if returns_value {
        let ret_ty = proc.ret_ty.clone();
        let phi_id = proc.push_value(
            "retval".to_string(),
            ret_ty,
            ValueKind::Instruction { block: exit_id },
        );
        (
            vec![Phi {
                result: phi_id,
                incoming,
            }],
            Some(Operand::Value(phi_id)),
        )
    } else {
        (Vec::new(), None)
    };

    proc.blocks.push(Block {
        name: "exit".to_string(),
        phis,
        instrs: Vec::new(),
        term: Terminator::Ret { value: ret_value },
    });
}

/* ------------------------------------------------------------------ */
/* Pass 4: name uniquification                                         */

/// Suffix every SSA name with `$<program>` so the two coupled programs
/// occupy disjoint namespaces.
pub fn uniquify_names(proc: &mut Procedure, program: u8) {
    for v in &mut proc.values {
        v.name = format!("{}${}", v.name, program);
    }
}

/* ------------------------------------------------------------------ */
/* Pass 5: mark removal                                                */

/// Delete `__mark` calls, rewriting `and(__mark(k), c)` to `c`. A
/// zero-extension of the call is unwrapped and removed along with it; a
/// branch whose entire condition was the mark collapses to `true`.
pub fn remove_marks(proc: &mut Procedure) {
    // The call results plus any zero-extensions of them.
    let mut mark_values: BTreeSet<ValueId> = BTreeSet::new();
    for block in &proc.blocks {
        for instr in &block.instrs {
            if let (InstrOp::Call { callee, .. }, Some(r)) = (&instr.op, instr.result) {
                if callee == MARK_INTRINSIC {
                    mark_values.insert(r);
                }
            }
        }
    }
    loop {
        let mut grew = false;
        for block in &proc.blocks {
            for instr in &block.instrs {
                if let (
                    InstrOp::Cast {
                        kind: CastKind::ZExt,
                        value: Operand::Value(v),
                    },
                    Some(r),
                ) = (&instr.op, instr.result)
                {
                    if mark_values.contains(v) && mark_values.insert(r) {
                        grew = true;
                    }
                }
            }
        }
        if !grew {
            break;
        }
    }

    // Rewrite conjunctions containing a mark value to their other operand.
    let mut subst: HashMap<ValueId, Operand> = HashMap::new();
    for block in &proc.blocks {
        for instr in &block.instrs {
            if let (InstrOp::Binary { op: BinOp::And, lhs, rhs }, Some(r)) =
                (&instr.op, instr.result)
            {
                let lhs_is_mark =
                    matches!(lhs, Operand::Value(v) if mark_values.contains(v));
                let rhs_is_mark =
                    matches!(rhs, Operand::Value(v) if mark_values.contains(v));
                match (lhs_is_mark, rhs_is_mark) {
                    (true, false) => {
                        subst.insert(r, rhs.clone());
                    }
                    (false, true) => {
                        subst.insert(r, lhs.clone());
                    }
                    (true, true) => {
                        subst.insert(r, Operand::Const(Constant::Bool(true)));
                    }
                    (false, false) => {}
                }
            }
        }
    }
    apply_substitution(proc, &subst);
    let rewritten: BTreeSet<ValueId> = subst.keys().copied().collect();

    // A condition that was the bare mark collapses to true.
    for block in &mut proc.blocks {
        if let Terminator::CondBr { cond, .. } = &mut block.term {
            if matches!(cond, Operand::Value(v) if mark_values.contains(v)) {
                *cond = Operand::Const(Constant::Bool(true));
            }
        }
    }

    for block in &mut proc.blocks {
        block.instrs.retain(|i| match (&i.op, i.result) {
            (InstrOp::Call { callee, .. }, _) if callee == MARK_INTRINSIC => false,
            (_, Some(r)) => !mark_values.contains(&r) && !rewritten.contains(&r),
            _ => true,
        });
    }
}

/* ------------------------------------------------------------------ */
/* Pass 6: stack access annotation                                     */

/// Flag loads and stores whose address derives from a stack slot; the
/// encoder routes these through the stack array instead of the heap array.
pub fn annotate_stack(proc: &mut Procedure) {
    let mut stack_ptrs: BTreeSet<ValueId> = proc
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .filter_map(|i| match (&i.op, i.result) {
            (InstrOp::Alloca { .. }, Some(r)) => Some(r),
            _ => None,
        })
        .collect();

    let from_stack = |op: &Operand, set: &BTreeSet<ValueId>| {
        matches!(op, Operand::Value(v) if set.contains(v))
    };
    loop {
        let mut grew = false;
        for block in &proc.blocks {
            for phi in &block.phis {
                if phi
                    .incoming
                    .iter()
                    .all(|(_, op)| from_stack(op, &stack_ptrs))
                    && stack_ptrs.insert(phi.result)
                {
                    grew = true;
                }
            }
            for instr in &block.instrs {
                let result = match instr.result {
                    Some(r) => r,
                    None => continue,
                };
                let derived = match &instr.op {
                    InstrOp::Gep { base, .. } => from_stack(base, &stack_ptrs),
                    InstrOp::Select {
                        then_value,
                        else_value,
                        ..
                    } => {
                        from_stack(then_value, &stack_ptrs)
                            && from_stack(else_value, &stack_ptrs)
                    }
                    _ => false,
                };
                if derived && stack_ptrs.insert(result) {
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
    }

    for block in &mut proc.blocks {
        for instr in &mut block.instrs {
            match &mut instr.op {
                InstrOp::Load { addr, stack } | InstrOp::Store { addr, stack, .. } => {
                    if matches!(addr, Operand::Value(v) if stack_ptrs.contains(v)) {
                        *stack = true;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn promotes_a_single_slot() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %p = alloca 1
  store %x, %p
  %v = load %p
  ret %v
}";
        let mut m = parse_module(src).unwrap();
        promote_allocas(&mut m.procedures[0]);
        let f = &m.procedures[0];
        assert!(f.blocks[0].instrs.is_empty());
        assert_eq!(
            f.block(BlockId(0)).term,
            Terminator::Ret {
                value: Some(Operand::Value(f.params[0]))
            }
        );
    }

    #[test]
    fn promotes_across_branches_with_phi() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %p = alloca 1
  store 0, %p
  %c = icmp sgt %x, 0
  br %c, pos, done
pos:
  store %x, %p
  br done
done:
  %v = load %p
  ret %v
}";
        let mut m = parse_module(src).unwrap();
        promote_allocas(&mut m.procedures[0]);
        let f = &m.procedures[0];
        assert_eq!(f.blocks[2].phis.len(), 1);
        assert_eq!(f.blocks[2].phis[0].incoming.len(), 2);
        assert!(f
            .blocks
            .iter()
            .all(|b| b.instrs.iter().all(|i| !matches!(i.op, InstrOp::Alloca { .. }))));
    }

    #[test]
    fn keeps_array_slots() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %a = alloca 4
  %p = gep %a, 1 x 0
  store %x, %p
  %v = load %p
  ret %v
}";
        let mut m = parse_module(src).unwrap();
        promote_allocas(&mut m.procedures[0]);
        let f = &m.procedures[0];
        assert!(f.blocks[0]
            .instrs
            .iter()
            .any(|i| matches!(i.op, InstrOp::Alloca { .. })));
    }

    #[test]
    fn removes_forwarding_blocks() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  br hop
hop:
  br done
done:
  ret %x
}";
        let mut m = parse_module(src).unwrap();
        simplify_cfg(&mut m.procedures[0]);
        assert_eq!(m.procedures[0].blocks.len(), 2);
    }

    #[test]
    fn unifies_two_returns() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %c = icmp sgt %x, 0
  br %c, pos, neg
pos:
  ret %x
neg:
  ret 0
}";
        let mut m = parse_module(src).unwrap();
        unify_exits(&mut m.procedures[0]);
        let f = &m.procedures[0];
        assert_eq!(f.exit_block(), Some(BlockId(3)));
        assert_eq!(f.block(BlockId(3)).phis.len(), 1);
        assert_eq!(f.block(BlockId(3)).phis[0].incoming.len(), 2);
    }

    #[test]
    fn removes_mark_calls_and_conjunct() {
        let src = "
define @f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [body: %i1]
  %m = call @__mark(1)
  %c = icmp sle %i, %n
  %g = and %m, %c
  br %g, body, done
body:
  %i1 = add %i, 1
  br loop
done:
  ret %i
}";
        let mut m = parse_module(src).unwrap();
        remove_marks(&mut m.procedures[0]);
        let f = &m.procedures[0];
        let loop_block = f.block(BlockId(1));
        assert_eq!(loop_block.instrs.len(), 1);
        match &loop_block.term {
            Terminator::CondBr { cond, .. } => {
                assert_eq!(cond, &Operand::Value(loop_block.instrs[0].result.unwrap()));
            }
            t => panic!("expected a conditional branch, got {:?}", t),
        }
    }

    #[test]
    fn annotates_stack_accesses() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %a = alloca 4
  %p = gep %a, 1 x 1
  store %x, %p
  %v = load %p
  ret %v
}";
        let mut m = parse_module(src).unwrap();
        annotate_stack(&mut m.procedures[0]);
        let f = &m.procedures[0];
        let stacky: Vec<bool> = f.blocks[0]
            .instrs
            .iter()
            .filter_map(|i| match &i.op {
                InstrOp::Load { stack, .. } | InstrOp::Store { stack, .. } => Some(*stack),
                _ => None,
            })
            .collect();
        assert_eq!(stacky, vec![true, true]);
    }
}
