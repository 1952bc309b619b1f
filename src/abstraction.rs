//! Fixed abstractions: external functions and global addresses.
//!
//! Declaration-only functions get no defining clauses; a pair declared in
//! both modules with the same arity receives an equivalence axiom (equal
//! inputs and equal input heaps imply equal outputs and equal output
//! heaps), optionally strengthened by `addfuncond` annotations. Globals
//! receive matching negative sentinel addresses; string constants are
//! placed by content so equal literals alias across the two programs.

use crate::annot::Annotations;
use crate::assignment::memory_type;
use crate::ir::{Module, Type};
use crate::mark::MARK_INTRINSIC;
use crate::opts::{IntSemantics, Options};
use crate::smt::{and_all, eq, implies, var, SmtExp, SmtType, SortedVar};
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet};

/// Extern functions declared in both modules with matching arity; only
/// these can be coupled relationally.
pub fn relational_externs(mod1: &Module, mod2: &Module) -> BTreeSet<String> {
    mod1.declarations
        .iter()
        .filter(|d| d.name != MARK_INTRINSIC)
        .filter_map(|d1| {
            mod2.declaration(&d1.name)
                .filter(|d2| d2.arity == d1.arity)
                .map(|_| d1.name.clone())
        })
        .collect()
}

fn scalar_type(opts: &Options) -> SmtType {
    match opts.int_semantics {
        IntSemantics::Unbounded => SmtType::Int,
        IntSemantics::Bounded => SmtType::BitVec(32),
    }
}

/// The equivalence axiom for one extern pair plus trivially-true one-sided
/// abstractions for every extern of each program.
pub fn extern_definitions(
    mod1: &Module,
    mod2: &Module,
    annotations: &Annotations,
    opts: &Options,
) -> Vec<SmtExp> {
    let mut out = Vec::new();
    let scalar = scalar_type(opts);

    for name in relational_externs(mod1, mod2) {
        let arity = mod1.declaration(&name).unwrap().arity;
        let mut args = Vec::new();
        let mut inputs_equal = Vec::new();
        for i in 0..arity {
            args.push(SortedVar::new(format!("arg1_{}", i), scalar.clone()));
        }
        for i in 0..arity {
            args.push(SortedVar::new(format!("arg2_{}", i), scalar.clone()));
        }
        for i in 0..arity {
            inputs_equal.push(eq(var(format!("arg1_{}", i)), var(format!("arg2_{}", i))));
        }
        if opts.memory.heap {
            args.push(SortedVar::new("HEAP$1", memory_type(opts)));
            args.push(SortedVar::new("HEAP$2", memory_type(opts)));
            inputs_equal.push(eq(var("HEAP$1"), var("HEAP$2")));
        }
        args.push(SortedVar::new("res1", scalar.clone()));
        args.push(SortedVar::new("res2", scalar.clone()));
        let mut outputs_equal = vec![eq(var("res1"), var("res2"))];
        if opts.memory.heap {
            args.push(SortedVar::new("HEAP$1_res", memory_type(opts)));
            args.push(SortedVar::new("HEAP$2_res", memory_type(opts)));
            outputs_equal.push(eq(var("HEAP$1_res"), var("HEAP$2_res")));
        }
        if let Some(conds) = annotations.fun_conds.get(&name) {
            outputs_equal.extend(conds.iter().cloned());
        }
        out.push(SmtExp::FunDef {
            name: format!("INV_REC_{}", name),
            args,
            ret: SmtType::Bool,
            body: Box::new(implies(and_all(inputs_equal), and_all(outputs_equal))),
        });
    }

    for (module, program) in [(mod1, 1u8), (mod2, 2u8)] {
        for decl in &module.declarations {
            if decl.name == MARK_INTRINSIC {
                continue;
            }
            let mut args = Vec::new();
            for i in 0..decl.arity {
                args.push(SortedVar::new(format!("arg_{}", i), scalar.clone()));
            }
            if opts.memory.heap {
                args.push(SortedVar::new("HEAP", memory_type(opts)));
            }
            args.push(SortedVar::new("res", scalar.clone()));
            if opts.memory.heap {
                args.push(SortedVar::new("HEAP_res", memory_type(opts)));
            }
            out.push(SmtExp::FunDef {
                name: format!("INV_REC_{}__{}", decl.name, program),
                args,
                ret: SmtType::Bool,
                body: Box::new(SmtExp::BoolLit(true)),
            });
        }
    }
    out
}

/// Negative sentinel addresses for all globals of both modules.
///
/// Globals present in both modules share an address; per-program leftovers
/// live in disjoint ranges. String constants (under `--strings`) are placed
/// by sorted content, so identical literals collide across programs.
pub fn global_addresses(
    mod1: &Module,
    mod2: &Module,
    opts: &Options,
) -> (BTreeMap<String, i64>, BTreeMap<String, i64>) {
    let mut addr1 = BTreeMap::new();
    let mut addr2 = BTreeMap::new();
    let is_string = |g: &crate::ir::Global| opts.strings && g.init.is_some();

    let mut counter: i64 = 1;
    for g1 in &mod1.globals {
        if is_string(g1) {
            continue;
        }
        if mod2.globals.iter().any(|g2| g2.name == g1.name && !is_string(g2)) {
            counter += g1.size as i64;
            addr1.insert(g1.name.clone(), -counter);
            addr2.insert(g1.name.clone(), -counter);
        }
    }
    for g1 in &mod1.globals {
        if !is_string(g1) && !addr1.contains_key(&g1.name) {
            counter += g1.size as i64;
            addr1.insert(g1.name.clone(), -counter);
        }
    }
    for g2 in &mod2.globals {
        if !is_string(g2) && !addr2.contains_key(&g2.name) {
            counter += g2.size as i64;
            addr2.insert(g2.name.clone(), -counter);
        }
    }

    if opts.strings {
        let mut contents: BTreeSet<&str> = BTreeSet::new();
        for g in mod1.globals.iter().chain(mod2.globals.iter()) {
            if let Some(init) = &g.init {
                contents.insert(init);
            }
        }
        let mut by_content = BTreeMap::new();
        for content in contents {
            counter += content.len() as i64 + 1;
            by_content.insert(content.to_string(), -counter);
        }
        for (module, map) in [(mod1, &mut addr1), (mod2, &mut addr2)] {
            for g in &module.globals {
                if let Some(init) = &g.init {
                    map.insert(g.name.clone(), by_content[init]);
                }
            }
        }
    }
    (addr1, addr2)
}

fn address_literal(addr: i64, opts: &Options) -> SmtExp {
    match opts.int_semantics {
        IntSemantics::Unbounded => SmtExp::IntLit(BigInt::from(addr)),
        IntSemantics::Bounded => SmtExp::BvLit {
            value: BigInt::from(addr),
            width: Type::Pointer.bits(),
        },
    }
}

/// Zero-argument `define-fun`s binding each global's suffixed name to its
/// address.
pub fn global_definitions(mod1: &Module, mod2: &Module, opts: &Options) -> Vec<SmtExp> {
    let (addr1, addr2) = global_addresses(mod1, mod2, opts);
    let pointer = match opts.int_semantics {
        IntSemantics::Unbounded => SmtType::Int,
        IntSemantics::Bounded => SmtType::BitVec(64),
    };
    let mut out = Vec::new();
    for (map, program) in [(&addr1, 1u8), (&addr2, 2u8)] {
        for (name, addr) in map.iter() {
            out.push(SmtExp::FunDef {
                name: format!("{}${}", name, program),
                args: Vec::new(),
                ret: pointer.clone(),
                body: Box::new(address_literal(*addr, opts)),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn matched_globals_share_an_address() {
        let m1 = parse_module("global @tab 4\nglobal @only1 2\n").unwrap();
        let m2 = parse_module("global @tab 4\nglobal @only2 8\n").unwrap();
        let (a1, a2) = global_addresses(&m1, &m2, &Options::default());
        assert_eq!(a1["tab"], a2["tab"]);
        assert_ne!(a1["only1"], a2["only2"]);
        assert!(a1["tab"] < 0);
    }

    #[test]
    fn equal_strings_collide_across_programs() {
        let m1 = parse_module("global @msg 6 = \"hello\"\n").unwrap();
        let m2 = parse_module("global @greeting 6 = \"hello\"\n").unwrap();
        let opts = Options {
            strings: true,
            ..Options::default()
        };
        let (a1, a2) = global_addresses(&m1, &m2, &opts);
        assert_eq!(a1["msg"], a2["greeting"]);
    }

    #[test]
    fn extern_pair_gets_equivalence_axiom() {
        let m1 = parse_module("declare @g(1)\ndefine @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}")
            .unwrap();
        let m2 = parse_module("declare @g(1)\ndefine @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}")
            .unwrap();
        let defs = extern_definitions(&m1, &m2, &Annotations::default(), &Options::default());
        let text: Vec<String> = defs.iter().map(|d| d.to_sexpr()).collect();
        assert!(text
            .iter()
            .any(|t| t.starts_with("(define-fun INV_REC_g ") && t.contains("(= res1 res2)")));
        assert!(text.iter().any(|t| t.contains("INV_REC_g__1")));
        assert!(text.iter().any(|t| t.contains("INV_REC_g__2")));
    }

    #[test]
    fn fun_conds_strengthen_the_axiom() {
        let m1 = parse_module("declare @g(1)\n").unwrap();
        let m2 = parse_module("declare @g(1)\n").unwrap();
        let annots =
            crate::annot::parse_annotations("/*@ addfuncond g (> res1 0) @*/", "").unwrap();
        let defs = extern_definitions(&m1, &m2, &annots, &Options::default());
        let text: Vec<String> = defs.iter().map(|d| d.to_sexpr()).collect();
        assert!(text.iter().any(|t| t.contains("(> res1 0)")));
    }
}
