#[cfg(test)]
mod tests {
    use crate::*;

    fn generate(src1: &str, src2: &str, opts: &Options) -> Vec<SmtExp> {
        run_verification(src1, src2, opts, None)
            .expect("verification failed")
            .smt
    }

    fn render(exprs: &[SmtExp]) -> String {
        exprs
            .iter()
            .map(|e| e.to_sexpr())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The predicate a clause concludes, if any.
    fn consequent_pred(exp: &SmtExp) -> Option<String> {
        fn walk(e: &SmtExp) -> Option<String> {
            match e {
                SmtExp::Assert(b) => walk(b),
                SmtExp::Forall { body, .. } => walk(body),
                SmtExp::Let { body, .. } => walk(body),
                SmtExp::Op { name, args } if name == "=>" => walk(args.last()?),
                SmtExp::Op { name, .. } => Some(name.clone()),
                _ => None,
            }
        }
        match exp {
            SmtExp::Assert(_) => walk(exp),
            _ => None,
        }
    }

    fn implications_to(exprs: &[SmtExp], pred: &str) -> usize {
        exprs
            .iter()
            .filter(|e| consequent_pred(e).as_deref() == Some(pred))
            .count()
    }

    const IDENTITY: &str = "define @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}";

    const SUM_LOOP: &str = "
define @f(%n: i32) -> i32 {
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

    const SUM_CLOSED: &str = "
define @f(%n: i32) -> i32 {
entry:
  br check
check:
  %m = call @__mark(1)
  %c = icmp sge %n, 0
  %g = and %m, %c
  br %g, compute, neg
compute:
  %n1 = add %n, 1
  %p = mul %n, %n1
  %h = sdiv %p, 2
  ret %h
neg:
  ret 0
}";

    const SUM_DOWN: &str = "
define @f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %j = phi [entry: %n], [body: %j1]
  %s = phi [entry: 0], [body: %s1]
  %m = call @__mark(1)
  %c = icmp sgt %j, 0
  %g = and %m, %c
  br %g, body, done
body:
  %j1 = sub %j, 1
  %s1 = add %s, %j
  br loop
done:
  ret %s
}";

    /* -------------------------------------------------------------- */
    /* S1: identity                                                    */

    #[test]
    fn identity_pair_produces_the_expected_entry_clause() {
        let out = generate(IDENTITY, IDENTITY, &Options::default());
        let text = render(&out);
        assert!(text.contains(
            "(assert (forall ((x$1 Int) (x$2 Int)) (=> (= x$1 x$2) (INV_MAIN_EXIT x$1 x$2))))"
        ));
        assert!(text.contains("(set-logic HORN)"));
        assert!(text.contains("(check-sat)"));
        assert!(text.contains("(get-model)"));
    }

    /* -------------------------------------------------------------- */
    /* S2: loop against closed form                                    */

    #[test]
    fn unbalanced_loop_gets_a_stutter_clause() {
        let opts = Options::default();
        let out = generate(SUM_LOOP, SUM_CLOSED, &opts);
        // One joint entry implication into the loop mark, plus exactly one
        // stutter implication for program 1's loop step.
        assert_eq!(implications_to(&out, "INV_MAIN_1"), 2);
        // Paths 1 -> EXIT couple 1 x 2 ways.
        assert_eq!(implications_to(&out, "INV_MAIN_EXIT"), 2);
    }

    #[test]
    fn unbalanced_loop_path_counts() {
        let m1 = parser::parse_module(SUM_LOOP).unwrap();
        let m2 = parser::parse_module(SUM_CLOSED).unwrap();
        let prepared = encoder::prepare(m1, m2, &Options::default()).unwrap();
        let (a1, a2) = &prepared.analyses["f"];
        let one = Mark::number(1);
        assert_eq!(a1.paths.paths_between(one, one).len(), 1);
        assert_eq!(a2.paths.paths_between(one, one).len(), 0);
        assert_eq!(a2.paths.paths_between(one, Mark::EXIT).len(), 2);
    }

    /* -------------------------------------------------------------- */
    /* S3: off-by-n                                                    */

    #[test]
    fn off_by_n_adds_asymmetric_transitions() {
        let lockstep = generate(SUM_LOOP, SUM_DOWN, &Options::default());
        let opts = Options {
            off_by_n: true,
            ..Options::default()
        };
        let relaxed = generate(SUM_LOOP, SUM_DOWN, &opts);
        // Both programs loop at mark 1, so lock-step coupling emits the
        // joint products only; off-by-n adds one stutter per loop path per
        // program.
        assert_eq!(implications_to(&lockstep, "INV_MAIN_1"), 2);
        assert_eq!(implications_to(&relaxed, "INV_MAIN_1"), 4);
    }

    #[test]
    fn coupling_count_matches_path_products() {
        let m1 = parser::parse_module(SUM_LOOP).unwrap();
        let m2 = parser::parse_module(SUM_DOWN).unwrap();
        let opts = Options {
            off_by_n: true,
            ..Options::default()
        };
        let prepared = encoder::prepare(m1, m2, &opts).unwrap();
        let (a1, a2) = &prepared.analyses["f"];
        let one = Mark::number(1);
        let joint = a1.paths.paths_between(one, one).len()
            * a2.paths.paths_between(one, one).len()
            + a1.paths.paths_between(Mark::ENTRY, one).len()
                * a2.paths.paths_between(Mark::ENTRY, one).len();
        let stutters =
            a1.paths.paths_between(one, one).len() + a2.paths.paths_between(one, one).len();
        let out = generate(SUM_LOOP, SUM_DOWN, &opts);
        assert_eq!(implications_to(&out, "INV_MAIN_1"), joint + stutters);
    }

    /* -------------------------------------------------------------- */
    /* S4: mismatched arity                                            */

    #[test]
    fn mismatched_arity_reports_arity_mismatch() {
        let src2 = "define @f(%x: i32, %y: i32) -> i32 {\nentry:\n  ret %x\n}";
        let err = run_verification(IDENTITY, src2, &Options::default(), None).unwrap_err();
        assert!(err.to_string().contains("ArityMismatch"));
    }

    /* -------------------------------------------------------------- */
    /* S5: dynamic equation discovery                                  */

    #[test]
    fn dynamic_mode_fits_exit_invariants() {
        let src1 = "define @f(%x: i32, %y: i32) -> i32 {\nentry:\n  %p = mul %x, %y\n  %r = add %p, 1\n  ret %r\n}";
        let src2 = "define @f(%x: i32, %y: i32) -> i32 {\nentry:\n  %p = mul %y, %x\n  %r = add %p, 1\n  ret %r\n}";
        let cfg = DynamicConfig {
            degree: 2,
            num_seeds: 8,
            seed: 7,
            ..DynamicConfig::default()
        };
        let result =
            run_verification(src1, src2, &Options::default(), Some(&cfg)).unwrap();
        let text = render(&result.smt);
        // The exit predicate is defined, not declared, and its body relates
        // the observed results.
        assert!(text.contains("(define-fun INV_MAIN_EXIT "));
        assert!(!text.contains("(declare-fun INV_MAIN_EXIT"));
        let exit_def = result
            .smt
            .iter()
            .find_map(|e| match e {
                SmtExp::FunDef { name, body, .. } if name == "INV_MAIN_EXIT" => {
                    Some(body.to_sexpr())
                }
                _ => None,
            })
            .expect("an exit invariant definition");
        assert_ne!(exit_def, "false");
        assert!(exit_def.contains("result$1"));
        let traces = result.traces.expect("collected traces");
        assert_eq!(traces.len(), 8);
        for pair in &traces {
            assert_eq!(pair.first.result, pair.second.result);
        }
    }

    /* -------------------------------------------------------------- */
    /* S6: heap store round-trip                                       */

    #[test]
    fn heap_accesses_thread_the_heap_arrays() {
        let src = "
define @f(%x: i32) -> i32 {
entry:
  %a = alloca 4
  %p = gep %a, 1 x 0
  store 5, %p
  %v = load %p
  ret %v
}";
        let opts = Options {
            memory: MemoryModel {
                heap: true,
                stack: false,
            },
            ..Options::default()
        };
        let out = generate(src, src, &opts);
        let text = render(&out);
        assert!(text.contains("HEAP$1"));
        assert!(text.contains("HEAP$2"));
        assert!(text.contains("(store HEAP$1"));
        assert!(text.contains("(select HEAP$2"));
    }

    #[test]
    fn memory_access_enables_the_heap_without_a_flag() {
        let src = "
define @f(%p: ptr) -> i32 {
entry:
  %v = load %p
  ret %v
}";
        let out = generate(src, src, &Options::default());
        assert!(render(&out).contains("HEAP$1"));
    }

    /* -------------------------------------------------------------- */
    /* Determinism                                                     */

    #[test]
    fn generation_is_deterministic() {
        let opts = Options {
            off_by_n: true,
            ..Options::default()
        };
        let a = render(&generate(SUM_LOOP, SUM_DOWN, &opts));
        let b = render(&generate(SUM_LOOP, SUM_DOWN, &opts));
        assert_eq!(a, b);
    }

    #[test]
    fn dynamic_generation_is_deterministic() {
        let cfg = DynamicConfig {
            degree: 1,
            num_seeds: 6,
            seed: 3,
            ..DynamicConfig::default()
        };
        let a = run_verification(SUM_LOOP, SUM_DOWN, &Options::default(), Some(&cfg)).unwrap();
        let b = run_verification(SUM_LOOP, SUM_DOWN, &Options::default(), Some(&cfg)).unwrap();
        assert_eq!(render(&a.smt), render(&b.smt));
    }

    /* -------------------------------------------------------------- */
    /* Output round-trip                                               */

    #[test]
    fn artifact_lines_roundtrip_through_the_reader() {
        let opts = Options {
            off_by_n: true,
            ..Options::default()
        };
        let out = generate(SUM_LOOP, SUM_DOWN, &opts);
        for exp in &out {
            let printed = exp.to_sexpr();
            let reparsed = smt::parse_exp(&printed)
                .unwrap_or_else(|e| panic!("parse failed on {}: {}", printed, e));
            assert_eq!(&reparsed, exp);
        }
    }

    /* -------------------------------------------------------------- */
    /* Calls and summaries                                             */

    #[test]
    fn defined_calls_use_relational_summaries() {
        let src = "
define @g(%a: i32) -> i32 {
entry:
  %r = add %a, 1
  ret %r
}
define @f(%x: i32) -> i32 {
entry:
  %r = call i32 @g(%x)
  ret %r
}";
        let opts = Options {
            fun: Some("f".to_string()),
            ..Options::default()
        };
        let out = generate(src, src, &opts);
        let text = render(&out);
        assert!(text.contains("(declare-fun INV_REC_g "));
        assert!(text.contains("(declare-fun INV_REC_g_PRE "));
        // The call site asserts the precondition and applies the summary.
        assert!(implications_to(&out, "INV_REC_g_PRE") >= 1);
        assert!(text.contains("(INV_REC_g "));
        // The summary is defined by clauses concluding it.
        assert!(implications_to(&out, "INV_REC_g") >= 1);
    }

    #[test]
    fn extern_calls_get_an_equivalence_axiom() {
        let src = "
declare @ext(1)
define @f(%x: i32) -> i32 {
entry:
  %r = call i32 @ext(%x)
  ret %r
}";
        let out = generate(src, src, &Options::default());
        let text = render(&out);
        assert!(text.contains("(define-fun INV_REC_ext "));
        assert!(text.contains("(= res1 res2)"));
        assert!(text.contains("(INV_REC_ext "));
    }

    #[test]
    fn recursive_function_gets_a_summary_encoding() {
        let src = "
define @f(%n: i32) -> i32 {
entry:
  %c = icmp sle %n, 0
  br %c, base, rec
base:
  ret 0
rec:
  %n1 = sub %n, 1
  %r = call i32 @f(%n1)
  %s = add %r, %n
  ret %s
}";
        let out = generate(src, src, &Options::default());
        let text = render(&out);
        assert!(text.contains("(declare-fun INV_REC_f "));
        assert!(implications_to(&out, "INV_REC_f") >= 1);
    }

    #[test]
    fn only_rec_replaces_iterative_coupling() {
        let opts = Options {
            only_rec: true,
            ..Options::default()
        };
        let out = generate(SUM_LOOP, SUM_DOWN, &opts);
        let text = render(&out);
        assert!(implications_to(&out, "INV_REC_f_PRE") == 1);
        assert!(text.contains("(INV_REC_f "));
        // No iterative mark clauses for the selected pair.
        assert_eq!(implications_to(&out, "INV_MAIN_1"), 0);
    }

    /* -------------------------------------------------------------- */
    /* Annotations end to end                                          */

    #[test]
    fn user_preconditions_replace_argument_equality() {
        let src1 = format!("/*@ rel_in pre (= x$1 (+ x$2 1)) @*/\n{}", IDENTITY);
        let out = generate(&src1, IDENTITY, &Options::default());
        let text = render(&out);
        assert!(text.contains("(= x$1 (+ x$2 1))"));
        assert!(!text.contains("(=> (= x$1 x$2)"));
    }

    /* -------------------------------------------------------------- */
    /* String constants                                                */

    #[test]
    fn string_constants_collide_by_content() {
        let src1 = "global @msg 6 = \"hello\"\ndefine @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}";
        let src2 =
            "global @greet 6 = \"hello\"\ndefine @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}";
        let opts = Options {
            strings: true,
            ..Options::default()
        };
        let out = generate(src1, src2, &opts);
        let defs: Vec<String> = out
            .iter()
            .filter_map(|e| match e {
                SmtExp::FunDef { name, body, .. }
                    if name == "msg$1" || name == "greet$2" =>
                {
                    Some(body.to_sexpr())
                }
                _ => None,
            })
            .collect();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0], defs[1]);
    }

    /* -------------------------------------------------------------- */
    /* Search scan, with and without table preparation                 */

    fn scan_source(with_prep: bool) -> String {
        let prep = "
define @prep(%m: i32) -> i32 {
entry:
  br fill
fill:
  %j = phi [entry: 0], [fillbody: %j1]
  %fm = call @__mark(1)
  %fc = icmp slt %j, 256
  %fg = and %fm, %fc
  br %fg, fillbody, filled
fillbody:
  %p = gep @delta, 1 x %j
  store %m, %p
  %j1 = add %j, 1
  br fill
filled:
  ret 0
}
";
        let call_prep = if with_prep {
            "  %ignored = call i32 @prep(%m0)\n"
        } else {
            ""
        };
        format!(
            "global @delta 256
{}
define @scan(%n: i32, %m0: i32) -> i32 {{
entry:
{}  br loop
loop:
  %i = phi [entry: 0], [body: %i1]
  %k = phi [entry: 0], [body: %k1]
  %sm = call @__mark(2)
  %sc = icmp slt %i, %n
  %sg = and %sm, %sc
  br %sg, body, done
body:
  %p = gep @delta, 1 x %i
  %d = load %p
  %k1 = add %k, %d
  %i1 = add %i, 1
  br loop
done:
  ret %k
}}",
            if with_prep { prep } else { "" },
            call_prep
        )
    }

    #[test]
    fn scan_without_preparation_generates() {
        let src = scan_source(false);
        let opts = Options {
            memory: MemoryModel {
                heap: true,
                stack: false,
            },
            ..Options::default()
        };
        let out = generate(&src, &src, &opts);
        assert!(implications_to(&out, "INV_MAIN_2") >= 1);
    }

    #[test]
    fn scan_with_preparation_generates() {
        let src = scan_source(true);
        let opts = Options {
            fun: Some("scan".to_string()),
            memory: MemoryModel {
                heap: true,
                stack: false,
            },
            ..Options::default()
        };
        let out = generate(&src, &src, &opts);
        let text = render(&out);
        assert!(text.contains("INV_REC_prep"));
        assert!(implications_to(&out, "INV_MAIN_2") >= 1);
    }
}

#[cfg(test)]
mod properties {
    use crate::integer::Integer;
    use crate::interp::{self, Heap, InterpCtx};
    use crate::linear;
    use crate::opts::Options;
    use crate::smt::{self, SmtExp, SmtType, SortedVar};
    use num_bigint::BigInt;
    use num_rational::BigRational;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn name_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,5}".prop_filter("not a literal keyword", |s| {
            s != "true" && s != "false"
        })
    }

    fn exp_strategy() -> impl Strategy<Value = SmtExp> {
        let leaf = prop_oneof![
            name_strategy().prop_map(|n| smt::var(n)),
            any::<i64>().prop_map(|v| smt::int(v)),
            any::<bool>().prop_map(SmtExp::BoolLit),
        ];
        leaf.prop_recursive(3, 24, 3, |inner| {
            prop_oneof![
                (
                    prop_oneof![Just("+"), Just("and"), Just("=>"), Just("=")],
                    prop::collection::vec(inner.clone(), 1..3)
                )
                    .prop_map(|(n, args)| smt::op(n, args)),
                (name_strategy(), inner.clone(), inner.clone()).prop_map(|(n, v, b)| {
                    SmtExp::Let {
                        defs: vec![(n, v)],
                        body: Box::new(b),
                    }
                }),
                (name_strategy(), inner).prop_map(|(n, b)| {
                    smt::forall(vec![SortedVar::new(n, SmtType::Int)], b)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn printing_roundtrips(e in exp_strategy()) {
            let printed = e.to_sexpr();
            let parsed = smt::parse_exp(&printed)
                .unwrap_or_else(|err| panic!("parse failed on {}: {}", printed, err));
            prop_assert_eq!(parsed, e);
        }

        #[test]
        fn null_space_vectors_are_exact(
            rows in prop::collection::vec(
                prop::collection::vec(-6i8..6, 4),
                1..4,
            ),
        ) {
            let matrix: linear::Matrix<BigRational> = rows
                .iter()
                .map(|r| {
                    r.iter()
                        .map(|v| BigRational::from(BigInt::from(*v)))
                        .collect()
                })
                .collect();
            for vec in linear::null_space(&matrix) {
                let product = linear::matrix_times_vector(&matrix, &vec);
                let all_zero = {
                    use num_traits::Zero;
                    product.iter().all(|x| x.is_zero())
                };
                prop_assert!(all_zero);
            }
        }

        #[test]
        fn interpreter_runs_are_identical(n in -20i64..40) {
            let src = "
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
            let mut module = crate::parser::parse_module(src).unwrap();
            crate::preprocess::preprocess(&mut module, 1);
            for p in &mut module.procedures {
                crate::preprocess::finalize(p);
            }
            let opts = Options::default();
            let globals = BTreeMap::new();
            let ctx = InterpCtx {
                module: &module,
                opts: &opts,
                globals: &globals,
            };
            let run = || {
                interp::interpret(
                    &ctx,
                    &ctx.module.procedures[0],
                    &[Integer::unbounded(n)],
                    Heap::new(Integer::unbounded(0)),
                    10_000,
                )
                .unwrap()
            };
            let a = run();
            let b = run();
            prop_assert_eq!(a.result, b.result);
            prop_assert_eq!(a.blocks_visited, b.blocks_visited);
        }
    }
}
