//! Candidate invariant synthesis from observed states.
//!
//! For each mark the observed variable tuples are split into three classes:
//! only the first program still looping, only the second, or both advancing
//! together. Per class, every monomial over the mark's free variables up to
//! the requested degree is sampled on each observation; the null space of
//! the sampled matrix (over exact rationals) gives the coefficient vectors
//! of equations that hold on every observation. The predicate body is the
//! disjunction over the three classes of the conjunction of their
//! equations, optionally strengthened by externally discovered heap-shape
//! patterns.

use crate::linear::{self, Matrix};
use crate::mark::Mark;
use crate::opts::{IntSemantics, Options};
use crate::smt::{self, binop, op, var, SmtExp};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};
use std::collections::BTreeMap;

/// One observed state: the values of the free variables at a mark.
pub type Observation = BTreeMap<String, BigInt>;

/// Data split by which program was still advancing.
#[derive(Debug, Clone, Default)]
pub struct LoopClasses<T> {
    pub left: T,
    pub right: T,
    pub none: T,
}

/// Monomials over `vars` of total degree 1..=`degree`, as sorted variable
/// multisets, in degree-then-lexicographic order.
pub fn monomials(vars: &[String], degree: usize) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    for d in 1..=degree {
        let mut current = Vec::new();
        combinations(vars, d, 0, &mut current, &mut out);
    }
    out
}

fn combinations(
    vars: &[String],
    remaining: usize,
    start: usize,
    current: &mut Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    if remaining == 0 {
        out.push(current.clone());
        return;
    }
    for i in start..vars.len() {
        current.push(vars[i].clone());
        combinations(vars, remaining - 1, i, current, out);
        current.pop();
    }
}

fn eval_monomial(monomial: &[String], observation: &Observation) -> BigRational {
    let mut product = BigRational::one();
    for v in monomial {
        let value = observation.get(v).cloned().unwrap_or_default();
        product *= BigRational::from(value);
    }
    product
}

/// Fit integer equations `Σ cᵢ·mᵢ + c = 0` holding on every observation.
pub fn fit_equations(
    observations: &[Observation],
    vars: &[String],
    degree: usize,
) -> Vec<Vec<BigInt>> {
    if observations.is_empty() {
        return Vec::new();
    }
    let basis = monomials(vars, degree);
    let mut matrix: Matrix<BigRational> = Vec::new();
    for observation in observations {
        let mut row: Vec<BigRational> = basis
            .iter()
            .map(|m| eval_monomial(m, observation))
            .collect();
        row.push(BigRational::one());
        matrix.push(row);
    }
    linear::null_space(&matrix)
        .iter()
        .map(|v| linear::rat_to_int(v))
        .collect()
}

fn coefficient(value: &BigInt, width: u32, opts: &Options) -> SmtExp {
    match opts.int_semantics {
        IntSemantics::Unbounded => SmtExp::IntLit(value.clone()),
        IntSemantics::Bounded => SmtExp::BvLit {
            value: value.clone(),
            width,
        },
    }
}

/// Render one fitted coefficient vector as an equation, positive terms on
/// the left, negated negative terms on the right, the constant last.
pub fn equation_exp(coeffs: &[BigInt], vars: &[String], degree: usize, opts: &Options) -> SmtExp {
    let (add, mul) = match opts.int_semantics {
        IntSemantics::Unbounded => ("+", "*"),
        IntSemantics::Bounded => ("bvadd", "bvmul"),
    };
    let basis = monomials(vars, degree);
    assert_eq!(basis.len() + 1, coeffs.len());

    let term = |monomial: &[String]| -> SmtExp {
        if monomial.len() == 1 {
            var(monomial[0].clone())
        } else {
            op(mul, monomial.iter().map(|v| var(v.clone())).collect())
        }
    };

    let mut left = Vec::new();
    let mut right = Vec::new();
    for (coeff, monomial) in coeffs.iter().zip(basis.iter()) {
        if coeff.is_zero() {
            continue;
        }
        let magnitude = coeff.abs();
        let rendered = if magnitude.is_one() {
            term(monomial)
        } else {
            binop(mul, coefficient(&magnitude, 32, opts), term(monomial))
        };
        if coeff.is_positive() {
            left.push(rendered);
        } else {
            right.push(rendered);
        }
    }
    let constant = &coeffs[coeffs.len() - 1];
    if constant.is_positive() {
        left.push(coefficient(constant, 64, opts));
    } else if constant.is_negative() {
        right.push(coefficient(&-constant, 64, opts));
    }

    let side = |mut terms: Vec<SmtExp>| -> SmtExp {
        match terms.len() {
            0 => coefficient(&BigInt::zero(), 32, opts),
            1 => terms.pop().unwrap(),
            _ => op(add, terms),
        }
    };
    smt::eq(side(left), side(right))
}

fn class_body(
    observations: &[Observation],
    patterns: &[SmtExp],
    vars: &[String],
    degree: usize,
    opts: &Options,
) -> SmtExp {
    let mut conjuncts: Vec<SmtExp> = fit_equations(observations, vars, degree)
        .iter()
        .map(|eq| equation_exp(eq, vars, degree, opts))
        .collect();
    conjuncts.extend(patterns.iter().cloned());
    if conjuncts.is_empty() {
        SmtExp::BoolLit(false)
    } else {
        smt::and_all(conjuncts)
    }
}

/// Fitted bodies for each mark predicate: the disjunction over the three
/// exit classes. `free_vars` lists the non-memory variable names of each
/// mark; `patterns` carries externally discovered heap-shape candidates.
pub fn invariant_definitions(
    observations: &BTreeMap<Mark, LoopClasses<Vec<Observation>>>,
    patterns: &BTreeMap<Mark, LoopClasses<Vec<SmtExp>>>,
    free_vars: &BTreeMap<Mark, Vec<String>>,
    degree: usize,
    opts: &Options,
) -> BTreeMap<Mark, SmtExp> {
    let empty_patterns = LoopClasses::<Vec<SmtExp>>::default();
    let mut definitions = BTreeMap::new();
    for (mark, vars) in free_vars {
        let body = match observations.get(mark) {
            None => SmtExp::BoolLit(false),
            Some(classes) => {
                let marks_patterns = patterns.get(mark).unwrap_or(&empty_patterns);
                smt::or_all(vec![
                    class_body(&classes.left, &marks_patterns.left, vars, degree, opts),
                    class_body(&classes.right, &marks_patterns.right, vars, degree, opts),
                    class_body(&classes.none, &marks_patterns.none, vars, degree, opts),
                ])
            }
        };
        definitions.insert(*mark, body);
    }
    definitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(pairs: &[(&str, i64)]) -> Observation {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), BigInt::from(*v)))
            .collect()
    }

    #[test]
    fn monomials_are_lexicographic() {
        let vars = vec!["x".to_string(), "y".to_string()];
        let ms = monomials(&vars, 2);
        let rendered: Vec<String> = ms.iter().map(|m| m.join("*")).collect();
        assert_eq!(rendered, vec!["x", "y", "x*x", "x*y", "y*y"]);
    }

    #[test]
    fn fits_a_linear_relation() {
        // s = 2i on every observation.
        let observations = vec![
            obs(&[("i", 0), ("s", 0)]),
            obs(&[("i", 1), ("s", 2)]),
            obs(&[("i", 3), ("s", 6)]),
        ];
        let vars = vec!["i".to_string(), "s".to_string()];
        let equations = fit_equations(&observations, &vars, 1);
        assert!(!equations.is_empty());
        // Every fitted equation is exact on every observation.
        for eq in &equations {
            for o in &observations {
                let value = BigInt::from(2) * 0
                    + &eq[0] * o.get("i").unwrap()
                    + &eq[1] * o.get("s").unwrap()
                    + &eq[2];
                assert_eq!(value, BigInt::from(0));
            }
        }
    }

    #[test]
    fn fits_a_product_relation() {
        // x1*y1 = x2*y2 needs degree 2.
        let observations = vec![
            obs(&[("x1", 2), ("y1", 3), ("x2", 3), ("y2", 2)]),
            obs(&[("x1", 1), ("y1", 5), ("x2", 5), ("y2", 1)]),
            obs(&[("x1", 4), ("y1", 7), ("x2", 7), ("y2", 4)]),
            obs(&[("x1", -2), ("y1", 3), ("x2", 3), ("y2", -2)]),
            obs(&[("x1", 6), ("y1", -1), ("x2", -1), ("y2", 6)]),
            obs(&[("x1", 0), ("y1", 9), ("x2", 9), ("y2", 0)]),
            obs(&[("x1", 8), ("y1", 2), ("x2", 2), ("y2", 8)]),
            obs(&[("x1", 3), ("y1", 3), ("x2", 3), ("y2", 3)]),
            obs(&[("x1", 5), ("y1", -4), ("x2", -4), ("y2", 5)]),
            obs(&[("x1", -7), ("y1", 2), ("x2", 2), ("y2", -7)]),
            obs(&[("x1", 9), ("y1", 5), ("x2", 5), ("y2", 9)]),
            obs(&[("x1", 11), ("y1", -3), ("x2", -3), ("y2", 11)]),
            obs(&[("x1", -5), ("y1", -6), ("x2", -6), ("y2", -5)]),
            obs(&[("x1", 13), ("y1", 4), ("x2", 4), ("y2", 13)]),
            obs(&[("x1", 10), ("y1", 7), ("x2", 7), ("y2", 10)]),
        ];
        let vars: Vec<String> = ["x1", "y1", "x2", "y2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let equations = fit_equations(&observations, &vars, 2);
        // Every equation must vanish on all observations; at least one must
        // involve the cross products.
        assert!(!equations.is_empty());
        let basis = monomials(&vars, 2);
        for eq in &equations {
            for o in &observations {
                let mut total = eq[eq.len() - 1].clone();
                for (c, m) in eq.iter().zip(basis.iter()) {
                    let mut term = c.clone();
                    for v in m {
                        term *= o.get(v).unwrap();
                    }
                    total += term;
                }
                assert_eq!(total, BigInt::from(0));
            }
        }
    }

    #[test]
    fn renders_equation_sides() {
        let vars = vec!["i".to_string(), "s".to_string()];
        // 2i - s + 0 = 0 renders as (= (* 2 i) s).
        let exp = equation_exp(
            &[BigInt::from(2), BigInt::from(-1), BigInt::from(0)],
            &vars,
            1,
            &Options::default(),
        );
        assert_eq!(exp.to_sexpr(), "(= (* 2 i) s)");
    }

    #[test]
    fn empty_class_is_false() {
        let mut free_vars = BTreeMap::new();
        free_vars.insert(Mark::EXIT, vec!["x".to_string()]);
        let defs = invariant_definitions(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &free_vars,
            1,
            &Options::default(),
        );
        assert_eq!(defs[&Mark::EXIT].to_sexpr(), "false");
    }
}
