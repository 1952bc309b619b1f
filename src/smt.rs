//! The SMT term algebra.
//!
//! One owned sum type covers every form the generator emits. Terms are
//! value types; sharing is structural, equality derives from shape. The
//! operations mirror the transformations the back-ends need: let
//! compression for readable output, assignment renaming for SSA-freshening,
//! array instantiation and forall removal for solver front-ends that reject
//! quantified arrays, and define-fun suffixing for combined artifacts.

use num_bigint::BigInt;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// SMT sorts used by the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtType {
    Int,
    Bool,
    BitVec(u32),
    Array(Box<SmtType>, Box<SmtType>),
}

impl fmt::Display for SmtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtType::Int => write!(f, "Int"),
            SmtType::Bool => write!(f, "Bool"),
            SmtType::BitVec(w) => write!(f, "(_ BitVec {})", w),
            SmtType::Array(i, e) => write!(f, "(Array {} {})", i, e),
        }
    }
}

/// A typed bound variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedVar {
    pub name: String,
    pub ty: SmtType,
}

impl SortedVar {
    pub fn new(name: impl Into<String>, ty: SmtType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl fmt::Display for SortedVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {})", self.name, self.ty)
    }
}

/// Every expression and top-level form the generator can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtExp {
    SetLogic(String),
    VarDecl(SortedVar),
    FunDecl {
        name: String,
        arg_types: Vec<SmtType>,
        ret: SmtType,
    },
    FunDef {
        name: String,
        args: Vec<SortedVar>,
        ret: SmtType,
        body: Box<SmtExp>,
    },
    Assert(Box<SmtExp>),
    CheckSat,
    GetModel,
    Forall {
        vars: Vec<SortedVar>,
        body: Box<SmtExp>,
    },
    Let {
        defs: Vec<(String, SmtExp)>,
        body: Box<SmtExp>,
    },
    Op {
        name: String,
        args: Vec<SmtExp>,
    },
    Var(String),
    IntLit(BigInt),
    BvLit {
        value: BigInt,
        width: u32,
    },
    BoolLit(bool),
    FloatLit(String),
    Comment(String),
}

/* ------------------------------------------------------------------ */
/* Constructors                                                        */

pub fn var(name: impl Into<String>) -> SmtExp {
    SmtExp::Var(name.into())
}

pub fn int(value: impl Into<BigInt>) -> SmtExp {
    SmtExp::IntLit(value.into())
}

pub fn op(name: impl Into<String>, args: Vec<SmtExp>) -> SmtExp {
    SmtExp::Op {
        name: name.into(),
        args,
    }
}

pub fn binop(name: impl Into<String>, lhs: SmtExp, rhs: SmtExp) -> SmtExp {
    op(name, vec![lhs, rhs])
}

pub fn eq(lhs: SmtExp, rhs: SmtExp) -> SmtExp {
    binop("=", lhs, rhs)
}

pub fn not(e: SmtExp) -> SmtExp {
    op("not", vec![e])
}

pub fn implies(antecedent: SmtExp, consequent: SmtExp) -> SmtExp {
    binop("=>", antecedent, consequent)
}

/// Conjunction that collapses the trivial cases.
pub fn and_all(mut conjuncts: Vec<SmtExp>) -> SmtExp {
    match conjuncts.len() {
        0 => SmtExp::BoolLit(true),
        1 => conjuncts.pop().unwrap(),
        _ => op("and", conjuncts),
    }
}

/// Disjunction that collapses the trivial cases.
pub fn or_all(mut disjuncts: Vec<SmtExp>) -> SmtExp {
    match disjuncts.len() {
        0 => SmtExp::BoolLit(false),
        1 => disjuncts.pop().unwrap(),
        _ => op("or", disjuncts),
    }
}

pub fn forall(vars: Vec<SortedVar>, body: SmtExp) -> SmtExp {
    if vars.is_empty() {
        body
    } else {
        SmtExp::Forall {
            vars,
            body: Box::new(body),
        }
    }
}

/// Wrap `body` in one single-binding let per definition, innermost last.
/// Rebinding the same name shadows, which is how heap updates thread.
pub fn nest_lets(defs: Vec<(String, SmtExp)>, body: SmtExp) -> SmtExp {
    let mut exp = body;
    for (name, value) in defs.into_iter().rev() {
        exp = SmtExp::Let {
            defs: vec![(name, value)],
            body: Box::new(exp),
        };
    }
    exp
}

/// Memory arrays are recognised by name throughout the pipeline.
pub fn is_array_name(name: &str) -> bool {
    name.starts_with("HEAP") || name.starts_with("STACK")
}

/* ------------------------------------------------------------------ */
/* Printing                                                            */

impl fmt::Display for SmtExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtExp::SetLogic(logic) => write!(f, "(set-logic {})", logic),
            SmtExp::VarDecl(v) => write!(f, "(declare-var {} {})", v.name, v.ty),
            SmtExp::FunDecl {
                name,
                arg_types,
                ret,
            } => {
                write!(f, "(declare-fun {} (", name)?;
                for (i, t) in arg_types.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ") {})", ret)
            }
            SmtExp::FunDef {
                name,
                args,
                ret,
                body,
            } => {
                write!(f, "(define-fun {} (", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ") {} {})", ret, body)
            }
            SmtExp::Assert(e) => write!(f, "(assert {})", e),
            SmtExp::CheckSat => write!(f, "(check-sat)"),
            SmtExp::GetModel => write!(f, "(get-model)"),
            SmtExp::Forall { vars, body } => {
                write!(f, "(forall (")?;
                for (i, v) in vars.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ") {})", body)
            }
            SmtExp::Let { defs, body } => {
                write!(f, "(let (")?;
                for (i, (name, value)) in defs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "({} {})", name, value)?;
                }
                write!(f, ") {})", body)
            }
            SmtExp::Op { name, args } => {
                write!(f, "({}", name)?;
                for a in args {
                    write!(f, " {}", a)?;
                }
                write!(f, ")")
            }
            SmtExp::Var(name) => write!(f, "{}", name),
            SmtExp::IntLit(v) => write!(f, "{}", v),
            SmtExp::BvLit { value, width } => {
                let modulus = BigInt::from(1u8) << *width;
                let mut unsigned = value % &modulus;
                if unsigned.sign() == num_bigint::Sign::Minus {
                    unsigned += &modulus;
                }
                write!(f, "(_ bv{} {})", unsigned, width)
            }
            SmtExp::BoolLit(b) => write!(f, "{}", b),
            SmtExp::FloatLit(s) => write!(f, "{}", s),
            SmtExp::Comment(text) => write!(f, "; {}", text),
        }
    }
}

impl SmtExp {
    /// Lossless textual form, one S-expression.
    pub fn to_sexpr(&self) -> String {
        self.to_string()
    }

    /* -------------------------------------------------------------- */
    /* Queries                                                         */

    /// All identifiers occurring as variables, bound or free.
    pub fn used_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut BTreeSet<String>) {
        match self {
            SmtExp::Var(name) => {
                names.insert(name.clone());
            }
            SmtExp::Assert(e) => e.collect_names(names),
            SmtExp::Forall { body, .. } => body.collect_names(names),
            SmtExp::Let { defs, body } => {
                for (_, v) in defs {
                    v.collect_names(names);
                }
                body.collect_names(names);
            }
            SmtExp::Op { args, .. } => {
                for a in args {
                    a.collect_names(names);
                }
            }
            SmtExp::FunDef { body, .. } => body.collect_names(names),
            _ => {}
        }
    }

    /// Occurrences of `name` as a variable.
    fn count_uses(&self, name: &str) -> usize {
        match self {
            SmtExp::Var(n) => usize::from(n == name),
            SmtExp::Assert(e) => e.count_uses(name),
            SmtExp::Forall { body, .. } => body.count_uses(name),
            SmtExp::Let { defs, body } => {
                defs.iter().map(|(_, v)| v.count_uses(name)).sum::<usize>()
                    + body.count_uses(name)
            }
            SmtExp::Op { args, .. } => args.iter().map(|a| a.count_uses(name)).sum(),
            SmtExp::FunDef { body, .. } => body.count_uses(name),
            _ => 0,
        }
    }

    fn is_primitive(&self) -> bool {
        matches!(
            self,
            SmtExp::Var(_) | SmtExp::IntLit(_) | SmtExp::BvLit { .. } | SmtExp::BoolLit(_)
        )
    }

    /* -------------------------------------------------------------- */
    /* Let compression                                                 */

    /// Inline every let binding whose value is a primitive or referenced at
    /// most once; keep the rest. The only transformation that changes node
    /// identity, applied at print time.
    pub fn compress_lets(&self) -> SmtExp {
        self.compress(&HashMap::new())
    }

    fn compress(&self, env: &HashMap<String, SmtExp>) -> SmtExp {
        match self {
            SmtExp::Var(name) => env.get(name).cloned().unwrap_or_else(|| self.clone()),
            SmtExp::Assert(e) => SmtExp::Assert(Box::new(e.compress(env))),
            SmtExp::Forall { vars, body } => SmtExp::Forall {
                vars: vars.clone(),
                body: Box::new(body.compress(env)),
            },
            SmtExp::FunDef {
                name,
                args,
                ret,
                body,
            } => SmtExp::FunDef {
                name: name.clone(),
                args: args.clone(),
                ret: ret.clone(),
                body: Box::new(body.compress(env)),
            },
            SmtExp::Op { name, args } => SmtExp::Op {
                name: name.clone(),
                args: args.iter().map(|a| a.compress(env)).collect(),
            },
            SmtExp::Let { defs, body } => {
                let mut env = env.clone();
                let mut kept: Vec<(String, SmtExp)> = Vec::new();
                for (i, (name, value)) in defs.iter().enumerate() {
                    let value = value.compress(&env);
                    let later_uses: usize = defs[i + 1..]
                        .iter()
                        .map(|(_, v)| v.count_uses(name))
                        .sum::<usize>()
                        + body.count_uses(name);
                    if value.is_primitive() || later_uses <= 1 {
                        env.insert(name.clone(), value);
                    } else {
                        env.remove(name);
                        kept.push((name.clone(), value));
                    }
                }
                let body = body.compress(&env);
                if kept.is_empty() {
                    body
                } else {
                    SmtExp::Let {
                        defs: kept,
                        body: Box::new(body),
                    }
                }
            }
            other => other.clone(),
        }
    }

    /* -------------------------------------------------------------- */
    /* Assignment renaming                                             */

    /// Give every let-bound name a fresh numbered version, so bindings can
    /// be moved across each other without capture.
    pub fn rename_assignments(&self) -> SmtExp {
        let mut counters = HashMap::new();
        self.rename(&HashMap::new(), &mut counters)
    }

    fn rename(
        &self,
        scope: &HashMap<String, String>,
        counters: &mut HashMap<String, usize>,
    ) -> SmtExp {
        match self {
            SmtExp::Var(name) => SmtExp::Var(scope.get(name).cloned().unwrap_or_else(|| name.clone())),
            SmtExp::Assert(e) => SmtExp::Assert(Box::new(e.rename(scope, counters))),
            SmtExp::Forall { vars, body } => SmtExp::Forall {
                vars: vars.clone(),
                body: Box::new(body.rename(scope, counters)),
            },
            SmtExp::Op { name, args } => SmtExp::Op {
                name: name.clone(),
                args: args.iter().map(|a| a.rename(scope, counters)).collect(),
            },
            SmtExp::FunDef {
                name,
                args,
                ret,
                body,
            } => SmtExp::FunDef {
                name: name.clone(),
                args: args.clone(),
                ret: ret.clone(),
                body: Box::new(body.rename(scope, counters)),
            },
            SmtExp::Let { defs, body } => {
                let mut scope = scope.clone();
                let mut new_defs = Vec::new();
                for (name, value) in defs {
                    let value = value.rename(&scope, counters);
                    let n = counters.entry(name.clone()).or_insert(0);
                    *n += 1;
                    let fresh = format!("{}_{}", name, n);
                    scope.insert(name.clone(), fresh.clone());
                    new_defs.push((fresh, value));
                }
                SmtExp::Let {
                    defs: new_defs,
                    body: Box::new(body.rename(&scope, counters)),
                }
            }
            other => other.clone(),
        }
    }

    /* -------------------------------------------------------------- */
    /* Array instantiation                                             */

    /// Replace equalities between whole memory arrays by universally
    /// quantified index-wise equality.
    pub fn instantiate_arrays(&self) -> SmtExp {
        match self {
            SmtExp::Op { name, args } if name == "=" && args.len() == 2 => {
                let arrays = args.iter().all(
                    |a| matches!(a, SmtExp::Var(n) if is_array_name(n)),
                );
                if arrays {
                    let index = var("i");
                    return forall(
                        vec![SortedVar::new("i", SmtType::Int)],
                        eq(
                            binop("select", args[0].clone(), index.clone()),
                            binop("select", args[1].clone(), index),
                        ),
                    );
                }
                SmtExp::Op {
                    name: name.clone(),
                    args: args.iter().map(|a| a.instantiate_arrays()).collect(),
                }
            }
            SmtExp::Assert(e) => SmtExp::Assert(Box::new(e.instantiate_arrays())),
            SmtExp::Forall { vars, body } => SmtExp::Forall {
                vars: vars.clone(),
                body: Box::new(body.instantiate_arrays()),
            },
            SmtExp::Let { defs, body } => SmtExp::Let {
                defs: defs
                    .iter()
                    .map(|(n, v)| (n.clone(), v.instantiate_arrays()))
                    .collect(),
                body: Box::new(body.instantiate_arrays()),
            },
            SmtExp::Op { name, args } => SmtExp::Op {
                name: name.clone(),
                args: args.iter().map(|a| a.instantiate_arrays()).collect(),
            },
            SmtExp::FunDef {
                name,
                args,
                ret,
                body,
            } => SmtExp::FunDef {
                name: name.clone(),
                args: args.clone(),
                ret: ret.clone(),
                body: Box::new(body.instantiate_arrays()),
            },
            other => other.clone(),
        }
    }

    /* -------------------------------------------------------------- */
    /* Forall removal                                                  */

    /// Hoist universally bound variables into `introduced`; needed for
    /// solver front-ends that want free variables declared globally.
    pub fn remove_foralls(&self, introduced: &mut Vec<SortedVar>) -> SmtExp {
        match self {
            SmtExp::Forall { vars, body } => {
                for v in vars {
                    if !introduced.contains(v) {
                        introduced.push(v.clone());
                    }
                }
                body.remove_foralls(introduced)
            }
            SmtExp::Assert(e) => SmtExp::Assert(Box::new(e.remove_foralls(introduced))),
            SmtExp::Let { defs, body } => SmtExp::Let {
                defs: defs
                    .iter()
                    .map(|(n, v)| (n.clone(), v.remove_foralls(introduced)))
                    .collect(),
                body: Box::new(body.remove_foralls(introduced)),
            },
            SmtExp::Op { name, args } => SmtExp::Op {
                name: name.clone(),
                args: args.iter().map(|a| a.remove_foralls(introduced)).collect(),
            },
            other => other.clone(),
        }
    }
}

/// Rewrite a whole artifact for front-ends that reject quantifiers: every
/// universally bound variable becomes a global `declare-var`, inserted
/// before the first assertion.
pub fn remove_foralls_program(exprs: &[SmtExp]) -> Vec<SmtExp> {
    let mut introduced = Vec::new();
    let stripped: Vec<SmtExp> = exprs
        .iter()
        .map(|e| e.remove_foralls(&mut introduced))
        .collect();
    let first_assert = stripped
        .iter()
        .position(|e| matches!(e, SmtExp::Assert(_)))
        .unwrap_or(stripped.len());
    let mut out = stripped[..first_assert].to_vec();
    out.extend(introduced.into_iter().map(SmtExp::VarDecl));
    out.extend(stripped[first_assert..].iter().cloned());
    out
}

/// Suffix every function symbol defined in `exprs` (and each of its
/// occurrences) with `suffix`.
pub fn rename_define_funs(exprs: &[SmtExp], suffix: &str) -> Vec<SmtExp> {
    let mut defined = BTreeSet::new();
    for e in exprs {
        match e {
            SmtExp::FunDef { name, .. } | SmtExp::FunDecl { name, .. } => {
                defined.insert(name.clone());
            }
            _ => {}
        }
    }
    exprs
        .iter()
        .map(|e| rename_symbols(e, &defined, suffix))
        .collect()
}

fn rename_symbols(exp: &SmtExp, defined: &BTreeSet<String>, suffix: &str) -> SmtExp {
    let rename = |name: &String| {
        if defined.contains(name) {
            format!("{}{}", name, suffix)
        } else {
            name.clone()
        }
    };
    match exp {
        SmtExp::FunDecl {
            name,
            arg_types,
            ret,
        } => SmtExp::FunDecl {
            name: rename(name),
            arg_types: arg_types.clone(),
            ret: ret.clone(),
        },
        SmtExp::FunDef {
            name,
            args,
            ret,
            body,
        } => SmtExp::FunDef {
            name: rename(name),
            args: args.clone(),
            ret: ret.clone(),
            body: Box::new(rename_symbols(body, defined, suffix)),
        },
        SmtExp::Assert(e) => SmtExp::Assert(Box::new(rename_symbols(e, defined, suffix))),
        SmtExp::Forall { vars, body } => SmtExp::Forall {
            vars: vars.clone(),
            body: Box::new(rename_symbols(body, defined, suffix)),
        },
        SmtExp::Let { defs, body } => SmtExp::Let {
            defs: defs
                .iter()
                .map(|(n, v)| (n.clone(), rename_symbols(v, defined, suffix)))
                .collect(),
            body: Box::new(rename_symbols(body, defined, suffix)),
        },
        SmtExp::Op { name, args } => SmtExp::Op {
            name: rename(name),
            args: args
                .iter()
                .map(|a| rename_symbols(a, defined, suffix))
                .collect(),
        },
        SmtExp::Var(name) => SmtExp::Var(rename(name)),
        other => other.clone(),
    }
}

/* ------------------------------------------------------------------ */
/* Parsing                                                             */

#[derive(Debug, Clone)]
enum STree {
    Atom(String),
    List(Vec<STree>),
}

impl STree {
    fn print(&self) -> String {
        match self {
            STree::Atom(a) => a.clone(),
            STree::List(items) => {
                let inner: Vec<String> = items.iter().map(|i| i.print()).collect();
                format!("({})", inner.join(" "))
            }
        }
    }
}

fn lex_sexpr(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            c if c.is_whitespace() => i += 1,
            ';' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' | ')' => {
                tokens.push(chars[i].to_string());
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && chars[i] != '('
                    && chars[i] != ')'
                {
                    i += 1;
                }
                tokens.push(chars[start..i].iter().collect());
            }
        }
    }
    Ok(tokens)
}

fn parse_trees(tokens: &[String], pos: &mut usize) -> Result<STree, String> {
    if *pos >= tokens.len() {
        return Err("unexpected end of input".to_string());
    }
    let tok = &tokens[*pos];
    *pos += 1;
    if tok == "(" {
        let mut items = Vec::new();
        while *pos < tokens.len() && tokens[*pos] != ")" {
            items.push(parse_trees(tokens, pos)?);
        }
        if *pos >= tokens.len() {
            return Err("missing closing parenthesis".to_string());
        }
        *pos += 1;
        Ok(STree::List(items))
    } else if tok == ")" {
        Err("unexpected ')'".to_string())
    } else {
        Ok(STree::Atom(tok.clone()))
    }
}

fn parse_sort(tree: &STree) -> Result<SmtType, String> {
    match tree {
        STree::Atom(a) if a == "Int" => Ok(SmtType::Int),
        STree::Atom(a) if a == "Bool" => Ok(SmtType::Bool),
        STree::List(items) => match items.as_slice() {
            [STree::Atom(u), STree::Atom(bv), STree::Atom(w)] if u == "_" && bv == "BitVec" => {
                Ok(SmtType::BitVec(
                    w.parse().map_err(|_| "bad bit-vector width")?,
                ))
            }
            [STree::Atom(arr), index, element] if arr == "Array" => Ok(SmtType::Array(
                Box::new(parse_sort(index)?),
                Box::new(parse_sort(element)?),
            )),
            _ => Err(format!("unknown sort {}", tree.print())),
        },
        STree::Atom(a) => Err(format!("unknown sort {}", a)),
    }
}

fn parse_sorted_var(tree: &STree) -> Result<SortedVar, String> {
    match tree {
        STree::List(items) if items.len() == 2 => {
            let name = match &items[0] {
                STree::Atom(a) => a.clone(),
                t => return Err(format!("bad variable name {}", t.print())),
            };
            Ok(SortedVar::new(name, parse_sort(&items[1])?))
        }
        t => Err(format!("bad sorted variable {}", t.print())),
    }
}

fn interp(tree: &STree) -> Result<SmtExp, String> {
    match tree {
        STree::Atom(a) => {
            if a == "true" {
                Ok(SmtExp::BoolLit(true))
            } else if a == "false" {
                Ok(SmtExp::BoolLit(false))
            } else if let Some(v) = BigInt::parse_bytes(a.as_bytes(), 10) {
                Ok(SmtExp::IntLit(v))
            } else {
                Ok(SmtExp::Var(a.clone()))
            }
        }
        STree::List(items) => {
            let head = match items.first() {
                Some(h) => h,
                None => return Err("empty expression".to_string()),
            };
            if let STree::Atom(h) = head {
                match h.as_str() {
                    "set-logic" => {
                        if let Some(STree::Atom(logic)) = items.get(1) {
                            return Ok(SmtExp::SetLogic(logic.clone()));
                        }
                        return Err("bad set-logic".to_string());
                    }
                    "check-sat" => return Ok(SmtExp::CheckSat),
                    "get-model" => return Ok(SmtExp::GetModel),
                    "assert" => {
                        return Ok(SmtExp::Assert(Box::new(interp(
                            items.get(1).ok_or("bad assert")?,
                        )?)))
                    }
                    "declare-var" => {
                        let name = match items.get(1) {
                            Some(STree::Atom(a)) => a.clone(),
                            _ => return Err("bad declare-var".to_string()),
                        };
                        let ty = parse_sort(items.get(2).ok_or("bad declare-var")?)?;
                        return Ok(SmtExp::VarDecl(SortedVar::new(name, ty)));
                    }
                    "declare-fun" => {
                        let name = match items.get(1) {
                            Some(STree::Atom(a)) => a.clone(),
                            _ => return Err("bad declare-fun".to_string()),
                        };
                        let arg_types = match items.get(2) {
                            Some(STree::List(ts)) => {
                                ts.iter().map(parse_sort).collect::<Result<Vec<_>, _>>()?
                            }
                            _ => return Err("bad declare-fun".to_string()),
                        };
                        let ret = parse_sort(items.get(3).ok_or("bad declare-fun")?)?;
                        return Ok(SmtExp::FunDecl {
                            name,
                            arg_types,
                            ret,
                        });
                    }
                    "define-fun" => {
                        let name = match items.get(1) {
                            Some(STree::Atom(a)) => a.clone(),
                            _ => return Err("bad define-fun".to_string()),
                        };
                        let args = match items.get(2) {
                            Some(STree::List(vs)) => vs
                                .iter()
                                .map(parse_sorted_var)
                                .collect::<Result<Vec<_>, _>>()?,
                            _ => return Err("bad define-fun".to_string()),
                        };
                        let ret = parse_sort(items.get(3).ok_or("bad define-fun")?)?;
                        let body = interp(items.get(4).ok_or("bad define-fun")?)?;
                        return Ok(SmtExp::FunDef {
                            name,
                            args,
                            ret,
                            body: Box::new(body),
                        });
                    }
                    "forall" => {
                        let vars = match items.get(1) {
                            Some(STree::List(vs)) => vs
                                .iter()
                                .map(parse_sorted_var)
                                .collect::<Result<Vec<_>, _>>()?,
                            _ => return Err("bad forall".to_string()),
                        };
                        let body = interp(items.get(2).ok_or("bad forall")?)?;
                        return Ok(SmtExp::Forall {
                            vars,
                            body: Box::new(body),
                        });
                    }
                    "let" => {
                        let defs = match items.get(1) {
                            Some(STree::List(ds)) => {
                                let mut defs = Vec::new();
                                for d in ds {
                                    match d {
                                        STree::List(pair) if pair.len() == 2 => {
                                            let name = match &pair[0] {
                                                STree::Atom(a) => a.clone(),
                                                t => {
                                                    return Err(format!(
                                                        "bad let binding {}",
                                                        t.print()
                                                    ))
                                                }
                                            };
                                            defs.push((name, interp(&pair[1])?));
                                        }
                                        t => {
                                            return Err(format!("bad let binding {}", t.print()))
                                        }
                                    }
                                }
                                defs
                            }
                            _ => return Err("bad let".to_string()),
                        };
                        let body = interp(items.get(2).ok_or("bad let")?)?;
                        return Ok(SmtExp::Let {
                            defs,
                            body: Box::new(body),
                        });
                    }
                    "_" => {
                        // (_ bvN w)
                        if let (Some(STree::Atom(bv)), Some(STree::Atom(w))) =
                            (items.get(1), items.get(2))
                        {
                            if let Some(digits) = bv.strip_prefix("bv") {
                                let value = BigInt::parse_bytes(digits.as_bytes(), 10)
                                    .ok_or("bad bit-vector literal")?;
                                let width = w.parse().map_err(|_| "bad bit-vector width")?;
                                return Ok(SmtExp::BvLit { value, width });
                            }
                        }
                        return Err(format!("unknown indexed form {}", tree.print()));
                    }
                    _ => {}
                }
            }
            let name = head.print();
            let args = items[1..]
                .iter()
                .map(interp)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SmtExp::Op { name, args })
        }
    }
}

/// Parse a sequence of top-level S-expressions.
pub fn parse(input: &str) -> Result<Vec<SmtExp>, String> {
    let tokens = lex_sexpr(input)?;
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < tokens.len() {
        let tree = parse_trees(&tokens, &mut pos)?;
        out.push(interp(&tree)?);
    }
    Ok(out)
}

/// Parse exactly one expression.
pub fn parse_exp(input: &str) -> Result<SmtExp, String> {
    let mut exprs = parse(input)?;
    match exprs.len() {
        1 => Ok(exprs.pop().unwrap()),
        n => Err(format!("expected one expression, found {}", n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_a_clause() {
        let clause = SmtExp::Assert(Box::new(forall(
            vec![
                SortedVar::new("x$1", SmtType::Int),
                SortedVar::new("x$2", SmtType::Int),
            ],
            implies(
                eq(var("x$1"), var("x$2")),
                op("INV_MAIN_EXIT", vec![var("x$1"), var("x$2")]),
            ),
        )));
        assert_eq!(
            clause.to_sexpr(),
            "(assert (forall ((x$1 Int) (x$2 Int)) (=> (= x$1 x$2) (INV_MAIN_EXIT x$1 x$2))))"
        );
    }

    #[test]
    fn compress_inlines_single_use_and_primitives() {
        let exp = nest_lets(
            vec![
                ("a".to_string(), var("x")),
                ("b".to_string(), binop("+", var("a"), int(1))),
            ],
            binop("+", var("b"), int(2)),
        );
        assert_eq!(exp.compress_lets().to_sexpr(), "(+ (+ x 1) 2)");
    }

    #[test]
    fn compress_keeps_shared_bindings() {
        let exp = nest_lets(
            vec![("a".to_string(), binop("+", var("x"), int(1)))],
            binop("*", var("a"), var("a")),
        );
        assert_eq!(
            exp.compress_lets().to_sexpr(),
            "(let ((a (+ x 1))) (* a a))"
        );
    }

    #[test]
    fn rename_assignments_freshens_shadowing() {
        let exp = nest_lets(
            vec![
                ("h".to_string(), binop("f", var("h"), int(1))),
                ("h".to_string(), binop("f", var("h"), int(2))),
            ],
            var("h"),
        );
        assert_eq!(
            exp.rename_assignments().to_sexpr(),
            "(let ((h_1 (f h 1))) (let ((h_2 (f h_1 2))) h_2))"
        );
    }

    #[test]
    fn instantiates_array_equalities() {
        let exp = eq(var("HEAP$1"), var("HEAP$2"));
        assert_eq!(
            exp.instantiate_arrays().to_sexpr(),
            "(forall ((i Int)) (= (select HEAP$1 i) (select HEAP$2 i)))"
        );
    }

    #[test]
    fn removes_foralls_into_declarations() {
        let clause = forall(
            vec![SortedVar::new("x", SmtType::Int)],
            eq(var("x"), int(1)),
        );
        let mut introduced = Vec::new();
        let body = clause.remove_foralls(&mut introduced);
        assert_eq!(body.to_sexpr(), "(= x 1)");
        assert_eq!(introduced, vec![SortedVar::new("x", SmtType::Int)]);
    }

    #[test]
    fn program_level_forall_removal_declares_variables() {
        let program = vec![
            SmtExp::SetLogic("HORN".to_string()),
            SmtExp::Assert(Box::new(forall(
                vec![SortedVar::new("x", SmtType::Int)],
                eq(var("x"), var("x")),
            ))),
            SmtExp::CheckSat,
        ];
        let rewritten = remove_foralls_program(&program);
        let text: Vec<String> = rewritten.iter().map(|e| e.to_sexpr()).collect();
        assert_eq!(text[1], "(declare-var x Int)");
        assert_eq!(text[2], "(assert (= x x))");
    }

    #[test]
    fn renames_defined_symbols_only() {
        let exprs = vec![
            SmtExp::FunDecl {
                name: "INV_MAIN_1".to_string(),
                arg_types: vec![SmtType::Int],
                ret: SmtType::Bool,
            },
            SmtExp::Assert(Box::new(op("INV_MAIN_1", vec![var("x")]))),
        ];
        let renamed = rename_define_funs(&exprs, "_v2");
        assert_eq!(
            renamed[1].to_sexpr(),
            "(assert (INV_MAIN_1_v2 x))"
        );
    }

    #[test]
    fn roundtrip_clause() {
        let clause = SmtExp::Assert(Box::new(forall(
            vec![SortedVar::new("x", SmtType::Int)],
            implies(
                binop("<", var("x"), int(-3)),
                op("P", vec![var("x"), SmtExp::BoolLit(true)]),
            ),
        )));
        let printed = clause.to_sexpr();
        assert_eq!(parse_exp(&printed).unwrap(), clause);
    }

    #[test]
    fn roundtrip_bitvector_literal() {
        let lit = SmtExp::BvLit {
            value: BigInt::from(5),
            width: 8,
        };
        assert_eq!(lit.to_sexpr(), "(_ bv5 8)");
        assert_eq!(parse_exp("(_ bv5 8)").unwrap(), lit);
    }
}
