//! Extraction of relational annotations from input files.
//!
//! Three directives are recognised inside `/*@ ... @*/` comments:
//! `rel_in` (relational precondition), `rel_out` (relational
//! postcondition) and `addfuncond` (extra conjunct for a function's
//! equivalence axiom). Parsing is regex-driven; the first `rel_in` and
//! `rel_out` win, later duplicates warn and are ignored, `addfuncond`
//! accumulates per function.

use crate::error::{Error, Result};
use crate::smt::{self, SmtExp};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

lazy_static! {
    static ref REL_IN: Regex =
        Regex::new(r"/\*@\s*rel_in\s*(\w*)\s*\(((?s).*?)\)\s*@\*/").unwrap();
    static ref REL_OUT: Regex =
        Regex::new(r"/\*@\s*rel_out\s*(\w*)\s*\(((?s).*?)\)\s*@\*/").unwrap();
    static ref FUN_COND: Regex =
        Regex::new(r"/\*@\s*addfuncond\s*(\w*)\s*\(((?s).*?)\)\s*@\*/").unwrap();
}

/// Relational pre/post-conditions and extra function conditions collected
/// from both input files.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    pub rel_in: Option<SmtExp>,
    pub rel_out: Option<SmtExp>,
    pub fun_conds: BTreeMap<String, Vec<SmtExp>>,
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

fn parse_body(kind: &str, text: &str, offset: usize, body: &str) -> Result<SmtExp> {
    smt::parse_exp(&format!("({})", body)).map_err(|_| Error::AnnotationParse {
        kind: kind.to_string(),
        line: line_of(text, offset),
    })
}

fn extract_single(
    kind: &str,
    regex: &Regex,
    text: &str,
    slot: &mut Option<SmtExp>,
) -> Result<()> {
    for captures in regex.captures_iter(text) {
        let whole = captures.get(0).unwrap();
        let body = captures.get(2).unwrap().as_str();
        if slot.is_some() {
            warn!(
                "duplicate {} directive at line {} ignored",
                kind,
                line_of(text, whole.start())
            );
            continue;
        }
        *slot = Some(parse_body(kind, text, whole.start(), body)?);
    }
    Ok(())
}

/// Scan both source files for annotations.
pub fn parse_annotations(file1: &str, file2: &str) -> Result<Annotations> {
    let mut annotations = Annotations::default();
    for text in [file1, file2] {
        extract_single("rel_in", &REL_IN, text, &mut annotations.rel_in)?;
        extract_single("rel_out", &REL_OUT, text, &mut annotations.rel_out)?;
        for captures in FUN_COND.captures_iter(text) {
            let whole = captures.get(0).unwrap();
            let fun = captures.get(1).unwrap().as_str().to_string();
            let body = captures.get(2).unwrap().as_str();
            let exp = parse_body("addfuncond", text, whole.start(), body)?;
            annotations.fun_conds.entry(fun).or_default().push(exp);
        }
    }
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rel_in_and_out() {
        let src1 = "/*@ rel_in inv (= x$1 x$2) @*/\ndefine @f(%x: i32) -> i32 { }";
        let src2 = "/*@ rel_out post (= result$1 result$2) @*/";
        let a = parse_annotations(src1, src2).unwrap();
        assert_eq!(a.rel_in.unwrap().to_sexpr(), "(= x$1 x$2)");
        assert_eq!(a.rel_out.unwrap().to_sexpr(), "(= result$1 result$2)");
    }

    #[test]
    fn first_directive_wins() {
        let src = "/*@ rel_in a (= x$1 x$2) @*/\n/*@ rel_in b (= y$1 y$2) @*/";
        let a = parse_annotations(src, "").unwrap();
        assert_eq!(a.rel_in.unwrap().to_sexpr(), "(= x$1 x$2)");
    }

    #[test]
    fn accumulates_fun_conds() {
        let src = "/*@ addfuncond g (> res1 0) @*/\n/*@ addfuncond g (< res1 10) @*/";
        let a = parse_annotations(src, "").unwrap();
        assert_eq!(a.fun_conds["g"].len(), 2);
    }

    #[test]
    fn bad_body_is_an_error() {
        let src = "/*@ rel_in inv ((= x$1) @*/";
        // An unbalanced body still matches the directive shape but fails
        // the S-expression reader.
        let err = parse_annotations(src, "").unwrap_err();
        assert!(err.to_string().contains("AnnotationParseError"));
    }

    #[test]
    fn multiline_bodies_parse() {
        let src = "/*@ rel_in inv (and (= x$1 x$2)\n (= y$1 y$2)) @*/";
        let a = parse_annotations(src, "").unwrap();
        assert!(a.rel_in.unwrap().to_sexpr().contains("and"));
    }
}
