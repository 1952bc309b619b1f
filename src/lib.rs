pub mod abstraction;
pub mod annot;
pub mod assignment;
pub mod dynamic;
pub mod encoder;
pub mod error;
pub mod integer;
pub mod interp;
pub mod invariant;
pub mod ir;
pub mod linear;
pub mod mark;
pub mod opts;
pub mod parser;
pub mod path;
pub mod preprocess;
pub mod smt;

pub use dynamic::PairTrace;
pub use error::{Error, Result, TrapKind};
pub use integer::Integer;
pub use mark::Mark;
pub use opts::{DynamicConfig, IntSemantics, MemoryModel, Options};
pub use smt::{SmtExp, SmtType, SortedVar};

mod tests;

/// Everything a verification run produces: the SMT artifact and, in
/// dynamic mode, the collected trace pairs.
#[derive(Debug)]
pub struct VerificationResult {
    pub smt: Vec<SmtExp>,
    pub traces: Option<Vec<PairTrace>>,
}

/// Run the whole pipeline on two sources: annotations, parsing, pass
/// pipeline, analyses, optional trace collection and invariant fitting,
/// clause generation. The returned expressions are already let-compressed,
/// ready for line-by-line printing.
pub fn run_verification(
    src1: &str,
    src2: &str,
    opts: &Options,
    dynamic_cfg: Option<&DynamicConfig>,
) -> Result<VerificationResult> {
    let annotations = annot::parse_annotations(src1, src2)?;
    let mod1 = parser::parse_module(src1)?;
    let mod2 = parser::parse_module(src2)?;

    let mut opts = opts.clone();
    opts.memory.heap =
        opts.memory.heap || mod1.accesses_memory() || mod2.accesses_memory();
    opts.dynamic = dynamic_cfg.is_some();

    let prepared = encoder::prepare(mod1, mod2, &opts)?;
    let selected = encoder::selected_pair(&prepared, &opts)?;

    let (bodies, traces) = match dynamic_cfg {
        Some(cfg) => {
            let items = match &cfg.inputs {
                Some(text) => dynamic::parse_input(text)?,
                None => {
                    let arity = prepared
                        .mod1
                        .procedure(&selected)
                        .map(|p| p.params.len())
                        .unwrap_or(0);
                    dynamic::random_items(arity, cfg)
                }
            };
            let traces = dynamic::collect_traces(&prepared, &selected, items, &opts, cfg);
            let bodies = dynamic::dynamic_invariants(&prepared, &selected, &traces, &opts, cfg);
            (Some(bodies), Some(traces))
        }
        None => (None, None),
    };

    let raw = encoder::generate(&prepared, &annotations, &opts, bodies.as_ref())?;
    let smt = raw
        .iter()
        .map(|e| e.rename_assignments().compress_lets())
        .collect();
    Ok(VerificationResult { smt, traces })
}
