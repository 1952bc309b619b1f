//! Command-line front-end.
//!
//! Reads two lowered-IR files, generates the relational Horn clauses and
//! writes them to the selected sink, one top-level form per line.
//! Diagnostics go to standard error; exit code 1 signals matching or
//! front-end failures, usage errors exit with 2.

use clap::Parser;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tandem::{DynamicConfig, IntSemantics, Options};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Relational equivalence checker emitting constrained Horn clauses")]
struct Cli {
    /// First input file (lowered IR)
    file1: PathBuf,

    /// Second input file (lowered IR)
    file2: PathBuf,

    /// SMT output file (stdout if absent)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Function to verify (defaults to the first defined function)
    #[arg(long, value_name = "NAME")]
    fun: Option<String>,

    /// Allow loops to be off by n iterations
    #[arg(long = "off-by-n")]
    off_by_n: bool,

    /// Only generate recursive invariants for the selected function
    #[arg(long = "only-rec")]
    only_rec: bool,

    /// Thread heap arrays through the invariants
    #[arg(long)]
    heap: bool,

    /// Thread stack arrays through the invariants
    #[arg(long)]
    stack: bool,

    /// Place string constants at matched negative addresses
    #[arg(long)]
    strings: bool,

    /// Include path forwarded to the front-end
    #[arg(short = 'I', value_name = "PATH")]
    include: Vec<PathBuf>,

    /// Two's-complement bit-vector semantics instead of mathematical
    /// integers
    #[arg(long)]
    bounded: bool,

    /// Interpret both programs on seed inputs and fit candidate invariants
    #[arg(long)]
    dynamic: bool,

    /// Maximum total degree of fitted polynomial equations
    #[arg(long, default_value_t = 1, value_name = "N")]
    degree: usize,

    /// Seed input file, one `vars1|vars2|heap1|heap2` item per line
    #[arg(long, value_name = "PATH")]
    inputs: Option<PathBuf>,

    /// Number of random seed inputs when no input file is given
    #[arg(long, default_value_t = 16, value_name = "N")]
    seeds: usize,

    /// PRNG seed for input generation
    #[arg(long, default_value_t = 0, value_name = "N")]
    seed: u64,

    /// Serialize the collected traces as JSON
    #[arg(long = "trace-out", value_name = "PATH")]
    trace_out: Option<PathBuf>,
}

fn run(cli: &Cli) -> tandem::Result<()> {
    let src1 = fs::read_to_string(&cli.file1)?;
    let src2 = fs::read_to_string(&cli.file2)?;

    if !cli.include.is_empty() {
        tracing::warn!("-I has no effect: the textual front-end resolves no includes");
    }

    let opts = Options {
        fun: cli.fun.clone(),
        off_by_n: cli.off_by_n,
        only_rec: cli.only_rec,
        memory: tandem::MemoryModel {
            heap: cli.heap,
            stack: cli.stack,
        },
        strings: cli.strings,
        int_semantics: if cli.bounded {
            IntSemantics::Bounded
        } else {
            IntSemantics::Unbounded
        },
        dynamic: cli.dynamic,
    };
    let dynamic_cfg = if cli.dynamic {
        let inputs = match &cli.inputs {
            Some(path) => Some(fs::read_to_string(path)?),
            None => None,
        };
        Some(DynamicConfig {
            degree: cli.degree,
            num_seeds: cli.seeds,
            seed: cli.seed,
            inputs,
            ..DynamicConfig::default()
        })
    } else {
        None
    };

    let result = tandem::run_verification(&src1, &src2, &opts, dynamic_cfg.as_ref())?;

    let mut sink: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    for exp in &result.smt {
        writeln!(sink, "{}", exp)?;
    }

    if let (Some(path), Some(traces)) = (&cli.trace_out, &result.traces) {
        let json = tandem::dynamic::traces_to_json(traces);
        fs::write(path, serde_json::to_string_pretty(&json).unwrap_or_default())?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("{}", e);
        process::exit(1);
    }
}
