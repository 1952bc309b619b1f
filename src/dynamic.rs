//! Trace collection for the dynamic mode.
//!
//! Seed inputs (parsed from a file or generated from a fixed PRNG seed) are
//! pushed onto a monitor work queue; a fixed pool of workers pops items,
//! runs both interpreters against the shared immutable IR, and appends the
//! resulting trace pairs. Cancellation is a sentinel item that every worker
//! re-enqueues for its peers. Downstream consumers re-order by the item
//! counter, so worker scheduling never shows in the output.

use crate::abstraction;
use crate::encoder::PreparedPair;
use crate::error::{Error, Result};
use crate::integer::Integer;
use crate::interp::{self, CallTrace, Heap, InterpCtx, State};
use crate::invariant::{self, LoopClasses, Observation};
use crate::mark::Mark;
use crate::opts::{DynamicConfig, IntSemantics, Options};
use crate::smt::{is_array_name, SmtExp};
use num_bigint::BigInt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// One seed input: argument tuples, heap backgrounds and heap contents for
/// both programs. The sentinel (`heap_set == false`, `counter == -1`)
/// cancels the pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub vals: (Vec<BigInt>, Vec<BigInt>),
    pub heap_backgrounds: (BigInt, BigInt),
    pub heaps: (Vec<(BigInt, BigInt)>, Vec<(BigInt, BigInt)>),
    pub heap_set: bool,
    pub counter: i64,
}

impl WorkItem {
    pub fn sentinel() -> WorkItem {
        WorkItem {
            vals: (Vec::new(), Vec::new()),
            heap_backgrounds: (BigInt::from(0), BigInt::from(0)),
            heaps: (Vec::new(), Vec::new()),
            heap_set: false,
            counter: -1,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !self.heap_set && self.counter == -1
    }
}

/// A monitor: `push` signals one waiter, `pop` blocks while empty.
pub struct ThreadSafeQueue<T> {
    queue: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, value: T) {
        self.queue.lock().unwrap().push_back(value);
        self.cond.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut guard = self.queue.lock().unwrap();
        loop {
            if let Some(value) = guard.pop_front() {
                return value;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Both programs' traces for one work item.
#[derive(Debug, Clone)]
pub struct PairTrace {
    pub counter: i64,
    pub first: CallTrace,
    pub second: CallTrace,
}

/* ------------------------------------------------------------------ */
/* Seed inputs                                                         */

fn parse_numbers(part: &str) -> Result<Vec<BigInt>> {
    part.split(';')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            BigInt::parse_bytes(s.trim().as_bytes(), 10).ok_or_else(|| {
                Error::FrontEnd(format!("bad number '{}' in input file", s.trim()))
            })
        })
        .collect()
}

fn parse_heap(part: &str) -> Result<Vec<(BigInt, BigInt)>> {
    part.split(';')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let mut halves = entry.split(',');
            let index = halves.next().unwrap_or("").trim();
            let value = halves.next().unwrap_or("").trim();
            match (
                BigInt::parse_bytes(index.as_bytes(), 10),
                BigInt::parse_bytes(value.as_bytes(), 10),
            ) {
                (Some(i), Some(v)) => Ok((i, v)),
                _ => Err(Error::FrontEnd(format!(
                    "bad heap entry '{}' in input file",
                    entry
                ))),
            }
        })
        .collect()
}

/// Parse seed inputs: one item per line, `vars1|vars2|heap1|heap2`, the
/// variable fields semicolon-separated numbers and the heap fields
/// semicolon-separated `index,value` pairs.
pub fn parse_input(text: &str) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 4 {
            return Err(Error::FrontEnd(format!(
                "input line {} does not have four '|' separated fields",
                i + 1
            )));
        }
        items.push(WorkItem {
            vals: (parse_numbers(parts[0])?, parse_numbers(parts[1])?),
            heap_backgrounds: (BigInt::from(0), BigInt::from(0)),
            heaps: (parse_heap(parts[2])?, parse_heap(parts[3])?),
            heap_set: true,
            counter: i as i64,
        });
    }
    Ok(items)
}

/// Generate seed inputs from a fixed PRNG seed; both programs receive the
/// same argument tuple so the default precondition holds.
pub fn random_items(arity: usize, cfg: &DynamicConfig) -> Vec<WorkItem> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    (0..cfg.num_seeds)
        .map(|i| {
            let vals: Vec<BigInt> = (0..arity)
                .map(|_| BigInt::from(rng.gen_range(-16i64..=16)))
                .collect();
            WorkItem {
                vals: (vals.clone(), vals),
                heap_backgrounds: (BigInt::from(0), BigInt::from(0)),
                heaps: (Vec::new(), Vec::new()),
                heap_set: false,
                counter: i as i64,
            }
        })
        .collect()
}

/* ------------------------------------------------------------------ */
/* Collection                                                          */

fn make_heap(
    background: &BigInt,
    cells: &[(BigInt, BigInt)],
    semantics: IntSemantics,
) -> Heap {
    use num_traits::ToPrimitive;
    let of_bigint = |v: &BigInt| match semantics {
        IntSemantics::Unbounded => Integer::Unbounded(v.clone()),
        IntSemantics::Bounded => Integer::bounded(64, v.to_i64().unwrap_or(0)),
    };
    let mut heap = Heap::new(of_bigint(background));
    for (addr, value) in cells {
        heap.write(addr.clone(), of_bigint(value));
    }
    heap
}

fn run_one(
    prepared: &PreparedPair,
    selected: &str,
    item: &WorkItem,
    opts: &Options,
    cfg: &DynamicConfig,
) -> Result<PairTrace> {
    use num_traits::ToPrimitive;
    let (addr1, addr2) = abstraction::global_addresses(&prepared.mod1, &prepared.mod2, opts);
    let semantics = opts.int_semantics;

    let mut traces = Vec::new();
    for (module, addrs, vals, background, cells) in [
        (
            &prepared.mod1,
            &addr1,
            &item.vals.0,
            &item.heap_backgrounds.0,
            &item.heaps.0,
        ),
        (
            &prepared.mod2,
            &addr2,
            &item.vals.1,
            &item.heap_backgrounds.1,
            &item.heaps.1,
        ),
    ] {
        let proc = module.procedure(selected).ok_or_else(|| {
            Error::MissingCounterpart(selected.to_string())
        })?;
        if vals.len() != proc.params.len() {
            return Err(Error::ArityMismatch(format!(
                "seed item {} supplies {} values for {} parameters",
                item.counter,
                vals.len(),
                proc.params.len()
            )));
        }
        let args: Vec<Integer> = proc
            .params
            .iter()
            .zip(vals.iter())
            .map(|(id, v)| match semantics {
                IntSemantics::Unbounded => Integer::Unbounded(v.clone()),
                IntSemantics::Bounded => {
                    Integer::bounded(proc.value(*id).ty.bits(), v.to_i64().unwrap_or(0))
                }
            })
            .collect();
        let ctx = InterpCtx {
            module,
            opts,
            globals: addrs,
        };
        let heap = make_heap(background, cells, semantics);
        let trace = interp::interpret(&ctx, proc, &args, heap, cfg.step_budget)?;
        if let Some(kind) = trace.trap {
            return Err(Error::ArithTrap(kind));
        }
        if trace.early_exit {
            return Err(Error::BudgetExceeded);
        }
        traces.push(trace);
    }
    let second = traces.pop().unwrap();
    let first = traces.pop().unwrap();
    Ok(PairTrace {
        counter: item.counter,
        first,
        second,
    })
}

/// Run every work item through the interpreter pair on a fixed worker
/// pool. Failing items are reported and skipped; results come back in
/// counter order.
pub fn collect_traces(
    prepared: &PreparedPair,
    selected: &str,
    items: Vec<WorkItem>,
    opts: &Options,
    cfg: &DynamicConfig,
) -> Vec<PairTrace> {
    let total = items.len();
    let queue: ThreadSafeQueue<WorkItem> = ThreadSafeQueue::new();
    let results: Mutex<Vec<PairTrace>> = Mutex::new(Vec::new());
    let completed = AtomicUsize::new(0);
    let workers = num_cpus::get().max(1).min(total.max(1));

    for item in items {
        queue.push(item);
    }
    queue.push(WorkItem::sentinel());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let item = queue.pop();
                if item.is_sentinel() {
                    queue.push(item);
                    break;
                }
                match run_one(prepared, selected, &item, opts, cfg) {
                    Ok(trace) => results.lock().unwrap().push(trace),
                    Err(e) => warn!("seed item {} failed: {}", item.counter, e),
                }
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        if cfg.timeout_ms > 0 {
            let timeout = Duration::from_millis(cfg.timeout_ms);
            let started = Instant::now();
            let completed = &completed;
            let queue = &queue;
            scope.spawn(move || {
                while completed.load(Ordering::SeqCst) < total {
                    if started.elapsed() >= timeout {
                        queue.push(WorkItem::sentinel());
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
        }
    });

    let mut traces = results.into_inner().unwrap();
    traces.sort_by_key(|t| t.counter);
    traces
}

/* ------------------------------------------------------------------ */
/* Observations                                                        */

fn merge_states(s1: &State, s2: &State) -> Observation {
    let mut obs = Observation::new();
    for (name, value) in s1.vars.iter().chain(s2.vars.iter()) {
        obs.insert(name.clone(), value.signed());
    }
    obs
}

fn exit_observation(pair: &PairTrace) -> Option<Observation> {
    let r1 = pair.first.result.as_ref()?;
    let r2 = pair.second.result.as_ref()?;
    let mut obs = merge_states(&pair.first.ret, &pair.second.ret);
    obs.insert("result$1".to_string(), r1.signed());
    obs.insert("result$2".to_string(), r2.signed());
    Some(obs)
}

fn mark_events<'a>(
    trace: &'a CallTrace,
    name_to_mark: &BTreeMap<String, Mark>,
) -> BTreeMap<Mark, Vec<&'a State>> {
    let mut events: BTreeMap<Mark, Vec<&State>> = BTreeMap::new();
    for step in &trace.steps {
        if let Some(&m) = name_to_mark.get(&step.block) {
            if !m.is_special() {
                events.entry(m).or_default().push(&step.state);
            }
        }
    }
    events
}

/// Group the collected traces into per-mark observations split by which
/// program was still looping: matched visits pair up (`none`), surplus
/// visits of one program pair with the other's final visit (`left`/
/// `right`).
pub fn mark_observations(
    prepared: &PreparedPair,
    selected: &str,
    traces: &[PairTrace],
) -> BTreeMap<Mark, LoopClasses<Vec<Observation>>> {
    let (a1, a2) = &prepared.analyses[selected];
    let p1 = prepared.mod1.procedure(selected).unwrap();
    let p2 = prepared.mod2.procedure(selected).unwrap();
    let names1: BTreeMap<String, Mark> = p1
        .block_ids()
        .map(|b| (p1.block(b).name.clone(), a1.marks.mark_of(b)))
        .collect();
    let names2: BTreeMap<String, Mark> = p2
        .block_ids()
        .map(|b| (p2.block(b).name.clone(), a2.marks.mark_of(b)))
        .collect();

    let mut out: BTreeMap<Mark, LoopClasses<Vec<Observation>>> = BTreeMap::new();
    for pair in traces {
        let events1 = mark_events(&pair.first, &names1);
        let events2 = mark_events(&pair.second, &names2);
        let mut marks: Vec<Mark> = events1.keys().chain(events2.keys()).copied().collect();
        marks.sort();
        marks.dedup();
        for m in marks {
            let empty = Vec::new();
            let occ1 = events1.get(&m).unwrap_or(&empty);
            let occ2 = events2.get(&m).unwrap_or(&empty);
            let classes = out.entry(m).or_default();
            let matched = occ1.len().min(occ2.len());
            for i in 0..matched {
                classes.none.push(merge_states(occ1[i], occ2[i]));
            }
            if let Some(last2) = occ2.last() {
                for s1 in &occ1[matched..] {
                    classes.left.push(merge_states(s1, last2));
                }
            }
            if let Some(last1) = occ1.last() {
                for s2 in &occ2[matched..] {
                    classes.right.push(merge_states(last1, s2));
                }
            }
        }
        if let Some(obs) = exit_observation(pair) {
            out.entry(Mark::EXIT).or_default().none.push(obs);
        }
    }
    out
}

/// Fit polynomial equations and assemble the mark predicate bodies.
pub fn dynamic_invariants(
    prepared: &PreparedPair,
    selected: &str,
    traces: &[PairTrace],
    opts: &Options,
    cfg: &DynamicConfig,
) -> BTreeMap<Mark, SmtExp> {
    let (a1, a2) = &prepared.analyses[selected];
    let observations = mark_observations(prepared, selected, traces);

    let mut free_vars: BTreeMap<Mark, Vec<String>> = BTreeMap::new();
    let mut marks: Vec<Mark> = a1.free_vars.keys().chain(a2.free_vars.keys()).copied().collect();
    marks.sort();
    marks.dedup();
    for m in marks {
        if m == Mark::ENTRY {
            continue;
        }
        let mut names: Vec<String> = Vec::new();
        for a in [a1, a2] {
            names.extend(
                a.free_vars
                    .get(&m)
                    .into_iter()
                    .flatten()
                    .filter(|v| !is_array_name(&v.name))
                    .map(|v| v.name.clone()),
            );
        }
        free_vars.insert(m, names);
    }

    invariant::invariant_definitions(
        &observations,
        &BTreeMap::new(),
        &free_vars,
        cfg.degree,
        opts,
    )
}

/* ------------------------------------------------------------------ */
/* Serialization                                                       */

fn state_json(state: &State) -> Value {
    let variables: serde_json::Map<String, Value> = state
        .vars
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.signed().to_string())))
        .collect();
    let heap: serde_json::Map<String, Value> = state
        .heap
        .cells
        .iter()
        .map(|(addr, value)| (addr.to_string(), Value::String(value.signed().to_string())))
        .collect();
    json!({
        "variables": variables,
        "heap": heap,
        "heapBackground": state.heap.background.signed().to_string(),
    })
}

fn call_json(trace: &CallTrace) -> Value {
    json!({
        "function": trace.name,
        "entry": state_json(&trace.entry),
        "return": state_json(&trace.ret),
        "result": trace.result.as_ref().map(|r| r.signed().to_string()),
        "earlyExit": trace.early_exit,
        "blocksVisited": trace.blocks_visited,
        "steps": trace.steps.iter().map(|s| json!({
            "block": s.block,
            "state": state_json(&s.state),
            "calls": s.calls.iter().map(call_json).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

/// Render the collected traces as JSON for external inspection.
pub fn traces_to_json(traces: &[PairTrace]) -> Value {
    Value::Array(
        traces
            .iter()
            .map(|pair| {
                json!({
                    "counter": pair.counter,
                    "first": call_json(&pair.first),
                    "second": call_json(&pair.second),
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn queue_blocks_until_pushed() {
        let queue: Arc<ThreadSafeQueue<i32>> = Arc::new(ThreadSafeQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.push(7);
        assert_eq!(popper.join().unwrap(), 7);
    }

    #[test]
    fn sentinel_is_recognised() {
        assert!(WorkItem::sentinel().is_sentinel());
        let real = WorkItem {
            heap_set: true,
            counter: 0,
            ..WorkItem::sentinel()
        };
        assert!(!real.is_sentinel());
    }

    #[test]
    fn parses_the_line_format() {
        let items = parse_input("1;2|1;2|0,5|0,5\n3;4|3;4||\n").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].vals.0, vec![BigInt::from(1), BigInt::from(2)]);
        assert_eq!(items[0].heaps.1, vec![(BigInt::from(0), BigInt::from(5))]);
        assert!(items[1].heaps.0.is_empty());
        assert_eq!(items[1].counter, 1);
    }

    #[test]
    fn random_items_are_deterministic() {
        let cfg = DynamicConfig {
            num_seeds: 5,
            seed: 42,
            ..DynamicConfig::default()
        };
        let a = random_items(2, &cfg);
        let b = random_items(2, &cfg);
        let values =
            |items: &[WorkItem]| items.iter().map(|i| i.vals.0.clone()).collect::<Vec<_>>();
        assert_eq!(values(&a), values(&b));
    }
}
