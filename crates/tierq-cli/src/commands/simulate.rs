//! Synthetic tree fan-out workload.
//!
//! The root node spawns `fanout` children per level down to `depth`; every
//! deepest node spawns `leaves` leaf records. Nodes and leaves are separate
//! task types so both tiers see mixed traffic.

use std::hint::black_box;

use anyhow::{Result, bail};
use serde::Serialize;
use tierq_common::types::{TaskType, TaskTypeId};
use tierq_core::queue::{CombinerConfig, EnqueueMode, ResidualPolicy};
use tierq_core::ChainPlan;
use tierq_engine::{Config, RunReport, Runtime};

use crate::output::{self, Format};
use crate::{ModeArg, OutputFormat, ResidualArg, SimulateArgs};

struct TreeNode;

impl TaskType for TreeNode {
    /// (level, index within level)
    type Data = [u32; 2];
    const ID: TaskTypeId = TaskTypeId::new(1);
    const NAME: &'static str = "node";
}

struct TreeLeaf;

impl TaskType for TreeLeaf {
    type Data = u32;
    const ID: TaskTypeId = TaskTypeId::new(2);
    const NAME: &'static str = "leaf";
}

/// Records a complete run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Expected {
    nodes: u64,
    leaves: u64,
}

impl Expected {
    fn of(depth: u32, fanout: u32, leaves: u32) -> Option<Self> {
        let fanout = u64::from(fanout);
        let mut level = 1u64;
        let mut nodes = 1u64;
        for _ in 0..depth {
            level = level.checked_mul(fanout)?;
            nodes = nodes.checked_add(level)?;
        }
        Some(Self {
            nodes,
            leaves: level.checked_mul(u64::from(leaves))?,
        })
    }
}

#[derive(Serialize)]
struct SimulateOutput<'a> {
    expected: Expected,
    complete: bool,
    report: &'a RunReport,
}

fn spin(work: u32, seed: u32) {
    let mut x = seed;
    for _ in 0..work {
        x = black_box(x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223));
    }
}

fn config(args: &SimulateArgs) -> Config {
    let combiner = CombinerConfig::default()
        .with_spill_chance(args.spill)
        .with_high_fill_percent(args.high_fill)
        .with_lanes_per_record(args.lanes_per_record)
        .with_enqueue_mode(match args.mode {
            ModeArg::Coalesced => EnqueueMode::Coalesced,
            ModeArg::PerRecord => EnqueueMode::PerRecord,
        })
        .with_residual(match args.residual {
            ResidualArg::Drain => ResidualPolicy::Drain,
            ResidualArg::Discard => ResidualPolicy::Discard,
        })
        .with_seed(args.seed);
    Config::default()
        .with_groups(args.groups)
        .with_lanes(args.lanes)
        .with_budget(args.budget)
        .with_global_capacity(args.global_capacity)
        .with_combiner(combiner)
}

fn runtime(args: &SimulateArgs) -> Result<Runtime> {
    let plan = ChainPlan::builder(args.budget)
        .share::<TreeNode>(3)
        .share::<TreeLeaf>(1)
        .build()?;
    let mut runtime = Runtime::new(config(args), plan)?;
    let (depth, fanout, leaves, work) = (args.depth, args.fanout, args.leaves, args.work);
    runtime
        .register::<TreeNode, _>(move |scope, &[level, index]| {
            spin(work, index);
            if level < depth {
                for k in 0..fanout {
                    scope.enqueue::<TreeNode>(&[level + 1, index.wrapping_mul(fanout) + k])?;
                }
            } else {
                for k in 0..leaves {
                    scope.enqueue::<TreeLeaf>(&(index.wrapping_mul(leaves) + k))?;
                }
            }
            Ok(())
        })?
        .register::<TreeLeaf, _>(move |_, &index| {
            spin(work, index);
            Ok(())
        })?;
    Ok(runtime)
}

/// Run the simulate command.
pub fn run(args: &SimulateArgs, format: OutputFormat, quiet: bool) -> Result<()> {
    let Some(expected) = Expected::of(args.depth, args.fanout, args.leaves) else {
        bail!("a tree of depth {} and fanout {} is too large", args.depth, args.fanout);
    };
    let runtime = runtime(args)?;
    runtime.seed::<TreeNode>([[0, 0]])?;
    output::status(
        &format!(
            "running {} nodes and {} leaves on {} groups of {} lanes",
            expected.nodes, expected.leaves, args.groups, args.lanes
        ),
        quiet || matches!(format, OutputFormat::Json),
    );
    let report = runtime.run()?;
    let complete = report.executed_of(TreeNode::ID) == expected.nodes
        && report.executed_of(TreeLeaf::ID) == expected.leaves;

    match Format::from(format) {
        Format::Json => output::print_json(
            &SimulateOutput {
                expected,
                complete,
                report: &report,
            },
            quiet,
        )?,
        Format::Table => print_report(&report, quiet),
    }

    if complete {
        output::success(
            &format!("executed {} records", report.total_executed()),
            quiet || matches!(format, OutputFormat::Json),
        );
        Ok(())
    } else {
        bail!(
            "executed {} nodes and {} leaves, expected {} and {}",
            report.executed_of(TreeNode::ID),
            report.executed_of(TreeLeaf::ID),
            expected.nodes,
            expected.leaves
        )
    }
}

fn print_report(report: &RunReport, quiet: bool) {
    let stats = &report.stats;
    let mut items = vec![
        ("Elapsed", format!("{:.2?}", report.elapsed)),
        ("Throughput", format!("{:.0} records/s", report.throughput())),
    ];
    items.extend(
        report
            .executed
            .iter()
            .map(|t| (t.name, t.executed.to_string())),
    );
    items.extend([
        ("Local enqueued", stats.local_enqueued.to_string()),
        ("External enqueued", stats.external_enqueued.to_string()),
        ("Spilled", stats.spilled.to_string()),
        ("Overflowed", stats.overflowed.to_string()),
        ("Dropped", stats.dropped.to_string()),
        ("Local batches", stats.local_batches.to_string()),
        ("External batches", stats.external_batches.to_string()),
        ("Residual batches", stats.residual_batches.to_string()),
        ("Drained", report.residual.drained.to_string()),
        ("Lost", report.residual.lost.to_string()),
        ("Discarded", report.residual.discarded.to_string()),
    ]);
    output::print_key_value_table("Metric", &items, quiet);
}
