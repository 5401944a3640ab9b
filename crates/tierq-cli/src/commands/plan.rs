//! Layout planning command.

use std::str::FromStr;

use anyhow::Result;
use comfy_table::Cell;
use tierq_common::memory::LayoutPlanner;
use tierq_common::types::TaskTypeId;
use tierq_common::{SizingDirective, SizingPolicy};

use crate::OutputFormat;
use crate::output::{self, Format};

/// One `--entry` argument: `<id>:<record_bytes>:<count=N|bytes=N|share=N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpec(pub SizingDirective);

impl FromStr for EntrySpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(id), Some(bytes), Some(policy)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!(
                "expected <id>:<record_bytes>:<count=N|bytes=N|share=N>, got `{s}`"
            ));
        };
        let id = parse_number(id, "task id")?;
        let bytes = parse_number(bytes, "record size")?;
        let (kind, value) = policy
            .split_once('=')
            .ok_or_else(|| format!("policy `{policy}` is not of the form kind=N"))?;
        let value = parse_number(value, "policy value")?;
        let policy = match kind.trim() {
            "count" => SizingPolicy::Count(value),
            "bytes" => SizingPolicy::Bytes(value),
            "share" => SizingPolicy::Share(value),
            other => return Err(format!("unknown policy `{other}`")),
        };
        Ok(Self(SizingDirective::new(TaskTypeId::new(id), bytes, policy)))
    }
}

fn parse_number(text: &str, what: &str) -> std::result::Result<u32, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("{what} `{text}` is not a number"))
}

fn describe(policy: SizingPolicy) -> String {
    match policy {
        SizingPolicy::Count(n) => format!("count {n}"),
        SizingPolicy::Bytes(n) => format!("bytes {n}"),
        SizingPolicy::Share(n) => format!("share {n}"),
    }
}

/// Run the plan command.
pub fn run(budget: u32, entries: &[EntrySpec], format: OutputFormat, quiet: bool) -> Result<()> {
    let mut planner = LayoutPlanner::new(budget);
    for entry in entries {
        planner.push(entry.0);
    }
    let layout = planner.plan()?;
    tracing::debug!(queues = layout.len(), total = layout.total(), "layout planned");

    match Format::from(format) {
        Format::Json => output::print_json(&layout, quiet)?,
        Format::Table => {
            if quiet {
                return Ok(());
            }
            let mut table = output::create_table();
            output::add_header(
                &mut table,
                &["Type", "Policy", "Record", "Capacity", "Offset", "Size"],
            );
            for placement in layout.placements() {
                table.add_row(vec![
                    Cell::new(placement.type_id.as_u32()),
                    Cell::new(describe(placement.policy)),
                    Cell::new(format!("{} B", placement.record_bytes)),
                    Cell::new(placement.capacity),
                    Cell::new(placement.offset),
                    Cell::new(output::format_bytes(placement.size)),
                ]);
            }
            println!("{table}");
            output::status(
                &format!(
                    "total {} of {} ({} unused)",
                    output::format_bytes(layout.total()),
                    output::format_bytes(layout.budget()),
                    output::format_bytes(layout.unused())
                ),
                quiet,
            );
        }
    }
    Ok(())
}
