// src/commands/repair.rs
//! Classify and fix interrupted transactions

use super::{format_bytes, Context, OperationTally};
use anyhow::Result;
use cefs::transaction::{RepairAction, RepairOutcome};
use cefs::{Filter, Repairer};
use std::time::Duration;

pub fn cmd_repair(
    ctx: &Context,
    filter: &Filter,
    dry_run: bool,
    min_age_secs: Option<u64>,
) -> Result<()> {
    let min_age = min_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.repair.min_age());
    let repairer = Repairer::new(&ctx.layout, min_age);
    let (outcomes, failures) = repairer.run(filter, dry_run)?;

    if outcomes.is_empty() && failures.is_empty() {
        println!("No in-progress transactions found");
    } else {
        print_table(&outcomes);
    }

    let mut tally = OperationTally::default();
    let mut reclaimed = 0;
    for outcome in &outcomes {
        let label = outcome.report.inprogress_path.display().to_string();
        match outcome.report.action() {
            RepairAction::Skip => tally.skip(label, &outcome.report.reason),
            _ => {
                reclaimed += outcome.reclaimed_bytes;
                tally.success(label);
            }
        }
    }
    for (path, error) in failures {
        tally.failure(path.display().to_string(), error);
    }

    if reclaimed > 0 {
        println!(
            "{} {}",
            if dry_run { "Would reclaim" } else { "Reclaimed" },
            format_bytes(reclaimed)
        );
    }
    tally.finish("repaired", dry_run)
}

fn print_table(outcomes: &[RepairOutcome]) {
    println!(
        "{:<20} {:<9} {:>8}  {}",
        "STATUS", "ACTION", "AGE", "TRANSACTION"
    );
    for outcome in outcomes {
        let report = &outcome.report;
        println!(
            "{:<20} {:<9} {:>7}m  {}",
            report.status.as_str(),
            report.action().to_string(),
            report.age.as_secs() / 60,
            report.image_path.display()
        );
        println!("{:<20} {:<9} {:>8}  {}", "", "", "", report.reason);
        if let Some(reason) = &outcome.kept_image {
            println!("{:<20} {:<9} {:>8}  image kept: {}", "", "", "", reason);
        }
        for name in report.names() {
            println!("{:<20} {:<9} {:>8}    {}", "", "", "", name);
        }
    }
    println!();
}
