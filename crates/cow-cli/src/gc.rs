//! # Garbage Collection
//!
//! Reclaims zero-count blocks and runs the consistency sweep; also hosts the
//! scrub report.

use anyhow::{bail, Result};
use clap::Args;
use cow_block::{Store, StoreStats};
use cow_config::log_cli_info;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Only report what would be reclaimed
    #[arg(long)]
    dry_run: bool,
}

pub fn run(store: &Store, args: GcArgs) -> Result<()> {
    println!();
    println!("  Block Store Garbage Collection");
    println!("  =============================");

    let before = store.stats()?;
    print_stats(&before);

    if args.dry_run {
        println!();
        if before.pending_reclaim == 0 {
            println!("  Nothing to reclaim.");
        } else {
            println!(
                "  {} blocks ({}) would be reclaimed.",
                format_number(before.pending_reclaim),
                format_bytes(before.pending_reclaim * before.block_size)
            );
        }
        println!("  Run without --dry-run to reclaim and sweep.");
        return Ok(());
    }

    let queued = store.reclaim_pending()?;
    let report = store.sweep()?;
    let reclaimed = queued as u64 + report.reclaimed;

    println!();
    println!("  Sweep:");
    println!("    Reclaimed blocks:   {}", format_number(reclaimed));
    println!("    Deferred (in use):  {}", format_number(report.deferred));
    println!("    Orphaned payloads:  {}", format_number(report.orphaned_data));
    println!("    Stale temp files:   {}", format_number(report.stale_temp_files));
    println!("    Empty directories:  {}", format_number(report.empty_dirs));
    println!(
        "    Space freed:        {}",
        format_bytes((reclaimed + report.orphaned_data) * before.block_size)
    );

    log_cli_info!(
        "gc complete",
        reclaimed = reclaimed,
        orphaned = report.orphaned_data,
        temp_files = report.stale_temp_files,
    );
    Ok(())
}

pub fn scrub(store: &Store) -> Result<()> {
    let report = store.scrub()?;
    println!("Checked {} blocks", format_number(report.checked));
    for id in &report.corrupt {
        println!("  corrupt: {}", id);
    }
    for id in &report.missing {
        println!("  missing: {}", id);
    }
    if !report.is_clean() {
        bail!(
            "{} corrupt and {} missing blocks",
            report.corrupt.len(),
            report.missing.len()
        );
    }
    println!("All blocks verified");
    Ok(())
}

pub fn print_stats(stats: &StoreStats) {
    println!();
    println!("  Store Statistics:");
    println!("    Block size:        {}", format_bytes(stats.block_size));
    println!(
        "    Distinct blocks:   {} ({})",
        format_number(stats.block_count),
        format_bytes(stats.physical_bytes)
    );
    println!(
        "    References:        {} ({})",
        format_number(stats.total_references),
        format_bytes(stats.logical_bytes)
    );
    println!("    Dedup ratio:       {:.2}x", stats.dedup_ratio());
    println!("    Pending reclaim:   {}", format_number(stats.pending_reclaim));
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format number with comma separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
