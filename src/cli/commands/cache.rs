//! Cache command - inspect and maintain the cache

use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::KilnResult;
use crate::maintenance::{CacheManager, EntryInfo, Eviction, EvictionReport, MaintenanceOutcome};
use crate::util::{format_bytes, format_millis, render_duration};
use console::style;
use std::path::Path;
use std::time::Duration;

/// Execute the cache command
pub fn execute(args: CacheArgs, config: &Config, cache_root: &Path) -> KilnResult<()> {
    let manager = CacheManager::from_config(config, cache_root);

    match args.action {
        CacheAction::List { format } => list_entries(&manager, format),
        CacheAction::Maintain { identity } => maintain(&manager, config, identity.as_deref()),
        CacheAction::Clean { expire, dry_run } => {
            let expire = expire.unwrap_or(config.cache.expire_unused_after);
            clean(&manager, expire, dry_run)
        }
    }
}

fn list_entries(manager: &CacheManager, format: OutputFormat) -> KilnResult<()> {
    let entries = manager.entries()?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No cache entries found in {}.", manager.store().root().display());
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_entry_table(&entries),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.id);
            }
        }
        OutputFormat::Json => {}
    }
    Ok(())
}

fn print_entry_table(entries: &[EntryInfo]) {
    println!(
        "{:<32} {:<18} {:<10} {:<10} {:<22}",
        "ACTION", "INPUT HASH", "SIZE", "STATE", "LAST USED"
    );
    println!("{}", "-".repeat(94));

    for entry in entries {
        let state = if entry.locked {
            style("locked").yellow().to_string()
        } else if entry.last_used.is_some() {
            style("complete").green().to_string()
        } else {
            style("partial").dim().to_string()
        };
        let last_used = entry
            .last_used
            .map(format_millis)
            .unwrap_or_else(|| "-".to_string());
        let hash: String = entry.input_hash.chars().take(16).collect();

        println!(
            "{:<32} {:<18} {:<10} {:<10} {:<22}",
            entry.action,
            hash,
            format_bytes(entry.size_bytes),
            state,
            last_used
        );
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!();
    println!("Total: {} entries ({})", entries.len(), format_bytes(total));
}

fn maintain(manager: &CacheManager, config: &Config, identity: Option<&str>) -> KilnResult<()> {
    let outcome = manager.perform_maintenance(&config.maintenance_policy(), identity)?;

    match outcome {
        MaintenanceOutcome::MissingRoot => {
            println!("No cache at {}.", manager.store().root().display())
        }
        MaintenanceOutcome::Initialized => println!("Cache maintenance initialized."),
        MaintenanceOutcome::NotDue => println!(
            "Cleanup not due (interval {}).",
            render_duration(config.cache.perform_cleanup_after)
        ),
        MaintenanceOutcome::Scheduled { at } => {
            println!("Scheduled cache cleanup for after {}.", format_millis(at))
        }
        MaintenanceOutcome::Waiting { until } => {
            println!("Cache cleanup scheduled for after {}.", format_millis(until))
        }
        MaintenanceOutcome::Cleaned(report) => print_report(&report, false),
        MaintenanceOutcome::Aborted { locked_entry } => print_aborted(&locked_entry),
    }
    Ok(())
}

fn clean(manager: &CacheManager, expire: Duration, dry_run: bool) -> KilnResult<()> {
    let eviction = if dry_run {
        manager.preview(expire)?
    } else {
        manager.clean(expire)?
    };

    match eviction {
        Eviction::Completed(report) => print_report(&report, dry_run),
        Eviction::Aborted { locked_entry } => print_aborted(&locked_entry),
    }
    Ok(())
}

fn print_report(report: &EvictionReport, dry_run: bool) {
    if report.deleted.is_empty() {
        println!("No expired cache entries.");
    } else {
        for id in &report.deleted {
            println!("  {} {}", style("•").red(), id);
        }
        let verb = if dry_run { "Would delete" } else { "Deleted" };
        println!(
            "{} {} expired cache entries totaling {}.",
            verb,
            report.deleted.len(),
            format_bytes(report.deleted_bytes)
        );
    }
    if !report.protected.is_empty() {
        println!(
            "{} {} expired entries kept, still relied on by newer entries.",
            style("•").cyan(),
            report.protected.len()
        );
    }
    if dry_run {
        println!();
        println!("Dry run - no entries removed.");
    }
}

fn print_aborted(locked_entry: &str) {
    println!(
        "{} Cleanup aborted: {} is in use. Try again later.",
        style("!").yellow(),
        locked_entry
    );
}
