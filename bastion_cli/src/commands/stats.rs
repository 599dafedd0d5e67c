//! Registry statistics, cleanup and fraud tracking inspection

use crate::client::AdminClient;
use crate::config::Config;
use anyhow::Result;
use console::style;
use std::collections::BTreeMap;

/// Show registry statistics
pub async fn stats() -> Result<()> {
    let client = AdminClient::from_config(&Config::load()?)?;
    let stats = client.statistics().await?;

    println!("Blocks:");
    println!("  Total:        {}", stats.total);
    println!("  Active:       {}", style(stats.active).red().bold());
    println!("  Expired:      {}", stats.expired);
    println!("  Last 24h:     {}", stats.recent_24h);

    print_breakdown("Active by reason:", &stats.by_reason);
    print_breakdown("Active by kind:", &stats.by_kind);

    Ok(())
}

/// Run the expiry sweep and tracking GC now
pub async fn cleanup() -> Result<()> {
    let client = AdminClient::from_config(&Config::load()?)?;
    let report = client.cleanup().await?;

    match report.expired_blocks {
        Some(n) => println!("Expired blocks:           {}", n),
        None => println!("Expired blocks:           skipped (sweep already running)"),
    }
    match report.dropped_entries {
        Some(n) => println!("Dropped tracking entries: {}", n),
        None => println!("Dropped tracking entries: skipped (GC already running)"),
    }

    Ok(())
}

/// Show an identity's fraud tracking
pub async fn tracking(identity: String) -> Result<()> {
    let client = AdminClient::from_config(&Config::load()?)?;
    let snapshot = client.tracking(&identity).await?;

    println!("Tracking for {}", style(&snapshot.identity).cyan());
    println!("  Failed logins: {}", snapshot.failed_logins);
    println!("  Requests:      {}", snapshot.requests);
    println!("  Uploads:       {}", snapshot.file_uploads);
    if let Some(at) = snapshot.last_activity {
        println!("  Last activity: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if snapshot.suspicious_activities.is_empty() {
        println!("  No suspicious activity");
        return Ok(());
    }
    println!();
    println!("Suspicious activity:");
    for activity in &snapshot.suspicious_activities {
        println!(
            "  {}  {}",
            style(activity.timestamp.format("%H:%M:%S")).dim(),
            activity.description
        );
    }

    Ok(())
}

fn print_breakdown(title: &str, counts: &BTreeMap<String, u64>) {
    if counts.is_empty() {
        return;
    }
    println!();
    println!("{}", title);
    let mut rows: Vec<_> = counts.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (name, count) in rows {
        println!("  {:<24} {}", name, count);
    }
}
