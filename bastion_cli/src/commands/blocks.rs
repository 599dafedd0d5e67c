//! Block registry commands (blocks, block, unblock)

use crate::client::AdminClient;
use crate::config::Config;
use anyhow::Result;
use bastion_common::{BlockKind, BlockReason, BlockRecord, CreateBlockRequest, ListBlocksQuery};
use chrono::{DateTime, Duration, Utc};
use console::style;

/// List blocks as a table
pub async fn list(query: ListBlocksQuery) -> Result<()> {
    let client = AdminClient::from_config(&Config::load()?)?;
    let page = client.list_blocks(&query).await?;

    if page.items.is_empty() {
        println!("No blocks found");
        return Ok(());
    }

    println!(
        "{:<39} {:<16} {:<24} {:<8} {:<10} {}",
        style("IDENTITY").bold(),
        style("KIND").bold(),
        style("REASON").bold(),
        style("STATUS").bold(),
        style("HITS").bold(),
        style("EXPIRES").bold()
    );
    let now = Utc::now();
    for record in &page.items {
        println!(
            "{:<39} {:<16} {:<24} {:<8} {:<10} {}",
            record.identity,
            record.kind.as_str(),
            record.reason.as_str(),
            status(record, now),
            record.violation_count,
            format_expiry(record.expires_at)
        );
    }
    println!();
    println!(
        "Page {} of {} ({} blocks)",
        page.page,
        page.pages.max(1),
        page.total
    );

    Ok(())
}

/// Block an identity
pub async fn block(
    identity: String,
    kind: BlockKind,
    reason: BlockReason,
    hours: Option<i64>,
    description: Option<String>,
) -> Result<()> {
    let client = AdminClient::from_config(&Config::load()?)?;

    let req = CreateBlockRequest {
        identity,
        kind,
        reason,
        expires_at: expiry_from_hours(hours, Utc::now())?,
        description,
    };
    let record = client.create_block(&req).await?;

    println!(
        "{} Blocked {} ({})",
        style("✓").green().bold(),
        style(&record.identity).cyan(),
        record.reason
    );
    println!("  Expires: {}", format_expiry(record.expires_at));

    Ok(())
}

/// Lift an identity's active block
pub async fn unblock(identity: String, reason: String) -> Result<()> {
    let client = AdminClient::from_config(&Config::load()?)?;
    let record = client.unblock(&identity, &reason).await?;

    println!(
        "{} Unblocked {} (was blocked for {}, {} violations)",
        style("✓").green().bold(),
        style(&record.identity).cyan(),
        record.reason,
        record.violation_count
    );

    Ok(())
}

fn status(record: &BlockRecord, now: DateTime<Utc>) -> &'static str {
    if record.is_in_force(now) {
        "active"
    } else if record.active {
        "expired"
    } else {
        "lifted"
    }
}

fn expiry_from_hours(hours: Option<i64>, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match hours {
        None => Ok(None),
        Some(h) if h > 0 => Ok(Some(now + Duration::hours(h))),
        Some(h) => anyhow::bail!("--hours must be positive, got {}", h),
    }
}

fn format_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}
