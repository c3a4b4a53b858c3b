// ============================================================================
// companion-mem — CLI harness for the companion memory subsystem
// ============================================================================
// Usage:
//   companion-mem extract --user U --companion C --message "..." --response "..."
//   companion-mem search  --user U --companion C "what do you know about my job"
//   companion-mem list    --user U --companion C [--limit 20]
//   companion-mem forget  --user U --companion C
//   companion-mem stats
//   companion-mem health
//
// Calls the same extract/search operations as the production orchestrator;
// useful as a correctness and load probe.
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use companion_core::{
    format_snippets_for_prompt, HealthStatus, MemoryConfig, MemoryManager, OwnerScope,
};
use tracing_subscriber::EnvFilter;

/// Companion memory inspection and probe tool
#[derive(Parser)]
#[command(name = "companion-mem", version, about = "Probe and inspect the companion memory subsystem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one exchange through extraction and reconciliation
    Extract {
        #[arg(long)]
        user: String,
        #[arg(long)]
        companion: String,
        /// The user's message in the exchange
        #[arg(long)]
        message: String,
        /// The companion's response in the exchange
        #[arg(long, default_value = "")]
        response: String,
    },

    /// Semantic search over an owner's memories
    Search {
        #[arg(long)]
        user: String,
        #[arg(long)]
        companion: String,
        /// Search query
        query: String,
        /// Maximum results
        #[arg(long)]
        limit: Option<u64>,
        /// Minimum similarity score
        #[arg(long)]
        threshold: Option<f32>,
        /// Print the prompt-injection block instead of a table
        #[arg(long)]
        as_prompt: bool,
    },

    /// List an owner's most recent memories
    List {
        #[arg(long)]
        user: String,
        #[arg(long)]
        companion: String,
        #[arg(long, default_value = "20")]
        limit: u64,
    },

    /// Delete all memories for an owner
    Forget {
        #[arg(long)]
        user: String,
        #[arg(long)]
        companion: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show collection statistics
    Stats,

    /// Check subsystem health
    Health,
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let manager = MemoryManager::new(MemoryConfig::from_env()).await?;

    match cli.command {
        Commands::Extract {
            user,
            companion,
            message,
            response,
        } => cmd_extract(&manager, &user, &companion, &message, &response).await,
        Commands::Search {
            user,
            companion,
            query,
            limit,
            threshold,
            as_prompt,
        } => cmd_search(&manager, &user, &companion, &query, limit, threshold, as_prompt).await,
        Commands::List {
            user,
            companion,
            limit,
        } => cmd_list(&manager, &user, &companion, limit).await,
        Commands::Forget {
            user,
            companion,
            yes,
        } => cmd_forget(&manager, &user, &companion, yes).await,
        Commands::Stats => cmd_stats(&manager).await,
        Commands::Health => cmd_health(&manager).await,
    }
}

async fn cmd_extract(
    manager: &MemoryManager,
    user: &str,
    companion: &str,
    message: &str,
    response: &str,
) -> Result<()> {
    let owner = OwnerScope::new(user, companion);
    let outcome = manager.process_exchange(&owner, message, response).await;

    println!("=== Extraction Outcome ===");
    println!("Method:      {:?}", outcome.method);
    println!(
        "Confidence:  {:.2}{}",
        outcome.confidence,
        if outcome.requires_validation {
            " (requires validation)"
        } else {
            ""
        }
    );
    println!(
        "Candidates:  {} extracted, {} persisted, {} skipped",
        outcome.metrics.candidates_extracted,
        outcome.metrics.candidates_persisted,
        outcome.metrics.candidates_skipped
    );
    println!(
        "Timings:     extraction {}ms, reconcile {}ms",
        outcome.metrics.extraction_ms, outcome.metrics.reconcile_ms
    );
    println!(
        "Usage:       {} tokens across {} requests (~${:.6})",
        outcome.usage.total_tokens, outcome.usage.requests, outcome.usage.estimated_cost
    );
    for (i, op) in outcome.operations.iter().enumerate() {
        println!(
            "  [{}] {:?} (confidence {:.2}) — {}",
            i, op.op, op.confidence, op.reason
        );
    }
    for id in &outcome.stored_ids {
        println!("  stored: {}", id);
    }

    Ok(())
}

async fn cmd_search(
    manager: &MemoryManager,
    user: &str,
    companion: &str,
    query: &str,
    limit: Option<u64>,
    threshold: Option<f32>,
    as_prompt: bool,
) -> Result<()> {
    let owner = OwnerScope::new(user, companion);

    let mut options = manager.default_search_options();
    if let Some(l) = limit {
        options.limit = l;
    }
    if let Some(t) = threshold {
        options.threshold = t;
    }

    let outcome = manager.search(query, &owner, Some(options)).await;

    if as_prompt {
        print!("{}", format_snippets_for_prompt(&outcome.memories));
        return Ok(());
    }

    println!("=== Search Results ({} found) ===", outcome.diagnostics.total_found);
    for scored in &outcome.memories {
        println!(
            "  {:.4}  [{}]  {}",
            scored.score,
            scored.memory.memory_type,
            scored.memory.text
        );
    }
    println!(
        "avg latency {:.1}ms, cache hit ratio {:.2}",
        outcome.diagnostics.average_latency_ms, outcome.diagnostics.cache_hit_ratio
    );

    Ok(())
}

async fn cmd_list(manager: &MemoryManager, user: &str, companion: &str, limit: u64) -> Result<()> {
    let owner = OwnerScope::new(user, companion);
    let memories = manager.list_memories(&owner, limit).await?;

    if memories.is_empty() {
        println!("No memories for {}", owner);
        return Ok(());
    }

    for memory in memories {
        println!(
            "{}  [{}]  imp {:.2}  acc {}  {}",
            format_timestamp(memory.created_at),
            memory.memory_type,
            memory.importance,
            memory.access_count,
            memory.text
        );
    }

    Ok(())
}

async fn cmd_forget(manager: &MemoryManager, user: &str, companion: &str, yes: bool) -> Result<()> {
    let owner = OwnerScope::new(user, companion);

    if !yes {
        println!("Delete ALL memories for {}? Re-run with --yes to confirm.", owner);
        return Ok(());
    }

    manager.forget_owner(&owner).await?;
    println!("Deleted all memories for {}", owner);

    Ok(())
}

async fn cmd_stats(manager: &MemoryManager) -> Result<()> {
    let stats = manager.stats().await?;

    println!("=== Companion Memory Stats ===");
    println!("Memories: {}", stats.points_count);

    Ok(())
}

async fn cmd_health(manager: &MemoryManager) -> Result<()> {
    let report = manager.health_check().await;

    println!(
        "Status: {}",
        match report.status {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    );
    for detail in &report.details {
        println!("  {}", detail);
    }

    if report.status == HealthStatus::Unhealthy {
        std::process::exit(1);
    }

    Ok(())
}
