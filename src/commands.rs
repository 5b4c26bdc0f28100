use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::Result;
use crate::api::{self, AppState};
use crate::cache::QueryCache;
use crate::config::{Config, get_config_dir};
use crate::content::ContentType;
use crate::database::Database;
use crate::database::queries::EmbeddingQueries;
use crate::embeddings::{Embedder, EmbeddingGenerator};
use crate::retriever::{ContextRequest, ContextRetriever};
use crate::search::SearchEngine;
use crate::trigger::TriggerService;
use crate::usage::{ReportPeriod, UsageTracker};

/// Everything a command needs, wired from one config.
struct Engine {
    state: AppState,
    generator: EmbeddingGenerator,
}

async fn build_engine(config: &Config) -> Result<Engine> {
    let database = Database::initialize_from_config_dir(&config.base_dir).await?;
    let usage = UsageTracker::new(database.clone(), config.usage.clone());
    let generator = EmbeddingGenerator::new(&config.provider, usage.clone())?;
    let embedder: Arc<dyn Embedder> = Arc::new(generator.clone());

    let cache = QueryCache::new(&config.cache);
    let search = SearchEngine::new(database.clone(), config.provider.dimension as usize);
    let retriever = ContextRetriever::new(
        Arc::clone(&embedder),
        search,
        cache.clone(),
        usage.clone(),
    );
    let trigger = TriggerService::new(
        database.clone(),
        embedder,
        usage.clone(),
        config.queue.clone(),
    );

    Ok(Engine {
        state: AppState {
            retriever,
            trigger,
            usage,
            cache,
            database,
        },
        generator,
    })
}

fn load_config() -> Result<Config> {
    let config_dir = get_config_dir()?;
    Ok(Config::load(&config_dir)?)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Start the HTTP API and the indexing worker pool, serving until ctrl-c.
#[inline]
pub async fn serve(port_override: Option<u16>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(port) = port_override {
        config.server.port = port;
    }

    println!("🚀 Starting context engine");

    let engine = build_engine(&config).await?;
    let state = engine.state;

    // The provider being down is not fatal at startup: queued jobs retry and
    // searches report SEARCH_FAILED until it comes back.
    match engine.generator.health_check().await {
        Ok(()) => {
            info!("Embedding provider healthy at {}", config.provider.base_url);
            println!(
                "✅ Embedding provider: {} ({})",
                config.provider.base_url, config.provider.model
            );
        }
        Err(e) => {
            warn!("Embedding provider check failed: {}", e);
            println!("⚠️  Embedding provider unavailable: {e}");
            println!("   Indexing and search will fail until it is reachable.");
        }
    }

    let recovered = state.trigger.reset_stuck_jobs().await?;
    if recovered > 0 {
        println!("♻️  Recovered {recovered} job(s) from a previous run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = state.trigger.spawn_workers(shutdown_rx);
    println!("👷 Started {} indexing worker(s)", workers.len());

    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    println!("🌐 Listening on http://{bind_address}");
    println!("Press Ctrl+C to stop");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("\n📴 Shutting down");
    let _ = shutdown_tx.send(true);
    for result in join_all(workers).await {
        if let Err(e) = result {
            warn!("Indexing worker ended abnormally: {}", e);
        }
    }

    println!("✅ Shutdown complete");
    Ok(())
}

/// Print connectivity, queue, and cache state.
#[inline]
pub async fn show_status() -> Result<()> {
    let config = load_config()?;

    println!("📊 Context Engine Status");
    println!("{}", "=".repeat(50));
    println!();

    println!("🗄️  Database:");
    let engine = match build_engine(&config).await {
        Ok(engine) => {
            println!("   ✅ SQLite: {}", config.database_path().display());
            engine
        }
        Err(e) => {
            println!("   ❌ SQLite: failed to open - {e}");
            return Ok(());
        }
    };

    match EmbeddingQueries::count_active_all(engine.state.database.pool()).await {
        Ok(count) => println!("   📄 Active embeddings: {count}"),
        Err(e) => println!("   ⚠️  Embedding count unavailable: {e}"),
    }

    println!();
    println!("🤖 Embedding Provider:");
    match engine.generator.health_check().await {
        Ok(()) => {
            println!("   ✅ Reachable: {}", config.provider.base_url);
            println!("   📋 Model: {}", config.provider.model);
            println!("   🔢 Dimension: {}", config.provider.dimension);
        }
        Err(e) => println!("   ❌ Unreachable: {e}"),
    }

    println!();
    println!("🚦 Indexing Queue:");
    match engine.state.trigger.queue_stats().await {
        Ok(stats) => {
            println!("   ⏳ Pending: {}", stats.counts.pending);
            println!("   🔄 Processing: {}", stats.counts.processing);
            println!("   ✅ Completed: {}", stats.counts.completed);
            println!("   ❌ Failed: {}", stats.counts.failed);
            if let Some(age) = stats.oldest_pending_age_seconds {
                println!("   🕰️  Oldest pending job: {age}s old");
            }
        }
        Err(e) => println!("   ⚠️  Queue stats unavailable: {e}"),
    }

    println!();
    println!("💾 Query Cache:");
    if config.cache.enabled {
        println!(
            "   ✅ Enabled: {} entries max, {}s TTL",
            config.cache.max_entries, config.cache.ttl_seconds
        );
    } else {
        println!("   💤 Disabled");
    }

    Ok(())
}

/// Run one retrieval from the command line and print the hits.
#[inline]
pub async fn run_search(
    tenant: &str,
    query: String,
    content_type: Option<ContentType>,
    top_n: Option<usize>,
    min_score: Option<f64>,
    all_types: bool,
) -> Result<()> {
    let config = load_config()?;
    let engine = build_engine(&config).await?;

    let request = ContextRequest {
        query,
        content_type,
        top_n,
        min_score,
        include_metadata: false,
    };

    let (context, breakdown) = if all_types {
        let retrieved = engine
            .state
            .retriever
            .retrieve_all_context(tenant, &request)
            .await?;
        (retrieved.context, Some(retrieved.breakdown))
    } else {
        let retrieved = engine
            .state
            .retriever
            .retrieve_context(tenant, &request)
            .await?;
        (retrieved, None)
    };

    let source = if context.cached { "cache" } else { "search" };
    println!(
        "🔍 {} result(s) in {}ms via {source}",
        context.total, context.retrieval_time_ms
    );

    for (rank, result) in context.results.iter().enumerate() {
        println!(
            "  {}. [{}] {} (score {:.2})",
            rank + 1,
            result.content_type.as_str(),
            result.title,
            result.confidence
        );
        if !result.snippet.is_empty() {
            println!("     {}", result.snippet);
        }
    }

    if let Some(breakdown) = breakdown {
        println!();
        println!("By content type:");
        for (content_type, count) in &breakdown {
            println!("  {}: {}", content_type.as_str(), count);
        }
    }

    Ok(())
}

/// Print a tenant's usage report for the given window.
#[inline]
pub async fn usage_report(tenant: &str, period: &str) -> Result<()> {
    let period: ReportPeriod = period.parse()?;
    let config = load_config()?;
    let engine = build_engine(&config).await?;

    let report = engine.state.usage.report(tenant, period).await?;

    println!("📈 Usage for {} over the last {}", tenant, report.period);
    println!("{}", "=".repeat(50));
    println!("  Operations: {}", report.summary.total_operations);
    println!(
        "  Success rate: {:.1}%",
        report.summary.success_rate * 100.0
    );
    println!("  Tokens: {}", report.summary.total_tokens);
    println!("  API calls: {}", report.summary.total_api_calls);
    println!("  Avg duration: {:.1}ms", report.summary.avg_duration_ms);

    if !report.operations.is_empty() {
        println!();
        println!("By operation:");
        for (operation, usage) in &report.operations {
            println!(
                "  {}: {} ({} ok, {} tokens)",
                operation, usage.operations, usage.successful, usage.tokens
            );
        }
    }

    for alert in &report.alerts {
        println!();
        println!("⚠️  {}", alert.message);
    }

    Ok(())
}

/// Requeue failed indexing jobs, optionally for a single tenant.
#[inline]
pub async fn retry_jobs(tenant: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let engine = build_engine(&config).await?;

    let requeued = engine.state.trigger.retry_failed_jobs(tenant).await?;
    if requeued == 0 {
        println!("No failed jobs to retry.");
    } else {
        println!("♻️  Requeued {requeued} job(s)");
        println!("Start 'serve' to process them.");
    }

    Ok(())
}

/// Purge finished jobs and compact the database.
#[inline]
pub async fn cleanup(older_than_hours: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let engine = build_engine(&config).await?;

    let purged = engine
        .state
        .trigger
        .cleanup_completed_jobs(older_than_hours)
        .await?;
    println!("🧹 Purged {purged} finished job(s)");

    engine.state.database.optimize().await?;
    println!("✅ Database compacted");

    Ok(())
}

/// Print the resolved configuration and where it came from.
#[inline]
pub fn show_config() -> Result<()> {
    let config = load_config()?;

    println!("📋 Configuration: {}", config.config_file_path().display());
    if !config.config_file_path().exists() {
        println!("   (file missing, showing defaults)");
    }
    println!();

    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{rendered}");

    Ok(())
}
