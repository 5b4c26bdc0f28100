use clap::{Parser, Subcommand};
use context_engine::Result;
use context_engine::commands::{
    cleanup, retry_jobs, run_search, serve, show_config, show_status, usage_report,
};
use context_engine::content::ContentType;

#[derive(Parser)]
#[command(name = "context-engine")]
#[command(about = "Multi-tenant retrieval-augmented context engine for AI chat and voice agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server and the indexing worker pool
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show connectivity, queue, and cache status
    Status,
    /// Run a retrieval query against a tenant's indexed content
    Search {
        /// Tenant whose content to search
        tenant: String,
        /// Natural language query
        query: String,
        /// Restrict results to one content type (menu, policy, faq, business)
        #[arg(long)]
        content_type: Option<ContentType>,
        /// Maximum number of results (1-20)
        #[arg(long)]
        top_n: Option<usize>,
        /// Minimum similarity score (0.0-1.0)
        #[arg(long)]
        min_score: Option<f64>,
        /// Search every content type and show a per-type breakdown
        #[arg(long)]
        all: bool,
    },
    /// Show a tenant's usage report
    Usage {
        /// Tenant to report on
        tenant: String,
        /// Report window: day, week, or month
        #[arg(long, default_value = "day")]
        period: String,
    },
    /// Requeue failed indexing jobs
    RetryJobs {
        /// Only retry jobs belonging to this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Purge finished jobs and compact the database
    Cleanup {
        /// Purge jobs that finished more than this many hours ago
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            serve(port).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Search {
            tenant,
            query,
            content_type,
            top_n,
            min_score,
            all,
        } => {
            run_search(&tenant, query, content_type, top_n, min_score, all).await?;
        }
        Commands::Usage { tenant, period } => {
            usage_report(&tenant, &period).await?;
        }
        Commands::RetryJobs { tenant } => {
            retry_jobs(tenant.as_deref()).await?;
        }
        Commands::Cleanup { older_than_hours } => {
            cleanup(older_than_hours).await?;
        }
        Commands::Config => {
            show_config()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["context-engine", "status"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            matches!(parsed.command, Commands::Status);
        }
    }

    #[test]
    fn serve_with_port_override() {
        let cli = Cli::try_parse_from(["context-engine", "serve", "--port", "9090"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Serve { port } = parsed.command {
                assert_eq!(port, Some(9090));
            }
        }
    }

    #[test]
    fn search_command_basics() {
        let cli = Cli::try_parse_from(["context-engine", "search", "tenant-1", "gluten free"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Search {
                tenant,
                query,
                content_type,
                all,
                ..
            } = parsed.command
            {
                assert_eq!(tenant, "tenant-1");
                assert_eq!(query, "gluten free");
                assert_eq!(content_type, None);
                assert!(!all);
            }
        }
    }

    #[test]
    fn search_command_with_filters() {
        let cli = Cli::try_parse_from([
            "context-engine",
            "search",
            "tenant-1",
            "refund policy",
            "--content-type",
            "policy",
            "--top-n",
            "3",
            "--min-score",
            "0.8",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Search {
                content_type,
                top_n,
                min_score,
                ..
            } = parsed.command
            {
                assert_eq!(content_type, Some(ContentType::Policy));
                assert_eq!(top_n, Some(3));
                assert_eq!(min_score, Some(0.8));
            }
        }
    }

    #[test]
    fn search_rejects_unknown_content_type() {
        let cli = Cli::try_parse_from([
            "context-engine",
            "search",
            "tenant-1",
            "anything",
            "--content-type",
            "recipes",
        ]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn usage_defaults_to_daily_period() {
        let cli = Cli::try_parse_from(["context-engine", "usage", "tenant-1"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Usage { tenant, period } = parsed.command {
                assert_eq!(tenant, "tenant-1");
                assert_eq!(period, "day");
            }
        }
    }

    #[test]
    fn retry_jobs_accepts_tenant_filter() {
        let cli = Cli::try_parse_from(["context-engine", "retry-jobs", "--tenant", "tenant-1"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::RetryJobs { tenant } = parsed.command {
                assert_eq!(tenant, Some("tenant-1".to_string()));
            }
        }
    }

    #[test]
    fn cleanup_age_flag() {
        let cli = Cli::try_parse_from(["context-engine", "cleanup", "--older-than-hours", "48"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Cleanup { older_than_hours } = parsed.command {
                assert_eq!(older_than_hours, Some(48));
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["context-engine", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["context-engine", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
