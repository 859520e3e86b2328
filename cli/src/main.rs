//! Command-line front end for exemplar catalogs.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use exemplar_retrieval::{
    Admission, EmbeddingProviderType, RagService, RetrievalRequest, ServiceConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "exemplar-rag")]
#[command(about = "Build and query rule-scoped exemplar catalogs", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Embedding provider, overriding the configuration
    #[arg(long, global = true, value_enum)]
    embedder: Option<EmbedderArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderArg {
    /// OpenAI-compatible embeddings endpoint
    Openai,
    /// Local feature hashing
    Hashing,
}

impl From<EmbedderArg> for EmbeddingProviderType {
    fn from(arg: EmbedderArg) -> Self {
        match arg {
            EmbedderArg::Openai => EmbeddingProviderType::OpenAI,
            EmbedderArg::Hashing => EmbeddingProviderType::Hashing,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a catalog from a knowledge base and save it
    Build {
        /// Knowledge-base JSON (defaults to the configured path)
        #[arg(short = 'k', long)]
        knowledge_base: Option<PathBuf>,

        /// Output directory (defaults to the configured catalog directory)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Retrieve exemplars for a query and print them as JSON
    Query {
        /// Catalog directory (defaults to the configured catalog directory)
        #[arg(short, long)]
        catalog: Option<PathBuf>,

        /// Rule ID to search under
        #[arg(short, long)]
        rule: String,

        /// Results per polarity
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Query text
        text: String,
    },

    /// List rules with their exemplar counts
    Rules {
        /// Catalog directory (defaults to the configured catalog directory)
        #[arg(short, long)]
        catalog: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    let service = RagService::from_config(config.clone())?;

    match cli.command {
        Command::Build {
            knowledge_base,
            out,
        } => {
            let knowledge_base = knowledge_base.unwrap_or(config.knowledge_base_path);
            let out = out.unwrap_or(config.catalog_dir);

            let rules = service
                .build(&knowledge_base)
                .await
                .with_context(|| format!("failed to build from {}", knowledge_base.display()))?;
            service
                .save(&out)
                .await
                .with_context(|| format!("failed to save catalog to {}", out.display()))?;
            info!("Wrote {rules} rules to {}", out.display());
        }
        Command::Query {
            catalog,
            rule,
            top_k,
            text,
        } => {
            load_catalog(&service, catalog.unwrap_or(config.catalog_dir)).await?;

            let mut request = RetrievalRequest::new(rule, text);
            request.top_k = top_k;
            match service.retrieve(request).await? {
                Admission::Granted(response) => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                Admission::Denied(denial) => bail!("{denial}"),
            }
        }
        Command::Rules { catalog } => {
            load_catalog(&service, catalog.unwrap_or(config.catalog_dir)).await?;
            println!("{}", serde_json::to_string_pretty(&service.rules().await?)?);
        }
    }

    Ok(())
}

async fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(embedder) = cli.embedder {
        config.embedding.provider = embedder.into();
    }
    Ok(config)
}

async fn load_catalog(service: &RagService, path: PathBuf) -> anyhow::Result<()> {
    service
        .load(&path)
        .await
        .with_context(|| format!("failed to load catalog from {}", path.display()))?;
    Ok(())
}
