use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use finrag_core::read_documents;
use finrag_rag::{
    EmbeddingClient, FilingRetriever, LlmClient, LlmProvider, MetadataFilter, QueryOrchestrator,
    RagConfig, RetrievalResult, SystemClock,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG: &str = "finrag.toml";

#[derive(Parser, Debug)]
#[command(name = "finrag", version = VERSION, about = "Question answering over indexed 10-K filings")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `[store] db_path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    collection: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and store a JSONL file of filing documents.
    Ingest { input: PathBuf },
    /// Answer a question using the reasoning service and retrieval tools.
    Query {
        question: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long = "no-enhance", action = ArgAction::SetTrue)]
        no_enhance: bool,
    },
    /// Nearest indexed passages for a query.
    Search {
        query: String,
        #[arg(short = 'k', long)]
        k: Option<usize>,
        #[arg(long)]
        ticker: Option<String>,
        /// Only passages from filings dated `YYYY-MM-DD`.
        #[arg(long = "filing-date")]
        filing_date: Option<String>,
        /// Only passages from this source file.
        #[arg(long = "source-ref")]
        source_ref: Option<String>,
        #[arg(long = "chunk-index")]
        chunk_index: Option<usize>,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    Count,
    Clear,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = load_config(&config_path)?;
    if let Some(db) = &cli.db {
        config.store.db_path = db.display().to_string();
    }
    if let Some(collection) = &cli.collection {
        config.store.collection = collection.clone();
    }

    match cli.command {
        Commands::Ingest { input } => {
            let file = File::open(&input)
                .with_context(|| format!("failed to open {}", input.display()))?;
            let documents = read_documents(BufReader::new(file))
                .with_context(|| format!("failed to parse documents in {}", input.display()))?;
            if documents.is_empty() {
                bail!("no documents found in {}", input.display());
            }
            let retriever = open_retriever(&config)?;
            let chunks = retriever.add_documents(&documents)?;
            println!(
                "[finrag] Indexed {} chunks from {} documents into '{}' ({} total)",
                chunks,
                documents.len(),
                config.store.collection,
                retriever.count()
            );
        }
        Commands::Query {
            question,
            provider,
            model,
            no_enhance,
        } => {
            if let Some(provider) = provider {
                config.agent.provider = provider;
            }
            if model.is_some() {
                config.agent.model = model;
            }
            if no_enhance {
                config.agent.enhance_queries = false;
            }
            let retriever = open_retriever(&config)?;
            let llm = build_llm_client(&config)?;
            let orchestrator =
                QueryOrchestrator::new(retriever, Arc::new(llm), Arc::new(SystemClock), &config.agent);
            println!("{}", orchestrator.query(&question));
        }
        Commands::Search {
            query,
            k,
            ticker,
            filing_date,
            source_ref,
            chunk_index,
            json,
        } => {
            let retriever = open_retriever(&config)?;
            let filter = search_filter(ticker, filing_date, source_ref, chunk_index);
            let results = retriever.search_filtered(&query, k, &filter);
            if json {
                let rows: Vec<_> = results.iter().map(result_json).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_results(&results);
            }
        }
        Commands::Count => {
            let retriever = open_retriever(&config)?;
            println!(
                "[finrag] Collection '{}' holds {} chunks",
                config.store.collection,
                retriever.count()
            );
        }
        Commands::Clear => {
            let retriever = open_retriever(&config)?;
            retriever.clear()?;
            println!("[finrag] Cleared collection '{}'", config.store.collection);
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: &Path) -> Result<RagConfig> {
    let mut config = if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        RagConfig::from_toml_str(&contents).map_err(|e| anyhow!("invalid config: {e}"))?
    } else {
        RagConfig::default()
    };
    config.apply_env();
    Ok(config)
}

fn open_retriever(config: &RagConfig) -> Result<FilingRetriever> {
    let embedder = EmbeddingClient::from_env()?;
    info!(backend = embedder.backend_name(), db = %config.store.db_path, "opening vector index");
    FilingRetriever::from_config(config, Arc::new(embedder), Arc::new(SystemClock))
        .with_context(|| format!("failed to open index at {}", config.store.db_path))
}

fn build_llm_client(config: &RagConfig) -> Result<LlmClient> {
    let provider: LlmProvider = config.agent.provider()?;
    let model = config.agent.model_for(provider);
    let client = LlmClient::new(provider, model)?.with_max_steps(config.agent.max_steps);
    info!(provider = provider.as_str(), model = client.model(), "reasoning service ready");
    Ok(client)
}

fn search_filter(
    ticker: Option<String>,
    filing_date: Option<String>,
    source_ref: Option<String>,
    chunk_index: Option<usize>,
) -> MetadataFilter {
    let mut filter = ticker.map(MetadataFilter::ticker).unwrap_or_default();
    if let Some(filing_date) = filing_date {
        filter = filter.with_filing_date(filing_date);
    }
    if let Some(source_ref) = source_ref {
        filter = filter.with_source_ref(source_ref);
    }
    if let Some(chunk_index) = chunk_index {
        filter = filter.with_chunk_index(chunk_index);
    }
    filter
}

fn result_json(result: &RetrievalResult) -> serde_json::Value {
    json!({
        "content": result.content,
        "score": result.score,
        "ticker": result.metadata.ticker,
        "filing_date": result.metadata.filing_date,
        "source_ref": result.metadata.source_ref,
        "chunk_index": result.metadata.chunk_index,
    })
}

fn print_results(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("[finrag] No matching passages");
        return;
    }
    for (idx, result) in results.iter().enumerate() {
        println!(
            "#{} {} {} {} chunk={} distance={:.4}",
            idx + 1,
            result.metadata.ticker,
            result.metadata.filing_date,
            result.metadata.source_ref,
            result.metadata.chunk_index,
            result.score
        );
        println!("{}\n", result.content.trim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_flags_build_one_filter() {
        let filter = search_filter(
            Some("AAPL".into()),
            Some("2022-10-28".into()),
            Some("aapl_10k.txt".into()),
            Some(3),
        );
        assert_eq!(
            filter,
            MetadataFilter::ticker("AAPL")
                .with_filing_date("2022-10-28")
                .with_source_ref("aapl_10k.txt")
                .with_chunk_index(3)
        );
        assert_eq!(search_filter(None, None, None, None), MetadataFilter::default());
    }

    #[test]
    fn search_accepts_metadata_flags() {
        let cli = Cli::parse_from([
            "finrag",
            "search",
            "revenue",
            "--filing-date",
            "2022-07-30",
            "--source-ref",
            "msft_10k.txt",
        ]);
        match cli.command {
            Commands::Search {
                filing_date,
                source_ref,
                ticker,
                ..
            } => {
                assert_eq!(filing_date.as_deref(), Some("2022-07-30"));
                assert_eq!(source_ref.as_deref(), Some("msft_10k.txt"));
                assert!(ticker.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
