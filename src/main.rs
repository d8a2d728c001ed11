//! # opensrc CLI
//!
//! The primary mode is `opensrc serve`, the MCP server an agent connects
//! to over stdio. The remaining commands are shell conveniences over the
//! same core: fetch and index a source, list the registry, run a one-off
//! semantic search, and remove sources.
//!
//! ```bash
//! opensrc serve                      # stdio MCP server
//! opensrc fetch zod github:BurntSushi/ripgrep
//! opensrc list
//! opensrc search "parse and validate a schema" --source zod
//! opensrc remove zod
//! opensrc clean --repos
//! ```
//!
//! State lives under `$OPENSRC_DIR`, `$XDG_DATA_HOME/opensrc`, or
//! `~/.local/share/opensrc`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use opensrc::app::{App, CleanFilter};
use opensrc::config;
use opensrc::embedder::LocalEmbedder;
use opensrc::logging::Logger;
use opensrc::query::{self, SemanticOutcome, SemanticParams};
use opensrc::server;

#[derive(Parser)]
#[command(
    name = "opensrc",
    about = "Fetch third-party source code and query it with grep, AST patterns, and semantic search",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server on stdin/stdout.
    ///
    /// Exposes a single `execute` tool that runs agent-supplied Lua
    /// scripts against the query API. This is the mode editors and
    /// agents connect to.
    Serve,

    /// Fetch one or more sources and index them.
    ///
    /// Accepts package specs (`zod`, `npm:react@18.2.0`, `pip:flask`,
    /// `crates:serde`) and repositories (`owner/repo`,
    /// `github:owner/repo@ref`, `gitlab:owner/repo`). Waits for indexing
    /// to finish before exiting.
    Fetch {
        /// Fetch specs.
        specs: Vec<String>,

        /// Re-fetch sources that already exist, replacing them in place.
        #[arg(long)]
        modify: bool,
    },

    /// List registered sources.
    List,

    /// One-shot semantic search over indexed sources.
    Search {
        /// The query text.
        query: String,

        /// Restrict to one source.
        #[arg(long)]
        source: Option<String>,

        /// Number of results.
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },

    /// Remove sources by name.
    Remove {
        names: Vec<String>,
    },

    /// Remove whole categories of sources.
    Clean {
        /// Remove all registry packages.
        #[arg(long)]
        packages: bool,
        /// Remove all repositories.
        #[arg(long)]
        repos: bool,
        /// Remove npm packages only.
        #[arg(long)]
        npm: bool,
        /// Remove PyPI packages only.
        #[arg(long)]
        pypi: bool,
        /// Remove crates.io packages only.
        #[arg(long)]
        crates: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_root = config::data_root()?;
    let config = config::load_config(&data_root)?;

    let logger = if matches!(cli.command, Commands::Serve) {
        Arc::new(Logger::open(&config.log_path()))
    } else {
        Arc::new(Logger::stderr_only())
    };

    let embedder = Arc::new(LocalEmbedder::new(config.max_embed_chars));
    let app = App::init(config, logger, embedder)?;

    match cli.command {
        Commands::Serve => server::serve(app).await,
        Commands::Fetch { specs, modify } => run_fetch(&app, &specs, modify).await,
        Commands::List => run_list(&app),
        Commands::Search {
            query,
            source,
            top_k,
        } => run_search(&app, &query, source, top_k).await,
        Commands::Remove { names } => {
            let removed = app.remove(&names).await?;
            println!("removed: {}", removed.join(", "));
            Ok(())
        }
        Commands::Clean {
            packages,
            repos,
            npm,
            pypi,
            crates,
        } => {
            let removed = app
                .clean(CleanFilter {
                    packages,
                    repos,
                    npm,
                    pypi,
                    crates,
                })
                .await?;
            println!("removed: {}", removed.join(", "));
            Ok(())
        }
    }
}

async fn run_fetch(app: &Arc<App>, specs: &[String], modify: bool) -> Result<()> {
    if specs.is_empty() {
        anyhow::bail!("No fetch specs given");
    }

    let results = app.fetch(specs, modify).await;
    for result in &results {
        match (&result.error, result.already_existed) {
            (Some(e), _) => println!("{}: error: {}", result.name, e),
            (None, true) => println!("{}: already fetched ({})", result.name, result.path),
            (None, false) => println!("{}: fetched to {}", result.name, result.path),
        }
    }

    // Indexing runs in the background; hold the process open until the
    // queue drains.
    while app.engine.any_pending() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let ok = results.iter().filter(|r| r.error.is_none()).count();
    println!("ok ({}/{} specs)", ok, results.len());
    Ok(())
}

fn run_list(app: &Arc<App>) -> Result<()> {
    let sources = app.registry.list();
    if sources.is_empty() {
        println!("No sources fetched.");
        return Ok(());
    }

    println!("{:<8} {:<40} {:<16} PATH", "TYPE", "NAME", "VERSION");
    for source in sources {
        println!(
            "{:<8} {:<40} {:<16} {}",
            source.kind.as_str(),
            source.name,
            source.version,
            source.path.display()
        );
    }
    Ok(())
}

async fn run_search(
    app: &Arc<App>,
    query_text: &str,
    source: Option<String>,
    top_k: usize,
) -> Result<()> {
    let params = SemanticParams {
        sources: source.map(|s| vec![s]),
        top_k: Some(top_k),
    };
    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        query_text,
        &params,
    )
    .await?;

    match outcome {
        SemanticOutcome::NotReady { error, sources } => {
            println!("{}: {}", error, sources.join(", "));
        }
        SemanticOutcome::Results(results) => {
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} {}:{}-{} ({} {})",
                    i + 1,
                    r.score,
                    r.source,
                    r.file,
                    r.start_line,
                    r.end_line,
                    r.kind.as_str(),
                    r.identifier
                );
            }
        }
    }
    Ok(())
}
