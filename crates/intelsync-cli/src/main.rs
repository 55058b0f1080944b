//! intelsync: hook-facing CLI over the intelligence store.
//!
//! Every invocation is a fresh process: open the store, pull the mirror if it
//! changed, do one unit of work in a session, commit, and (for writes) export
//! the mirror again. Exit status is non-zero only when the store could not be
//! written or the session API was misused; shape and embedding problems are
//! logged and the hook carries on.

use clap::{ArgAction, Parser, Subcommand};
use intelsync::atoms::types::{composite_key, CompressionLevel, MemoryType, Trajectory};
use intelsync::engine::embedding::HashEmbedder;
use intelsync::engine::{compression, learning, state, sync};
use intelsync::{
    EngineError, EngineResult, MirrorStore, RecordStore, ReplayTarget, SchemaRegistry, Session,
    StateCarrier, StoreConfig, WarmReplayLoader,
};
use log::{error, info};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "intelsync")]
#[command(about = "Intelligence store sync for stateless hook processes", long_about = None)]
#[command(version)]
struct Cli {
    /// Project root; the store lives in <root>/.intelsync/
    #[arg(long, global = true, env = "INTELSYNC_ROOT", default_value = ".")]
    root: PathBuf,

    /// TOML config file (replaces the --root layout)
    #[arg(short, long, global = true, env = "INTELSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Embedding width for embedding-bearing collections
    #[arg(long, global = true, env = "INTELSYNC_EMBEDDING_DIM")]
    embedding_dim: Option<usize>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and write an initial mirror
    Init,

    /// Merge a document into the store (default: the mirror)
    Import {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Write every collection to a document (default: the mirror)
    Export {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Per-collection counts and the learning report
    Stats,

    /// Store a memory
    Remember {
        /// Memory type (edit, command, decision, pattern, error, general)
        #[arg(short = 't', long = "type", default_value = "general")]
        memory_type: String,

        #[arg(required = true, num_args = 1..)]
        content: Vec<String>,
    },

    /// Find memories similar to a query
    Recall {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,
    },

    /// Q-learning update for a state/action pair
    Learn {
        state: String,
        action: String,

        #[arg(short, long, allow_negative_numbers = true)]
        reward: f64,
    },

    /// Record a file edit (feeds next-file suggestions)
    FileEdit { file: String },

    /// Files most often edited after FILE
    SuggestNext {
        file: String,

        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Cross-invocation key/value state
    Kv {
        #[command(subcommand)]
        action: KvCommands,
    },

    /// Warm up from recent sealed trajectories and report
    Replay {
        #[arg(short, long)]
        depth: Option<usize>,
    },

    /// Compress consolidated neural patterns
    Compress {
        /// full, half, int8 or binary
        #[arg(short, long, default_value = "int8")]
        level: String,
    },

    /// Print a neural pattern centroid, compressed copy first
    Centroid { id: String },

    /// Extract error codes from a failed command's stderr (read from stdin when omitted)
    RecordError {
        command: String,
        stderr: Option<String>,
    },
}

#[derive(Subcommand)]
enum KvCommands {
    Get { key: String },
    Set { key: String, value: String },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn load_config(cli: &Cli) -> EngineResult<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::for_project(&cli.root),
    };
    if cli.embedding_dim.is_some() {
        config.embedding_dim = cli.embedding_dim;
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> EngineResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One write in its own session, then commit and export.
fn write_session<R>(
    store: &RecordStore,
    config: &StoreConfig,
    work: impl FnOnce(&mut Session<'_>) -> EngineResult<R>,
) -> EngineResult<R> {
    let mut session = store.begin_session()?;
    let out = work(&mut session)?;
    session.commit()?;
    sync::export_to_path(store, &config.mirror_path)?;
    Ok(out)
}

fn run(cli: Cli) -> EngineResult<()> {
    let config = load_config(&cli)?;
    let store = RecordStore::open(&config, SchemaRegistry::standard(config.embedding_dim)?)?;
    let embedder = HashEmbedder::new(config.embedding_dim.unwrap_or(HashEmbedder::DEFAULT_DIMS));

    if let Some(summary) = sync::import_if_newer(&store, &config.mirror_path)? {
        info!("Pulled {} record(s) from the mirror", summary.total_merged());
    }

    match cli.command {
        Commands::Init => {
            sync::export_to_path(&store, &config.mirror_path)?;
            println!("Store ready at {}", config.db_path.display());
        }

        Commands::Import { file } => {
            let path = file.unwrap_or_else(|| config.mirror_path.clone());
            let summary = write_session(&store, &config, |session| {
                sync::import_from_path(session, &path)
            })?;
            print_json(&summary)?;
        }

        Commands::Export { file } => {
            // Only the mirror itself moves the sync marker.
            let (doc, path) = match file {
                Some(path) => {
                    let doc = sync::snapshot(&store)?;
                    MirrorStore::write(&path, &doc)?;
                    (doc, path)
                }
                None => {
                    let doc = sync::export_to_path(&store, &config.mirror_path)?;
                    (doc, config.mirror_path.clone())
                }
            };
            println!("Exported {} record(s) to {}", doc.record_count(), path.display());
        }

        Commands::Stats => {
            print_json(&sync::summary(&store)?)?;
        }

        Commands::Remember { memory_type, content } => {
            let content = content.join(" ");
            let memory = write_session(&store, &config, |session| {
                learning::remember(session, &embedder, MemoryType::parse(&memory_type), &content)
            })?;
            println!("{}", memory.id);
        }

        Commands::Recall { query, top_k } => {
            let hits = learning::recall(&store, &embedder, &query.join(" "), top_k)?;
            for (memory, score) in hits {
                println!("{:.3}  [{:?}] {}", score, memory.memory_type, memory.content);
            }
        }

        Commands::Learn { state, action, reward } => {
            let pattern = write_session(&store, &config, |session| {
                learning::update_q(session, &state, &action, reward)
            })?;
            println!(
                "Q({}, {}) = {:.4} after {} update(s)",
                state, action, pattern.value, pattern.update_count
            );
        }

        Commands::FileEdit { file } => {
            write_session(&store, &config, |session| state::track_file_edit(session, &file))?;
        }

        Commands::SuggestNext { file, count } => {
            for seq in state::suggest_next_files(&store, &file, count)? {
                println!("{}\t{}", seq.count, seq.next_file);
            }
        }

        Commands::Kv { action: KvCommands::Get { key } } => {
            let mut session = store.begin_session()?;
            if let Some(value) = StateCarrier::new(&mut session).get(&key)? {
                println!("{}", value);
            }
        }

        Commands::Kv { action: KvCommands::Set { key, value } } => {
            write_session(&store, &config, |session| {
                StateCarrier::new(session).set(&key, &value)
            })?;
        }

        Commands::Replay { depth } => {
            let loader = match depth {
                Some(d) => WarmReplayLoader::new(d),
                None => WarmReplayLoader::from_config(&config),
            };
            let mut tally = RewardTally::default();
            let report = loader.replay(&store, &mut tally)?;
            println!("Replayed {} of {} sealed trajectories", report.ingested, report.available);
            print_json(&tally.mean_rewards())?;
        }

        Commands::Compress { level } => {
            let level = CompressionLevel::parse(&level)
                .ok_or_else(|| EngineError::Config(format!("unknown compression level '{}'", level)))?;
            let n = write_session(&store, &config, |session| {
                compression::compress_neural_patterns(session, level)
            })?;
            println!("Compressed {} pattern(s)", n);
        }

        Commands::Centroid { id } => {
            if let Some(c) = compression::load_centroid(&store, &id)? {
                let level = c.level.map_or("exact", CompressionLevel::as_str);
                println!("{}\t{}", level, c.vector.len());
                print_json(&c.vector)?;
            }
        }

        Commands::RecordError { command, stderr } => {
            let stderr = match stderr {
                Some(s) => s,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let recorded = write_session(&store, &config, |session| {
                learning::record_error(session, &command, &stderr)
            })?;
            for r in recorded {
                println!("{}\t{}\t{}", r.id, r.signature, r.occurrences);
            }
        }
    }
    Ok(())
}

/// Volatile learner for `replay`: mean step reward per state/action.
#[derive(Default)]
struct RewardTally {
    sums: BTreeMap<String, (f64, u32)>,
}

impl RewardTally {
    fn mean_rewards(&self) -> BTreeMap<String, f64> {
        self.sums
            .iter()
            .map(|(k, (sum, n))| (k.clone(), sum / f64::from(*n)))
            .collect()
    }
}

impl ReplayTarget for RewardTally {
    fn ingest(&mut self, trajectory: &Trajectory) -> EngineResult<()> {
        for step in &trajectory.steps {
            let entry = self.sums.entry(composite_key(&[&step.state, &step.action])).or_default();
            entry.0 += step.reward;
            entry.1 += 1;
        }
        Ok(())
    }
}
