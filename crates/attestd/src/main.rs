//! attestd: content-integrity hashing for preserved trees
//!
//! Usage:
//!   attestd [--config /etc/attest/config.toml] <command>
//!
//! Commands:
//!   verify <root>       - compare fresh digests with the stored ones
//!   hash <root>         - block-hash a tree on the deadline scheduler
//!   config show         - print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prometheus_client::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

use attest_core::config::AttestConfig;
use attest_hash::{
    parse_algorithms, Algorithm, BlockHasher, HashBlock, LocalHashResult, LocalVerifier,
    PatternSubstance, SampledBlockHasher, Sampler, TreeHasher,
};
use attest_sched::{HashOutcome, HashRequest, HashScheduler, SystemClock};
use attest_store::{ContentStore, DirStore};

/// Length of a generated poll nonce
const NONCE_LEN: usize = 20;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "attestd", version, about = "attest content-integrity hashing")]
struct Cli {
    /// Path to attest.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "ATTEST_CONFIG",
        default_value = "/etc/attest/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ATTEST_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "ATTEST_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check every stored version against its recorded digest
    Verify {
        /// Root directory of the tree
        root: PathBuf,
        /// Print every event as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Hash the newest versions of a tree on the scheduler and print the digests
    Hash {
        /// Root directory of the tree
        root: PathBuf,
        /// Hash roughly one resource in N (default: sampler.default_modulus)
        #[arg(long)]
        sample_modulus: Option<i64>,
        /// Poll nonce as hex (default: random)
        #[arg(long)]
        nonce: Option<String>,
        /// Deadline in seconds (default: twice the estimate plus one second)
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Print blocks as JSON lines
        #[arg(long)]
        json: bool,
        /// Dump scheduler metrics in Prometheus text format afterwards
        #[arg(long)]
        metrics: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "attestd starting"
    );

    let config = AttestConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    match cli.command {
        Commands::Verify { root, json } => cmd_verify(&config, &root, json).await,
        Commands::Hash {
            root,
            sample_modulus,
            nonce,
            deadline_secs,
            json,
            metrics,
        } => {
            let opts = HashOptions {
                sample_modulus,
                nonce,
                deadline: deadline_secs.map(Duration::from_secs),
            };
            cmd_hash(&config, &root, &opts, json, metrics).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so command output on stdout stays parseable.
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn open_store(root: &Path) -> Result<Arc<dyn ContentStore>> {
    let store = DirStore::open(root).with_context(|| format!("opening tree: {}", root.display()))?;
    Ok(Arc::new(store))
}

// ── `attestd verify` ─────────────────────────────────────────────────────────

async fn cmd_verify(config: &AttestConfig, root: &Path, json: bool) -> Result<()> {
    let store = open_store(root)?;
    let tree = store.tree_id().to_string();
    let verifier = LocalVerifier::new(store, &config.verify, config.hasher.step_bytes)
        .context("configuring verifier")?;

    info!(tree = %tree, algorithm = %verifier.algorithm(), "verifying tree");
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        verifier.run(|event| {
            if json {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("encoding event: {e}"),
                }
            }
        })
    })
    .await
    .context("verify task panicked")?
    .context("verifying tree")?;

    info!(
        tree = %tree,
        elapsed_ms = started.elapsed().as_millis() as u64,
        clean = result.is_clean(),
        "verification finished"
    );

    if json {
        println!("{}", serde_json::to_string(&result).context("encoding summary")?);
    } else {
        print_verify_summary(&tree, &result);
    }

    if !result.is_clean() {
        anyhow::bail!(
            "{tree}: {} mismatched, {} missing content, {} errors",
            result.mismatched,
            result.no_content,
            result.errors
        );
    }
    Ok(())
}

fn print_verify_summary(tree: &str, result: &LocalHashResult) {
    println!("Tree:            {tree}");
    println!("Resources:       {}", result.resources);
    println!("Matching:        {}", result.matching);
    println!("Newly hashed:    {}", result.newly_hashed);
    println!("Rebaselined:     {}", result.obsolete_ok);
    println!("Mismatched:      {}", result.mismatched);
    println!("Missing content: {}", result.no_content);
    println!("Errors:          {}", result.errors);
    println!("Bytes hashed:    {}", result.bytes_hashed);
}

// ── `attestd hash` ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct HashOptions {
    sample_modulus: Option<i64>,
    nonce: Option<String>,
    deadline: Option<Duration>,
}

struct HashReport {
    outcome: HashOutcome,
    blocks: Vec<HashBlock>,
    algorithms: Vec<Algorithm>,
    /// Set when only a sample of the tree was hashed
    nonce: Option<Vec<u8>>,
}

async fn cmd_hash(
    config: &AttestConfig,
    root: &Path,
    opts: &HashOptions,
    json: bool,
    metrics: bool,
) -> Result<()> {
    let sched = HashScheduler::new(config.scheduler.clone(), Arc::new(SystemClock));
    let mut registry = Registry::default();
    sched.metrics().register(&mut registry);

    let report = hash_tree(&sched, config, root, opts).await;
    sched.stop();
    let report = report?;

    if let Some(nonce) = &report.nonce {
        println!("# sample nonce {}", hex::encode(nonce));
    }
    for block in &report.blocks {
        if json {
            println!("{}", serde_json::to_string(block).context("encoding block")?);
        } else {
            print_block(block, &report.algorithms);
        }
    }
    info!(
        tree = %report.outcome.tree_id,
        blocks = report.blocks.len(),
        bytes = report.outcome.bytes_hashed,
        elapsed_ms = report.outcome.time_used.as_millis() as u64,
        "hash finished"
    );

    if metrics {
        let mut body = String::new();
        prometheus_client::encoding::text::encode(&mut body, &registry)
            .context("encoding metrics")?;
        print!("{body}");
    }
    Ok(())
}

async fn hash_tree(
    sched: &HashScheduler,
    config: &AttestConfig,
    root: &Path,
    opts: &HashOptions,
) -> Result<HashReport> {
    let store = open_store(root)?;
    let algorithms = parse_algorithms(&config.hasher.algorithms).context("hasher.algorithms")?;

    let blocks = Arc::new(Mutex::new(Vec::new()));
    let sink = blocks.clone();
    let builder = BlockHasher::builder(store)
        .config(&config.hasher)
        .context("configuring block hasher")?
        .on_block(move |block| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(block)
        });

    let modulus = opts
        .sample_modulus
        .unwrap_or(config.sampler.default_modulus);
    let (engine, nonce): (Box<dyn TreeHasher>, _) = if modulus > 1 {
        let nonce = match &opts.nonce {
            Some(text) => parse_nonce(text)?,
            None => rand::random::<[u8; NONCE_LEN]>().to_vec(),
        };
        let sampler = Sampler::from_config(&config.sampler, &nonce, Some(modulus))
            .context("configuring sampler")?;
        let substance =
            PatternSubstance::from_config(&config.sampler).context("sampler.substance_patterns")?;
        let hasher = SampledBlockHasher::new(builder, sampler, substance)?;
        (Box::new(hasher), Some(nonce))
    } else {
        (Box::new(builder.build()?), None)
    };

    sched.start().context("starting hash worker")?;

    let estimate = sched.estimate_duration(engine.estimated_payload_bytes());
    let window = match opts.deadline {
        Some(window) => window,
        None => default_deadline(estimate)
            .with_context(|| format!("estimate of {estimate:?} leaves no usable deadline"))?,
    };
    let Some(deadline) = Instant::now().checked_add(window) else {
        bail!("deadline of {window:?} is out of range");
    };
    let (tx, rx) = tokio::sync::oneshot::channel();
    let request = HashRequest::new(engine, deadline, move |outcome| {
        let _ = tx.send(outcome);
    })
    .with_estimate(estimate);

    let job = sched
        .schedule_hash(request)
        .map_err(|rejected| anyhow::anyhow!("{rejected}"))?;
    info!(job = %job, estimate_ms = estimate.as_millis() as u64, "waiting for hash");

    let outcome = rx.await.context("scheduler dropped the job")?;
    if let Some(err) = &outcome.error {
        anyhow::bail!("hashing {}: {err}", outcome.tree_id);
    }

    let blocks = std::mem::take(&mut *blocks.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(HashReport {
        outcome,
        blocks,
        algorithms,
        nonce,
    })
}

/// Twice the estimate plus a second; `None` if that overflows.
fn default_deadline(estimate: Duration) -> Option<Duration> {
    estimate
        .checked_mul(2)
        .and_then(|d| d.checked_add(Duration::from_secs(1)))
}

fn parse_nonce(text: &str) -> Result<Vec<u8>> {
    let nonce = hex::decode(text.trim()).with_context(|| format!("nonce is not hex: {text}"))?;
    if nonce.is_empty() {
        anyhow::bail!("nonce must not be empty");
    }
    Ok(nonce)
}

fn print_block(block: &HashBlock, algorithms: &[Algorithm]) {
    println!("{}", block.resource());
    for v in block.versions() {
        match &v.error {
            Some(err) => println!("  v{:<4} error: {err}", v.version),
            None => {
                let digests: Vec<String> = algorithms
                    .iter()
                    .zip(&v.digests)
                    .map(|(alg, d)| format!("{alg}:{}", hex::encode(d)))
                    .collect();
                println!(
                    "  v{:<4} {:>10} bytes  {}",
                    v.version,
                    v.filtered_length,
                    digests.join(" ")
                );
            }
        }
    }
}

// ── `attestd config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &AttestConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = config
        .to_toml_string()
        .context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_hash::digest_bytes;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (rel, body) in [
            ("site/index.html/1", "<html>old</html>"),
            ("site/index.html/2", "<html>new</html>"),
            ("site/paper.pdf/1", "%PDF-1.4"),
        ] {
            let path = tmp.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        tmp
    }

    #[test]
    fn nonce_parsing() {
        assert_eq!(parse_nonce("00ff").unwrap(), vec![0x00, 0xff]);
        assert!(parse_nonce("xyz").is_err());
        assert!(parse_nonce("").is_err());
    }

    #[test]
    fn deadline_leaves_headroom() {
        assert_eq!(
            default_deadline(Duration::from_millis(250)),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(default_deadline(Duration::MAX), None);
    }

    #[tokio::test]
    async fn hash_tree_returns_current_versions() {
        let tmp = tree();
        let config = AttestConfig::default();
        let sched = HashScheduler::new(config.scheduler.clone(), Arc::new(SystemClock));

        let report = hash_tree(&sched, &config, tmp.path(), &HashOptions::default())
            .await
            .unwrap();
        sched.stop();

        assert!(report.nonce.is_none());
        assert_eq!(report.blocks.len(), 2);
        let index = report
            .blocks
            .iter()
            .find(|b| b.resource().as_str() == "site/index.html")
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.current().unwrap().digest(0).unwrap(),
            digest_bytes(Algorithm::Sha1, b"<html>new</html>").as_slice()
        );
    }

    #[tokio::test]
    async fn sampled_hash_reports_nonce() {
        let tmp = tree();
        let config = AttestConfig::default();
        let sched = HashScheduler::new(config.scheduler.clone(), Arc::new(SystemClock));
        let opts = HashOptions {
            sample_modulus: Some(2),
            nonce: Some("c0ffee".into()),
            deadline: Some(Duration::from_secs(30)),
        };

        let report = hash_tree(&sched, &config, tmp.path(), &opts).await.unwrap();
        sched.stop();

        assert_eq!(report.nonce, Some(vec![0xc0, 0xff, 0xee]));
        assert!(report.blocks.len() <= 2);
        assert!(report.outcome.is_ok());
    }

    #[tokio::test]
    async fn out_of_range_deadline_is_an_error() {
        let tmp = tree();
        let config = AttestConfig::default();
        let sched = HashScheduler::new(config.scheduler.clone(), Arc::new(SystemClock));
        let opts = HashOptions {
            deadline: Some(Duration::MAX),
            ..HashOptions::default()
        };

        let err = hash_tree(&sched, &config, tmp.path(), &opts).await.err().unwrap();
        sched.stop();
        assert!(err.to_string().contains("out of range"));
        assert!(sched.pending().is_empty());
    }

    #[test]
    fn rendered_config_parses_back() {
        let rendered = AttestConfig::default().to_toml_string().unwrap();
        let parsed = AttestConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.scheduler.steps_per_quantum, 10);
    }
}
