use crate::service::{compose, Collaborators};
use crate::utils::format_duration;
use crate::{CaptureRequest, Config, InMemoryCreditStore, JobId, JobStatus, QueueBackend};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "capture-scheduler")]
#[command(about = "Asynchronous web capture scheduler backed by a headless Chrome pool")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Number of worker loops")]
    pub workers: Option<usize>,

    #[arg(long, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Per-attempt render timeout in seconds")]
    pub render_timeout: Option<u64>,

    #[arg(long, help = "Maximum render attempts per job")]
    pub max_attempts: Option<u32>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit capture requests from a JSON-lines file and process them
    Run {
        #[arg(short, long, help = "JSON-lines file of capture requests")]
        input: PathBuf,

        #[arg(
            long = "credits",
            value_parser = parse_credit,
            help = "Starting balance, as user=amount (repeatable)"
        )]
        credits: Vec<(String, i64)>,

        #[arg(long, help = "Directory for captured artifacts")]
        storage_dir: Option<PathBuf>,

        #[arg(long, help = "Persist the queue to this journal file")]
        journal: Option<PathBuf>,

        #[arg(long, default_value = "5", help = "Progress reporting interval in seconds")]
        progress_interval: u64,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

fn parse_credit(value: &str) -> Result<(String, i64), String> {
    let (user, amount) = value
        .split_once('=')
        .ok_or_else(|| format!("expected user=amount, got {value}"))?;
    let user = user.trim();
    if user.is_empty() {
        return Err(format!("missing user in {value}"));
    }
    let amount = amount
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("bad amount in {value}: {e}"))?;
    if amount < 0 {
        return Err(format!("negative balance in {value}"));
    }
    Ok((user.to_string(), amount))
}

/// Reads the config file if given, applies CLI overrides and validates.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config(path).await?,
        None => Config::default(),
    };

    if let Some(workers) = args.workers {
        config.worker_pool_size = workers;
    }
    if let Some(pool_size) = args.pool_size {
        config.browser_pool_size = pool_size;
    }
    if let Some(timeout) = args.render_timeout {
        config.render_timeout = Duration::from_secs(timeout);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Workers: {}, browsers: {}, render timeout: {:?}, max attempts: {}",
        config.worker_pool_size,
        config.browser_pool_size,
        config.render_timeout,
        config.max_attempts
    );

    Ok(config)
}

async fn read_config(path: &PathBuf) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub struct CliRunner {
    config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Run {
                input,
                credits,
                storage_dir,
                journal,
                progress_interval,
            } => {
                let mut config = self.config.clone();
                if let Some(dir) = storage_dir {
                    config.storage_dir = dir;
                }
                if let Some(path) = journal {
                    config.queue_backend = QueueBackend::Journal { path };
                }
                self.run_jobs(
                    config,
                    input,
                    credits,
                    Duration::from_secs(progress_interval.max(1)),
                    shutdown,
                )
                .await
            }
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    async fn run_jobs(
        &self,
        config: Config,
        input: PathBuf,
        credits: Vec<(String, i64)>,
        progress_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let requests = read_requests(&input).await?;
        info!("Loaded {} capture requests from {}", requests.len(), input.display());

        let credit_store = Arc::new(InMemoryCreditStore::new());
        for (user, amount) in credits {
            credit_store.set_balance(user, amount);
        }

        let collaborators = Collaborators::production(&config, credit_store)?;
        let poll_interval = config.poll_interval;
        let mut system = compose(config, collaborators).await?;
        system.start();

        let mut submitted: Vec<(JobId, String)> = Vec::new();
        for (line, request) in requests {
            let user = request.user_id.clone();
            match system.service.submit(request).await {
                Ok(id) => submitted.push((id, user)),
                Err(e) => println!("line {line}: rejected ({}): {e}", e.reason()),
            }
        }

        let mut progress = tokio::time::interval(progress_interval);
        let mut poll = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                Ok(()) = shutdown.recv() => {
                    warn!("Shutdown requested with jobs still pending");
                    break;
                }
                _ = progress.tick() => {
                    let stats = system.stats().await;
                    println!(
                        "Queue: {} ready, {} delayed, {} in flight, {} dead-lettered | browsers: {}/{} busy",
                        stats.queue.ready,
                        stats.queue.delayed,
                        stats.queue.in_flight,
                        stats.queue.dead_lettered,
                        stats.pool.busy,
                        stats.pool.capacity
                    );
                }
                _ = poll.tick() => {
                    let mut pending = 0;
                    for (id, user) in &submitted {
                        if !system.service.status(*id, user).await?.status.is_terminal() {
                            pending += 1;
                        }
                    }
                    if pending == 0 {
                        break;
                    }
                }
            }
        }

        let mut completed = 0;
        for (id, user) in &submitted {
            let view = system.service.status(*id, user).await?;
            match view.status {
                JobStatus::Completed => {
                    completed += 1;
                    println!(
                        "{id} completed attempts={} {}",
                        view.attempts,
                        view.result_url.unwrap_or_default()
                    );
                }
                JobStatus::Failed => println!(
                    "{id} failed attempts={} reason={} {}",
                    view.attempts,
                    view.error_reason.unwrap_or_default(),
                    view.error_message.unwrap_or_default()
                ),
                status => println!("{id} {status} attempts={}", view.attempts),
            }
        }

        let stats = system.stats().await;
        let retried: usize = stats.workers.iter().map(|worker| worker.retried_count).sum();
        println!(
            "{} of {} jobs completed, {} retries, peak browser use {}/{}",
            completed,
            submitted.len(),
            retried,
            stats.pool.peak_busy,
            stats.pool.capacity
        );

        system.shutdown().await;
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = read_config(&config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Queue backend: {:?}", config.queue_backend);
        println!("  Workers: {}", config.worker_pool_size);
        println!("  Browser pool size: {}", config.browser_pool_size);
        println!("  Render timeout: {}", format_duration(config.render_timeout));
        println!("  Max attempts: {}", config.max_attempts);
        println!("  Visibility timeout: {}", format_duration(config.visibility_timeout));
        println!(
            "  Viewport: {}x{}",
            config.viewport.width, config.viewport.height
        );

        Ok(())
    }
}

/// Parses one capture request per non-blank line, keeping line numbers.
async fn read_requests(path: &PathBuf) -> anyhow::Result<Vec<(usize, CaptureRequest)>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let mut requests = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let request: CaptureRequest = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid capture request", path.display(), index + 1))?;
        requests.push((index + 1, request));
    }

    if requests.is_empty() {
        bail!("{} contains no capture requests", path.display());
    }
    Ok(requests)
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credit() {
        assert_eq!(parse_credit("alice=10"), Ok(("alice".to_string(), 10)));
        assert_eq!(parse_credit(" bob = 3 "), Ok(("bob".to_string(), 3)));
        assert!(parse_credit("alice").is_err());
        assert!(parse_credit("=5").is_err());
        assert!(parse_credit("alice=-1").is_err());
        assert!(parse_credit("alice=ten").is_err());
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "capture-scheduler",
            "--pool-size",
            "2",
            "run",
            "--input",
            "jobs.jsonl",
            "--credits",
            "alice=10",
            "--credits",
            "bob=1",
        ])
        .unwrap();

        assert_eq!(cli.pool_size, Some(2));
        match cli.command {
            Commands::Run { input, credits, .. } => {
                assert_eq!(input, PathBuf::from("jobs.jsonl"));
                assert_eq!(credits.len(), 2);
            }
            Commands::Validate { .. } => panic!("expected run command"),
        }
    }

    #[tokio::test]
    async fn test_read_requests_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        std::fs::write(
            &path,
            "{\"user_id\":\"alice\",\"url\":\"https://example.com\"}\n\n# comment\n{\"user_id\":\"bob\",\"url\":\"https://example.org\",\"options\":{\"format\":\"jpeg\"}}\n",
        )
        .unwrap();

        let requests = read_requests(&path).await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, 1);
        assert_eq!(requests[1].0, 4);
        assert_eq!(requests[1].1.user_id, "bob");
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"browser_pool_size": 0}"#).unwrap();

        let runner = CliRunner::new(Config::default());
        assert!(runner.validate_config(path).await.is_err());
    }
}
