use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use lookup_core::moderation::items_from_tweets;
use lookup_core::{
    load_lookup_config, AggregatedReport, BrowserLauncher, CancellationFlag, CaptureOptions,
    CaptureRequest, ChannelSink, DeviceTarget, FileCookieStore, HttpChatModel, LookupConfig,
    ModerationPipeline, Platform, PoolFingerprintGenerator, RecordMap, ReqwestFetcher,
    ScraperDeps, ScraperRegistry, ScraperStatus, TaskRunner, TaskSummary,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] lookup_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("capture error: {0}")]
    Capture(#[from] lookup_core::CaptureError),
    #[error("moderation error: {0}")]
    Moderation(#[from] lookup_core::ModerationError),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Social profile lookup and capture", long_about = None)]
pub struct Cli {
    /// Path to lookup.toml
    #[arg(long, default_value = "configs/lookup.toml")]
    pub config: PathBuf,
    /// Override for paths.result_dir
    #[arg(long)]
    pub result_dir: Option<PathBuf>,
    /// Output format of the final summary
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture one or more profiles, streaming progress events as JSON lines
    Capture(CaptureArgs),
    /// Score a saved tweets.json collection
    Moderate(ModerateArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    Desktop,
    Mobile,
}

impl From<DeviceArg> for DeviceTarget {
    fn from(device: DeviceArg) -> Self {
        match device {
            DeviceArg::Desktop => DeviceTarget::Desktop,
            DeviceArg::Mobile => DeviceTarget::Mobile,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct CaptureArgs {
    #[arg(long)]
    pub twitter: Option<String>,
    #[arg(long)]
    pub telegram: Option<String>,
    #[arg(long)]
    pub instagram: Option<String>,
    #[arg(long)]
    pub facebook: Option<String>,
    /// Phone number, digits only or formatted
    #[arg(long)]
    pub whatsapp: Option<String>,
    /// Devices to capture on (repeatable); defaults to the configured set
    #[arg(long = "device", value_enum)]
    pub devices: Vec<DeviceArg>,
    /// Follow @-mentions found in profile descriptions
    #[arg(long, default_value_t = false)]
    pub in_depth: bool,
    /// Screenshots only: no JSON records, no profile fetches
    #[arg(long, default_value_t = false)]
    pub screenshots_only: bool,
}

impl CaptureArgs {
    pub fn request(&self) -> Result<CaptureRequest> {
        let options = CaptureOptions {
            store_api_responses: !self.screenshots_only,
            in_depth: self.in_depth,
            device_targets: self.devices.iter().copied().map(DeviceTarget::from).collect(),
        };
        let mut request = CaptureRequest::new(options);
        let requested = [
            (Platform::Twitter, &self.twitter),
            (Platform::Telegram, &self.telegram),
            (Platform::Instagram, &self.instagram),
            (Platform::Facebook, &self.facebook),
            (Platform::Whatsapp, &self.whatsapp),
        ];
        for (platform, identity) in requested {
            if let Some(identity) = identity.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
                request = request.with(platform, identity);
            }
        }
        if request.inputs.is_empty() {
            return Err(AppError::InvalidArguments(
                "no profile requested; pass at least one of --twitter/--telegram/--instagram/--facebook/--whatsapp".into(),
            ));
        }
        Ok(request)
    }
}

#[derive(Args, Debug)]
pub struct ModerateArgs {
    /// tweets.json written by a previous capture
    #[arg(long)]
    pub records: PathBuf,
}

/// Logs go to stderr; stdout carries the event stream and the summary.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "lookupctl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Capture(args) => {
            let summary = context.capture(args).await?;
            render(&summary, cli.format)?;
        }
        Commands::Moderate(args) => {
            let report = context.moderate(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: Arc<LookupConfig>,
    result_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_lookup_config(&cli.config)?;
        let result_dir = cli
            .result_dir
            .clone()
            .unwrap_or_else(|| config.result_dir());
        Ok(Self {
            config: Arc::new(config),
            result_dir,
        })
    }

    fn fetcher(&self) -> Result<Arc<ReqwestFetcher>> {
        Ok(Arc::new(ReqwestFetcher::new(self.config.api.request_timeout())?))
    }

    /// `None` when moderation is disabled or no API key is available.
    fn moderation(&self, fetcher: Arc<ReqwestFetcher>) -> Option<Arc<ModerationPipeline>> {
        let section = &self.config.moderation;
        if !section.enabled {
            return None;
        }
        match HttpChatModel::from_config(section) {
            Ok(model) => Some(Arc::new(ModerationPipeline::from_config(
                section,
                Arc::new(model),
                fetcher,
            ))),
            Err(err) => {
                warn!(error = %err, "moderation disabled for this run");
                None
            }
        }
    }

    async fn capture(&self, args: &CaptureArgs) -> Result<TaskSummary> {
        let request = args.request()?;
        let fetcher = self.fetcher()?;
        let config = Arc::clone(&self.config);
        let cookies = FileCookieStore::from_config(&config.sessions, |path| config.resolve_path(path));
        let (sink, mut events) = ChannelSink::new();
        let cancel = CancellationFlag::new();

        let deps = ScraperDeps {
            config: Arc::clone(&self.config),
            fingerprints: Arc::new(PoolFingerprintGenerator::new(self.config.fingerprint.clone())),
            fetcher: fetcher.clone(),
            cookies: Arc::new(cookies),
            moderation: self.moderation(fetcher),
            sink: Arc::new(sink),
            cancel: cancel.clone(),
        };
        let runner = TaskRunner::new(
            ScraperRegistry::with_defaults(),
            Arc::new(BrowserLauncher::new(self.config.chromium.clone())),
            deps,
            self.result_dir.clone(),
        );

        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "unprintable progress event"),
                }
            }
        });
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling capture");
                cancel.cancel();
            }
        });

        let summary = runner.run(request).await;
        interrupt.abort();
        drop(runner);
        if let Err(err) = printer.await {
            warn!(error = %err, "event printer stopped early");
        }
        info!(task_id = %summary.task_id, dir = %summary.output_dir.display(), "capture finished");
        Ok(summary)
    }

    async fn moderate(&self, args: &ModerateArgs) -> Result<ModerationSummary> {
        let content = fs::read_to_string(&args.records)?;
        let tweets: RecordMap = serde_json::from_str(&content)?;
        let items = items_from_tweets(&tweets);
        let model = HttpChatModel::from_config(&self.config.moderation)?;
        let pipeline =
            ModerationPipeline::from_config(&self.config.moderation, Arc::new(model), self.fetcher()?);
        info!(items = items.len(), records = %args.records.display(), "scoring saved tweets");
        let report = pipeline.report(&items).await;
        Ok(ModerationSummary {
            records: args.records.clone(),
            items: items.len(),
            report,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ModerationSummary {
    pub records: PathBuf,
    pub items: usize,
    pub report: AggregatedReport,
}

impl DisplayFallback for ModerationSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} ({} posts)", self.records.display(), self.items)];
        if self.report.is_empty() {
            lines.push("No scores".to_string());
        }
        for (field, mean) in &self.report.scores {
            lines.push(format!("  - {field}: {mean:.2}"));
        }
        if let Some(message) = &self.report.general_message {
            lines.push(format!("Summary: {message}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TaskSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Task {} -> {}",
            self.task_id,
            self.output_dir.display()
        )];
        for outcome in &self.outcomes {
            let status = match &outcome.status {
                ScraperStatus::Completed { artifacts } => format!("completed ({artifacts} screenshots)"),
                ScraperStatus::Failed { kind, message } => format!("failed [{kind}] {message}"),
                ScraperStatus::Skipped { reason } => format!("skipped: {reason}"),
            };
            lines.push(format!("[{}] {}: {status}", outcome.platform, outcome.identity));
        }
        lines.push(format!(
            "Browser: {} contexts, {} navigations ({} timed out), {} screenshots",
            self.metrics.contexts_opened,
            self.metrics.navigations,
            self.metrics.navigation_timeouts,
            self.metrics.screenshots
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookup_core::{ScraperOutcome, SessionMetrics};
    use tempfile::TempDir;

    #[test]
    fn capture_flags_become_a_request() {
        let cli = Cli::try_parse_from([
            "lookupctl",
            "capture",
            "--telegram",
            "durov",
            "--whatsapp",
            "+1 555 0100",
            "--device",
            "mobile",
            "--screenshots-only",
        ])
        .unwrap();
        let Commands::Capture(args) = cli.command else {
            panic!("expected capture");
        };
        let request = args.request().unwrap();
        assert_eq!(
            request.inputs,
            vec![
                (Platform::Telegram, "durov".to_string()),
                (Platform::Whatsapp, "+1 555 0100".to_string()),
            ]
        );
        assert!(!request.options.store_api_responses);
        assert_eq!(request.options.device_targets, vec![DeviceTarget::Mobile]);
    }

    #[test]
    fn capture_without_profiles_is_rejected() {
        let args = CaptureArgs {
            twitter: Some("   ".into()),
            ..CaptureArgs::default()
        };
        assert!(matches!(args.request(), Err(AppError::InvalidArguments(_))));
    }

    #[test]
    fn result_dir_flag_overrides_config() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("lookup.toml");
        fs::write(&config, "[paths]\nbase_dir = \"/srv/lookup\"\n").unwrap();
        let cli = Cli::try_parse_from([
            "lookupctl",
            "--config",
            config.to_str().unwrap(),
            "moderate",
            "--records",
            "tweets.json",
        ])
        .unwrap();
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(context.result_dir, PathBuf::from("/srv/lookup/results"));

        let cli = Cli {
            result_dir: Some(temp.path().join("out")),
            ..cli
        };
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(context.result_dir, temp.path().join("out"));
    }

    #[test]
    fn summary_text_lists_every_outcome() {
        let summary = TaskSummary {
            task_id: "0123456789abcdef0123456789abcdef".into(),
            output_dir: PathBuf::from("results/0123456789abcdef0123456789abcdef"),
            outcomes: vec![
                ScraperOutcome {
                    platform: Platform::Telegram,
                    identity: "durov".into(),
                    status: ScraperStatus::Completed { artifacts: 2 },
                },
                ScraperOutcome {
                    platform: Platform::Twitter,
                    identity: "jack".into(),
                    status: ScraperStatus::Failed {
                        kind: "missing_credentials".into(),
                        message: "missing credentials for twitter session cookies".into(),
                    },
                },
            ],
            metrics: SessionMetrics::default(),
        };
        let text = summary.display();
        assert!(text.contains("[telegram] durov: completed (2 screenshots)"));
        assert!(text.contains("[twitter] jack: failed [missing_credentials]"));
    }
}
