//! One lookup task: launch a browser, run every requested scraper against it,
//! run their post-tasks, close the browser, announce completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{BrowserSession, SessionLauncher, SessionMetrics};
use crate::error::{CaptureError, CaptureResult};
use crate::progress::TaskEvent;
use crate::scraper::{
    validate_identity, CaptureOptions, Platform, Scraper, ScraperDeps, ScraperRegistry,
};

/// Which profiles to capture and how.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub inputs: Vec<(Platform, String)>,
    pub options: CaptureOptions,
}

impl CaptureRequest {
    pub fn new(options: CaptureOptions) -> Self {
        Self {
            inputs: Vec::new(),
            options,
        }
    }

    pub fn with(mut self, platform: Platform, identity: impl Into<String>) -> Self {
        self.inputs.push((platform, identity.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScraperStatus {
    Completed { artifacts: usize },
    Failed { kind: String, message: String },
    Skipped { reason: String },
}

impl ScraperStatus {
    fn failed(err: &CaptureError) -> Self {
        ScraperStatus::Failed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ScraperStatus::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScraperOutcome {
    pub platform: Platform,
    pub identity: String,
    #[serde(flatten)]
    pub status: ScraperStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub output_dir: PathBuf,
    pub outcomes: Vec<ScraperOutcome>,
    pub metrics: SessionMetrics,
}

impl TaskSummary {
    pub fn outcome(&self, platform: Platform) -> Option<&ScraperOutcome> {
        self.outcomes.iter().find(|outcome| outcome.platform == platform)
    }

    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status.is_completed())
            .count()
    }
}

pub struct TaskRunner {
    registry: ScraperRegistry,
    launcher: Arc<dyn SessionLauncher>,
    deps: ScraperDeps,
    result_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(
        registry: ScraperRegistry,
        launcher: Arc<dyn SessionLauncher>,
        deps: ScraperDeps,
        result_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            launcher,
            deps,
            result_dir: result_dir.into(),
        }
    }

    pub fn deps(&self) -> &ScraperDeps {
        &self.deps
    }

    /// Run `request` to completion. Failures are reported per scraper; the
    /// `COMPLETED` event is emitted in every case.
    pub async fn run(&self, request: CaptureRequest) -> TaskSummary {
        let task_id = Uuid::new_v4().simple().to_string();
        let output_dir = self.result_dir.join(&task_id);
        info!(task_id = %task_id, inputs = request.inputs.len(), "starting lookup task");
        if let Err(err) = tokio::fs::create_dir_all(&output_dir).await {
            warn!(dir = %output_dir.display(), error = %err, "failed to create task directory");
        }

        let mut outcomes = Vec::new();
        let mut scrapers: Vec<Box<dyn Scraper>> = Vec::new();
        for (platform, identity) in &request.inputs {
            let identity = identity.trim();
            if identity.is_empty() {
                continue;
            }
            if let Err(err) = validate_identity(identity) {
                warn!(platform = %platform, identity, "rejecting identity");
                self.deps.progress(*platform).error(err.kind(), err.to_string());
                outcomes.push(ScraperOutcome {
                    platform: *platform,
                    identity: identity.to_string(),
                    status: ScraperStatus::failed(&err),
                });
                continue;
            }
            match self.registry.create(*platform, identity, self.deps.clone()) {
                Some(scraper) => scrapers.push(scraper),
                None => {
                    warn!(platform = %platform, "no scraper registered");
                    outcomes.push(ScraperOutcome {
                        platform: *platform,
                        identity: identity.to_string(),
                        status: ScraperStatus::Skipped {
                            reason: "no scraper registered".into(),
                        },
                    });
                }
            }
        }

        let session = match self.launcher.launch().await {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "browser launch failed");
                None
            }
        };

        for scraper in &scrapers {
            let result = self
                .capture_one(scraper.as_ref(), &output_dir, session.as_deref(), &request.options)
                .await;
            let status = match result {
                Ok(artifacts) => {
                    info!(platform = %scraper.platform(), identity = scraper.identity(), artifacts, "scraper finished");
                    ScraperStatus::Completed { artifacts }
                }
                Err(err) => {
                    warn!(platform = %scraper.platform(), identity = scraper.identity(), error = %err, "scraper failed");
                    self.deps
                        .progress(scraper.platform())
                        .error(err.kind(), err.to_string());
                    ScraperStatus::failed(&err)
                }
            };
            outcomes.push(ScraperOutcome {
                platform: scraper.platform(),
                identity: scraper.identity().to_string(),
                status,
            });
        }

        for scraper in &scrapers {
            if let Err(err) = scraper.post_task().await {
                warn!(platform = %scraper.platform(), error = %err, "post task failed");
                self.deps
                    .progress(scraper.platform())
                    .error(err.kind(), err.to_string());
            }
        }

        let mut metrics = SessionMetrics::default();
        if let Some(session) = session {
            metrics = session.metrics();
            if let Err(err) = session.shutdown().await {
                warn!(task_id = %task_id, error = %err, "browser shutdown failed");
            }
        }

        self.deps.sink.emit(TaskEvent::completed(&task_id).into());
        let summary = TaskSummary {
            task_id,
            output_dir,
            outcomes,
            metrics,
        };
        info!(task_id = %summary.task_id, completed = summary.completed(), total = summary.outcomes.len(), "lookup task finished");
        summary
    }

    async fn capture_one(
        &self,
        scraper: &dyn Scraper,
        output_dir: &Path,
        session: Option<&dyn BrowserSession>,
        options: &CaptureOptions,
    ) -> CaptureResult<usize> {
        self.deps.cancel.checkpoint()?;
        let session = session.ok_or_else(|| {
            CaptureError::NoSessionAvailable("browser could not be launched".into())
        })?;
        let artifacts = scraper.capture(output_dir, session, options).await?;
        Ok(artifacts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::testing::{test_deps, RecordingSink, ScriptedBrowser};
    use tempfile::tempdir;

    fn runner(browser: &ScriptedBrowser, result_dir: PathBuf) -> (TaskRunner, Arc<RecordingSink>) {
        let (deps, sink) = test_deps();
        let runner = TaskRunner::new(
            ScraperRegistry::with_defaults(),
            Arc::new(browser.launcher()),
            deps,
            result_dir,
        );
        (runner, sink)
    }

    #[tokio::test]
    async fn empty_identities_are_skipped_and_completion_is_announced() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new();
        let (runner, sink) = runner(&browser, dir.path().to_path_buf());
        let request = CaptureRequest::default()
            .with(Platform::Facebook, "  ")
            .with(Platform::Whatsapp, "+1 555 0100");

        let summary = runner.run(request).await;

        assert_eq!(summary.outcomes.len(), 1);
        assert!(summary.outcome(Platform::Whatsapp).unwrap().status.is_completed());
        assert_eq!(summary.task_id.len(), 32);
        assert_eq!(browser.journal().shutdowns, 1);
        let last = sink.events().pop().unwrap();
        assert_eq!(last, ProgressEvent::Task(TaskEvent::completed(summary.task_id.clone())));
    }

    #[tokio::test]
    async fn failed_launch_fails_every_scraper_but_still_completes() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new().fail_launch();
        let (runner, sink) = runner(&browser, dir.path().to_path_buf());
        let request = CaptureRequest::default()
            .with(Platform::Facebook, "zuck")
            .with(Platform::Whatsapp, "15550100");

        let summary = runner.run(request).await;

        assert_eq!(summary.completed(), 0);
        for outcome in &summary.outcomes {
            match &outcome.status {
                ScraperStatus::Failed { kind, .. } => assert_eq!(kind, "no_session_available"),
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert_eq!(browser.journal().shutdowns, 0);
        let events = sink.events();
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Task(TaskEvent::System { .. }))
        ));
    }

    #[tokio::test]
    async fn cancelled_task_captures_nothing() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new();
        let (runner, _sink) = runner(&browser, dir.path().to_path_buf());
        runner.deps().cancel.cancel();
        let summary = runner
            .run(CaptureRequest::default().with(Platform::Facebook, "zuck"))
            .await;
        assert!(matches!(
            &summary.outcomes[0].status,
            ScraperStatus::Failed { kind, .. } if kind == "cancelled"
        ));
        assert!(browser.journal().contexts.is_empty());
        assert_eq!(browser.journal().shutdowns, 1);
    }

    #[tokio::test]
    async fn identities_escaping_the_task_dir_are_refused() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("results");
        let browser = ScriptedBrowser::new();
        let (runner, sink) = runner(&browser, results.clone());
        let request = CaptureRequest::default()
            .with(Platform::Facebook, "../../../escaped")
            .with(Platform::Telegram, "/tmp/x")
            .with(Platform::Whatsapp, "15550100");

        let summary = runner.run(request).await;

        for platform in [Platform::Facebook, Platform::Telegram] {
            assert!(matches!(
                &summary.outcome(platform).unwrap().status,
                ScraperStatus::Failed { kind, .. } if kind == "invalid_identity"
            ));
        }
        assert!(summary.outcome(Platform::Whatsapp).unwrap().status.is_completed());
        assert!(!dir.path().join("escaped").exists());
        let navigations = browser.journal().navigations;
        assert!(!navigations.is_empty());
        assert!(navigations.iter().all(|url| url == "https://wa.me/15550100"));
        let errors = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event.service_key(), Some((_, "error"))))
            .count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn outcomes_serialise_flat() {
        let outcome = ScraperOutcome {
            platform: Platform::Telegram,
            identity: "durov".into(),
            status: ScraperStatus::Completed { artifacts: 2 },
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["artifacts"], 2);
        assert_eq!(value["platform"], "telegram");
    }
}
