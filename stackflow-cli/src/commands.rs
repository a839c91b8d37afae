//! Command implementations.

use crate::local::LocalBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use stackflow::artifacts::{DirectoryTemplateSource, TemplateSource};
use stackflow::changeset::{ApprovalGate, AutoApprove, ChangeSet};
use stackflow::config::OrchestratorConfig;
use stackflow::errors::{ApprovalError, StackflowError};
use stackflow::manifest::StackSetManifest;
use stackflow::observability::WideEventEmitter;
use stackflow::orchestrator::{DeploymentOrchestrator, DeploymentReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Everything requested happened.
    Succeeded,
    /// The run stopped on a failed, rolled back, or cancelled stack.
    Failed,
}

impl Outcome {
    fn from_success(success: bool) -> Self {
        if success {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

/// Options shared by every stack-set command.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Stack-set manifest path.
    pub stack_set: PathBuf,
    /// Environment tag.
    pub environment: Option<String>,
    /// Local state directory.
    pub state_dir: PathBuf,
    /// Template source tree.
    pub templates: PathBuf,
    /// Orchestrator config file.
    pub config: Option<PathBuf>,
    /// Concurrency override.
    pub max_concurrency: Option<usize>,
}

struct Session {
    manifest: StackSetManifest,
    backend: LocalBackend,
    config: OrchestratorConfig,
}

impl Workspace {
    fn open(&self) -> Result<Session> {
        let mut manifest = StackSetManifest::from_json_file(&self.stack_set)
            .with_context(|| format!("loading stack set {}", self.stack_set.display()))?;
        if let Some(environment) = &self.environment {
            manifest = manifest
                .for_environment(environment)
                .map_err(StackflowError::from)?;
        }

        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::from_json_file(path)?,
            None => OrchestratorConfig::default(),
        };
        config.region.clone_from(&manifest.region);
        if let Some(max) = self.max_concurrency {
            config = config.with_max_concurrency(max);
        }

        let backend = LocalBackend::open(&self.state_dir, &config.region, &manifest.artifacts.prefix)?;
        tracing::debug!(
            stack_set = %manifest.name,
            region = %config.region,
            stacks = manifest.stacks.len(),
            "Stack set loaded"
        );
        Ok(Session {
            manifest,
            backend,
            config,
        })
    }
}

impl Session {
    fn orchestrator(&self, templates: Arc<dyn TemplateSource>) -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(
            self.config.clone(),
            self.backend.provisioner.clone(),
            self.backend.exports.clone(),
            self.backend.parameters.clone(),
            self.backend.publisher.clone(),
            templates,
        )
        .with_event_sink(Arc::new(stackflow::events::LoggingEventSink::info()))
    }

    /// The manifest pinned to the working tree's revision.
    fn pinned(&self, source: &DirectoryTemplateSource) -> StackSetManifest {
        self.manifest.clone().pin_revision(source.revision())
    }
}

fn open_templates(root: &Path) -> Result<DirectoryTemplateSource> {
    DirectoryTemplateSource::open(root).with_context(|| format!("reading templates in {}", root.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs `run` with Ctrl-C wired to the orchestrator's cancellation token.
async fn with_interrupt<F>(orchestrator: &DeploymentOrchestrator, run: F) -> F::Output
where
    F: std::future::Future,
{
    let token = orchestrator.cancellation().clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel("interrupted");
        }
    });
    let output = run.await;
    watcher.abort();
    output
}

fn finish_run(session: &Session, report: &DeploymentReport) -> Result<Outcome> {
    session.backend.save()?;
    WideEventEmitter::new().emit_run(report);
    print_json(report)?;
    Ok(Outcome::from_success(report.success))
}

/// Publishes every template under the workspace's template tree.
pub async fn publish(workspace: &Workspace) -> Result<Outcome> {
    let session = workspace.open()?;
    let publication = session
        .backend
        .publisher
        .publish_bundle(&workspace.templates)
        .await
        .map_err(StackflowError::from)?;
    tracing::info!(
        revision = %publication.revision,
        templates = publication.artifacts.len(),
        "Templates published"
    );
    print_json(&publication)?;
    Ok(Outcome::Succeeded)
}

/// Creates the stack set.
pub async fn create(workspace: &Workspace) -> Result<Outcome> {
    let session = workspace.open()?;
    let source = open_templates(&workspace.templates)?;
    let plan = session.pinned(&source).plan()?;
    let orchestrator = session.orchestrator(Arc::new(source));

    let report = with_interrupt(&orchestrator, orchestrator.create(&plan)).await;
    finish_run(&session, &report)
}

/// Updates the stack set in place.
pub async fn update(workspace: &Workspace) -> Result<Outcome> {
    let session = workspace.open()?;
    let source = open_templates(&workspace.templates)?;
    let plan = session.pinned(&source).plan()?;
    let orchestrator = session.orchestrator(Arc::new(source));

    let report = with_interrupt(&orchestrator, orchestrator.update(&plan)).await;
    finish_run(&session, &report)
}

/// Deletes the stack set in reverse order.
pub async fn delete(workspace: &Workspace) -> Result<Outcome> {
    let session = workspace.open()?;
    let source = open_templates(&workspace.templates)?;
    let teardown = session.pinned(&source).plan()?.teardown();
    let orchestrator = session.orchestrator(Arc::new(source));

    let report = with_interrupt(&orchestrator, orchestrator.delete(&teardown)).await;
    finish_run(&session, &report)
}

/// Previews the stack set as change sets, optionally executing them.
pub async fn changeset(workspace: &Workspace, execute: bool, assume_yes: bool) -> Result<Outcome> {
    let session = workspace.open()?;
    let source = open_templates(&workspace.templates)?;
    let plan = session.pinned(&source).plan()?;
    let gate: Arc<dyn ApprovalGate> = if assume_yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(PromptApproval)
    };
    let orchestrator = session.orchestrator(Arc::new(source)).with_approval_gate(gate);

    let changesets = orchestrator.changeset(&plan).await?;
    print_json(&changesets)?;
    if !execute {
        session.backend.save()?;
        return Ok(Outcome::Succeeded);
    }

    let result = with_interrupt(&orchestrator, orchestrator.execute_changesets(changesets)).await;
    session.backend.save()?;
    let outcomes = result?;

    let success = outcomes.iter().all(|(_, outcome)| outcome.is_success());
    let summary: Vec<serde_json::Value> = outcomes
        .iter()
        .map(|(stack, outcome)| serde_json::json!({ "stack": stack, "result": outcome }))
        .collect();
    print_json(&summary)?;
    Ok(Outcome::from_success(success))
}

/// Writes a new version of an external parameter.
pub fn put_parameter(workspace: &Workspace, name: &str, value: &str) -> Result<Outcome> {
    let session = workspace.open()?;
    let version = session.backend.parameters.put(name, value);
    session.backend.save()?;
    tracing::info!(path = name, version, "Parameter written");
    print_json(&serde_json::json!({ "path": name, "version": version }))?;
    Ok(Outcome::Succeeded)
}

/// Asks on the terminal before each change set executes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptApproval;

/// Maps a terminal answer to a verdict. `None` means nobody answered.
fn verdict(stack: String, answer: Option<bool>) -> Result<(), ApprovalError> {
    match answer {
        Some(true) => Ok(()),
        Some(false) => Err(ApprovalError::Denied { stack }),
        None => Err(ApprovalError::Cancelled { stack }),
    }
}

#[async_trait]
impl ApprovalGate for PromptApproval {
    async fn review(&self, changeset: &ChangeSet) -> Result<(), ApprovalError> {
        let stack = changeset.stack().to_string();
        let prompt = format!("Execute change set {} ({})?", changeset.id(), changeset.summary());

        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await;

        let answer = match answer {
            Ok(Ok(confirmed)) => Some(confirmed),
            Ok(Err(err)) => {
                tracing::warn!(stack = %stack, error = %err, "Approval prompt failed");
                None
            }
            Err(err) => {
                tracing::warn!(stack = %stack, error = %err, "Approval prompt task aborted");
                None
            }
        };
        verdict(stack, answer)
    }
}
