//! Job runner - ordered steps executed on one or more targets
//!
//! A job file names its targets (each a full [`Config`]) and a list of
//! steps. Every target gets its own session and runs the steps in order;
//! targets run concurrently on blocking worker threads.

use crate::checkout::{CheckoutHandle, CheckoutRequest};
use crate::config::{Config, ExpectationConfig};
use crate::core::{CommandExecutor, Expectation};
use crate::password::SharedPassword;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Target name used when a job file declares no targets
pub const DEFAULT_TARGET: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, Config>,
    pub steps: Vec<Step>,
}

/// One step of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Cmd {
        command: String,
        #[serde(default)]
        comment: String,
        #[serde(default)]
        sudo: bool,
    },
    Checkout(CheckoutRequest),
    Install {
        packages: Vec<String>,
    },
    /// Build command, tied to the most recent checkout
    Build {
        command: String,
        #[serde(default)]
        expect: Vec<ExpectationConfig>,
    },
    Chdir {
        path: String,
    },
    InDirectory {
        path: String,
        #[serde(default)]
        sudo: bool,
    },
    SetEnv {
        name: String,
        value: String,
    },
    Put {
        local: PathBuf,
        remote: String,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cmd { command, .. } => write!(f, "cmd `{}`", command),
            Self::Checkout(request) => write!(f, "checkout {} {}", request.vcs, request.url),
            Self::Install { packages } => write!(f, "install {}", packages.join(" ")),
            Self::Build { command, .. } => write!(f, "build `{}`", command),
            Self::Chdir { path } => write!(f, "chdir {}", path),
            Self::InDirectory { path, .. } => write!(f, "in_directory {}", path),
            Self::SetEnv { name, .. } => write!(f, "set_env {}", name),
            Self::Put { local, remote } => write!(f, "put {} -> {}", local.display(), remote),
        }
    }
}

/// Progress events, one stream per job
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { target: String },
    StepDone { target: String, index: usize },
    Completed { target: String },
    Failed { target: String, error: String },
}

/// What happened on one target
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: String,
    pub result: Result<Vec<CheckoutHandle>>,
}

impl JobFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("parsing job file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Declared targets, or `fallback` under [`DEFAULT_TARGET`]
    pub fn resolved_targets(&self, fallback: &Config) -> BTreeMap<String, Config> {
        if self.targets.is_empty() {
            BTreeMap::from([(DEFAULT_TARGET.to_string(), fallback.clone())])
        } else {
            self.targets.clone()
        }
    }
}

/// Run a job on all of its targets concurrently.
///
/// All targets share `passwords`, so a sudo password is asked for at most once.
pub async fn run_job(
    job: &JobFile,
    fallback: &Config,
    passwords: SharedPassword,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
) -> Vec<TargetOutcome> {
    let mut handles = Vec::new();
    for (target, config) in job.resolved_targets(fallback) {
        let steps = job.steps.clone();
        let events = events.clone();
        let passwords = passwords.clone();
        let name = target.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_target(&name, &config, &steps, passwords, events.as_ref())
        });
        handles.push((target, handle));
    }

    let mut outcomes = Vec::new();
    for (target, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("worker for {} failed: {}", target, e)),
        };
        outcomes.push(TargetOutcome { target, result });
    }
    outcomes
}

fn emit(events: Option<&mpsc::UnboundedSender<JobEvent>>, event: JobEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Run every step on one target, on the calling thread
pub fn run_target(
    target: &str,
    config: &Config,
    steps: &[Step],
    passwords: SharedPassword,
    events: Option<&mpsc::UnboundedSender<JobEvent>>,
) -> Result<Vec<CheckoutHandle>> {
    emit(
        events,
        JobEvent::Started {
            target: target.to_string(),
        },
    );

    let result = CommandExecutor::connect(config)
        .with_context(|| format!("connecting to target {}", target))
        .map(|exec| exec.with_password_source(Box::new(passwords)))
        .and_then(|mut exec| run_steps(target, &mut exec, steps, events));

    match &result {
        Ok(_) => {
            log::info!("[{}] job completed", target);
            emit(
                events,
                JobEvent::Completed {
                    target: target.to_string(),
                },
            );
        }
        Err(e) => {
            log::error!("[{}] job failed: {:#}", target, e);
            emit(
                events,
                JobEvent::Failed {
                    target: target.to_string(),
                    error: format!("{:#}", e),
                },
            );
        }
    }
    result
}

/// Run steps in order on an already connected executor
pub fn run_steps(
    target: &str,
    exec: &mut CommandExecutor,
    steps: &[Step],
    events: Option<&mpsc::UnboundedSender<JobEvent>>,
) -> Result<Vec<CheckoutHandle>> {
    let mut checkouts: Vec<CheckoutHandle> = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        log::info!("[{}] step {}/{}: {}", target, index + 1, steps.len(), step);
        let context = || format!("step {} ({})", index + 1, step);

        match step {
            Step::Cmd {
                command,
                comment,
                sudo,
            } => {
                exec.cmd(command, comment, *sudo).with_context(context)?;
            }
            Step::Checkout(request) => {
                let handle = exec.checkout(request).with_context(context)?;
                checkouts.push(handle);
            }
            Step::Install { packages } => exec.install_packages(packages).with_context(context)?,
            Step::Build { command, expect } => {
                let expectations = expect
                    .iter()
                    .map(|e| Expectation::new(&e.lines, e.response.clone()))
                    .collect::<crate::error::Result<Vec<_>>>()
                    .with_context(context)?;
                exec.run_build_command(command, checkouts.last(), &expectations)
                    .with_context(context)?;
            }
            Step::Chdir { path } => exec.chdir(path).with_context(context)?,
            Step::InDirectory { path, sudo } => {
                exec.in_directory(path, *sudo).with_context(context)?
            }
            Step::SetEnv { name, value } => exec.set_env(name, value).with_context(context)?,
            Step::Put { local, remote } => exec.put_file(local, remote).with_context(context)?,
        }

        emit(
            events,
            JobEvent::StepDone {
                target: target.to_string(),
                index,
            },
        );
    }
    Ok(checkouts)
}
