//! Checkout reconciliation - idempotent fetch/update for git, bzr and repo
//!
//! Checkouts land in the shell's current directory. An existing directory
//! is updated in place when it is a checkout of the requested URL;
//! otherwise a fresh checkout is made.

use crate::core::{CommandExecutor, CommandInvocation};
use crate::error::{Result, ShellError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-specific long form of Launchpad bzr URLs
const LAUNCHPAD_LONG_FORM: &str = r"\S+://bazaar\.launchpad\.net/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
    Bzr,
    /// Manifest-driven multi-repository checkout
    Repo,
}

impl fmt::Display for Vcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Bzr => write!(f, "bzr"),
            Self::Repo => write!(f, "repo"),
        }
    }
}

/// What to check out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub vcs: Vcs,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Manifest file for repo checkouts
    #[serde(default)]
    pub manifest: Option<String>,
    /// Shallow clone depth (git)
    #[serde(default)]
    pub depth: Option<u32>,
    /// Target directory name (bzr)
    #[serde(default)]
    pub name: Option<String>,
}

impl CheckoutRequest {
    pub fn new(vcs: Vcs, url: impl Into<String>) -> Self {
        Self {
            vcs,
            url: url.into(),
            branch: None,
            manifest: None,
            depth: None,
            name: None,
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Identity of a completed checkout, usable as a cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckoutHandle {
    vcs: Vcs,
    url: String,
    revision: Option<String>,
    directory: String,
}

impl CheckoutHandle {
    pub fn vcs(&self) -> Vcs {
        self.vcs
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Directory, relative to where the checkout was made
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Stable content key: VCS, URL and revision
    pub fn cache_key(&self) -> String {
        serde_json::json!([self.vcs, self.url, self.revision]).to_string()
    }
}

/// Directory git clones `url` into
pub fn git_dirname(url: &str) -> String {
    let base = basename(url.trim_end_matches('/'));
    base.strip_suffix(".git").unwrap_or(base).to_string()
}

/// Directory bzr checks `url` out into
pub fn bzr_dirname(url: &str) -> String {
    let base = basename(url.trim_end_matches('/'));
    base.strip_prefix("lp:").unwrap_or(base).to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Rewrite long-form Launchpad URLs to their `lp:` alias
pub fn canonical_bzr_url(text: &str) -> Result<String> {
    let long_form = Regex::new(LAUNCHPAD_LONG_FORM)?;
    Ok(long_form
        .replace_all(text, "lp:")
        .trim_end_matches('/')
        .to_string())
}

/// Whether `bzr info` output names `url` as parent or bound branch
pub fn bzr_info_matches(info: &[String], url: &str) -> Result<bool> {
    let wanted = canonical_bzr_url(url)?;
    for line in info {
        if line.contains("parent branch: ") || line.contains("checkout of branch: ") {
            if canonical_bzr_url(line)?.contains(&wanted) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn origin_matches(exec: &mut CommandExecutor, url: &str) -> Result<bool> {
    let wanted = format!("Fetch URL: {}", url);
    let out = exec.run("git remote show origin")?;
    Ok(out.lines.iter().any(|line| line.trim() == wanted))
}

/// Issues the checkout commands for one executor
pub struct CheckoutReconciler<'a> {
    exec: &'a mut CommandExecutor,
}

impl<'a> CheckoutReconciler<'a> {
    pub fn new(exec: &'a mut CommandExecutor) -> Self {
        Self { exec }
    }

    pub fn checkout(&mut self, request: &CheckoutRequest) -> Result<CheckoutHandle> {
        log::info!(
            "checkout: {}, {}, branch={:?}, manifest={:?}",
            request.vcs,
            request.url,
            request.branch,
            request.manifest
        );
        match request.vcs {
            Vcs::Git => self.git(request),
            Vcs::Bzr => self.bzr(request),
            Vcs::Repo => self.repo(request),
        }
    }

    /// Run `f` inside `dir`, returning to the current directory afterwards
    fn in_subdir<T>(
        &mut self,
        dir: &str,
        f: impl FnOnce(&mut CommandExecutor) -> Result<T>,
    ) -> Result<T> {
        let here = self.exec.cwd()?;
        self.exec.chdir(dir)?;
        let result = f(&mut *self.exec);
        self.exec.chdir(&here)?;
        result
    }

    fn read_revision(&mut self, command: &str) -> Result<Option<String>> {
        match self
            .exec
            .run_invocation(&CommandInvocation::new(command).quiet())
        {
            Ok(result) => Ok(result
                .lines
                .last()
                .map(|line| line.trim().to_string())
                .filter(|rev| !rev.is_empty())),
            Err(ShellError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn git(&mut self, request: &CheckoutRequest) -> Result<CheckoutHandle> {
        let url = request.url.as_str();
        let dirname = git_dirname(url);

        let updated = if self.exec.isdir(&dirname)? {
            self.in_subdir(&dirname, |exec| {
                let matched = origin_matches(exec, url)?;
                if matched {
                    exec.run("git stash")?;
                    exec.run("git reset --hard")?;
                    exec.run("git pull")?;
                }
                Ok(matched)
            })?
        } else {
            false
        };

        if !updated {
            let mut clone = String::from("git clone");
            if let Some(depth) = request.depth {
                clone.push_str(&format!(" --depth {}", depth));
            }
            if let Some(branch) = &request.branch {
                clone.push_str(&format!(" --branch {}", branch));
            }
            clone.push_str(&format!(" {}", url));
            self.exec.run(&clone)?;
        }

        let revision = self.read_revision(&format!("git -C {} rev-parse HEAD", dirname))?;
        Ok(CheckoutHandle {
            vcs: Vcs::Git,
            url: url.to_string(),
            revision,
            directory: dirname,
        })
    }

    fn bzr(&mut self, request: &CheckoutRequest) -> Result<CheckoutHandle> {
        let url = request.url.as_str();
        let dirname = match &request.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => bzr_dirname(url),
        };

        let mut updated = false;
        if self.exec.isdir(&dirname)? {
            updated = self.in_subdir(&dirname, |exec| {
                let info = exec.run("bzr info")?;
                let matched = bzr_info_matches(&info.lines, url)?;
                if matched {
                    exec.run("bzr update")?;
                }
                Ok(matched)
            })?;

            if !updated {
                // Something else is in the way
                self.exec.run(&format!("rm -rf {}", dirname))?;
            }
        }

        if !updated {
            self.exec
                .run(&format!("bzr checkout --quiet {} {}", url, dirname))?;
        }

        let revision = self.read_revision(&format!("bzr revno {}", dirname))?;
        Ok(CheckoutHandle {
            vcs: Vcs::Bzr,
            url: url.to_string(),
            revision,
            directory: dirname,
        })
    }

    fn repo(&mut self, request: &CheckoutRequest) -> Result<CheckoutHandle> {
        let url = request.url.as_str();

        if let Err(e) = self.exec.run("git config --global -l") {
            let unconfigured = e
                .command_output()
                .iter()
                .any(|line| line.starts_with("fatal: unable to read config file"));
            if !unconfigured {
                return Err(e);
            }
            let identity = self.exec.git_identity().clone();
            self.exec
                .run(&format!("git config --global user.email '{}'", identity.email))?;
            self.exec
                .run(&format!("git config --global user.name '{}'", identity.name))?;
        }

        let initialised = if self.exec.isdir(".repo/manifests")? {
            self.in_subdir(".repo/manifests", |exec| origin_matches(exec, url))?
        } else {
            false
        };

        let repo_tool = self.exec.repo_tool().to_string();
        if !initialised {
            let mut init = format!("{} init -u {}", repo_tool, url);
            if let Some(branch) = &request.branch {
                init.push_str(&format!(" -b {}", branch));
            }
            if let Some(manifest) = &request.manifest {
                init.push_str(&format!(" -m {}", manifest));
            }
            self.exec.run(&init)?;
        }
        self.exec.run(&format!("{} sync", repo_tool))?;

        let revision = self.read_revision("git -C .repo/manifests rev-parse HEAD")?;
        Ok(CheckoutHandle {
            vcs: Vcs::Repo,
            url: url.to_string(),
            revision,
            directory: ".".to_string(),
        })
    }
}
