//! Command executor - runs commands through a shell session
//!
//! Each command goes through the same protocol:
//! 1. send the command (prefixed with `sudo` when asked for)
//! 2. poll output until a fresh prompt appears, answering interactive
//!    prompts and nudging a silent shell along the way
//! 3. for verified runs, `echo $?` and fail on anything but `0`
//!
//! Exactly one command is in flight per session.

use super::interaction::{Expectation, Interaction};
use super::session::{split_lines, ShellSession};
use crate::checkout::{CheckoutHandle, CheckoutReconciler, CheckoutRequest};
use crate::config::{Config, ExecutorConfig, GitIdentity};
use crate::error::{Result, ShellError};
use crate::password::{PasswordSource, TerminalPrompt};
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

const BACKOFF_START: Duration = Duration::from_micros(100);
const BACKOFF_FACTOR: f64 = 1.3;
/// Lines of trailing output offered to expectations
const EXPECT_WINDOW: usize = 16;
const SUDO_PROBE: &str = "sudo -n true";

/// One command to run, with how to run it
#[derive(Debug, Clone, Default)]
pub struct CommandInvocation {
    pub command: String,
    /// Don't log the command's output
    pub quiet: bool,
    pub sudo: bool,
    /// Ad-hoc prompts and their answers
    pub expectations: Vec<Expectation>,
}

impl CommandInvocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    pub fn expect_all(mut self, expectations: &[Expectation]) -> Self {
        self.expectations.extend_from_slice(expectations);
        self
    }
}

/// Output of a command: echo and trailing prompt removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub lines: Vec<String>,
    /// Set for verified runs only
    pub return_code: Option<i32>,
}

/// Lines received so far for the command in flight
#[derive(Debug, Default)]
struct OutputBuffer {
    lines: Vec<String>,
    partial: String,
}

impl OutputBuffer {
    /// Add received text; returns the index of the first newly completed line
    fn push(&mut self, text: &str) -> usize {
        let first_new = self.lines.len();
        self.partial.push_str(text);
        let (complete, partial) = split_lines(&self.partial);
        self.lines.extend(complete);
        self.partial = partial;
        first_new
    }

    /// What the terminal is currently showing on its last line
    fn latest(&self) -> Option<&str> {
        if !self.partial.is_empty() {
            Some(&self.partial)
        } else {
            self.lines.last().map(String::as_str)
        }
    }

    fn tail(&self, n: usize) -> Vec<String> {
        let mut tail: Vec<String> = self.lines.iter().rev().take(n).rev().cloned().collect();
        if !self.partial.is_empty() {
            tail.push(self.partial.clone());
        }
        tail
    }

    /// Drop the echoed command and the prompt
    fn into_command_output(self) -> Vec<String> {
        let mut lines = self.lines;
        if lines.len() < 2 {
            return Vec::new();
        }
        lines.pop();
        lines.remove(0);
        lines
    }
}

/// Drives one session through the send/await/verify protocol
pub struct CommandExecutor {
    session: ShellSession,
    interaction: Interaction,
    settings: ExecutorConfig,
    return_code_re: Regex,
    /// Empty string: sudo works without a password
    sudo_password: Option<String>,
    passwords: Box<dyn PasswordSource>,
    git_identity: GitIdentity,
    repo_tool: String,
}

impl CommandExecutor {
    pub fn new(session: ShellSession, config: &Config) -> Result<Self> {
        Ok(Self {
            session,
            interaction: Interaction::from_config(&config.interaction)?,
            settings: config.executor.clone(),
            return_code_re: Regex::new(r"(\d+)\s*$")?,
            sudo_password: None,
            passwords: Box::new(TerminalPrompt),
            git_identity: config.git_identity.clone(),
            repo_tool: config.repo_tool.clone(),
        })
    }

    /// Connect a session for `config` and wrap it
    pub fn connect(config: &Config) -> Result<Self> {
        let session = ShellSession::connect_with(config)?;
        Self::new(session, config)
    }

    pub fn with_password_source(mut self, source: Box<dyn PasswordSource>) -> Self {
        self.passwords = source;
        self
    }

    pub fn session(&self) -> &ShellSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ShellSession {
        &mut self.session
    }

    pub fn git_identity(&self) -> &GitIdentity {
        &self.git_identity
    }

    pub fn repo_tool(&self) -> &str {
        &self.repo_tool
    }

    /// Run a command and verify its return code
    pub fn run(&mut self, command: &str) -> Result<CommandResult> {
        self.run_invocation(&CommandInvocation::new(command))
    }

    pub fn run_sudo(&mut self, command: &str) -> Result<CommandResult> {
        self.run_invocation(&CommandInvocation::new(command).sudo(true))
    }

    /// Run an invocation and verify its return code
    pub fn run_invocation(&mut self, invocation: &CommandInvocation) -> Result<CommandResult> {
        let result = self.execute(invocation)?;
        let code = self.check_return_code(&invocation.command, result.lines.clone())?;
        Ok(CommandResult {
            lines: result.lines,
            return_code: Some(code),
        })
    }

    /// Run an invocation without checking its return code
    pub fn execute(&mut self, invocation: &CommandInvocation) -> Result<CommandResult> {
        let command = if invocation.sudo {
            self.ensure_sudo_password()?;
            format!("sudo {}", invocation.command)
        } else {
            invocation.command.clone()
        };

        let lines = self.await_completion(
            Some(&command),
            invocation.quiet,
            invocation.sudo,
            &invocation.expectations,
        )?;
        Ok(CommandResult {
            lines,
            return_code: None,
        })
    }

    /// Don't run a command, just wait for the next prompt
    pub fn wait_for_prompt(&mut self, expectations: &[Expectation]) -> Result<Vec<String>> {
        self.await_completion(None, false, false, expectations)
    }

    fn check_return_code(&mut self, command: &str, output: Vec<String>) -> Result<i32> {
        let rx = self.await_completion(Some("echo $?"), true, false, &[])?;
        let code = rx
            .iter()
            .filter_map(|line| self.return_code_re.captures(line))
            .last()
            .and_then(|caps| caps[1].parse::<i32>().ok());

        match code {
            Some(0) => Ok(0),
            return_code => Err(ShellError::CommandFailed {
                command: command.to_string(),
                return_code,
                output,
            }),
        }
    }

    /// Find out once per session whether sudo needs a password
    fn ensure_sudo_password(&mut self) -> Result<()> {
        if self.sudo_password.is_some() {
            return Ok(());
        }
        self.await_completion(Some(SUDO_PROBE), true, false, &[])?;
        match self.check_return_code(SUDO_PROBE, Vec::new()) {
            Ok(_) => self.sudo_password = Some(String::new()),
            Err(ShellError::CommandFailed { .. }) => {
                let password = self
                    .passwords
                    .request_password("Please enter sudo password: ")?;
                self.sudo_password = Some(password);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn await_completion(
        &mut self,
        command: Option<&str>,
        quiet: bool,
        sudo: bool,
        expectations: &[Expectation],
    ) -> Result<Vec<String>> {
        if let Some(command) = command {
            self.session.send(&format!("{}\n", command))?;
        }

        let mut output = OutputBuffer::default();
        let mut sent_sudo_password = false;
        let mut backoff = BACKOFF_START;
        let mut last_chunk = Instant::now();

        loop {
            if let Some(text) = self.session.receive(self.settings.chunk_size)? {
                backoff = BACKOFF_START;
                last_chunk = Instant::now();
                let first_new = output.push(&text);
                if !quiet {
                    for line in &output.lines[first_new..] {
                        log::info!("{}", line);
                    }
                }
                if self.chunk_finished(&mut output, first_new, quiet)? {
                    break;
                }
                continue;
            }

            // Nothing new: the prompt may have landed just before the timeout
            if self.latest_finished(&mut output, quiet)? {
                break;
            }

            if let Some(latest) = output.latest().map(str::to_string) {
                if let Some(answer) = self.interaction.canned_answer(&latest) {
                    log::info!("Answering {:?} with {:?}", latest.trim_end(), answer);
                    let answer = format!("{}\n", answer);
                    self.session.send_raw(&answer)?;
                } else if sudo && !sent_sudo_password && self.interaction.is_sudo_prompt(&latest) {
                    let password = format!("{}\n", self.sudo_password.as_deref().unwrap_or(""));
                    self.session.send_raw(&password)?;
                    sent_sudo_password = true;
                } else if let Some(expectation) = self
                    .interaction
                    .find_expectation(expectations, &output.tail(EXPECT_WINDOW))
                {
                    log::info!("Answering {:?} with {:?}", latest.trim_end(), expectation.response());
                    let response = format!("{}\n", expectation.response());
                    self.session.send_raw(&response)?;
                }
            }

            if last_chunk.elapsed() > self.settings.stall_nudge() {
                log::debug!("No output for {:?}, sending newline", self.settings.stall_nudge());
                self.session.send_raw("\n")?;
                last_chunk = Instant::now();
            }

            std::thread::sleep(backoff);
            backoff = backoff.mul_f64(BACKOFF_FACTOR).min(self.settings.max_backoff());
        }

        Ok(output.into_command_output())
    }

    /// Check what a chunk just added: the last completed line, then the
    /// unterminated one (a prompt usually has no newline after it)
    fn chunk_finished(
        &mut self,
        output: &mut OutputBuffer,
        first_new: usize,
        quiet: bool,
    ) -> Result<bool> {
        if output.lines.len() > first_new {
            if let Some(last) = output.lines.last().cloned() {
                if self.is_completion(&last)? {
                    return Ok(true);
                }
            }
        }
        self.partial_finished(output, quiet)
    }

    /// Re-check only the line the terminal currently ends on
    fn latest_finished(&mut self, output: &mut OutputBuffer, quiet: bool) -> Result<bool> {
        if !output.partial.is_empty() {
            return self.partial_finished(output, quiet);
        }
        match output.lines.last().cloned() {
            Some(last) => self.is_completion(&last),
            None => Ok(false),
        }
    }

    fn partial_finished(&mut self, output: &mut OutputBuffer, quiet: bool) -> Result<bool> {
        if output.partial.is_empty() {
            return Ok(false);
        }
        let partial = output.partial.clone();
        if !self.is_completion(&partial)? {
            return Ok(false);
        }
        if !quiet {
            log::info!("{}", partial);
        }
        output.lines.push(std::mem::take(&mut output.partial));
        Ok(true)
    }

    /// Fresh prompt or hung tool
    fn is_completion(&mut self, line: &str) -> Result<bool> {
        Ok(self.session.match_prompt(line)? || self.interrupt_if_unresponsive(line)?)
    }

    fn interrupt_if_unresponsive(&mut self, line: &str) -> Result<bool> {
        if self.interaction.is_unresponsive(line) {
            log::warn!("Command looks hung ({:?}), sending interrupt", line);
            self.session.interrupt()?;
            return Ok(true);
        }
        Ok(false)
    }

    // -- Pass-through helpers --

    /// Run an arbitrary command; the comment documents why in the log
    pub fn cmd(&mut self, command: &str, comment: &str, sudo: bool) -> Result<CommandResult> {
        log::info!("cmd: {} #{}", command, comment);
        self.run_invocation(&CommandInvocation::new(command).sudo(sudo))
    }

    pub fn chdir(&mut self, directory: &str) -> Result<()> {
        self.run(&format!("cd {}", directory))?;
        Ok(())
    }

    pub fn mkdir(&mut self, directory: &str, sudo: bool) -> Result<()> {
        self.run_invocation(&CommandInvocation::new(format!("mkdir -p {}", directory)).sudo(sudo))?;
        Ok(())
    }

    /// Create a directory if needed and change into it
    pub fn in_directory(&mut self, directory: &str, sudo: bool) -> Result<()> {
        self.mkdir(directory, sudo)?;
        self.chdir(directory)
    }

    pub fn isdir(&mut self, path: &str) -> Result<bool> {
        match self.run(&format!("test -d {}", path)) {
            Ok(_) => Ok(true),
            Err(ShellError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current working directory of the shell
    pub fn cwd(&mut self) -> Result<String> {
        let result = self.run("pwd")?;
        result
            .lines
            .into_iter()
            .next()
            .ok_or_else(|| ShellError::CommandFailed {
                command: "pwd".to_string(),
                return_code: Some(0),
                output: Vec::new(),
            })
    }

    pub fn set_env(&mut self, name: &str, value: &str) -> Result<()> {
        self.run(&format!("export {}='{}'", name, value))?;
        Ok(())
    }

    pub fn append_to_file(&mut self, text: &str, file_name: &str) -> Result<()> {
        self.run(&format!("echo \"{}\" >> {}", text, file_name))?;
        Ok(())
    }

    pub fn copy(&mut self, source: &str, dest: &str, sudo: bool) -> Result<()> {
        self.run_invocation(&CommandInvocation::new(format!("cp {} {}", source, dest)).sudo(sudo))?;
        Ok(())
    }

    pub fn move_path(&mut self, source: &str, dest: &str, sudo: bool) -> Result<()> {
        self.run_invocation(&CommandInvocation::new(format!("mv {} {}", source, dest)).sudo(sudo))?;
        Ok(())
    }

    pub fn ls(&mut self, target: &str, sudo: bool) -> Result<Vec<String>> {
        let result =
            self.run_invocation(&CommandInvocation::new(format!("ls {}", target)).sudo(sudo))?;
        Ok(result.lines)
    }

    pub fn rm(&mut self, path: &str) -> Result<()> {
        self.run(&format!("rm {}", path))?;
        Ok(())
    }

    /// Install whichever of `packages` dpkg doesn't know about
    pub fn install_packages(&mut self, packages: &[String]) -> Result<()> {
        log::info!("install_packages: {}", packages.join(" "));
        let mut missing = Vec::new();
        for package in packages {
            let result = self.execute(&CommandInvocation::new(format!("dpkg -l {}", package)))?;
            if result
                .lines
                .iter()
                .any(|line| line.to_lowercase().contains("no packages found matching"))
            {
                missing.push(package.as_str());
            }
        }

        if !missing.is_empty() {
            self.run_sudo("apt-get update --fix-missing")?;
            self.run_sudo(&format!("apt-get -yq install {}", missing.join(" ")))?;
        }
        Ok(())
    }

    /// Run a build step, optionally tied to the checkout it builds
    pub fn run_build_command(
        &mut self,
        build_command: &str,
        source: Option<&CheckoutHandle>,
        expectations: &[Expectation],
    ) -> Result<CommandResult> {
        match source {
            Some(handle) => log::info!("build: {} (source {})", build_command, handle.cache_key()),
            None => log::info!("build: {}", build_command),
        }
        self.run_invocation(&CommandInvocation::new(build_command).expect_all(expectations))
    }

    /// Fetch or update a checkout in the current directory
    pub fn checkout(&mut self, request: &CheckoutRequest) -> Result<CheckoutHandle> {
        CheckoutReconciler::new(self).checkout(request)
    }

    fn resolve_remote(&mut self, remote: &str) -> Result<String> {
        if remote.starts_with('/') || remote.starts_with('~') {
            return Ok(remote.to_string());
        }
        Ok(format!("{}/{}", self.cwd()?.trim_end_matches('/'), remote))
    }

    /// Copy a local file onto the target; relative paths follow the shell's cwd
    pub fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let remote = self.resolve_remote(remote)?;
        log::info!("put: {} -> {}", local.display(), remote);
        self.session.put_file(local, &remote)
    }

    pub fn get_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        let remote = self.resolve_remote(remote)?;
        log::info!("get: {} -> {}", remote, local.display());
        self.session.get_file(&remote, local)
    }

    pub fn write_file(&mut self, remote: &str, contents: &str) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(contents.as_bytes())?;
        staged.flush()?;
        self.put_file(staged.path(), remote)
    }
}
