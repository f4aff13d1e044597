//! In-memory scripted shell shared by the integration tests.
//!
//! The scripted shell keeps its state (cwd, last return code, prompt
//! counter, directories) across connections, the way a screen session
//! outlives ssh.

#![allow(dead_code)]

use shellpilot::config::{Config, TransportKind};
use shellpilot::core::{CommandExecutor, ShellSession, Transport};
use shellpilot::ShellError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const HEAD: &str = "3f2c1e0a9d8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d";
pub const BZR_REVNO: &str = "42";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Question {
    HostKey,
    Colour,
    Password,
    /// Waiting for any line of input
    Wake,
    /// Busy until a deadline; input is swallowed
    Linger,
}

#[derive(Debug, Default)]
pub struct ShellState {
    pub connected: bool,
    pub fail_opens: u32,
    /// Opens succeed but the connection never comes up
    pub zombie: bool,
    /// Connected, but input goes nowhere
    pub mute: bool,
    pub opens: u32,
    pub reattaches: u32,
    pub interrupts: u32,
    pub cwd: String,
    pub rc: i32,
    pub counter: u64,
    pub ps1: Option<String>,
    awaiting: Option<Question>,
    linger_until: Option<Instant>,
    pub sudo_password: Option<String>,
    /// Absolute paths that exist
    pub dirs: BTreeSet<String>,
    /// Git checkout directory -> origin URL
    pub remotes: BTreeMap<String, String>,
    /// Bzr checkout directory -> parent branch
    pub bzr_parents: BTreeMap<String, String>,
    /// What `git config --global -l` fails with, if anything
    pub git_config_error: Option<String>,
    /// Packages dpkg knows about
    pub installed: BTreeSet<String>,
    /// Every line the shell read, in order
    pub inputs: Vec<String>,
    typed: String,
    output: Vec<u8>,
}

impl ShellState {
    fn write(&mut self, text: &str) {
        self.output.extend_from_slice(text.as_bytes());
    }

    fn render_prompt(&self, count: u64) -> String {
        match &self.ps1 {
            Some(ps1) => ps1.replace(r"\#", &count.to_string()),
            None => "$ ".to_string(),
        }
    }

    fn prompt(&mut self) {
        self.counter += 1;
        let prompt = self.render_prompt(self.counter);
        self.write(&prompt);
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.trim_end_matches('/').to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), path.trim_end_matches('/'))
        }
    }

    fn finish_linger(&mut self) {
        let due = self
            .linger_until
            .map_or(false, |deadline| Instant::now() >= deadline);
        if self.awaiting == Some(Question::Linger) && due {
            self.awaiting = None;
            self.linger_until = None;
            self.write("\r\ndone\r\n");
            self.rc = 0;
            self.prompt();
        }
    }

    fn answer(&mut self, question: Question, line: &str) {
        self.rc = match question {
            Question::HostKey if line == "yes" => {
                self.write("Warning: Permanently added 'example' to the list of known hosts.\r\n");
                0
            }
            Question::HostKey => {
                self.write("Host key verification failed.\r\n");
                255
            }
            Question::Colour => 0,
            Question::Password if Some(line) == self.sudo_password.as_deref() => {
                self.write("done\r\n");
                0
            }
            Question::Password => {
                self.write("Sorry, try again.\r\n");
                1
            }
            Question::Wake => {
                self.write("woke up\r\n");
                0
            }
            Question::Linger => 0,
        };
    }

    fn execute(&mut self, line: &str) {
        self.inputs.push(line.to_string());
        if self.awaiting == Some(Question::Linger) {
            return;
        }
        // Passwords are not echoed
        let echo = if self.awaiting == Some(Question::Password) {
            ""
        } else {
            line
        };
        self.write(&format!("{}\r\n", echo));

        if let Some(question) = self.awaiting.take() {
            self.answer(question, line);
            self.prompt();
            return;
        }

        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "" => {}
            _ if cmd.starts_with('#') => {}
            _ if cmd.starts_with("PS1=") => {
                self.ps1 = Some(line["PS1=".len()..].trim_matches('"').to_string());
                self.rc = 0;
            }
            _ if cmd.starts_with("TERM=") => self.rc = 0,
            "unset" | "export" => self.rc = 0,
            "echo" if arg == "$?" => {
                let rc = self.rc;
                self.write(&format!("{}\r\n", rc));
                self.rc = 0;
            }
            "pwd" => {
                let cwd = self.cwd.clone();
                self.write(&format!("{}\r\n", cwd));
                self.rc = 0;
            }
            "cd" => {
                self.cwd = self.resolve(arg);
                self.rc = 0;
            }
            "test" => {
                let path = self.resolve(arg.trim_start_matches("-d "));
                self.rc = if self.dirs.contains(&path) { 0 } else { 1 };
            }
            "mkdir" => {
                let path = self.resolve(arg.trim_start_matches("-p "));
                self.dirs.insert(path);
                self.rc = 0;
            }
            "rm" => {
                let path = self.resolve(arg.trim_start_matches("-rf "));
                let nested = format!("{}/", path);
                self.dirs.retain(|dir| *dir != path && !dir.starts_with(&nested));
                self.remotes.remove(&path);
                self.bzr_parents.remove(&path);
                self.rc = 0;
            }
            "say" => {
                self.write(&format!("{}\r\n", arg));
                self.rc = 0;
            }
            "noeol" => {
                self.write("partial output");
                self.rc = 0;
            }
            "eolprompt" => {
                // The prompt arrives as a complete line
                self.rc = 0;
                self.prompt();
                self.write("\r\n");
                return;
            }
            "sleepy" => {
                self.awaiting = Some(Question::Wake);
                return;
            }
            "linger" => {
                // Prompt text glued to output, then silence for a while
                let ahead = self.render_prompt(self.counter + 1);
                self.write(&format!("junk{}\r\nworking", ahead));
                self.awaiting = Some(Question::Linger);
                self.linger_until = Some(Instant::now() + Duration::from_millis(150));
                return;
            }
            "connect" => {
                self.write("The authenticity of host 'example (10.0.0.1)' can't be established.\r\n");
                self.write("Are you sure you want to continue connecting (yes/no)? ");
                self.awaiting = Some(Question::HostKey);
                return;
            }
            "adduser" => {
                self.write("Enable color display in this user account (y/N)? ");
                self.awaiting = Some(Question::Colour);
                return;
            }
            "fetch" => {
                self.write("fatal: The remote end hung up unexpectedly\r\n");
                return;
            }
            "dpkg" => {
                let package = arg.trim_start_matches("-l ");
                if self.installed.contains(package) {
                    self.write(&format!("ii  {}  1.0-1  amd64  scripted package\r\n", package));
                    self.rc = 0;
                } else {
                    self.write(&format!(
                        "dpkg-query: no packages found matching {}\r\n",
                        package
                    ));
                    self.rc = 1;
                }
            }
            "git" => self.rc = self.git(arg),
            "bzr" => self.rc = self.bzr(arg),
            "~/bin/repo" => {
                if arg.starts_with("init -u ") {
                    let url = arg["init -u ".len()..]
                        .split(' ')
                        .next()
                        .unwrap_or("")
                        .to_string();
                    let manifests = self.resolve(".repo/manifests");
                    self.dirs.insert(manifests.clone());
                    self.remotes.insert(manifests, url);
                }
                self.rc = 0;
            }
            "sudo" if arg.starts_with("-n ") => {
                if self.sudo_password.is_some() {
                    self.write("sudo: a password is required\r\n");
                    self.rc = 1;
                } else {
                    self.rc = 0;
                }
            }
            "sudo" if self.sudo_password.is_some() => {
                self.write("[sudo] password for ci: ");
                self.awaiting = Some(Question::Password);
                return;
            }
            "sudo" => self.rc = 0,
            _ => {
                self.write(&format!("bash: {}: command not found\r\n", cmd));
                self.rc = 127;
            }
        }
        self.prompt();
    }

    fn git(&mut self, arg: &str) -> i32 {
        if arg == "remote show origin" {
            let Some(url) = self.remotes.get(&self.cwd).cloned() else {
                self.write("fatal: 'origin' does not appear to be a git repository\r\n");
                return 128;
            };
            self.write(&format!(
                "* remote origin\r\n  Fetch URL: {}\r\n  Push  URL: {}\r\n",
                url, url
            ));
            return 0;
        }
        if arg == "config --global -l" {
            if let Some(error) = self.git_config_error.clone() {
                self.write(&format!("{}\r\n", error));
                return 128;
            }
            self.write("user.name=CI\r\n");
            return 0;
        }
        if arg.starts_with("config --global ") {
            self.git_config_error = None;
            return 0;
        }
        if arg.starts_with("-C ") && arg.ends_with("rev-parse HEAD") {
            self.write(&format!("{}\r\n", HEAD));
            return 0;
        }
        if arg.starts_with("clone ") {
            let url = arg.rsplit(' ').next().unwrap_or("").to_string();
            let name = url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
            let dir = self.resolve(name.strip_suffix(".git").unwrap_or(name));
            self.dirs.insert(dir.clone());
            self.remotes.insert(dir, url);
        }
        0
    }

    fn bzr(&mut self, arg: &str) -> i32 {
        if arg == "info" {
            let Some(parent) = self.bzr_parents.get(&self.cwd).cloned() else {
                self.write("bzr: ERROR: Not a branch: \"/work/\".\r\n");
                return 3;
            };
            self.write("Standalone tree (format: 2a)\r\nLocation:\r\n  branch root: .\r\n\r\n");
            self.write(&format!("Related branches:\r\n  parent branch: {}\r\n", parent));
            return 0;
        }
        if arg.starts_with("revno ") {
            self.write(&format!("{}\r\n", BZR_REVNO));
            return 0;
        }
        if let Some(rest) = arg.strip_prefix("checkout --quiet ") {
            if let Some((url, dir)) = rest.split_once(' ') {
                let dir = self.resolve(dir);
                self.dirs.insert(dir.clone());
                self.bzr_parents.insert(dir, url.to_string());
            }
        }
        0
    }
}

#[derive(Clone)]
pub struct ScriptedShell(Arc<Mutex<ShellState>>);

impl ScriptedShell {
    pub fn new(cwd: &str) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(cwd.to_string());
        Self(Arc::new(Mutex::new(ShellState {
            cwd: cwd.to_string(),
            dirs,
            ..ShellState::default()
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, ShellState> {
        self.0.lock().unwrap()
    }

    /// Break the connection; the next `failures` opens are refused
    pub fn drop_connection(&self, failures: u32) {
        let mut state = self.state();
        state.connected = false;
        state.fail_opens = failures;
    }

    /// Lines read since the last call, without liveness tokens and `$?` checks
    pub fn take_commands(&self) -> Vec<String> {
        std::mem::take(&mut self.state().inputs)
            .into_iter()
            .filter(|line| !line.starts_with("#ack ") && line != "echo $?")
            .collect()
    }
}

impl Transport for ScriptedShell {
    fn kind(&self) -> TransportKind {
        TransportKind::MultiplexedRemote
    }

    fn open(&mut self) -> shellpilot::Result<()> {
        let mut state = self.state();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(ShellError::Transport("connection refused".to_string()));
        }
        state.opens += 1;
        if !state.zombie {
            state.connected = true;
        }
        Ok(())
    }

    fn reattach(&mut self) -> shellpilot::Result<()> {
        self.state().reattaches += 1;
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> shellpilot::Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(ShellError::Transport("broken pipe".to_string()));
        }
        if state.mute {
            return Ok(());
        }
        for &byte in data {
            match byte {
                0x03 => {
                    state.typed.clear();
                    state.interrupts += 1;
                    state.awaiting = None;
                    state.linger_until = None;
                    state.write("^C\r\n");
                    state.rc = 130;
                    state.prompt();
                }
                b'\n' => {
                    let line = std::mem::take(&mut state.typed);
                    state.execute(&line);
                }
                _ => state.typed.push(byte as char),
            }
        }
        Ok(())
    }

    fn receive_raw(&mut self, max: usize) -> shellpilot::Result<Option<Vec<u8>>> {
        let mut state = self.state();
        if !state.connected {
            return Ok(None);
        }
        state.finish_linger();
        if state.output.is_empty() {
            return Ok(None);
        }
        let n = max.min(state.output.len());
        Ok(Some(state.output.drain(..n).collect()))
    }

    fn is_active(&mut self) -> bool {
        self.state().connected
    }

    fn reconnectable(&self) -> bool {
        true
    }

    fn probes_before_send(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.state().connected = false;
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.prompt = r"fake \#: ".to_string();
    config.handshake_polls = 200;
    config.reconnect.delay_secs = 0.0;
    config.probe.interval_ms = 1;
    config.executor.max_backoff_ms = 20;
    config
}

pub fn executor_with(shell: &ScriptedShell, config: &Config) -> CommandExecutor {
    let mut session = ShellSession::with_transport(Box::new(shell.clone()), config).unwrap();
    session.connect().unwrap();
    CommandExecutor::new(session, config).unwrap()
}

pub fn executor(shell: &ScriptedShell) -> CommandExecutor {
    executor_with(shell, &config())
}
