//! External command execution.
//!
//! [`Cmd`] is a builder around `std::process::Command` that classifies
//! success, logs through the injected [`Logger`](crate::logger::Logger), and
//! keeps `PWD` consistent with the working directory it runs in.
//!
//! ```rust,ignore
//! let runner = ProcessRunner::new(logger);
//! let result = runner
//!     .cmd("qemu-img")
//!     .args(["create", "-f", "qcow2"])
//!     .arg_path(&disk)
//!     .arg("8192M")
//!     .error_msg("qemu-img create failed")
//!     .run()?;
//! ```

pub mod watch;

pub use watch::MainLoop;

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};

use crate::error::{BuildError, Result};
use crate::logger::{ConsoleLogger, SharedLogger};

/// Outcome of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// False when the process was terminated by a signal.
    pub exited_normally: bool,
    /// Exit code, or the signal number when `exited_normally` is false.
    pub exit_status: i32,
    pub output: Vec<u8>,
}

impl ProcessResult {
    pub fn from_status(status: ExitStatus, output: Vec<u8>) -> Self {
        match status.code() {
            Some(code) => Self {
                exited_normally: true,
                exit_status: code,
                output,
            },
            None => Self {
                exited_normally: false,
                exit_status: status.signal().unwrap_or(-1),
                output,
            },
        }
    }

    /// Result for a child whose exit status could not be collected.
    pub(crate) fn lost() -> Self {
        Self {
            exited_normally: false,
            exit_status: -1,
            output: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exited_normally && self.exit_status == 0
    }

    /// Captured stdout with surrounding whitespace removed.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.output).trim().to_string()
    }

    /// Non-empty stdout lines, in order.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.output)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Creates commands bound to one logger.
#[derive(Clone)]
pub struct ProcessRunner {
    logger: SharedLogger,
}

impl ProcessRunner {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }

    pub fn cmd(&self, program: impl AsRef<OsStr>) -> Cmd {
        Cmd::new(program).logger(self.logger.clone())
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }
}

/// Builder for one external command invocation.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    error_msg: Option<String>,
    allow_fail: bool,
    log_success: bool,
    log_initiation: bool,
    logger: SharedLogger,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: None,
            error_msg: None,
            allow_fail: false,
            log_success: false,
            log_initiation: true,
            logger: ConsoleLogger::shared(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Replace the inherited environment entirely.
    pub fn env_override(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Set one variable on top of the inherited (or overridden) environment.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env
            .get_or_insert_with(inherited_env)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the failed result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn log_success(mut self) -> Self {
        self.log_success = true;
        self
    }

    /// Don't announce the command before running it.
    pub fn quiet(mut self) -> Self {
        self.log_initiation = false;
        self
    }

    pub fn logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Printable command line.
    pub fn cmdline(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| quote_arg(&part.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run and wait, capturing stdout. Stdin is `/dev/null`.
    pub fn run(self) -> Result<ProcessResult> {
        let mut command = self.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        self.announce();
        let output = command.output().map_err(|e| self.spawn_error(e))?;
        self.finish(output.status, output.stdout)
    }

    /// Run and wait, feeding `input` on stdin and capturing stdout.
    pub fn run_with_input(self, input: &[u8]) -> Result<ProcessResult> {
        let mut command = self.command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        self.announce();
        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;

        // Write from a separate thread so a chatty child can't deadlock us.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_vec();
            std::thread::spawn(move || stdin.write_all(&input))
        });
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.join() {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }
        self.finish(output.status, output.stdout)
    }

    /// Run and wait with stdio inherited from this process.
    pub fn run_interactive(self) -> Result<ProcessResult> {
        let mut command = self.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        self.announce();
        let status = command.status().map_err(|e| self.spawn_error(e))?;
        self.finish(status, Vec::new())
    }

    /// Start the process without waiting for it.
    ///
    /// The exit status is collected on a waiter thread and delivered through
    /// the returned [`AsyncChild`], normally by registering it with a
    /// [`MainLoop`].
    pub fn spawn(self) -> Result<AsyncChild> {
        let mut command = self.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        self.announce();
        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = match child.wait() {
                Ok(status) => ProcessResult::from_status(status, Vec::new()),
                Err(_) => ProcessResult::lost(),
            };
            let _ = tx.send(result);
        });

        Ok(AsyncChild { pid, exit_rx: rx })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = env_for_cwd(self.cwd.as_deref(), self.env.as_ref()) {
            command.env_clear().envs(env);
        }
        command
    }

    fn announce(&self) {
        if self.log_initiation {
            self.logger.info(&format!("Running: {}", self.cmdline()));
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> BuildError {
        if err.kind() == std::io::ErrorKind::NotFound {
            BuildError::not_found("program", PathBuf::from(&self.program))
        } else {
            err.into()
        }
    }

    fn finish(&self, status: ExitStatus, output: Vec<u8>) -> Result<ProcessResult> {
        let result = ProcessResult::from_status(status, output);
        let summary = || {
            let cwd = self
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "None".to_string());
            format!(
                "cmd '{}' (cwd={}) exited with code {}, {} bytes of output",
                self.cmdline(),
                cwd,
                result.exit_status,
                result.output.len()
            )
        };

        if !result.success() && !self.allow_fail {
            match &self.error_msg {
                Some(msg) => self.logger.error(&format!("{}: {}", msg, summary())),
                None => self.logger.error(&summary()),
            }
            return Err(BuildError::ProcessExecutionFailure {
                command: self.cmdline(),
                exited_normally: result.exited_normally,
                exit_status: result.exit_status,
            });
        }
        if self.log_success {
            self.logger.debug(&summary());
        }
        Ok(result)
    }
}

/// A launched process whose exit has not been observed yet.
pub struct AsyncChild {
    pid: u32,
    exit_rx: Receiver<ProcessResult>,
}

impl AsyncChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the process exits.
    pub fn wait(self) -> ProcessResult {
        self.exit_rx.recv().unwrap_or_else(|_| ProcessResult::lost())
    }

    pub(crate) fn into_parts(self) -> (u32, Receiver<ProcessResult>) {
        (self.pid, self.exit_rx)
    }
}

/// Compute the environment for a child running in `cwd`.
///
/// `PWD` is only rewritten when there is no explicit environment or the
/// explicit one already tracks `PWD`. A relative `cwd` is joined onto the
/// existing `PWD`. Returns `None` when the inherited environment can be used
/// unchanged.
pub fn env_for_cwd(
    cwd: Option<&Path>,
    env: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match cwd {
        Some(cwd) if env.map_or(true, |e| e.contains_key("PWD")) => {
            let mut env = env.cloned().unwrap_or_else(inherited_env);
            let pwd = match env.get("PWD") {
                Some(pwd) if cwd.is_relative() => Path::new(pwd).join(cwd),
                _ => cwd.to_path_buf(),
            };
            env.insert("PWD".to_string(), pwd.to_string_lossy().into_owned());
            Some(env)
        }
        _ => env.cloned(),
    }
}

fn inherited_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}
