//! Delegated tool invocation.
//!
//! Tools run synchronously to completion; there is no timeout and no
//! cancellation. Combined stdout/stderr is teed line by line into the
//! session's log file and echoed at debug level. Steps reach tools only
//! through [`ToolRunner`] so tests can script them.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};

use crate::error::AnatprepError;
use crate::io::tracker::now_timestamp;

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment, on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// Where combined output is appended.
    pub log_path: Option<PathBuf>,
    /// Inherit the terminal (viewers); output is not captured.
    pub interactive: bool,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            log_path: None,
            interactive: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn log_to(mut self, path: &Path) -> Self {
        self.log_path = Some(path.to_path_buf());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Short tool name for messages (`/usr/bin/bet` → `bet`).
    pub fn tool_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a tool ended. `code` is `None` when killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    pub code: Option<i32>,
}

impl ToolExit {
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

/// Seam between steps and the operating system.
pub trait ToolRunner {
    /// Run to completion. Errors only when the tool cannot be started.
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolExit>;

    /// Whether `program` can be started (on `PATH`, or an existing path).
    fn is_available(&self, program: &str) -> bool;
}

/// Runs real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    #[instrument(skip_all, fields(tool = %invocation.tool_name(), interactive = invocation.interactive))]
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolExit> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        info!(command = %invocation.command_line(), "running tool");

        let log = match &invocation.log_path {
            Some(path) => Some(open_log(path, invocation)?),
            None => None,
        };

        if invocation.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = spawn(&mut cmd, invocation)?
                .wait()
                .context("wait for tool")?;
            debug!(exit_code = ?status.code(), "tool finished");
            return Ok(ToolExit {
                code: status.code(),
            });
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = spawn(&mut cmd, invocation)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let log = Arc::new(log.map(Mutex::new));
        let stdout_log = Arc::clone(&log);
        let stderr_log = Arc::clone(&log);
        let stdout_handle = thread::spawn(move || tee_lines(stdout, &stdout_log));
        let stderr_handle = thread::spawn(move || tee_lines(stderr, &stderr_log));

        let status = child.wait().context("wait for tool")?;
        join_tee(stdout_handle).context("join stdout")?;
        join_tee(stderr_handle).context("join stderr")?;

        if let Some(mutex) = log.as_ref() {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "[exit code: {:?}]", status.code());
                let _ = writer.flush();
            }
        }
        debug!(exit_code = ?status.code(), "tool finished");
        Ok(ToolExit {
            code: status.code(),
        })
    }

    fn is_available(&self, program: &str) -> bool {
        find_program(program).is_some()
    }
}

/// Run and turn a non-zero exit into [`AnatprepError::ExternalToolFailure`].
pub fn run_checked(runner: &dyn ToolRunner, invocation: &ToolInvocation) -> Result<()> {
    let exit = runner.run(invocation)?;
    if exit.success() {
        return Ok(());
    }
    error!(
        tool = %invocation.tool_name(),
        exit_code = ?exit.code,
        log = ?invocation.log_path,
        "tool failed"
    );
    Err(AnatprepError::ExternalToolFailure {
        tool: invocation.tool_name(),
        code: exit.code,
        log: invocation.log_path.clone(),
    }
    .into())
}

/// Misconfiguration naming every program in `programs` that is unavailable.
pub fn require_tools(runner: &dyn ToolRunner, programs: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = programs
        .iter()
        .filter(|(program, _)| !runner.is_available(program))
        .map(|(program, package)| format!("'{program}' ({package})"))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(AnatprepError::Misconfiguration(format!(
        "not found in PATH: {}",
        missing.join(", ")
    ))
    .into())
}

/// Resolve `program` the way `Command` would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

fn spawn(cmd: &mut Command, invocation: &ToolInvocation) -> Result<std::process::Child> {
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            error!(tool = %invocation.program, "tool not found");
            Err(AnatprepError::Misconfiguration(format!(
                "'{}' not found in PATH",
                invocation.program
            ))
            .into())
        }
        Err(err) => {
            error!(err = %err, "failed to spawn tool");
            Err(err).with_context(|| format!("spawn {}", invocation.program))
        }
    }
}

fn open_log(path: &Path, invocation: &ToolInvocation) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "\n[{}] $ {}", now_timestamp(), invocation.command_line())
        .with_context(|| format!("write log {}", path.display()))?;
    writer.flush().ok();
    Ok(writer)
}

type SharedLog = Arc<Option<Mutex<BufWriter<File>>>>;

/// Forward each line to the log (flushed per line) and to debug tracing.
fn tee_lines<R: Read>(reader: R, log: &SharedLog) -> Result<()> {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        debug!(line = %String::from_utf8_lossy(&line).trim_end(), "tool output");
        if let Some(mutex) = log.as_ref() {
            if let Ok(mut writer) = mutex.lock() {
                if let Err(err) = writer.write_all(&line) {
                    warn!(err = %err, "failed to write tool log");
                } else if let Err(err) = writer.flush() {
                    warn!(err = %err, "failed to flush tool log");
                }
            }
        }
    }
    Ok(())
}

fn join_tee(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn output_is_teed_to_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/mask.log");
        let exit = SystemToolRunner
            .run(&sh("echo out; echo err 1>&2").log_to(&log))
            .expect("run");
        assert!(exit.success());
        let contents = fs::read_to_string(&log).expect("log");
        assert!(contents.contains("$ sh -c"));
        assert!(contents.contains("out\n"));
        assert!(contents.contains("err\n"));
    }

    #[test]
    fn log_is_appended_across_invocations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("step.log");
        SystemToolRunner
            .run(&sh("echo first").log_to(&log))
            .expect("run");
        SystemToolRunner
            .run(&sh("echo second").log_to(&log))
            .expect("run");
        let contents = fs::read_to_string(&log).expect("log");
        assert!(contents.contains("first") && contents.contains("second"));
    }

    #[test]
    fn non_zero_exit_is_tool_failure_with_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("step.log");
        let err = run_checked(&SystemToolRunner, &sh("exit 3").log_to(&log)).unwrap_err();
        match err.downcast_ref::<AnatprepError>() {
            Some(AnatprepError::ExternalToolFailure { tool, code, log: Some(path) }) => {
                assert_eq!(tool, "sh");
                assert_eq!(*code, Some(3));
                assert_eq!(path, &log);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_misconfiguration() {
        let err = SystemToolRunner
            .run(&ToolInvocation::new("anatprep-no-such-tool"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnatprepError>(),
            Some(AnatprepError::Misconfiguration(_))
        ));
        assert!(!SystemToolRunner.is_available("anatprep-no-such-tool"));
        assert!(SystemToolRunner.is_available("sh"));
    }

    #[test]
    fn env_is_passed_through() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("env.log");
        SystemToolRunner
            .run(&sh("echo $LOG_DIR").env("LOG_DIR", "/study/logs").log_to(&log))
            .expect("run");
        assert!(fs::read_to_string(&log).expect("log").contains("/study/logs"));
    }

    #[test]
    fn require_tools_lists_every_missing_program() {
        let err = require_tools(
            &SystemToolRunner,
            &[("sh", "POSIX"), ("anatprep-nope-a", "FSL"), ("anatprep-nope-b", "MRtrix3")],
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("anatprep-nope-a") && msg.contains("anatprep-nope-b"));
        assert!(!msg.contains("'sh'"));
    }
}
