//! Control of the external MTA: configuration check, reload, status and
//! lookup-table rebuild.
//!
//! The engine only talks to the MTA through the `MtaControl` trait, so
//! tests can substitute a scripted implementation.  `CommandMta` runs the
//! commands from `MtaSettings`, each under a hard timeout.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::config::MtaSettings;
use crate::errors::{Result, StageError};

/// Result of a configuration check.  An empty error list means the
/// candidate was accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub errors: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Operations the engine needs from the MTA.
pub trait MtaControl: Send + Sync {
    /// Check the configuration in `config_dir`, whose main file is `file`.
    fn check(&self, config_dir: &Path, file: &Path) -> Result<CheckReport>;

    /// Ask the running MTA to reload its configuration.
    fn reload(&self) -> Result<()>;

    /// Whether the MTA is up.  Queried once after a reload.
    fn is_running(&self) -> Result<bool>;

    /// Rebuild the lookup table derived from `file` (e.g. a credential map).
    fn rebuild_map(&self, file: &Path) -> Result<()>;
}

/// `MtaControl` backed by external commands.
pub struct CommandMta {
    settings: MtaSettings,
    timeout: Duration,
}

struct CommandOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn describe_failure(&self) -> String {
        let tail = self
            .stderr
            .lines()
            .chain(self.stdout.lines())
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        match self.status.code() {
            Some(code) if tail.is_empty() => format!("exited with status {code}"),
            Some(code) => format!("exited with status {code}: {tail}"),
            None => "terminated by signal".to_string(),
        }
    }
}

impl CommandMta {
    pub fn new(settings: MtaSettings) -> Self {
        let timeout = settings.command_timeout();
        Self { settings, timeout }
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(
        &self,
        tool: &str,
        template: &[String],
        config_dir: Option<&Path>,
        file: Option<&Path>,
    ) -> Result<CommandOutput> {
        let argv = substitute(template, config_dir, file);
        let (program, args) = argv.split_first().ok_or_else(|| StageError::ExternalTool {
            tool: tool.to_string(),
            detail: "no command configured".to_string(),
        })?;

        debug!("Running {tool}: {}", argv.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StageError::ExternalTool {
                tool: tool.to_string(),
                detail: format!("could not start '{program}': {e}"),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_deadline(&mut child, self.timeout)? {
            Some(status) => status,
            None => {
                warn!("{tool} exceeded {:?}, killing it", self.timeout);
                let _ = child.kill();
                let _ = child.wait();
                return Err(StageError::ExternalTool {
                    tool: tool.to_string(),
                    detail: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        let output = CommandOutput {
            status,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        };
        trace!("{tool} finished: {status}");
        Ok(output)
    }
}

impl MtaControl for CommandMta {
    fn check(&self, config_dir: &Path, file: &Path) -> Result<CheckReport> {
        let out = self.run(
            "configuration check",
            &self.settings.check_command,
            Some(config_dir),
            Some(file),
        )?;

        let mut errors: Vec<String> = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .filter(|l| l.contains("fatal:") || l.contains("error:"))
            .map(|l| l.trim().to_string())
            .collect();

        if !out.status.success() && errors.is_empty() {
            errors.push(out.describe_failure());
        }
        Ok(CheckReport { errors })
    }

    fn reload(&self) -> Result<()> {
        let out = self.run("reload", &self.settings.reload_command, None, None)?;
        if !out.status.success() {
            return Err(StageError::ExternalTool {
                tool: "reload".to_string(),
                detail: out.describe_failure(),
            });
        }
        Ok(())
    }

    fn is_running(&self) -> Result<bool> {
        let out = self.run("status", &self.settings.status_command, None, None)?;
        Ok(out.status.success())
    }

    fn rebuild_map(&self, file: &Path) -> Result<()> {
        let Some(template) = &self.settings.map_command else {
            return Ok(());
        };
        let out = self.run("map rebuild", template, None, Some(file))?;
        if !out.status.success() {
            return Err(StageError::ExternalTool {
                tool: "map rebuild".to_string(),
                detail: out.describe_failure(),
            });
        }
        Ok(())
    }
}

/// Replace `{config_dir}` and `{file}` in every argument.
fn substitute(template: &[String], config_dir: Option<&Path>, file: Option<&Path>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            let mut arg = arg.clone();
            if let Some(dir) = config_dir {
                arg = arg.replace("{config_dir}", &dir.to_string_lossy());
            }
            if let Some(file) = file {
                arg = arg.replace("{file}", &file.to_string_lossy());
            }
            arg
        })
        .collect()
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Poll the child until it exits or `timeout` elapses (`None`).
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn mta(check: &str, reload: &str, status: &str) -> CommandMta {
        CommandMta::new(MtaSettings {
            check_command: sh(check),
            reload_command: sh(reload),
            status_command: sh(status),
            map_command: None,
            check_companions: Vec::new(),
            command_timeout_secs: 5,
        })
    }

    #[test]
    fn clean_check_has_no_errors() {
        let dir = TempDir::new().unwrap();
        let m = mta("exit 0", "exit 0", "exit 0");
        let report = m.check(dir.path(), &dir.path().join("main.cf")).unwrap();
        assert!(report.is_ok());
    }

    #[test]
    fn check_collects_fatal_and_error_lines() {
        let dir = TempDir::new().unwrap();
        let m = mta(
            "echo 'postfix: warning: harmless'; echo 'postfix: fatal: bad mynetworks' >&2; exit 1",
            "exit 0",
            "exit 0",
        );
        let report = m.check(dir.path(), &dir.path().join("main.cf")).unwrap();
        assert_eq!(report.errors, vec!["postfix: fatal: bad mynetworks"]);
    }

    #[test]
    fn nonzero_check_without_error_lines_still_fails() {
        let dir = TempDir::new().unwrap();
        let m = mta("echo oops >&2; exit 2", "exit 0", "exit 0");
        let report = m.check(dir.path(), &dir.path().join("main.cf")).unwrap();
        assert_eq!(report.errors, vec!["exited with status 2: oops"]);
    }

    #[test]
    fn placeholders_are_substituted() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("main.cf");
        std::fs::write(&file, "myhostname = a.example\n").unwrap();

        let mut settings = MtaSettings {
            check_command: vec![
                "sh".into(),
                "-c".into(),
                "test -f \"$0\" && test -d \"$1\" || echo 'error: missing'".into(),
                "{file}".into(),
                "{config_dir}".into(),
            ],
            ..MtaSettings::default()
        };
        settings.command_timeout_secs = 5;
        let report = CommandMta::new(settings).check(dir.path(), &file).unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn reload_failure_is_reported() {
        let m = mta("exit 0", "echo 'reload refused' >&2; exit 1", "exit 0");
        let err = m.reload().unwrap_err();
        assert!(err.to_string().contains("reload refused"), "{err}");
    }

    #[test]
    fn status_exit_code_means_running() {
        assert!(mta("exit 0", "exit 0", "exit 0").is_running().unwrap());
        assert!(!mta("exit 0", "exit 0", "exit 3").is_running().unwrap());
    }

    #[test]
    fn slow_commands_time_out() {
        let m = mta("exit 0", "sleep 5", "exit 0").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = m.reload().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(err, StageError::ExternalTool { ref detail, .. } if detail.contains("timed out")));
    }

    #[test]
    fn missing_program_is_an_external_tool_error() {
        let m = CommandMta::new(MtaSettings {
            reload_command: vec!["/nonexistent/mta-reload".into()],
            ..MtaSettings::default()
        });
        assert!(matches!(m.reload(), Err(StageError::ExternalTool { .. })));
    }

    #[test]
    fn unbounded_timeout_still_waits_for_exit() {
        let m = mta("exit 0", "exit 0", "exit 0").with_timeout(Duration::MAX);
        assert!(m.reload().is_ok());
    }

    #[test]
    fn map_rebuild_is_skipped_when_unconfigured() {
        let dir = TempDir::new().unwrap();
        let m = mta("exit 0", "exit 0", "exit 0");
        assert!(m.rebuild_map(&dir.path().join("sasl_passwd")).is_ok());
    }
}
