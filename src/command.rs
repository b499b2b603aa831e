//! External command execution
//!
//! All privileged tooling (`wg`, `wg-quick`) goes through the
//! [`CommandRunner`] trait so the store and the live interface can be
//! exercised without root. Interface hooks are not run from here; they are
//! part of the rendered wg-quick file.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ToolingError;

/// Default bound on a single external command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A command to run, with optional stdin payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Log line override; `None` logs program and args
    pub display: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            display: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace what gets logged, for commands carrying secrets or long scripts
    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    fn log_line(&self) -> String {
        match &self.display {
            Some(d) => d.clone(),
            None if self.args.is_empty() => self.program.clone(),
            None => format!("{} {}", self.program, self.args.join(" ")),
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with exit status and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Capability to run external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is returned as output, not an error;
    /// use [`run_checked`] to turn it into [`ToolingError::Failed`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolingError>;
}

/// Run a command and require a zero exit status
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandOutput, ToolingError> {
    let output = runner.run(spec).await?;
    if !output.success() {
        return Err(ToolingError::Failed {
            program: spec.program.clone(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    async fn execute(spec: &CommandSpec) -> Result<CommandOutput, ToolingError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolingError::Unavailable {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| ToolingError::Failed {
                    program: spec.program.clone(),
                    status: None,
                    stderr: format!("writing stdin: {}", e),
                })?;
            // Dropping stdin closes the pipe so the child sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ToolingError::Failed {
                program: spec.program.clone(),
                status: None,
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolingError> {
        tracing::debug!("$ {}", spec.log_line());

        match tokio::time::timeout(spec.timeout, Self::execute(spec)).await {
            Ok(result) => result,
            Err(_) => Err(ToolingError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            }),
        }
    }
}

/// Test double: records every invocation and replays canned responses
///
/// Responses come from the rule with the longest matching argument
/// prefix; unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

#[derive(Debug)]
struct Rule {
    program: String,
    prefix: Vec<String>,
    responses: VecDeque<Result<CommandOutput, ToolingError>>,
    /// Last response repeats once the queue drains
    sticky: Option<Result<CommandOutput, ToolingError>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `program args...`. The last queued response
    /// for a rule keeps being returned after the others are consumed.
    pub fn respond(
        &self,
        program: &str,
        prefix: &[&str],
        response: Result<CommandOutput, ToolingError>,
    ) -> &Self {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.program == program && r.prefix == prefix)
        {
            if let Some(previous) = rule.sticky.replace(response) {
                rule.responses.push_back(previous);
            }
        } else {
            rules.push(Rule {
                program: program.to_string(),
                prefix,
                responses: VecDeque::new(),
                sticky: Some(response),
            });
        }
        self
    }

    /// Every command run so far, in order
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Commands whose program and leading args match
    pub fn calls_matching(&self, program: &str, prefix: &[&str]) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| spec_matches(c, program, prefix))
            .collect()
    }
}

fn spec_matches(spec: &CommandSpec, program: &str, prefix: &[impl AsRef<str>]) -> bool {
    spec.program == program
        && spec.args.len() >= prefix.len()
        && spec
            .args
            .iter()
            .zip(prefix)
            .all(|(a, p)| a == p.as_ref())
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolingError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        // Longest prefix wins so specific rules can override general ones
        let rule = rules
            .iter_mut()
            .filter(|r| spec_matches(spec, &r.program, &r.prefix[..]))
            .max_by_key(|r| r.prefix.len());

        match rule {
            Some(rule) => match rule.responses.pop_front() {
                Some(response) => response,
                None => rule
                    .sticky
                    .clone()
                    .unwrap_or_else(|| Ok(CommandOutput::ok(""))),
            },
            None => Ok(CommandOutput::ok("")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = CommandSpec::new("wg")
            .args(["show", "wg0", "dump"])
            .timeout(Duration::from_secs(3));
        assert_eq!(spec.args, vec!["show", "wg0", "dump"]);
        assert_eq!(spec.timeout, Duration::from_secs(3));
        assert_eq!(spec.log_line(), "wg show wg0 dump");
    }

    #[test]
    fn test_display_override_hides_args() {
        let spec = CommandSpec::new("wg").arg("pubkey").stdin("secret").display("wg pubkey");
        assert_eq!(spec.log_line(), "wg pubkey");
    }

    #[tokio::test]
    async fn test_scripted_runner_queue_then_sticky() {
        let runner = ScriptedRunner::new();
        runner.respond("wg", &["genkey"], Ok(CommandOutput::ok("first")));
        runner.respond("wg", &["genkey"], Ok(CommandOutput::ok("second")));

        let spec = CommandSpec::new("wg").arg("genkey");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "first");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "second");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "second");
        assert_eq!(runner.calls_matching("wg", &["genkey"]).len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_runner_longest_prefix() {
        let runner = ScriptedRunner::new();
        runner.respond("wg", &[], Ok(CommandOutput::ok("generic")));
        runner.respond("wg", &["show"], Ok(CommandOutput::ok("show")));

        let show = CommandSpec::new("wg").args(["show", "wg0"]);
        let other = CommandSpec::new("wg").arg("genpsk");
        assert_eq!(runner.run(&show).await.unwrap().stdout, "show");
        assert_eq!(runner.run(&other).await.unwrap().stdout, "generic");
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "wg",
            &["syncconf"],
            Ok(CommandOutput::failed(1, "Unable to modify interface\n")),
        );
        let spec = CommandSpec::new("wg").args(["syncconf", "wg0", "/dev/stdin"]);
        let err = run_checked(&runner, &spec).await.unwrap_err();
        assert_eq!(
            err,
            ToolingError::Failed {
                program: "wg".into(),
                status: Some(1),
                stderr: "Unable to modify interface".into(),
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("definitely-not-a-real-program-peerguard");
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ToolingError::Unavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = runner.run(&spec).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(
            err,
            ToolingError::Timeout {
                program: "sleep".into(),
                timeout: Duration::from_millis(200),
            }
        );
        assert_eq!(err.to_string(), "sleep timed out after 200ms");
    }
}
