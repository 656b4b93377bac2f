//! Subprocess execution for the CLIs this workspace drives (`aws`, `kubectl`,
//! `terraform`).
//!
//! Every invocation is described by a [`CommandSpec`] holding discrete argv
//! elements; nothing is ever passed through a shell.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Specification for a command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The program to execute
    pub program: String,
    /// Arguments as discrete elements
    pub args: Vec<String>,
    /// Optional working directory
    pub cwd: Option<PathBuf>,
    /// Environment overrides applied on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
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

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Whether every needle appears somewhere in the argument list.
    pub fn has_args(&self, needles: &[&str]) -> bool {
        needles
            .iter()
            .all(|needle| self.args.iter().any(|arg| arg == needle))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs a [`CommandSpec`] to completion.
///
/// An `Err` means the process could not be launched at all; a non-zero exit
/// is reported through [`CommandOutput::code`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!("Running: {}", spec);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.env);

        let output = cmd.output().await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use scripted::ScriptedRunner;

#[cfg(any(test, feature = "test-support"))]
mod scripted {
    use super::*;
    use std::sync::Mutex;

    struct Rule {
        needles: Vec<String>,
        output: CommandOutput,
        once: bool,
        used: bool,
    }

    /// Answers commands from a script of canned outputs and records every call.
    ///
    /// Rules are matched in registration order; a rule matches when all of its
    /// needles appear in the argument list. One-shot rules are consumed on
    /// first match, which lets a test script successive pages of the same call.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, needles: &[&str], output: CommandOutput) -> Self {
            self.push(needles, output, false);
            self
        }

        pub fn once(self, needles: &[&str], output: CommandOutput) -> Self {
            self.push(needles, output, true);
            self
        }

        fn push(&self, needles: &[&str], output: CommandOutput, once: bool) {
            if let Ok(mut rules) = self.rules.lock() {
                rules.push(Rule {
                    needles: needles.iter().map(|s| s.to_string()).collect(),
                    output,
                    once,
                    used: false,
                });
            }
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn calls_matching(&self, needles: &[&str]) -> Vec<CommandSpec> {
            self.calls()
                .into_iter()
                .filter(|spec| spec.has_args(needles))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(spec.clone());
            }

            let mut rules = self
                .rules
                .lock()
                .map_err(|_| std::io::Error::other("scripted runner poisoned"))?;

            for rule in rules.iter_mut() {
                if rule.once && rule.used {
                    continue;
                }
                let needles: Vec<&str> = rule.needles.iter().map(String::as_str).collect();
                if spec.has_args(&needles) {
                    rule.used = true;
                    return Ok(rule.output.clone());
                }
            }

            Ok(CommandOutput::failure(
                255,
                format!("no scripted response for: {}", spec),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("aws")
            .arg("s3api")
            .args(["head-bucket", "--bucket", "state"])
            .cwd("/tmp")
            .env("AWS_PAGER", "");

        assert_eq!(spec.program, "aws");
        assert_eq!(spec.args.len(), 4);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env.get("AWS_PAGER"), Some(&String::new()));
        assert_eq!(spec.to_string(), "aws s3api head-bucket --bucket state");
    }

    #[test]
    fn test_has_args() {
        let spec = CommandSpec::new("aws").args(["ec2", "delete-nat-gateway"]);
        assert!(spec.has_args(&["delete-nat-gateway"]));
        assert!(spec.has_args(&["ec2", "delete-nat-gateway"]));
        assert!(!spec.has_args(&["release-address"]));
    }

    #[test]
    fn test_command_output_status() {
        assert!(CommandOutput::success("{}").is_success());
        assert!(!CommandOutput::failure(1, "boom").is_success());
        assert!(!CommandOutput::default().is_success());
    }

    #[test]
    fn test_scripted_runner_once_rules_are_consumed() {
        let runner = ScriptedRunner::new()
            .once(&["list"], CommandOutput::success("page-1"))
            .on(&["list"], CommandOutput::success("page-2"));
        let spec = CommandSpec::new("aws").arg("list");

        let first = tokio_test::block_on(runner.run(&spec)).unwrap();
        let second = tokio_test::block_on(runner.run(&spec)).unwrap();
        let third = tokio_test::block_on(runner.run(&spec)).unwrap();

        assert_eq!(first.stdout, "page-1");
        assert_eq!(second.stdout, "page-2");
        assert_eq!(third.stdout, "page-2");
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_runner_unmatched_command_fails() {
        let runner = ScriptedRunner::new();
        let output = runner
            .run(&CommandSpec::new("kubectl").arg("get"))
            .await
            .unwrap();
        assert!(!output.is_success());
        assert!(output.stderr.contains("no scripted response"));
    }
}
