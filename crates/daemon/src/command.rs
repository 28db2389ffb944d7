//! Privileged command execution
//!
//! Everything the daemon does to the host network goes through an external
//! binary: `ip`, `wg`, `sysctl`, `iptables`. This module resolves binaries
//! against a fixed directory list (callers never trust `PATH`), keeps secret
//! material off command lines, and records firewall insertions with a known
//! inverse so teardown can roll them back.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use wgmint_common::{Error, Result};

/// Directories searched when resolving an executable, in order.
const SEARCH_DIRS: &[&str] = &["/usr/sbin", "/usr/bin", "/sbin", "/bin"];

/// Executes a single external command and returns its trimmed stdout.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, argv: &[String], stdin: Option<&str>) -> Result<String>;
}

/// Runs commands on the host, optionally under sudo.
pub struct SystemExecutor {
    use_sudo: bool,
}

impl SystemExecutor {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    /// Resolve a bare command name against the fixed directory list. Names
    /// that resolve nowhere are returned unchanged and left to the OS.
    pub fn resolve(name: &str) -> String {
        for dir in SEARCH_DIRS {
            let joined = Path::new(dir).join(name);
            if joined.is_file() {
                return joined.to_string_lossy().into_owned();
            }
        }
        name.to_string()
    }
}

#[async_trait]
impl Executor for SystemExecutor {
    async fn exec(&self, argv: &[String], stdin: Option<&str>) -> Result<String> {
        let mut full: Vec<String> = Vec::with_capacity(argv.len() + 1);
        if self.use_sudo {
            full.push(Self::resolve("sudo"));
        }
        full.extend(argv.iter().cloned());

        // with sudo in front, the real command still needs resolving too
        let target = usize::from(self.use_sudo);
        if let Some(cmd) = full.get_mut(target) {
            *cmd = Self::resolve(cmd);
        }

        debug!("running: {}", full.join(" "));

        let mut command = Command::new(&full[0]);
        command
            .args(&full[1..])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Execution {
                command: full.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Argument to the `wg` binary. Secret values never appear on the command
/// line; they are written to a private temp file and passed by path.
#[derive(Debug, Clone)]
pub enum WgArg {
    Lit(String),
    Secret(String),
}

impl WgArg {
    pub fn lit(value: impl Into<String>) -> Self {
        Self::Lit(value.into())
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self::Secret(value.into())
    }
}

/// How a firewall rule was applied; determines its inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerb {
    Append,
    Insert,
}

impl RuleVerb {
    fn flag(self) -> &'static str {
        match self {
            Self::Append => "--append",
            Self::Insert => "--insert",
        }
    }
}

/// A recorded iptables rule with a known `--delete` inverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleAction {
    pub table: Option<String>,
    pub verb: RuleVerb,
    pub chain: String,
    pub matches: Vec<String>,
}

impl RuleAction {
    pub fn append(chain: &str, matches: &[&str]) -> Self {
        Self {
            table: None,
            verb: RuleVerb::Append,
            chain: chain.to_string(),
            matches: matches.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn append_in_table(table: &str, chain: &str, matches: &[&str]) -> Self {
        Self {
            table: Some(table.to_string()),
            ..Self::append(chain, matches)
        }
    }

    /// Render the iptables argument list; `invert` swaps the recorded verb
    /// for `--delete` without touching anything else.
    pub fn args(&self, invert: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(table) = &self.table {
            args.push("--table".to_string());
            args.push(table.clone());
        }
        args.push(if invert {
            "--delete".to_string()
        } else {
            self.verb.flag().to_string()
        });
        args.push(self.chain.clone());
        args.extend(self.matches.iter().cloned());
        args
    }
}

/// Entry point for every privileged command the daemon issues. Owns the
/// reversible-rule log replayed at teardown.
pub struct Commander {
    executor: Arc<dyn Executor>,
    rule_log: Mutex<Vec<RuleAction>>,
}

impl Commander {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            rule_log: Mutex::new(Vec::new()),
        }
    }

    pub async fn ip(&self, args: &[&str]) -> Result<String> {
        let argv: Vec<String> = std::iter::once("ip")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        self.executor.exec(&argv, None).await
    }

    pub async fn sysctl(&self, setting: &str) -> Result<String> {
        let argv = vec!["sysctl".to_string(), setting.to_string()];
        self.executor.exec(&argv, None).await
    }

    /// Run `wg`, writing each secret argument to a fresh private temp file.
    /// The files are unlinked when this call returns, on every exit path.
    pub async fn wg(&self, args: Vec<WgArg>, stdin: Option<&str>) -> Result<String> {
        let mut secret_files: Vec<NamedTempFile> = Vec::new();
        let mut argv = vec!["wg".to_string()];
        for arg in args {
            match arg {
                WgArg::Lit(value) => argv.push(value),
                WgArg::Secret(value) => {
                    let mut file = NamedTempFile::new()?;
                    file.write_all(value.as_bytes())?;
                    file.flush()?;
                    argv.push(file.path().to_string_lossy().into_owned());
                    secret_files.push(file);
                }
            }
        }
        self.executor.exec(&argv, stdin).await
        // secret_files dropped here; NamedTempFile unlinks on drop
    }

    /// Apply a firewall rule, recording it for teardown first so a failed
    /// insert still gets a (harmless) delete attempt on rollback.
    pub async fn iptables(&self, action: RuleAction) -> Result<String> {
        self.rule_log.lock().push(action.clone());
        let mut argv = vec!["iptables".to_string()];
        argv.extend(action.args(false));
        self.executor.exec(&argv, None).await
    }

    /// Replay the rule log in original order with each verb inverted to its
    /// `--delete` form, then clear it. Best-effort: a failed delete is
    /// logged and the replay continues.
    pub async fn undo_all(&self) {
        let log: Vec<RuleAction> = std::mem::take(&mut *self.rule_log.lock());
        for action in &log {
            let mut argv = vec!["iptables".to_string()];
            argv.extend(action.args(true));
            if let Err(e) = self.executor.exec(&argv, None).await {
                warn!("rollback command failed: {}", e);
            }
        }
    }

    pub fn rules_recorded(&self) -> usize {
        self.rule_log.lock().len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingExecutor;
    use super::*;

    #[test]
    fn test_resolve_fixed_dirs() {
        let sh = SystemExecutor::resolve("sh");
        assert!(sh.starts_with('/'), "sh resolved to {}", sh);
        assert!(sh.ends_with("/sh"));

        assert_eq!(
            SystemExecutor::resolve("no-such-binary-wgmint"),
            "no-such-binary-wgmint"
        );
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let executor = SystemExecutor::new(false);
        let out = executor
            .exec(&["echo".to_string(), "hello".to_string()], None)
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_exec_failure_carries_stderr() {
        let executor = SystemExecutor::new(false);
        let err = executor
            .exec(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo broken >&2; exit 3".to_string(),
                ],
                None,
            )
            .await
            .unwrap_err();
        match err {
            Error::Execution { command, stderr } => {
                assert!(command.contains("sh"));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_feeds_stdin() {
        let executor = SystemExecutor::new(false);
        let out = executor
            .exec(&["cat".to_string()], Some("piped input"))
            .await
            .unwrap();
        assert_eq!(out, "piped input");
    }

    #[tokio::test]
    async fn test_secret_file_substituted_and_removed() {
        let executor = RecordingExecutor::new();
        let commander = Commander::new(executor.clone());

        commander
            .wg(
                vec![
                    WgArg::lit("set"),
                    WgArg::lit("wg0"),
                    WgArg::lit("private-key"),
                    WgArg::secret("SECRET-KEY-MATERIAL"),
                ],
                None,
            )
            .await
            .unwrap();

        let calls = executor.calls.lock();
        let argv = &calls[0];
        let path = argv.last().unwrap();
        assert_ne!(path, "SECRET-KEY-MATERIAL", "secret must not hit argv");
        assert!(!argv.iter().any(|a| a.contains("SECRET-KEY-MATERIAL")));
        assert!(
            !Path::new(path).exists(),
            "secret file must be unlinked after the call"
        );
    }

    #[tokio::test]
    async fn test_secret_file_removed_on_failure() {
        let executor = RecordingExecutor::new();
        executor.fail_when("private-key");
        let commander = Commander::new(executor.clone());

        let result = commander
            .wg(
                vec![
                    WgArg::lit("set"),
                    WgArg::lit("wg0"),
                    WgArg::lit("private-key"),
                    WgArg::secret("SECRET-KEY-MATERIAL"),
                ],
                None,
            )
            .await;
        assert!(result.is_err());

        let calls = executor.calls.lock();
        let path = calls[0].last().unwrap().clone();
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn test_rule_inversion() {
        let rule = RuleAction::append_in_table(
            "nat",
            "POSTROUTING",
            &["--out-interface", "eth0", "--jump", "MASQUERADE"],
        );
        assert_eq!(
            rule.args(false),
            vec![
                "--table",
                "nat",
                "--append",
                "POSTROUTING",
                "--out-interface",
                "eth0",
                "--jump",
                "MASQUERADE"
            ]
        );
        let inverted = rule.args(true);
        assert_eq!(inverted[2], "--delete");
        assert_eq!(&inverted[3..], &rule.args(false)[3..]);
    }

    #[tokio::test]
    async fn test_undo_all_inverts_in_order() {
        let executor = RecordingExecutor::new();
        let commander = Commander::new(executor.clone());

        commander
            .iptables(RuleAction::append("FORWARD", &["--in-interface", "wg0"]))
            .await
            .unwrap();
        commander
            .iptables(RuleAction::append("FORWARD", &["--in-interface", "wg1"]))
            .await
            .unwrap();
        commander
            .iptables(RuleAction::append_in_table(
                "nat",
                "POSTROUTING",
                &["--jump", "MASQUERADE"],
            ))
            .await
            .unwrap();
        assert_eq!(commander.rules_recorded(), 3);

        commander.undo_all().await;
        assert_eq!(commander.rules_recorded(), 0);

        let commands = executor.commands();
        let deletes: Vec<&String> = commands
            .iter()
            .filter(|c| c.contains("--delete"))
            .collect();
        assert_eq!(deletes.len(), 3, "one delete per recorded insertion");
        assert!(deletes[0].contains("wg0"));
        assert!(deletes[1].contains("wg1"));
        assert!(deletes[2].contains("MASQUERADE"));
        assert!(deletes[2].starts_with("iptables --table nat --delete"));
    }

    #[tokio::test]
    async fn test_undo_all_is_best_effort() {
        let executor = RecordingExecutor::new();
        let commander = Commander::new(executor.clone());

        commander
            .iptables(RuleAction::append("FORWARD", &["--in-interface", "wg0"]))
            .await
            .unwrap();
        commander
            .iptables(RuleAction::append("FORWARD", &["--in-interface", "wg1"]))
            .await
            .unwrap();

        executor.fail_when("wg0");
        commander.undo_all().await;

        // the wg0 delete failed, but wg1 was still replayed and the log cleared
        let commands = executor.commands();
        assert!(commands.iter().any(|c| c.contains("--delete FORWARD --in-interface wg1")));
        assert_eq!(commander.rules_recorded(), 0);
    }
}
