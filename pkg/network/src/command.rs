//! Host command execution for `ip`, `iptables` and friends.
//!
//! Network setup needs CAP_NET_ADMIN. When the runner is not root every
//! command is prefixed with `sudo -n` so a missing sudoers entry fails fast
//! instead of prompting.

use anyhow::{Context, Result};
use tracing::trace;

const SUDO: &[&str] = &["sudo", "-n"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCommand {
    /// Words placed before every command (`sudo -n`, or nothing).
    prefix: &'static [&'static str],
}

impl HostCommand {
    /// Use `sudo -n` unless the effective user is root.
    pub fn detect() -> Self {
        Self::with_sudo(!nix::unistd::geteuid().is_root())
    }

    pub fn with_sudo(use_sudo: bool) -> Self {
        Self {
            prefix: if use_sudo { SUDO } else { &[] },
        }
    }

    /// Run every command through `prefix`, e.g. a wrapper script.
    pub fn with_prefix(prefix: &'static [&'static str]) -> Self {
        Self { prefix }
    }

    pub fn uses_sudo(&self) -> bool {
        self.prefix == SUDO
    }

    /// Full argv for `args`, including the prefix if any.
    pub fn argv<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + self.prefix.len());
        argv.extend(self.prefix.iter().map(|p| p.to_string()));
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    /// A `tokio::process::Command` for `args` (program first).
    pub fn command<S: AsRef<str>>(&self, args: &[S]) -> Result<tokio::process::Command> {
        let argv = self.argv(args);
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest);
        Ok(cmd)
    }

    /// Run to completion; non-zero exit is an error carrying stderr.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let argv = self.argv(args);
        trace!("exec: {}", argv.join(" "));
        let output = self
            .command(args)?
            .output()
            .await
            .with_context(|| format!("failed to spawn `{}`", argv.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "`{}` failed ({}): {}",
                argv.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run and ignore failure (teardown of things that may already be gone).
    pub async fn run_quiet<S: AsRef<str>>(&self, args: &[S]) -> bool {
        match self.run(args).await {
            Ok(_) => true,
            Err(e) => {
                trace!("ignored: {:#}", e);
                false
            }
        }
    }
}

/// `ip netns exec <ns> <args…>`
pub fn in_netns(ns: &str, args: &[&str]) -> Vec<String> {
    let mut argv = vec![
        "ip".to_string(),
        "netns".to_string(),
        "exec".to_string(),
        ns.to_string(),
    ];
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}
