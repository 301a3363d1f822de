use anyhow::{bail, Context, Result};
use std::io::Write;
use std::process::Command;
use tracing::debug;

/// A CLI login flow that refreshes a provider's credential file.
#[derive(Debug, Clone, Copy)]
pub struct LoginTarget {
    pub command: &'static str,
    pub args: &'static [&'static str],
}

impl LoginTarget {
    fn display(&self) -> String {
        std::iter::once(self.command)
            .chain(self.args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub const DEFAULT_TARGETS: &[LoginTarget] = &[
    LoginTarget {
        command: "claude",
        args: &["login"],
    },
    LoginTarget {
        command: "codex",
        args: &["login"],
    },
];

pub trait CommandExecutor {
    fn exists(&self, command: &str) -> bool;
    /// Runs interactively with the terminal's stdio.
    fn run(&self, command: &str, args: &[&str]) -> Result<()>;
}

pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn exists(&self, command: &str) -> bool {
        which::which(command).is_ok()
    }

    fn run(&self, command: &str, args: &[&str]) -> Result<()> {
        let status = Command::new(command)
            .args(args)
            .status()
            .with_context(|| format!("failed to start {}", command))?;
        if !status.success() {
            bail!("{}", status);
        }
        Ok(())
    }
}

/// Run each installed login flow, then drop the cache so the next bar
/// refresh fetches with the new tokens. A failed login is reported only
/// after the cache is cleared.
pub fn run_auth_recovery<W, F>(
    out: &mut W,
    executor: &dyn CommandExecutor,
    clear_cache: F,
    targets: &[LoginTarget],
) -> Result<()>
where
    W: Write,
    F: FnOnce() -> Result<()>,
{
    writeln!(out, "Starting auth recovery...")?;

    let mut failures = Vec::new();
    for target in targets {
        let shown = target.display();
        if !executor.exists(target.command) {
            writeln!(out, "Skipping `{}` (command not found).", shown)?;
            continue;
        }

        writeln!(out, "Running `{}`...", shown)?;
        match executor.run(target.command, target.args) {
            Ok(()) => writeln!(out, "Completed `{}`.", shown)?,
            Err(err) => {
                debug!(command = target.command, error = %err, "login failed");
                failures.push(format!("{}: {:#}", target.command, err));
            }
        }
    }

    writeln!(out, "Clearing local cache...")?;
    clear_cache().context("failed to clear cache")?;

    if !failures.is_empty() {
        bail!("auth recovery incomplete: {}", failures.join("; "));
    }

    writeln!(out, "Auth recovery complete. Run `usage-bar status` to verify.")?;
    Ok(())
}
