//! Best-effort tool availability probe.
//!
//! A recipe's `check-installed` command decides whether its tool exists: the
//! tool counts as installed iff the command exits zero *and* prints
//! something non-blank. When installation is requested and an `install`
//! command is configured, it runs once and the check is repeated.

use std::process::{Command, Output};

use thiserror::Error;

use crate::config::ToolRecipe;
use crate::shell_command;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run check command {command:?}")]
    CheckFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool {tool} not found. Run with --install-deps to install")]
    MissingWithInstall { tool: String },

    #[error("tool {tool} not found and no install command specified")]
    Missing { tool: String },

    #[error("failed to install {tool}: {detail}")]
    InstallFailed { tool: String, detail: String },

    #[error("tool {tool} still not found after installation")]
    StillMissing { tool: String },
}

/// Check a recipe's tool, optionally installing it when missing.
///
/// Recipes without a `check-installed` command are assumed present.
pub fn check_tool(recipe: &ToolRecipe, tool: &str, install_missing: bool) -> Result<(), ProbeError> {
    if recipe.check_installed.is_empty() {
        return Ok(());
    }

    tracing::debug!(tool, command = %recipe.check_installed, "checking tool availability");
    if installed(&run_shell(&recipe.check_installed)?) {
        tracing::debug!(tool, "tool is installed");
        return Ok(());
    }

    if recipe.install.is_empty() {
        return Err(ProbeError::Missing {
            tool: tool.to_string(),
        });
    }
    if !install_missing {
        return Err(ProbeError::MissingWithInstall {
            tool: tool.to_string(),
        });
    }

    tracing::info!(tool, command = %recipe.install, "installing missing tool");
    let output = run_shell(&recipe.install)?;
    if !output.status.success() {
        return Err(ProbeError::InstallFailed {
            tool: tool.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    if installed(&run_shell(&recipe.check_installed)?) {
        tracing::info!(tool, "tool verified after installation");
        Ok(())
    } else {
        Err(ProbeError::StillMissing {
            tool: tool.to_string(),
        })
    }
}

fn run_shell(command: &str) -> Result<Output, ProbeError> {
    let (shell, flag) = shell_command();
    Command::new(shell)
        .arg(flag)
        .arg(command)
        .output()
        .map_err(|source| ProbeError::CheckFailed {
            command: command.to_string(),
            source,
        })
}

fn installed(output: &Output) -> bool {
    if !output.status.success() {
        return false;
    }
    let mut combined = output.stdout.clone();
    combined.extend_from_slice(&output.stderr);
    !String::from_utf8_lossy(&combined).trim().is_empty()
}
