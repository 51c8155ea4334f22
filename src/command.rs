use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::process::{Command, Output};

/// Runs the shell commands attached to interrupt mappings.
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn execute(command: &str, env: &[(&str, &str)]) -> Result<()> {
        info!("Executing command: {}", command);

        // Execute the command through a shell
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env.iter().copied())
            .output()
            .context(format!("Failed to execute command: {}", command))?;

        Self::check(output)
    }

    pub fn execute_with_timeout(command: &str, env: &[(&str, &str)], timeout_secs: u64) -> Result<()> {
        info!(
            "Executing command with {} second timeout: {}",
            timeout_secs, command
        );

        let output = Command::new("timeout")
            .arg(timeout_secs.to_string())
            .arg("sh")
            .arg("-c")
            .arg(command)
            .envs(env.iter().copied())
            .output()
            .context(format!("Failed to execute command: {}", command))?;

        Self::check(output)
    }

    fn check(output: Output) -> Result<()> {
        if output.status.success() {
            if !output.stdout.is_empty() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                debug!("Command output: {}", stdout);
            }
            info!("Command executed successfully");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Command execution failed with status: {:?}. Error: {}",
                output.status, stderr
            );
            Err(anyhow::anyhow!(
                "Command failed with status: {:?}",
                output.status
            ))
        }
    }
}
