//! Running external tools with a deadline.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use rh_core::{Error, Result};
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured output of a successful run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A builder for one external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run the command and capture its output.
    ///
    /// # Errors
    ///
    /// - [`Error::Tool`] if the process cannot be spawned or exits non-zero
    ///   (message includes stderr).
    /// - [`Error::Timeout`] if it runs past the deadline. The child is
    ///   killed.
    pub async fn execute(&self) -> Result<ToolOutput> {
        let tool = self.tool_name();

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tool(&tool, format!("failed to spawn: {e}")))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                if !output.status.success() {
                    return Err(Error::tool(
                        tool,
                        format!("exited with status {}: {}", output.status, stderr.trim()),
                    ));
                }
                Ok(ToolOutput { stdout, stderr })
            }
            Ok(Err(e)) => Err(Error::tool(tool, format!("I/O error waiting for process: {e}"))),
            Err(_elapsed) => Err(Error::Timeout(format!(
                "{tool} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        assert!(matches!(result, Err(Error::Tool { .. })));
    }

    #[tokio::test]
    async fn timeout_fires() {
        let Ok(sleep) = which::which("sleep") else {
            return;
        };
        let result = ToolCommand::new(sleep)
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn non_zero_exit_is_tool_error() {
        let Ok(f) = which::which("false") else {
            return;
        };
        let result = ToolCommand::new(f).execute().await;
        assert!(matches!(result, Err(Error::Tool { .. })));
    }
}
