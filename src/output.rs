//! Error notification sink.
//!
//! Everything notable is logged through `tracing`; in addition, an operator
//! can configure an error script that gets invoked for every notified
//! error. The message is handed over as a temporary file whose path is the
//! script's single argument.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

#[derive(Clone, Default)]
pub struct Output {
    error_script: Option<String>,
    temp_dir: Option<PathBuf>,
}

impl Output {
    /// `error_script` and `temp_dir` may be empty to disable the script
    /// notification and use the system temp directory, respectively.
    pub fn new(error_script: &str, temp_dir: &str) -> Self {
        Self {
            error_script: (!error_script.is_empty()).then(|| error_script.to_string()),
            temp_dir: (!temp_dir.is_empty()).then(|| PathBuf::from(temp_dir)),
        }
    }

    /// Log an error and, when configured, hand it to the error script. The
    /// script runs detached; notification can never block or fail a worker.
    pub fn notify_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");

        if let Some(script) = self.error_script.clone() {
            let temp_dir = self.temp_dir.clone();
            tokio::spawn(async move {
                if let Err(err) = run_error_script(&script, temp_dir.as_deref(), &message).await {
                    tracing::error!(script = %script, error = %err, "error script failed");
                }
            });
        }
    }
}

async fn run_error_script(script: &str, temp_dir: Option<&Path>, message: &str) -> AppResult<()> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("gordon");

    let mut file = match temp_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    file.write_all(message.as_bytes())?;

    // keep the file alive until the script has read it
    let path = file.into_temp_path();

    let output = tokio::process::Command::new(script)
        .arg(&path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(AppError::Execution(format!(
            "exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        tracing::warn!(script = %script, output = %stdout.trim(), "error script produced output");
    }

    path.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn well_behaved_script_succeeds() {
        run_error_script("/bin/true", None, "boom").await.unwrap();
    }

    #[tokio::test]
    async fn failing_script_reports_exit_status() {
        let err = run_error_script("/bin/false", None, "boom")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn script_receives_the_message_file() {
        // `grep -q boom <file>` exits 0 only if the message was written
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("check.sh");
        std::fs::write(&script, "#!/bin/sh\ngrep -q boom \"$1\"\n").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        run_error_script(script.to_str().unwrap(), None, "big boom")
            .await
            .unwrap();
    }

    #[test]
    fn empty_settings_disable_the_script() {
        let output = Output::new("", "");
        assert!(output.error_script.is_none());
        assert!(output.temp_dir.is_none());
    }
}
