//! Notice rendering.
//!
//! Rendering is an external service; the daemon either has no
//! renderer configured ([`DisabledRenderer`], every request degrades
//! to plain text) or pipes template parameters to an external program
//! ([`CommandRenderer`]) under a bounded timeout. A render failure is
//! never fatal to a tick.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use scrimd_core::notify::{NoticeParams, NoticeRenderer, NotifyError};
use tokio::io::AsyncWriteExt;

/// Renderer used when no render command is configured.
pub struct DisabledRenderer;

#[async_trait]
impl NoticeRenderer for DisabledRenderer {
    async fn render_notice(&self, _params: &NoticeParams) -> Result<Vec<u8>, NotifyError> {
        Err(NotifyError::RenderFailed {
            detail: "no render command configured".to_string(),
        })
    }
}

/// Renderer that invokes an external program.
///
/// The program receives the template parameters as JSON on stdin and
/// must write the image bytes to stdout. Nonzero exit, empty output,
/// or exceeding the timeout all count as render failures.
pub struct CommandRenderer {
    program: PathBuf,
    timeout: Duration,
}

impl CommandRenderer {
    /// Creates a renderer for the given program and per-call budget.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, params: &NoticeParams) -> Result<Vec<u8>, NotifyError> {
        let input = serde_json::to_vec(params).map_err(|e| NotifyError::RenderFailed {
            detail: format!("encode params: {e}"),
        })?;

        let mut child = tokio::process::Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NotifyError::RenderFailed {
                detail: format!("spawn {}: {e}", self.program.display()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| NotifyError::RenderFailed {
                    detail: format!("write params: {e}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| NotifyError::RenderFailed {
                detail: format!("wait: {e}"),
            })?;

        if !output.status.success() {
            return Err(NotifyError::RenderFailed {
                detail: format!("renderer exited with {}", output.status),
            });
        }
        if output.stdout.is_empty() {
            return Err(NotifyError::RenderFailed {
                detail: "renderer produced no output".to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl NoticeRenderer for CommandRenderer {
    async fn render_notice(&self, params: &NoticeParams) -> Result<Vec<u8>, NotifyError> {
        match tokio::time::timeout(self.timeout, self.run(params)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NoticeParams {
        NoticeParams {
            round_number: 1,
            credential: Some("OR401234".to_string()),
            time_label: "departure".to_string(),
            time: "22:05".parse().ok(),
        }
    }

    #[tokio::test]
    async fn test_disabled_renderer_always_fails() {
        let err = DisabledRenderer.render_notice(&params()).await.unwrap_err();
        assert!(matches!(err, NotifyError::RenderFailed { .. }));
    }

    #[tokio::test]
    async fn test_command_renderer_captures_stdout() {
        let renderer = CommandRenderer::new("/bin/cat", Duration::from_secs(5));
        let bytes = renderer.render_notice(&params()).await.unwrap();
        // cat echoes the params JSON back.
        let echoed: NoticeParams = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(echoed, params());
    }

    #[tokio::test]
    async fn test_missing_program_is_render_failure() {
        let renderer = CommandRenderer::new("/nonexistent/render", Duration::from_secs(1));
        let err = renderer.render_notice(&params()).await.unwrap_err();
        assert!(matches!(err, NotifyError::RenderFailed { .. }));
    }
}
