//! Two-stage external conversion: text -> PostScript -> PDF.
//!
//! Each stage is an opaque executable run to completion before the next one
//! starts. Exit status is the only signal of success; the final artifact's
//! size is read from file metadata only after the last stage has exited.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::artifacts::ArtifactSet;

/// Default location of the text -> PostScript tool.
pub const DEFAULT_TEXT_TO_PS: &str = "/usr/bin/enscript";

/// Default location of the PostScript -> PDF tool.
pub const DEFAULT_PS_TO_PDF: &str = "/usr/bin/ps2pdf12";

/// Most stderr bytes kept from a failed stage for logging.
const STDERR_LOG_LIMIT: usize = 2048;

/// Which conversion stage a result or error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TextToPostScript,
    PostScriptToPdf,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextToPostScript => "text-to-ps",
            Self::PostScriptToPdf => "ps-to-pdf",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage}: failed to start {program}: {source}")]
    Spawn {
        stage: Stage,
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("{stage}: failed waiting for process: {source}")]
    Wait {
        stage: Stage,
        source: std::io::Error,
    },

    #[error("{stage}: exited with status {code}")]
    Exit { stage: Stage, code: i32 },

    #[error("{stage}: killed by signal {signal}")]
    Killed { stage: Stage, signal: String },

    #[error("{stage}: did not finish within {limit:?}")]
    Timeout { stage: Stage, limit: Duration },

    #[error("cannot read converted document {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One argv slot of a stage command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageArg {
    Literal(String),
    /// Path of the file the stage reads.
    Input,
    /// Path of the file the stage must produce.
    Output,
}

/// Executable plus argument shape for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: PathBuf,
    pub args: Vec<StageArg>,
}

impl StageCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<StageArg>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `enscript -B <input> -p <output> -q`: no page headers, quiet.
    pub fn text_to_postscript(program: impl Into<PathBuf>) -> Self {
        Self::new(
            program,
            vec![
                StageArg::Literal("-B".into()),
                StageArg::Input,
                StageArg::Literal("-p".into()),
                StageArg::Output,
                StageArg::Literal("-q".into()),
            ],
        )
    }

    /// `ps2pdf12 <input> <output>`.
    pub fn postscript_to_pdf(program: impl Into<PathBuf>) -> Self {
        Self::new(program, vec![StageArg::Input, StageArg::Output])
    }

    /// `<program> <input> <output>`, for tools with a plain copy-like contract.
    pub fn input_output(program: impl Into<PathBuf>) -> Self {
        Self::new(program, vec![StageArg::Input, StageArg::Output])
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            match arg {
                StageArg::Literal(s) => cmd.arg(s),
                StageArg::Input => cmd.arg(input),
                StageArg::Output => cmd.arg(output),
            };
        }
        cmd
    }
}

/// Location and size of a successfully converted document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedDocument {
    pub path: PathBuf,
    pub size: u64,
}

/// Converts a worker's input artifact into its output artifact.
///
/// This abstraction lets the worker and supervisor be tested without the real
/// conversion tools installed.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn convert(&self, artifacts: &ArtifactSet) -> Result<ConvertedDocument, PipelineError>;
}

/// Pipeline backed by two external executables.
#[derive(Debug, Clone)]
pub struct ExternalPipeline {
    text_to_ps: StageCommand,
    ps_to_pdf: StageCommand,
    stage_timeout: Option<Duration>,
}

impl ExternalPipeline {
    pub fn new(text_to_ps: StageCommand, ps_to_pdf: StageCommand) -> Self {
        Self {
            text_to_ps,
            ps_to_pdf,
            stage_timeout: None,
        }
    }

    /// Kill and fail a stage that runs longer than `limit`.
    pub fn with_stage_timeout(mut self, limit: Option<Duration>) -> Self {
        self.stage_timeout = limit;
        self
    }

    async fn run_stage(
        &self,
        stage: Stage,
        command: &StageCommand,
        input: &Path,
        output: &Path,
    ) -> Result<(), PipelineError> {
        tracing::debug!(
            %stage,
            program = %command.program.display(),
            input = %input.display(),
            output = %output.display(),
            "Starting conversion stage"
        );

        let child = command
            .command(input, output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                stage,
                program: command.program.clone(),
                source,
            })?;

        let waited = match self.stage_timeout {
            // Dropping the timed-out future drops the child, which kills it.
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| PipelineError::Timeout { stage, limit })?,
            None => child.wait_with_output().await,
        };
        let result = waited.map_err(|source| PipelineError::Wait { stage, source })?;

        match classify_exit(stage, result.status) {
            Ok(()) => {
                tracing::debug!(%stage, "Conversion stage succeeded");
                Ok(())
            }
            Err(e) => {
                let shown = &result.stderr[..result.stderr.len().min(STDERR_LOG_LIMIT)];
                tracing::warn!(
                    %stage,
                    error = %e,
                    stderr = %String::from_utf8_lossy(shown).trim_end(),
                    "Conversion stage failed"
                );
                Err(e)
            }
        }
    }
}

impl Default for ExternalPipeline {
    fn default() -> Self {
        Self::new(
            StageCommand::text_to_postscript(DEFAULT_TEXT_TO_PS),
            StageCommand::postscript_to_pdf(DEFAULT_PS_TO_PDF),
        )
    }
}

#[async_trait]
impl Pipeline for ExternalPipeline {
    async fn convert(&self, artifacts: &ArtifactSet) -> Result<ConvertedDocument, PipelineError> {
        self.run_stage(
            Stage::TextToPostScript,
            &self.text_to_ps,
            artifacts.input(),
            artifacts.intermediate(),
        )
        .await?;
        self.run_stage(
            Stage::PostScriptToPdf,
            &self.ps_to_pdf,
            artifacts.intermediate(),
            artifacts.output(),
        )
        .await?;

        let path = artifacts.output().to_path_buf();
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|source| PipelineError::Metadata {
                path: path.clone(),
                source,
            })?
            .len();

        Ok(ConvertedDocument { path, size })
    }
}

fn classify_exit(stage: Stage, status: ExitStatus) -> Result<(), PipelineError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(PipelineError::Exit { stage, code });
    }
    Err(PipelineError::Killed {
        stage,
        signal: signal_name(status),
    })
}

#[cfg(unix)]
fn signal_name(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(raw) => nix::sys::signal::Signal::try_from(raw)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| raw.to_string()),
        None => "unknown".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: ExitStatus) -> String {
    "unknown".to_string()
}
