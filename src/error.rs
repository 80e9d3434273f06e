use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid run accession: {0}")]
    InvalidRunAccession(String),

    #[error("missing config file cardioseq.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read backlog file at {0}")]
    BacklogRead(PathBuf),

    #[error("failed to parse backlog: {0}")]
    BacklogParse(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited by remote API (status {status})")]
    RateLimited { status: u16 },

    #[error("{tool} exited with code {code}")]
    ToolExit { tool: String, code: i32 },

    #[error("{tool} timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("corrupt checkpoint at {path}: {message}")]
    #[diagnostic(help("refusing to guess a resume point; repair or remove the checkpoint file"))]
    CorruptCheckpoint { path: PathBuf, message: String },

    #[error("E-utilities request failed: {0}")]
    EutilsHttp(String),

    #[error("E-utilities returned status {status}: {message}")]
    EutilsStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("disk full: {0}")]
    DiskFull(String),
}

impl PipelineError {
    /// True for errors a worker may retry in place during download/convert.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientNetwork(_) | PipelineError::RateLimited { .. }
        )
    }

    /// Failure reason string recorded in checkpoint and batch result files.
    pub fn failure_reason(&self) -> String {
        match self {
            PipelineError::TransientNetwork(_) | PipelineError::RateLimited { .. } => {
                "network".to_string()
            }
            PipelineError::ToolExit { code, .. } => format!("tool_exit:{code}"),
            PipelineError::ToolTimeout { .. } => "timeout".to_string(),
            PipelineError::MissingTool(tool) => format!("missing_tool:{tool}"),
            other => other.to_string(),
        }
    }
}
