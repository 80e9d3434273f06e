use std::fs;
use std::time::Instant;

use camino::Utf8PathBuf;
use tracing::warn;

use crate::error::PipelineError;
use crate::store::RunLayout;

/// Process-wide run context with explicit creation and teardown.
///
/// Writes the liveness marker (pid file) when the run starts; `teardown`
/// removes it on clean exit. Monitoring treats a missing marker as
/// not-running, so the Drop backup only covers unwinding paths.
pub struct RunContext {
    pid_path: Utf8PathBuf,
    started: Instant,
    torn_down: bool,
}

impl RunContext {
    pub fn create(layout: &RunLayout) -> Result<Self, PipelineError> {
        let pid_path = layout.pid_path();
        if let Some(parent) = pid_path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        fs::write(pid_path.as_std_path(), format!("{}\n", std::process::id()))
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(Self {
            pid_path,
            started: Instant::now(),
            torn_down: false,
        })
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn teardown(mut self) -> Result<(), PipelineError> {
        self.torn_down = true;
        fs::remove_file(self.pid_path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if !self.torn_down && self.pid_path.as_std_path().exists() {
            if let Err(err) = fs::remove_file(self.pid_path.as_std_path()) {
                warn!("failed to remove liveness marker: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());

        let context = RunContext::create(&layout).unwrap();
        let pid_path = layout.pid_path();
        assert!(pid_path.as_std_path().exists());
        let content = fs::read_to_string(pid_path.as_std_path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        context.teardown().unwrap();
        assert!(!pid_path.as_std_path().exists());
    }

    #[test]
    fn drop_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());

        {
            let _context = RunContext::create(&layout).unwrap();
            assert!(layout.pid_path().as_std_path().exists());
        }
        assert!(!layout.pid_path().as_std_path().exists());
    }
}
