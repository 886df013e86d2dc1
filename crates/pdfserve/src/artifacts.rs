//! Per-worker transient files.
//!
//! Path format: `{work_dir}/pdfserve-{pid}-{worker}-{name}.{tmp,ps,pdf}`
//!
//! The pid keeps concurrent server processes sharing a work directory apart,
//! the worker id keeps concurrent workers handling same-named documents apart.

use std::io;
use std::path::{Path, PathBuf};

use crate::worker::WorkerId;

const FILE_PREFIX: &str = "pdfserve";

/// The three files one worker creates: received input, intermediate
/// PostScript, final PDF.
///
/// Removed on [`cleanup`](Self::cleanup) or on drop, whichever comes first.
#[derive(Debug)]
pub struct ArtifactSet {
    input: PathBuf,
    intermediate: PathBuf,
    output: PathBuf,
    cleaned: bool,
}

impl ArtifactSet {
    /// Derive artifact paths for `worker` from a name that already passed
    /// [`validate_name`](crate::wire::validate_name).
    pub fn for_worker(work_dir: &Path, worker: WorkerId, name: &str) -> Self {
        let stem = format!("{FILE_PREFIX}-{}-{}-{name}", std::process::id(), worker.get());
        Self {
            input: work_dir.join(format!("{stem}.tmp")),
            intermediate: work_dir.join(format!("{stem}.ps")),
            output: work_dir.join(format!("{stem}.pdf")),
            cleaned: false,
        }
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn intermediate(&self) -> &Path {
        &self.intermediate
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn paths(&self) -> [&Path; 3] {
        [&self.input, &self.intermediate, &self.output]
    }

    /// Remove all three files. Missing files are not an error, so this is
    /// safe after a partial run and safe to call twice.
    ///
    /// Every removal is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub fn cleanup(&mut self) -> io::Result<()> {
        let mut first_err = None;
        for path in self.paths() {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::trace!(path = %path.display(), "Removed artifact"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                    first_err.get_or_insert(e);
                }
            }
        }
        self.cleaned = true;
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        if !self.cleaned
            && let Err(e) = self.cleanup()
        {
            tracing::warn!(error = %e, "Failed to clean up artifacts");
        }
    }
}
