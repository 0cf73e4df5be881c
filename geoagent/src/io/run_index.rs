//! Append-only run numbering under `<output.root>/runs/`.
//!
//! An ordinal is claimed by creating `run-NNNN` with `create_dir`, which fails
//! if another thread or process got there first. The allocator then moves on to
//! the next ordinal, so no two runs ever share one.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

const RUN_PREFIX: &str = "run-";
const MAX_CLAIM_ATTEMPTS: u32 = 10_000;

/// A claimed run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSlot {
    pub ordinal: u32,
    pub dir: PathBuf,
}

impl RunSlot {
    pub fn run_id(&self) -> String {
        run_dir_name(self.ordinal)
    }
}

pub fn run_dir_name(ordinal: u32) -> String {
    format!("{RUN_PREFIX}{ordinal:04}")
}

fn parse_ordinal(name: &str) -> Option<u32> {
    name.strip_prefix(RUN_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct RunIndex {
    runs_root: PathBuf,
}

impl RunIndex {
    /// Index rooted at `<output_root>/runs`.
    pub fn new(output_root: &Path) -> Self {
        Self {
            runs_root: output_root.join("runs"),
        }
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    /// Highest ordinal currently on disk, or 0.
    pub fn latest(&self) -> Result<u32> {
        if !self.runs_root.exists() {
            return Ok(0);
        }
        let mut latest = 0;
        for entry in fs::read_dir(&self.runs_root)
            .with_context(|| format!("read {}", self.runs_root.display()))?
        {
            let entry = entry.context("read run entry")?;
            if let Some(ordinal) = entry.file_name().to_str().and_then(parse_ordinal) {
                latest = latest.max(ordinal);
            }
        }
        Ok(latest)
    }

    /// Claim the next free ordinal.
    pub fn allocate(&self) -> Result<RunSlot> {
        fs::create_dir_all(&self.runs_root)
            .with_context(|| format!("create {}", self.runs_root.display()))?;

        let mut ordinal = self.latest()? + 1;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let dir = self.runs_root.join(run_dir_name(ordinal));
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(ordinal, dir = %dir.display(), "claimed run directory");
                    return Ok(RunSlot { ordinal, dir });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => ordinal += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("create run dir {}", dir.display()));
                }
            }
        }
        Err(anyhow!(
            "could not claim a run directory under {}",
            self.runs_root.display()
        ))
    }
}
