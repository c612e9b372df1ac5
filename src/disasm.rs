//! Producing the two disassembly listings for a text section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{ProcessError, ProcessResult};
use crate::machine::Arch;

/// Source of symbolic (verbose) and plain listings of one section.
pub trait Disassembler {
    fn disassemble(
        &self,
        path: &Path,
        arch: Arch,
        segment: &str,
        section: &str,
        symbolic: bool,
    ) -> ProcessResult<String>;
}

/// Runs the `otool` command line tool.
#[derive(Debug, Clone)]
pub struct Otool {
    pub program: PathBuf,
}

impl Default for Otool {
    fn default() -> Self {
        Otool {
            program: PathBuf::from("otool"),
        }
    }
}

impl Otool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Otool {
            program: program.into(),
        }
    }
}

impl Disassembler for Otool {
    fn disassemble(
        &self,
        path: &Path,
        arch: Arch,
        segment: &str,
        section: &str,
        symbolic: bool,
    ) -> ProcessResult<String> {
        let failed = |reason: String| ProcessError::Disassembler {
            segment: segment.to_string(),
            section: section.to_string(),
            reason,
        };

        let mut cmd = Command::new(&self.program);
        cmd.arg("-arch")
            .arg(arch.to_string())
            .arg("-s")
            .arg(segment)
            .arg(section)
            .arg(if symbolic { "-V" } else { "-v" })
            .arg(path);
        debug!("running {:?}", cmd);

        let output = cmd
            .output()
            .map_err(|e| failed(format!("unable to run {}: {}", self.program.display(), e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{} ({})", output.status, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Listings prepared ahead of time, keyed by segment and section name.
#[derive(Debug, Clone, Default)]
pub struct ListingSet {
    listings: HashMap<(String, String), (String, String)>,
}

impl ListingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, segment: &str, section: &str, verbose: String, plain: String) {
        self.listings
            .insert((segment.to_string(), section.to_string()), (verbose, plain));
    }
}

impl Disassembler for ListingSet {
    fn disassemble(
        &self,
        _path: &Path,
        _arch: Arch,
        segment: &str,
        section: &str,
        symbolic: bool,
    ) -> ProcessResult<String> {
        let (verbose, plain) = self
            .listings
            .get(&(segment.to_string(), section.to_string()))
            .ok_or_else(|| ProcessError::Disassembler {
                segment: segment.to_string(),
                section: section.to_string(),
                reason: "no listing supplied".to_string(),
            })?;
        Ok(if symbolic { verbose.clone() } else { plain.clone() })
    }
}
