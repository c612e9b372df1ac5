//! Error types for executable processing.
//!
//! Errors fall into two groups: fatal ones abort the processing session, and
//! `NoMatchesFound`, which is an informational outcome of the deobfuscator.
//! Lookup misses inside the annotation passes never surface here; they
//! degrade to an absent comment instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid Mach-O header: unrecognized magic {0:#010x}")]
    InvalidHeader(u32),

    #[error("64-bit Mach-O images are not supported (magic {0:#010x})")]
    Unsupported64Bit(u32),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("architecture {0} not found in universal binary")]
    ArchitectureNotFound(String),

    #[error("truncated file: {what} at {offset:#x}..{end:#x} exceeds image size {size:#x}")]
    TruncatedFile {
        what: String,
        offset: u64,
        end: u64,
        size: u64,
    },

    #[error("parsing error: {0}")]
    Parsing(String),

    #[error("disassembler failed on ({segment},{section}): {reason}")]
    Disassembler {
        segment: String,
        section: String,
        reason: String,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no obfuscated instruction sequences were found")]
    NoMatchesFound,

    #[error("{0} is not applicable to this architecture")]
    NotApplicable(&'static str),
}

impl ProcessError {
    /// Remedy text shown next to the error message, where one exists.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ProcessError::InvalidHeader(_) => {
                Some("The file is not a Mach-O executable or universal binary.")
            }
            ProcessError::Unsupported64Bit(_) => {
                Some("Only 32-bit PPC and i386 images can be processed.")
            }
            ProcessError::UnsupportedArchitecture(_) | ProcessError::ArchitectureNotFound(_) => {
                Some("Choose one of the architectures contained in the file with --arch.")
            }
            ProcessError::TruncatedFile { .. } => {
                Some("The file appears to be damaged or incompletely copied.")
            }
            ProcessError::Disassembler { .. } => {
                Some("Install or upgrade the otool disassembler (Xcode command line tools).")
            }
            ProcessError::Write { .. } => {
                Some("Check that the destination directory exists and is writable.")
            }
            _ => None,
        }
    }

    /// Everything except the deobfuscator's "nothing found" outcome ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProcessError::NoMatchesFound | ProcessError::NotApplicable(_)
        )
    }

    pub(crate) fn truncated(what: impl Into<String>, offset: u64, len: u64, size: u64) -> Self {
        ProcessError::TruncatedFile {
            what: what.into(),
            offset,
            end: offset.saturating_add(len),
            size,
        }
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(ProcessError::InvalidHeader(0).is_fatal());
        assert!(!ProcessError::NoMatchesFound.is_fatal());
        assert!(!ProcessError::NotApplicable("nop search").is_fatal());
    }

    #[test]
    fn test_disassembler_suggestion() {
        let err = ProcessError::Disassembler {
            segment: "__TEXT".to_string(),
            section: "__text".to_string(),
            reason: "exit status 1".to_string(),
        };
        assert!(err.suggestion().unwrap().contains("otool"));
        assert!(err.to_string().contains("(__TEXT,__text)"));
    }
}
