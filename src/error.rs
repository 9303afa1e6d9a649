use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal failures while reading a program file. Everything else is a [`Diagnostic`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed program document {path:?}: {reason}")]
    MalformedDocument { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

/// Non-fatal findings collected alongside a (possibly partial) result.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A mapping points at a sample that does not exist on disk. The mapping is kept.
    UnresolvedSample { sample_path: PathBuf },
    /// Metadata, filename and spectral stages all failed.
    AmbiguousNoteInference { sample_path: PathBuf, fallback: u8 },
    /// `KeygroupNumKeygroups` disagrees with the distinct key-range groups present.
    InconsistentKeygroupCount { declared: Option<usize>, actual: usize },
    /// The pad container exists but its JSON could not be read.
    ModernContainerUnreadable { reason: String },
    /// An element was dropped while walking the legacy tree.
    SkippedElement { element: String, reason: String },
    /// A numeric field was clamped into the MIDI range.
    ValueOutOfRange { field: String, value: i64, clamped: u8 },
    /// More layers than pad slots; the extras were not written to the container.
    PadCapacityExceeded { dropped: usize },
    /// Neither format produced a single mapping.
    NoMappings,
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::ModernContainerUnreadable { .. }
            | Diagnostic::ValueOutOfRange { .. }
            | Diagnostic::NoMappings => Severity::Info,
            _ => Severity::Warning,
        }
    }

    /// Sends the diagnostic to the log at a level matching its severity.
    pub fn log(&self, source: &str) {
        match self.severity() {
            Severity::Info => log::info!("[{}] {}", source, self),
            Severity::Warning => log::warn!("[{}] {}", source, self),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnresolvedSample { sample_path } => {
                write!(f, "sample not found: {}", sample_path.display())
            }
            Diagnostic::AmbiguousNoteInference { sample_path, fallback } => write!(
                f,
                "could not infer a root note for {} (using {})",
                sample_path.display(),
                fallback
            ),
            Diagnostic::InconsistentKeygroupCount { declared, actual } => match declared {
                Some(declared) => write!(
                    f,
                    "KeygroupNumKeygroups says {} but {} key-range groups are present",
                    declared, actual
                ),
                None => write!(
                    f,
                    "KeygroupNumKeygroups missing or unreadable, {} key-range groups are present",
                    actual
                ),
            },
            Diagnostic::ModernContainerUnreadable { reason } => {
                write!(f, "pad container unreadable, using legacy layout: {}", reason)
            }
            Diagnostic::SkippedElement { element, reason } => {
                write!(f, "skipped {}: {}", element, reason)
            }
            Diagnostic::ValueOutOfRange { field, value, clamped } => {
                write!(f, "{} = {} is outside 0-127, clamped to {}", field, value, clamped)
            }
            Diagnostic::PadCapacityExceeded { dropped } => {
                write!(f, "{} layer(s) did not fit in the pad container", dropped)
            }
            Diagnostic::NoMappings => write!(f, "no sample mappings found"),
        }
    }
}
