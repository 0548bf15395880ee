//! Crate-wide error type
//!
//! Every fallible operation in the core returns a variant of [`Error`]. None
//! of these variants unwind across the core: callers at the CLI boundary map
//! them to process exit codes (see `cli::exit_code`).

use std::path::PathBuf;

use thiserror::Error;

/// The reason a partition-table planning pass rejected a directive.
///
/// Kept distinct from the human-readable [`Error::LayoutError`] message so
/// that planner unit tests (and the CLI's exit-code mapping) can match on the
/// reason itself rather than scraping text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayoutReason {
    /// Two partitions would occupy overlapping byte ranges.
    Overlap,
    /// A partition's end would fall beyond `flash_size`.
    Overflow,
    /// Two partitions share the same name.
    DuplicateName,
    /// A partition name is empty or longer than 15 ASCII bytes.
    InvalidName,
    /// An `ota_N` app partition exists without a matching `otadata` partition.
    MissingOtadata,
    /// More than one `size=0` ("grow to fill") directive applied in one pass.
    ZeroGrowAmbiguous,
    /// `AppSize` would make an app partition bigger than the space available
    /// before the next fixed partition.
    AppSizeExceeds,
    /// The table would contain zero `app` partitions.
    NoAppPartition,
    /// A directive referenced a name that is not present in the table.
    UnknownPartition,
}

impl std::fmt::Display for LayoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LayoutReason::Overlap => "partitions overlap",
            LayoutReason::Overflow => "partition extends past the end of flash",
            LayoutReason::DuplicateName => "duplicate partition name",
            LayoutReason::InvalidName => "partition name is empty or too long",
            LayoutReason::MissingOtadata => "an ota_N partition requires an otadata partition",
            LayoutReason::ZeroGrowAmbiguous => {
                "at most one partition may be resized to \"fill remaining space\" per pass"
            }
            LayoutReason::AppSizeExceeds => "app-size exceeds available space",
            LayoutReason::NoAppPartition => "table must contain at least one app partition",
            LayoutReason::UnknownPartition => "no partition with that name",
        };
        f.write_str(s)
    }
}

/// All possible errors returned by esppart.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The image header magic byte was not `0xE9`, the image overruns its
    /// partition, or (only fatal with `--check-app`) the trailing SHA-256
    /// digest does not match.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The 0xC00-byte partition table region is malformed: a record has a bad
    /// magic, or the MD5 trailer does not match.
    #[error("invalid partition table: {0}")]
    BadTable(String),

    /// A planner rule was violated while applying directives.
    #[error("layout error: {reason} ({detail})")]
    LayoutError {
        reason: LayoutReason,
        detail: String,
    },

    /// A partition name did not resolve against the current table.
    #[error("no such partition: {0}")]
    NotFound(String),

    /// A read, write or erase fell outside the bounds of a partition or of
    /// flash itself.
    #[error("range error: {0}")]
    RangeError(String),

    /// The device backend (serial I/O, chip reset, bootloader stub) failed.
    #[error("device error: {0}")]
    DeviceError(String),

    /// A LittleFS operation failed.
    #[error("filesystem error: {0}")]
    FsError(String),

    /// A directive string could not be parsed.
    #[error("invalid directive {token:?}: {reason}")]
    UserError { token: String, reason: String },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Wraps an I/O failure against a file-backed image.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn layout(reason: LayoutReason, detail: impl Into<String>) -> Self {
        Error::LayoutError {
            reason,
            detail: detail.into(),
        }
    }

    pub fn user(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UserError {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// The process exit code this error maps to on the command line: 0 on
    /// success, a distinct non-zero code per variant on failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidImage(_) => 2,
            Error::BadTable(_) => 3,
            Error::LayoutError { .. } => 4,
            Error::NotFound(_) => 5,
            Error::RangeError(_) => 6,
            Error::DeviceError(_) => 7,
            Error::FsError(_) => 8,
            Error::UserError { .. } => 9,
            Error::Cancelled => 10,
            Error::Io { .. } => 11,
        }
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for Error {
    fn from(source: serialport::Error) -> Self {
        Error::DeviceError(source.to_string())
    }
}
