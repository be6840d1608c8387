//! Error taxonomy shared by the attach and detach engines.

use snafu::Snafu;
use strum_macros::{AsRefStr, Display};

/// Stage of the initiator conversation that failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum InitiatorStage {
    Discovery,
    #[strum(serialize = "db entry")]
    DbEntry,
    Login,
    Logout,
    Rescan,
    #[strum(serialize = "iface delete")]
    DeleteIface,
}

/// Errors returned by the attachment engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("iSCSI target information is missing: {what}"))]
    MissingTarget { what: String },

    #[snafu(display("invalid portal: {portal}"))]
    InvalidPortal { portal: String },

    #[snafu(display("invalid HCTL ({hctl}) for device {device}"))]
    InvalidHctl { hctl: String, device: String },

    #[snafu(display("invalid output from lsblk: {reason}"))]
    InvalidLsblkOutput { reason: String },

    /// An external process exceeded its wall-clock budget.
    #[snafu(display("{command}: context deadline exceeded"))]
    Timeout { command: String },

    #[snafu(display("{path} does not exist"))]
    NotExist { path: String },

    #[snafu(display("unable to check unspecified device path"))]
    UnspecifiedDevicePath,

    /// Non-zero exit of an external process. The code carries meaning for
    /// some tools, see the predicate helpers below.
    #[snafu(display("{command} exited with code {code}: {stderr}{stdout}"))]
    ExternalExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("iscsiadm {stage} failed: {source}"))]
    Initiator {
        stage: InitiatorStage,
        source: Box<Error>,
    },

    #[snafu(display("multipath is inconsistent: {reason}"))]
    MultipathInconsistent { reason: String },

    #[snafu(display("{}: {source}", flush_failure(*in_use)))]
    MultipathFlush { in_use: bool, source: Box<Error> },

    #[snafu(display("could not resize multipath device {device}: {source}"))]
    MultipathResize { device: String, source: Box<Error> },

    #[snafu(display("{reason}"))]
    MultipathSelection { reason: String },

    #[snafu(display("error creating iSCSI persistence file {path}: {source}"))]
    Persist {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("error encoding connector: {source}"))]
    PersistEncode { source: serde_json::Error },

    #[snafu(display("error reading iSCSI persistence file {path}: {source}"))]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("invalid connector record in {path}: {source}"))]
    LoadDecode {
        path: String,
        source: serde_json::Error,
    },

    /// Composite failure of the attach engine: no portal produced a device.
    #[snafu(display("failed to find device path: {paths:?}, last error seen: {last_error}"))]
    ConnectFailed {
        paths: Vec<String>,
        last_error: String,
    },

    #[snafu(display("invalid glob pattern {pattern}: {source}"))]
    GlobPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[snafu(context(false), display("{source}"))]
    Io { source: std::io::Error },
}

fn flush_failure(in_use: bool) -> &'static str {
    if in_use {
        "device is probably still in use somewhere else"
    } else {
        "failed to flush multipath device map"
    }
}

impl Error {
    /// True when the error, or the initiator failure it wraps, is a
    /// wall-clock timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Initiator { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True when the error means an expected path or sysfs node is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotExist { .. } => true,
            Error::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// open-iscsi exits with status 21 when no sessions are active; that is
    /// an empty result, not an error.
    pub fn is_no_sessions(&self) -> bool {
        matches!(self, Error::ExternalExit { code: 21, .. })
    }

    /// lsblk exits with status 64 when only some of the requested devices
    /// were found; the partial output is still usable.
    pub fn is_partial_lsblk(&self) -> bool {
        matches!(self, Error::ExternalExit { code: 64, .. })
    }
}
