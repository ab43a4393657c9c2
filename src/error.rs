use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Engine errors. Every entry point returns one of these; most surface to
/// the caller unchanged. `WouldBlock` is not a failure: the operation has
/// been parked and the cookie will be notified with a terminal status later.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The request was routed to a partition this node is not active (or
    /// replica, for replicated ops) for.
    NotMyVbucket,
    /// The key does not exist.
    KeyMissing,
    /// The key already exists, or a compare-and-swap mismatch.
    KeyExists,
    /// The mutation would push memory usage past the admission threshold.
    NoMemory,
    /// A replace-style operation found no stored document to modify.
    NotStored,
    /// Malformed input, typically a key/value/extras validation failure.
    InvalidArgument(String),
    /// The operation is not supported by this bucket configuration.
    NotSupported,
    /// The operation has been queued; the cookie is notified on completion.
    WouldBlock,
    /// The value exceeds the configured maximum item size.
    TooBig,
    /// The client disconnected while the operation was in flight.
    Disconnect,
    /// A transient failure, retry later.
    TempFailure,
    /// A requested range (seqno or otherwise) is not satisfiable.
    Range,
    /// The consumer's history diverges from ours; it must rollback to the
    /// contained seqno and re-request.
    Rollback(u64),
    /// The resource is busy with a conflicting operation.
    Busy,
    /// Arithmetic on a non-numeric value.
    DeltaBadValue,
    /// A predicate supplied with the operation did not hold.
    PredicateFailed,
    /// The document is locked.
    Locked,
    /// The document is locked (transient flavor for lock-aware clients).
    LockedTempFailure,
    /// The key addresses a collection unknown to the current manifest.
    UnknownCollection,
    /// The client's collections manifest is ahead of the bucket's.
    CollectionsManifestAhead,
    /// A manifest update could not be applied to every active partition.
    CannotApplyCollectionsManifest,
    /// The durability requirement can never be met with the current chain.
    DurabilityImpossible,
    /// A synchronous write is already in flight for this key.
    SyncWriteInProgress,
    /// The outcome of a synchronous write is unknown (timeout, demotion).
    SyncWriteAmbiguous,
    /// A stream-id was supplied where none was negotiated, or vice versa.
    DcpStreamIdInvalid,
    /// Generic failure.
    Failed(String),
    /// The caller lacks access to the resource.
    Access,
    /// The authentication context is stale and must be refreshed.
    AuthStale,
    /// No bucket is selected or the bucket is shutting down.
    NoBucket,
    /// An IO error from the underlying store.
    Io(String),
    /// An internal invariant was violated. Callers are not expected to
    /// handle this; the affected partition is marked dead.
    Logic(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotMyVbucket => write!(f, "not my vbucket"),
            Error::KeyMissing => write!(f, "key not found"),
            Error::KeyExists => write!(f, "key exists (or cas mismatch)"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::NotStored => write!(f, "not stored"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotSupported => write!(f, "not supported"),
            Error::WouldBlock => write!(f, "would block, cookie will be notified"),
            Error::TooBig => write!(f, "value too big"),
            Error::Disconnect => write!(f, "client disconnected"),
            Error::TempFailure => write!(f, "temporary failure"),
            Error::Range => write!(f, "requested range not satisfiable"),
            Error::Rollback(seqno) => write!(f, "rollback required to seqno {seqno}"),
            Error::Busy => write!(f, "resource busy"),
            Error::DeltaBadValue => write!(f, "non-numeric value in arithmetic operation"),
            Error::PredicateFailed => write!(f, "predicate failed"),
            Error::Locked => write!(f, "document locked"),
            Error::LockedTempFailure => write!(f, "document locked, retry"),
            Error::UnknownCollection => write!(f, "unknown collection"),
            Error::CollectionsManifestAhead => write!(f, "collections manifest ahead"),
            Error::CannotApplyCollectionsManifest => {
                write!(f, "cannot apply collections manifest")
            }
            Error::DurabilityImpossible => write!(f, "durability requirement impossible"),
            Error::SyncWriteInProgress => write!(f, "sync write already in progress"),
            Error::SyncWriteAmbiguous => write!(f, "sync write outcome ambiguous"),
            Error::DcpStreamIdInvalid => write!(f, "invalid dcp stream-id"),
            Error::Failed(msg) => write!(f, "failed: {msg}"),
            Error::Access => write!(f, "access denied"),
            Error::AuthStale => write!(f, "authentication stale"),
            Error::NoBucket => write!(f, "no bucket"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Logic(msg) => write!(f, "logic error: {msg}"),
        }
    }
}

impl Error {
    /// Remaps lock- and sync-write-specific errors for clients that did not
    /// negotiate extended error codes.
    pub fn remap_for_basic_client(self) -> Error {
        match self {
            Error::Locked => Error::KeyExists,
            Error::LockedTempFailure => Error::TempFailure,
            Error::SyncWriteInProgress => Error::TempFailure,
            other => other,
        }
    }

    /// True for invariant violations that require marking the partition dead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Logic(_))
    }
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinval {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// Constructs an Error::Logic for the given format string.
#[macro_export]
macro_rules! errlogic {
    ($($args:tt)*) => { $crate::error::Error::Logic(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Io(err.to_string())
    }
}
