//! Error types for the record store.

use std::io;

use keel_types::{CodecError, ErrorCode, ErrorKind};
use snafu::{Location, Snafu};

use crate::collections::CollectionId;

/// Result type alias for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error at {location}: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
        /// Where the failing call was made.
        #[snafu(implicit)]
        location: Location,
    },

    /// Persisted snapshot is unreadable or has an unknown format.
    #[snafu(display("corrupted snapshot: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// A document could not be encoded or decoded.
    #[snafu(display("{collection}/{id}: {source}"))]
    Codec {
        /// Collection of the offending record.
        collection: CollectionId,
        /// Id of the offending record.
        id: String,
        /// The underlying codec error.
        source: CodecError,
    },

    /// A conditional batch was not applied because a precondition failed.
    ///
    /// Nothing in the batch was written. Callers usually re-read state and
    /// rebuild the batch.
    #[snafu(display("transaction aborted: {collection}/{id}: {reason}"))]
    Aborted {
        /// Collection of the first record whose precondition failed.
        collection: CollectionId,
        /// Id of that record.
        id: String,
        /// Which precondition failed.
        reason: String,
    },

    /// The session does not permit the operation.
    #[snafu(display("unauthorized: {message}"))]
    Unauthorized {
        /// Why the operation was refused.
        message: String,
    },

    /// The store session has been closed.
    #[snafu(display("store is closed"))]
    Closed,
}

impl Error {
    /// Whether this is a precondition abort rather than a failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }

    /// Returns the machine-readable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io { .. } => ErrorCode::StoreIo,
            Error::Corrupted { .. } => ErrorCode::StoreCorrupted,
            Error::Codec { .. } => ErrorCode::Codec,
            Error::Aborted { .. } => ErrorCode::StoreAborted,
            Error::Unauthorized { .. } => ErrorCode::Unauthorized,
            Error::Closed => ErrorCode::StoreClosed,
        }
    }

    /// Returns the taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }
}
