//! Document encoding shared by the store and its backends.
//!
//! Every record body and every persisted snapshot goes through these two
//! functions, so the wire shape of a document is decided in one place.

use serde::{Serialize, de::DeserializeOwned};
use snafu::{Location, ResultExt, Snafu};

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("encoding failed at {location}: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
        /// Where the encode was requested.
        #[snafu(implicit)]
        location: Location,
    },

    /// Decoding failed.
    #[snafu(display("decoding failed at {location}: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
        /// Where the decode was requested.
        #[snafu(implicit)]
        location: Location,
    },
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).context(EncodeSnafu)
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns `CodecError::Decode` if deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).context(DecodeSnafu)
}
