use crate::hash::Hash;
use thiserror::Error;

/// Errors produced while literalizing, deliteralizing, saving or loading hashed objects.
#[derive(Error, Debug)]
pub enum Error {
    /// The recomputed hash of a deliteralized object disagreed with the hash it was loaded by.
    #[error("recomputed hash does not match the requested hash {0}")]
    WrongHash(Hash),

    /// An authored object's signature did not verify against its author's public key.
    #[error("signature over {0} does not verify against the author's public key")]
    BadSignature(Hash),

    /// An authored object had no signature attached where one was required.
    #[error("object {0} is authored but carries no signature")]
    MissingSignature(Hash),

    /// A dependency's declared class name disagreed with the class stored in the backend.
    #[error("dependency {hash} declared as class {declared} but backend holds class {stored}")]
    ClassMismatch {
        /// Hash of the disputed dependency.
        hash: Hash,
        /// Class name declared by the literal being saved.
        declared: String,
        /// Class name found in the backend.
        stored: String,
    },

    /// Saving an object failed because one or more dependencies could not be resolved.
    #[error("missing {} dependencies", .hashes.len())]
    MissingDependencies {
        /// Hashes of the dependencies that could not be found.
        hashes: Vec<Hash>,
    },

    /// A `MutationOp`'s `prevOps` referenced an op whose `OpHeader` is not in the backend.
    #[error("missing OpHeader for prev op {0}")]
    MissingPrevOpHeader(Hash),

    /// The deliteralizer could not find a constructor for the literal's declared class.
    #[error("no constructor registered for class {0}")]
    UnknownClass(String),

    /// A literal was structurally invalid: unexpected `_type`, an embedded object where a
    /// reference was required, or an unsupported/cyclic value.
    #[error("invalid literal: {0}")]
    InvalidLiteral(String),

    /// The class-specific `validate()` hook rejected a deliteralized object.
    #[error("validation failed for {0}")]
    ValidationFailed(Hash),

    /// An `AsyncStream` consumer timed out waiting for the next item.
    #[error("timed out waiting for the next item")]
    Timeout,

    /// An `AsyncStream` consumer reached the end of a closed source.
    #[error("stream has ended")]
    End,

    /// A value in the canonical value domain could not be encoded (not finite, not supported).
    #[error("value cannot be canonically encoded: {0}")]
    InvalidValue(String),
}

/// Convenience alias for this crate's fallible results.
pub type Result<T> = std::result::Result<T, Error>;
