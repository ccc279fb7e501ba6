use quarry_data_model::TypeKind;
use thiserror::Error;

/// Conversion failures. The engine refuses pairings it does not recognize
/// rather than guessing; refusal is a value, never a panic.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// No dispatch case covers this source/destination pairing.
    #[error("no conversion from {src:?} to {dst:?}")]
    Unsupported {
        /// Source kind, if the source had a resolved type.
        src: Option<TypeKind>,
        /// Destination kind.
        dst: TypeKind,
    },

    /// The destination type chain ends in an unresolved `User` alias.
    #[error("destination type is unresolved")]
    UnresolvedType,

    /// A float descriptor outside the 32/64-bit conversion domain.
    #[error("cannot convert through a {0}-bit float")]
    FloatWidth(u8),

    /// A graph-level conversion a buffer conversion depended on returned
    /// null.
    #[error("nested graph conversion produced no result")]
    NullResult,

    /// Too few fields of a composite destination could be filled by name.
    #[error("only {matched} of {total} composite fields matched")]
    CompositeMismatch {
        /// Fields filled by name.
        matched: usize,
        /// Fields the destination declares.
        total: usize,
    },

    /// A virtual destination's callback rejected the source.
    #[error("virtual destination rejected the source")]
    VirtualRejected,
}
