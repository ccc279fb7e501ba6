use thiserror::Error;

/// Errors surfaced by the object-graph and registry layer.
#[derive(Error, Debug)]
pub enum ModelError {
    /// A handle named a slot that holds no live object.
    #[error("object handle {0} is not live")]
    DeadObject(u32),

    /// A string buffer did not hold valid utf-8 when text was requested.
    #[error("invalid utf-8 string payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A field lookup failed on a composite.
    #[error("field '{0}' not found on composite '{1}'")]
    FieldNotFound(String, String),

    /// An operation needed a resolved type but found none.
    #[error("object has no resolved type")]
    UntypedObject,
}
