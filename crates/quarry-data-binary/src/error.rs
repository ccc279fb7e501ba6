use quarry_data_convert::ConvertError;
use thiserror::Error;

/// Container read/write failures. Write failures abort the whole operation
/// with no partial-file guarantee; read failures below the root degrade to
/// zeroed fields instead of surfacing here.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Stream I/O failed.
    #[error("container i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before the declared header or payload.
    #[error("container truncated at offset {0}")]
    Truncated(usize),

    /// The root object carries no resolvable type.
    #[error("root object has no resolved type")]
    UntypedRoot,

    /// The root is externally backed and no resolver is installed.
    #[error("root object is external and cannot be inlined")]
    ExternalRoot,

    /// Re-typing the root during fix-up failed.
    #[error("root repair conversion failed: {0}")]
    RootRepair(#[from] ConvertError),
}
