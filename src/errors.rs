#[derive(Debug, Clone, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "Attempting to use an invalid operation handle.")]
    InvalidHandle,
    #[fail(
        display = "Cannot increment reference count on operation {} because it was already destroyed.",
        _0
    )]
    Destroyed(String),
    #[fail(
        display = "Cannot decrement reference count for operation {} because it is already 0.",
        _0
    )]
    ReferenceCountUnderflow(String),
    #[fail(display = "The provide handle has already been completed or is stale.")]
    InvalidProvideHandle,
    #[fail(
        display = "Provider of type {} with id {} has provided a result of type {} which cannot be converted to requested type {}. The operation will be marked as failed.",
        provider_type, provider_id, actual, requested
    )]
    TypeMismatch {
        provider_type: String,
        provider_id: String,
        actual: String,
        requested: String,
    },
    #[fail(display = "Unable to convert operation of type {} to type {}.", from, to)]
    InvalidConversion { from: String, to: String },
    #[fail(display = "Dependency Exception: {}", _0)]
    DependencyFailed(String),
    #[fail(
        display = "Failed to find a provider with id {} for {} of type {}.",
        provider_id, location, requested
    )]
    UnknownProvider {
        location: String,
        provider_id: String,
        requested: String,
    },
    #[fail(display = "{}", _0)]
    Provider(String),
    #[fail(display = "{}", _0)]
    Operation(String),
    #[fail(display = "Operation {} has already been completed.", _0)]
    AlreadyCompleted(String),
    #[fail(display = "Circular dependency detected while resolving {}.", _0)]
    CircularDependency(String),
    #[fail(display = "Callback panicked: {}", _0)]
    CallbackPanicked(String),
    #[fail(display = "{} operations are still alive.", _0)]
    LeakedOperations(usize),
    #[fail(display = "{}", _0)]
    Malformed(String),
    #[fail(display = "IO error: {}", _0)]
    Io(String),
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl Error {
    /// Keeps errors of this crate which a provider propagated, and wraps
    /// everything else into `Error::Provider`.
    pub(crate) fn from_provider(err: failure::Error) -> Self {
        err.downcast::<Error>()
            .unwrap_or_else(|err| Error::Provider(err.to_string()))
    }
}

impl From<::std::io::Error> for Error {
    fn from(err: ::std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<::serde_json::Error> for Error {
    fn from(err: ::serde_json::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}
