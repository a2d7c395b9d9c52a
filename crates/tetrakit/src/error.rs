use thiserror::Error;

/// Failure taxonomy shared by every fallible operation in the crate.
///
/// The general rule is fail fast, report once: the first non-success return
/// bubbles to the nearest handler, which either substitutes a locally-handled
/// alternative or logs a single diagnostic and propagates.
#[derive(Error, Debug)]
pub enum Error {
    /// A required input is missing.
    #[error("null input: {0}")]
    Null(String),

    /// A precondition was violated by the caller.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Zero volume, zero denominator, or a non-finite metric.
    #[error("division by zero: {0}")]
    DivZero(String),

    /// A lookup missed, e.g. a global id that is not local to this part.
    #[error("not found: {0}")]
    NotFound(String),

    /// A code path deliberately unimplemented for this configuration.
    #[error("not implemented: {0}")]
    Implement(String),

    /// A fixed-size scratch buffer overflowed; the caller may retry with a
    /// larger budget.
    #[error("increase limit: {0}")]
    IncreaseLimit(String),

    /// A QR pivot fell below threshold.
    #[error("ill conditioned: {0}")]
    IllConditioned(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Null(format!("io: {err}"))
    }
}

/// Shorthand for `Error::Invalid` with formatted context.
#[macro_export]
macro_rules! invalid {
    ($($arg:tt)*) => {
        $crate::error::Error::Invalid(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = Error::DivZero("zero tet volume".to_string());
        assert_eq!(format!("{err}"), "division by zero: zero tet volume");
    }

    #[test]
    fn io_errors_map_to_null() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from(io), Error::Null(_)));
    }
}
