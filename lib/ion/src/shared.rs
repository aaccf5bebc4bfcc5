use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error plumbing used throughout the pipeline. `Wait` signals
/// that an operation could not make progress yet (would-block socket,
/// not enough buffered bytes) and is always recoverable by a later service
/// pass. `Fatal` terminates the connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    PayloadTooLarge,
    EmptyPayload,
    Crypto,
    Handler,
    Serialization,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let error: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();

        assert_eq!(error, NetworkError::Wait);
    }

    #[test]
    fn test_io_error_folds_to_fatal() {
        let error: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();

        assert_eq!(
            error,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Crypto)).has_failed());
    }

}
