//! Status codes for navigation queries

/// Result type for query and nav mesh operations
pub type Result<T> = std::result::Result<T, Status>;

/// Outcome of a navigation operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// Operation completed
    Success,
    /// Operation produced a usable but incomplete result
    PartialResult,
    /// Sliced operation needs more updates
    InProgress,
    /// A parameter was invalid or the operation was called out of order
    InvalidParam,
    /// Operation failed for an unspecified reason
    Failure,
    /// Requested item does not exist
    NotFound,
    /// Output did not fit the requested capacity
    BufferTooSmall,
    /// Search ran out of nodes
    OutOfNodes,
    /// Data does not start with the expected magic number
    WrongMagic,
    /// Data was written by an unsupported format version
    WrongVersion,
    /// Data is malformed
    DataCorrupted,
    /// Item already exists
    AlreadyExists,
}

impl Status {
    /// True for [`Status::Success`] and [`Status::PartialResult`]
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::PartialResult)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success() && *self != Status::InProgress
    }

    pub fn is_in_progress(&self) -> bool {
        *self == Status::InProgress
    }

    pub fn is_partial(&self) -> bool {
        *self == Status::PartialResult
    }

    /// Converts a success status into `Ok(value)`
    pub fn to_result<T>(self, value: T) -> Result<T> {
        if self.is_success() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::PartialResult => write!(f, "Partial result"),
            Status::InProgress => write!(f, "Operation in progress"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::Failure => write!(f, "Failure"),
            Status::NotFound => write!(f, "Value not found"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::OutOfNodes => write!(f, "Out of search nodes"),
            Status::WrongMagic => write!(f, "Wrong magic number"),
            Status::WrongVersion => write!(f, "Wrong version"),
            Status::DataCorrupted => write!(f, "Data corrupted"),
            Status::AlreadyExists => write!(f, "Value already exists"),
        }
    }
}

impl From<Status> for navforge_common::Error {
    fn from(status: Status) -> Self {
        navforge_common::Error::Detour(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_predicate() {
        assert!(Status::Success.is_success());
        assert!(Status::PartialResult.is_success());
        assert!(!Status::InProgress.is_success());
        assert!(!Status::InvalidParam.is_success());
        assert!(!Status::InProgress.is_failure());
        assert!(Status::NotFound.is_failure());
    }

    #[test]
    fn test_to_result() {
        assert_eq!(Status::Success.to_result(3), Ok(3));
        assert_eq!(Status::PartialResult.to_result(3), Ok(3));
        assert_eq!(Status::Failure.to_result(3), Err(Status::Failure));
    }

    #[test]
    fn test_common_error_conversion() {
        let err: navforge_common::Error = Status::WrongMagic.into();
        assert!(err.to_string().contains("Wrong magic number"));
    }
}
