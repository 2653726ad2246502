//! Error codes and the `Error` value carried by `try_` operations.

use core::fmt;

/// Stable result codes shared by every operation in the crate.
///
/// The first four are expected outcomes; the rest are errors. The numeric
/// value doubles as the process exit status of an uncaught exception.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    NotFound = 2,
    ExceptionStackEmpty = 3,
    NullPointer = 4,
    OutOfMemory = 5,
    ZeroDivision = 6,
    InvalidArgument = 7,
    OutOfBounds = 8,
    UnsupportedOperation = 9,
    UnimplementedOperation = 10,
    BadFilePointer = 11,
}

const INVALID_CODE: &str = "Invalid return code";

impl ErrorCode {
    const ALL: [ErrorCode; 12] = [
        ErrorCode::Success,
        ErrorCode::Failure,
        ErrorCode::NotFound,
        ErrorCode::ExceptionStackEmpty,
        ErrorCode::NullPointer,
        ErrorCode::OutOfMemory,
        ErrorCode::ZeroDivision,
        ErrorCode::InvalidArgument,
        ErrorCode::OutOfBounds,
        ErrorCode::UnsupportedOperation,
        ErrorCode::UnimplementedOperation,
        ErrorCode::BadFilePointer,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|i| Self::ALL.get(i))
            .copied()
    }

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// `false` for the expected outcomes (`Success`, `Failure`, `NotFound`,
    /// `ExceptionStackEmpty`).
    #[inline]
    pub fn is_error(self) -> bool {
        self.raw() >= ErrorCode::NullPointer.raw()
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::Failure => "Failure",
            ErrorCode::NotFound => "Not found",
            ErrorCode::ExceptionStackEmpty => "Exception stack empty",
            ErrorCode::NullPointer => "Null pointer",
            ErrorCode::OutOfMemory => "Out of memory",
            ErrorCode::ZeroDivision => "Division by zero",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::OutOfBounds => "Index out of bounds",
            ErrorCode::UnsupportedOperation => "Unsupported operation",
            ErrorCode::UnimplementedOperation => "Unimplemented operation",
            ErrorCode::BadFilePointer => "Bad file pointer",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Human-readable string for any raw code, including out-of-range ones.
pub fn describe(raw: i32) -> &'static str {
    ErrorCode::from_raw(raw).map_or(INVALID_CODE, ErrorCode::description)
}

/// Error returned by the `try_` forms of every fallible operation.
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
#[error("{}", render(.code, .message))]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

fn render(code: &ErrorCode, message: &Option<String>) -> String {
    match message {
        Some(m) => format!("{code}: {m}"),
        None => code.to_string(),
    }
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidArgument, message)
    }

    pub(crate) fn out_of_memory(bytes: usize) -> Self {
        Self::with_message(
            ErrorCode::OutOfMemory,
            format!("allocation of {bytes} bytes failed"),
        )
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_round_trip_through_from_raw() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_raw(code.raw()), Some(code));
        }
        assert_eq!(ErrorCode::from_raw(-1), None);
        assert_eq!(ErrorCode::from_raw(12), None);
    }

    #[test]
    fn out_of_range_codes_have_sentinel_description() {
        assert_eq!(describe(ErrorCode::OutOfMemory.raw()), "Out of memory");
        assert_eq!(describe(99), "Invalid return code");
        assert_eq!(describe(i32::MIN), "Invalid return code");
    }

    #[test]
    fn expected_outcomes_are_not_errors() {
        assert!(!ErrorCode::Success.is_error());
        assert!(!ErrorCode::NotFound.is_error());
        assert!(!ErrorCode::ExceptionStackEmpty.is_error());
        assert!(ErrorCode::NullPointer.is_error());
        assert!(ErrorCode::BadFilePointer.is_error());
    }

    #[test]
    fn display_includes_message_when_present() {
        assert_eq!(Error::new(ErrorCode::NotFound).to_string(), "Not found");
        assert_eq!(
            Error::with_message(ErrorCode::InvalidArgument, "key is 3 bytes").to_string(),
            "Invalid argument: key is 3 bytes"
        );
    }
}
