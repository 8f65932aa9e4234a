#![cfg_attr(not(test), no_std)]

use core::fmt;

/// The error kind type used by the thread subsystem.
///
/// Similar to [`std::io::ErrorKind`], but restricted to the handful of
/// failures a kernel scheduler can actually surface. Everything else is a
/// precondition violation and asserts instead of returning an error.
///
/// [`std::io::ErrorKind`]: https://doc.rust-lang.org/std/io/enum.ErrorKind.html
#[repr(i32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum KError {
    /// Bad internal state.
    BadState = 1,
    /// Invalid parameter/argument.
    InvalidInput,
    /// Not enough space/cannot allocate memory.
    NoMemory,
    /// Device or resource is busy.
    ResourceBusy,
    /// The operation's deadline expired before it could complete.
    TimedOut,
    /// The operation needs to block to complete, but the blocking operation
    /// was requested to not occur.
    WouldBlock,
}

impl KError {
    /// Returns the error description.
    pub const fn as_str(&self) -> &'static str {
        match self {
            KError::BadState => "Bad internal state",
            KError::InvalidInput => "Invalid parameter",
            KError::NoMemory => "Out of memory",
            KError::ResourceBusy => "Resource busy",
            KError::TimedOut => "Timed out",
            KError::WouldBlock => "Operation would block",
        }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A specialized [`Result`] type with [`KError`] as the error type.
pub type KResult<T = ()> = Result<T, KError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_as_str() {
        assert_eq!(KError::NoMemory.to_string(), "Out of memory");
        assert_eq!(KError::TimedOut.as_str(), "Timed out");
    }

    #[test]
    fn codes_are_distinct() {
        let all = [
            KError::BadState,
            KError::InvalidInput,
            KError::NoMemory,
            KError::ResourceBusy,
            KError::TimedOut,
            KError::WouldBlock,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
