/// The outcome of a core operation.
///
/// Every operation that can fail for a recoverable reason reports one of
/// these values; the API layer above the core owns the table translating
/// them into its own error representation (POSIX errno, classic status
/// codes...). The core never performs that translation itself, and it never
/// panics for any of these outcomes. Panics are reserved for invariant
/// violations, which go through [`crate::fatal::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The operation completed as requested.
    Successful = 0,

    /// A blocking operation gave up because its timeout expired before the
    /// awaited condition was satisfied.
    Timeout = 1,

    /// The object the thread was blocked on was deleted while the thread
    /// was waiting. The wait is over but nothing was obtained.
    ObjectWasDeleted = 2,

    /// A non-blocking acquisition found the condition unsatisfied. This is
    /// ordinary control flow, not an error.
    Unsatisfied = 3,

    /// An identifier did not refer to a live object.
    InvalidId = 4,

    /// A numeric argument was outside its valid range.
    InvalidNumber = 5,

    /// The object was in a state in which the operation is not permitted.
    IncorrectState = 6,

    /// A fixed-capacity structure was full. The caller may retry once
    /// capacity frees up or fail its own containing operation.
    TooMany = 7,

    /// A fixed-size table had no free slot left.
    NoMemory = 8,
}

impl Status {
    /// Reconstructs a status from its wire value. Unknown values collapse
    /// to [`Status::InvalidNumber`]; they can only appear if the packed
    /// wait-flags word was corrupted, and the consumer treats that as an
    /// ordinary invalid outcome rather than trusting the corrupt value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Successful,
            1 => Status::Timeout,
            2 => Status::ObjectWasDeleted,
            3 => Status::Unsatisfied,
            4 => Status::InvalidId,
            5 => Status::InvalidNumber,
            6 => Status::IncorrectState,
            7 => Status::TooMany,
            8 => Status::NoMemory,
            _ => Status::InvalidNumber,
        }
    }

    /// The wire value of this status, as packed into the wait-flags word.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn round_trips_through_wire_value() {
        for status in [
            Status::Successful,
            Status::Timeout,
            Status::ObjectWasDeleted,
            Status::Unsatisfied,
            Status::InvalidId,
            Status::InvalidNumber,
            Status::IncorrectState,
            Status::TooMany,
            Status::NoMemory,
        ] {
            assert_eq!(Status::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn unknown_wire_values_collapse_to_invalid_number() {
        assert_eq!(Status::from_u8(200), Status::InvalidNumber);
    }
}
