//! Error type for cursor protocol violations.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `current()` before `move_next()` positioned the cursor.
    #[error("call move_next() before current()")]
    NotStarted,
    /// `current()` after `move_next()` returned false.
    #[error("cursor is at the end position")]
    Exhausted,
}

impl Error {
    /// Both variants mean the cursor was used out of protocol.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::NotStarted | Error::Exhausted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
