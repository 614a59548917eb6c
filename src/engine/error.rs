use chrono::{NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::{CalendarId, Ms};

use super::aggregate::ProviderFailure;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    UnknownOwner(String),
    Conflict(Ulid),
    NotPending(Ulid),
    AlreadyMember {
        owner: String,
        identity: CalendarId,
    },
    NotMember {
        owner: String,
        identity: CalendarId,
    },
    /// Active weekday whose start is not before its end.
    InvalidWindow {
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    InvalidSlotDuration(Ms),
    InvalidInput(&'static str),
    CalendarWrite(ProviderFailure),
    Cancelled,
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UnknownOwner(owner) => write!(f, "unknown owner: {owner}"),
            EngineError::Conflict(id) => write!(f, "conflict with request: {id}"),
            EngineError::NotPending(id) => write!(f, "request {id} is not pending"),
            EngineError::AlreadyMember { owner, identity } => {
                write!(f, "{identity} is already a member of {owner}")
            }
            EngineError::NotMember { owner, identity } => {
                write!(f, "{identity} is not a member of {owner}")
            }
            EngineError::InvalidWindow {
                weekday,
                start,
                end,
            } => write!(
                f,
                "invalid working hours for {weekday}: start {start} is not before end {end}"
            ),
            EngineError::InvalidSlotDuration(ms) => {
                write!(f, "invalid slot duration: {ms}ms")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::CalendarWrite(failure) => {
                write!(f, "calendar write failed: {failure}")
            }
            EngineError::Cancelled => write!(f, "request cancelled before all calendars answered"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
