use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

use super::access::Denial;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Room or booking does not exist.
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(Denial),
    #[error("invalid interval: start {start} must be before end {end}")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("interval conflicts with booking: {0}")]
    IntervalConflict(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("user {user_id} is already a member of room {room_id}")]
    AlreadyMember { room_id: Ulid, user_id: Ulid },
    #[error("user {user_id} is not a member of room {room_id}")]
    NotAMember { room_id: Ulid, user_id: Ulid },
    #[error("user {user_id} already joined booking {booking_id}")]
    AlreadyJoined { booking_id: Ulid, user_id: Ulid },
    #[error("user {user_id} is not a participant of booking {booking_id}")]
    NotAParticipant { booking_id: Ulid, user_id: Ulid },
    #[error("email already registered: {0}")]
    DuplicateEmail(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
