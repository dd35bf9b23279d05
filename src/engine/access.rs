//! Authorization resolver.
//!
//! Every decision is a pure function of a [`Principal`] (resolved once per request) and the
//! room state the caller already holds a lock on, so the check and the write it guards see
//! the same memberships.

use std::fmt;

use ulid::Ulid;

use crate::model::{Booking, Role, RoomState, User};

use super::EngineError;

/// The requesting user as seen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub system_admin: bool,
}

impl Principal {
    /// A user id with no matching user record. Holds no global privileges.
    pub fn unknown(user_id: Ulid) -> Self {
        Self {
            user_id,
            system_admin: false,
        }
    }
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            system_admin: user.system_admin,
        }
    }
}

/// What the principal wants to do to a room.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    /// Read room details, bookings, members; join a booking.
    ReadRoom,
    /// Create bookings, edit or delete the room, add members.
    AdministerRoom,
    /// Update or delete this booking.
    MutateBooking(&'a Booking),
    /// Remove this user's membership.
    RemoveMember(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    NotRoomMember,
    NotRoomAdmin,
    NotBookingOwner,
    NotSystemAdmin,
}

impl Denial {
    pub fn label(&self) -> &'static str {
        match self {
            Denial::NotRoomMember => "not_room_member",
            Denial::NotRoomAdmin => "not_room_admin",
            Denial::NotBookingOwner => "not_booking_owner",
            Denial::NotSystemAdmin => "not_system_admin",
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::NotRoomMember => f.write_str("not a member of this room"),
            Denial::NotRoomAdmin => f.write_str("room admin role required"),
            Denial::NotBookingOwner => {
                f.write_str("only the booking creator or a room admin may change this booking")
            }
            Denial::NotSystemAdmin => f.write_str("system admin required"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    Denied(Denial),
}

impl Permission {
    fn from_check(allowed: bool, denial: Denial) -> Self {
        if allowed {
            Permission::Allowed
        } else {
            Permission::Denied(denial)
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Permission::Allowed)
    }

    /// Turn a denial into `EngineError::Forbidden`.
    pub fn check(self) -> Result<(), EngineError> {
        match self {
            Permission::Allowed => Ok(()),
            Permission::Denied(denial) => {
                metrics::counter!(crate::observability::AUTHZ_DENIALS_TOTAL, "reason" => denial.label())
                    .increment(1);
                Err(EngineError::Forbidden(denial))
            }
        }
    }
}

pub fn is_room_admin(principal: &Principal, room: &RoomState) -> bool {
    principal.system_admin || room.role_of(&principal.user_id) == Some(Role::Admin)
}

pub fn can_access_room(principal: &Principal, room: &RoomState) -> bool {
    principal.system_admin || room.members.contains_key(&principal.user_id)
}

/// Creator, room admin, or system admin. The last is already implied by `is_room_admin`
/// but is spelled out so the rule reads the same as it is documented.
pub fn can_mutate_booking(principal: &Principal, room: &RoomState, booking: &Booking) -> bool {
    is_room_admin(principal, room)
        || booking.created_by == principal.user_id
        || principal.system_admin
}

pub fn evaluate(principal: &Principal, room: &RoomState, action: Action<'_>) -> Permission {
    match action {
        Action::ReadRoom => {
            Permission::from_check(can_access_room(principal, room), Denial::NotRoomMember)
        }
        Action::AdministerRoom => {
            Permission::from_check(is_room_admin(principal, room), Denial::NotRoomAdmin)
        }
        Action::MutateBooking(booking) => Permission::from_check(
            can_mutate_booking(principal, room, booking),
            Denial::NotBookingOwner,
        ),
        Action::RemoveMember(user_id) => Permission::from_check(
            user_id == principal.user_id || is_room_admin(principal, room),
            Denial::NotRoomAdmin,
        ),
    }
}
