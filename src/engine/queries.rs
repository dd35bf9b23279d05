use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::access::{self, evaluate, Action};
use super::conflict::{check_interval, find_conflict};
use super::{normalize_email, Engine, EngineError, SharedRoomState};

impl Engine {
    // ── Identity ─────────────────────────────────────────────

    pub fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        self.users.get(id).map(|u| UserInfo::from(u.value()))
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<UserInfo, EngineError> {
        let key = normalize_email(email);
        self.emails
            .get(&key)
            .and_then(|id| self.get_user(id.value()))
            .ok_or_else(|| EngineError::UserNotFound(email.to_string()))
    }

    /// A login name is either a user id or a registered email.
    pub fn resolve_login(&self, login: &str) -> Option<Ulid> {
        if let Ok(id) = Ulid::from_string(login) {
            return self.users.contains_key(&id).then_some(id);
        }
        self.find_user_by_email(login).ok().map(|u| u.id)
    }

    // ── Authorization resolver ───────────────────────────────
    //
    // Missing users, rooms or memberships are a plain `false`, never an error.

    pub async fn is_room_admin(&self, user_id: Ulid, room_id: Ulid) -> bool {
        let principal = self.principal(user_id);
        match self.read_room(room_id).await {
            Ok(guard) => access::is_room_admin(&principal, &guard),
            Err(_) => false,
        }
    }

    pub async fn can_access_room(&self, user_id: Ulid, room_id: Ulid) -> bool {
        let principal = self.principal(user_id);
        match self.read_room(room_id).await {
            Ok(guard) => access::can_access_room(&principal, &guard),
            Err(_) => false,
        }
    }

    pub async fn can_mutate_booking(&self, user_id: Ulid, booking: &Booking) -> bool {
        let principal = self.principal(user_id);
        match self.read_room(booking.room_id).await {
            Ok(guard) => access::can_mutate_booking(&principal, &guard, booking),
            Err(_) => false,
        }
    }

    // ── Conflict engine ──────────────────────────────────────

    /// Whether `[start, end)` overlaps any booking in the room other than `exclude`.
    /// Requires room access.
    pub async fn has_conflict(
        &self,
        actor: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let guard = self.read_room(room_id).await?;
        evaluate(&self.principal(actor), &guard, Action::ReadRoom).check()?;
        let span = check_interval(start, end)?;
        Ok(find_conflict(&guard, &span, exclude).is_some())
    }

    // ── Rooms ────────────────────────────────────────────────

    fn room_handles(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    /// Rooms the user is a member of, newest first.
    pub async fn list_rooms(&self, actor: Ulid) -> Vec<RoomInfo> {
        let mut rooms = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if !guard.deleted && guard.members.contains_key(&actor) {
                rooms.push(RoomInfo::from_state(&guard, &actor));
            }
        }
        rooms.sort_by_key(|r| Reverse((r.created_at, r.id)));
        rooms
    }

    pub async fn get_room_info(&self, actor: Ulid, room_id: Ulid) -> Result<RoomInfo, EngineError> {
        let guard = self.read_room(room_id).await?;
        evaluate(&self.principal(actor), &guard, Action::ReadRoom).check()?;
        Ok(RoomInfo::from_state(&guard, &actor))
    }

    pub async fn list_members(
        &self,
        actor: Ulid,
        room_id: Ulid,
    ) -> Result<Vec<MemberInfo>, EngineError> {
        let guard = self.read_room(room_id).await?;
        evaluate(&self.principal(actor), &guard, Action::ReadRoom).check()?;

        let mut members: Vec<MemberInfo> = guard
            .members
            .iter()
            .map(|(user_id, role)| {
                let user = self.users.get(user_id);
                MemberInfo {
                    room_id,
                    user_id: *user_id,
                    name: user.as_ref().map(|u| u.name.clone()),
                    email: user.as_ref().map(|u| u.email.clone()),
                    role: *role,
                }
            })
            .collect();
        members.sort_by_key(|m| (m.role != Role::Admin, m.user_id));
        Ok(members)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// All bookings in the room, ordered by start.
    pub async fn list_room_bookings(
        &self,
        actor: Ulid,
        room_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_room(room_id).await?;
        evaluate(&self.principal(actor), &guard, Action::ReadRoom).check()?;
        Ok(guard.bookings.clone())
    }

    pub async fn get_booking(&self, actor: Ulid, booking_id: Ulid) -> Result<Booking, EngineError> {
        let guard = self.resolve_booking_read(booking_id).await?;
        evaluate(&self.principal(actor), &guard, Action::ReadRoom).check()?;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Bookings the user created or joined, across all rooms, ordered by start.
    pub async fn list_user_bookings(&self, actor: Ulid) -> Vec<Booking> {
        let mut bookings = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            bookings.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.created_by == actor || b.has_participant(&actor))
                    .cloned(),
            );
        }
        bookings.sort_by_key(|b| (b.span.start, b.id));
        bookings
    }

    pub async fn list_participants(
        &self,
        actor: Ulid,
        booking_id: Ulid,
    ) -> Result<Vec<Participant>, EngineError> {
        let guard = self.resolve_booking_read(booking_id).await?;
        evaluate(&self.principal(actor), &guard, Action::ReadRoom).check()?;
        Ok(guard
            .booking(&booking_id)
            .map(|b| b.participants.clone())
            .unwrap_or_default())
    }
}
