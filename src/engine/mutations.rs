use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{evaluate, Action, Denial, Permission};
use super::conflict::{check_interval, check_no_conflict, validate_span, validate_text};
use super::{normalize_email, Engine, EngineError, WalCommand, WalControl};

fn require_non_empty(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    /// Register a user. Only the first user, or a system admin acting on someone's
    /// behalf, may create a system admin.
    pub async fn register_user(
        &self,
        actor: Option<Ulid>,
        new: NewUser,
    ) -> Result<UserInfo, EngineError> {
        require_non_empty(&new.name, "name must not be empty")?;
        require_non_empty(&new.email, "email must not be empty")?;
        validate_text(Some(&new.name), MAX_NAME_LEN, "user name too long")?;
        validate_text(Some(&new.email), MAX_EMAIL_LEN, "email too long")?;
        validate_text(Some(&new.credential_hash), MAX_CREDENTIAL_LEN, "credential too long")?;

        let _registering = self.registrations.lock().await;
        if new.system_admin {
            let bootstrap = self.users.is_empty();
            let by_admin = actor.is_some_and(|a| self.principal(a).system_admin);
            if !(bootstrap || by_admin) {
                Permission::Denied(Denial::NotSystemAdmin).check()?;
            }
        }

        let _gate = self.enter_persist_gate().await;
        if self.users.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        let key = normalize_email(&new.email);
        match self.emails.entry(key.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateEmail(key)),
            Entry::Vacant(slot) => {
                slot.insert(new.id);
            }
        }

        let event = Event::UserRegistered {
            id: new.id,
            name: new.name,
            email: key.clone(),
            credential_hash: new.credential_hash,
            system_admin: new.system_admin,
            created_at: now_ms(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.emails.remove_if(&key, |_, id| *id == new.id);
            return Err(e);
        }
        self.apply_global(&event);
        debug!("registered user {} <{key}>", new.id);

        self.users
            .get(&new.id)
            .map(|u| UserInfo::from(u.value()))
            .ok_or(EngineError::UserNotFound(new.id.to_string()))
    }

    // ── Rooms ────────────────────────────────────────────────

    /// Create a room; the creator becomes its first admin.
    pub async fn create_room(&self, actor: Ulid, new: NewRoom) -> Result<RoomInfo, EngineError> {
        if !self.users.contains_key(&actor) {
            return Err(EngineError::UserNotFound(actor.to_string()));
        }
        require_non_empty(&new.title, "room title must not be empty")?;
        validate_text(Some(&new.title), MAX_TITLE_LEN, "room title too long")?;
        validate_text(new.description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let _gate = self.enter_persist_gate().await;
        let created_at = now_ms();
        let mut rs = RoomState::new(new.id, new.title.clone(), new.description.clone(), created_at);
        rs.members.insert(actor, Role::Admin);
        let shared = Arc::new(RwLock::new(rs));
        // Publish the room already locked, so nobody sees it before it is durable.
        let mut guard = shared
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::AlreadyExists(new.id))?;
        match self.rooms.entry(new.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(new.id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }

        let event = Event::RoomCreated {
            id: new.id,
            title: new.title,
            description: new.description,
            created_at,
            members: vec![(actor, Role::Admin)],
        };
        if let Err(e) = self.wal_append(&event).await {
            guard.deleted = true;
            self.rooms.remove(&new.id);
            return Err(e);
        }
        debug!("room {} created by {actor}", new.id);
        Ok(RoomInfo::from_state(&guard, &actor))
    }

    pub async fn update_room(
        &self,
        actor: Ulid,
        room_id: Ulid,
        patch: RoomPatch,
    ) -> Result<RoomInfo, EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::AdministerRoom).check()?;

        let title = patch.title.unwrap_or_else(|| guard.title.clone());
        let description = patch.description.unwrap_or_else(|| guard.description.clone());
        require_non_empty(&title, "room title must not be empty")?;
        validate_text(Some(&title), MAX_TITLE_LEN, "room title too long")?;
        validate_text(description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;

        let event = Event::RoomUpdated {
            id: room_id,
            title,
            description,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(RoomInfo::from_state(&guard, &actor))
    }

    /// Delete a room together with its memberships, bookings and participants.
    pub async fn delete_room(&self, actor: Ulid, room_id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::AdministerRoom).check()?;

        self.wal_append(&Event::RoomDeleted { id: room_id }).await?;
        let bookings = guard.bookings.len();
        self.detach_room(&mut guard);
        debug!("room {room_id} deleted by {actor} ({bookings} bookings dropped)");
        Ok(())
    }

    // ── Membership ───────────────────────────────────────────

    pub async fn add_member(
        &self,
        actor: Ulid,
        room_id: Ulid,
        email: &str,
        role: Role,
    ) -> Result<MemberInfo, EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::AdministerRoom).check()?;

        let user = self
            .find_user_by_email(email)
            .map_err(|_| EngineError::UserNotFound(email.to_string()))?;
        if guard.members.contains_key(&user.id) {
            return Err(EngineError::AlreadyMember {
                room_id,
                user_id: user.id,
            });
        }
        if guard.members.len() >= MAX_MEMBERS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many members in room"));
        }

        let event = Event::MemberAdded {
            room_id,
            user_id: user.id,
            role,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("user {} joined room {room_id} as {role}", user.id);
        Ok(MemberInfo {
            room_id,
            user_id: user.id,
            name: Some(user.name),
            email: Some(user.email),
            role,
        })
    }

    /// Room admins may remove anyone; members may remove themselves.
    pub async fn remove_member(
        &self,
        actor: Ulid,
        room_id: Ulid,
        user_id: Ulid,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::RemoveMember(user_id)).check()?;

        if !guard.members.contains_key(&user_id) {
            return Err(EngineError::NotAMember { room_id, user_id });
        }
        let event = Event::MemberRemoved { room_id, user_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Authorize, validate the interval, reject overlaps, then persist. The room lock is
    /// held throughout, so concurrent writers to the same room are serialized.
    pub async fn create_booking(
        &self,
        actor: Ulid,
        new: NewBooking,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.lock_room(new.room_id).await?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::AdministerRoom).check()?;

        let span = check_interval(new.start, new.end)?;
        validate_span(&span)?;
        validate_text(new.title.as_deref(), MAX_TITLE_LEN, "booking title too long")?;
        validate_text(new.description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;

        // The id index is global, so the room lock alone does not make the id unique.
        let (id, room_id) = (new.id, new.room_id);
        match self.booking_to_room.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(room_id);
            }
        }
        let created = self.insert_reserved_booking(&mut guard, actor, new, span).await;
        if created.is_err() {
            self.booking_to_room.remove_if(&id, |_, r| *r == room_id);
        }
        created
    }

    /// Limits, overlap and persistence for a booking whose id is already reserved.
    async fn insert_reserved_booking(
        &self,
        rs: &mut RoomState,
        actor: Ulid,
        new: NewBooking,
        span: Span,
    ) -> Result<Booking, EngineError> {
        if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings in room"));
        }

        check_no_conflict(rs, &span, None)?;

        let booking = Booking {
            id: new.id,
            room_id: new.room_id,
            created_by: actor,
            span,
            title: new.title,
            description: new.description,
            created_at: now_ms(),
            participants: Vec::new(),
        };
        let event = Event::BookingCreated {
            id: booking.id,
            room_id: booking.room_id,
            created_by: booking.created_by,
            span: booking.span,
            title: booking.title.clone(),
            description: booking.description.clone(),
            created_at: booking.created_at,
            participants: Vec::new(),
        };
        self.persist_and_apply(rs, &event).await?;
        debug!(
            "booking {} [{}, {}) created in room {}",
            booking.id, span.start, span.end, booking.room_id
        );
        Ok(booking)
    }

    /// Merge the patch over the stored booking and re-validate it, ignoring the booking's
    /// own current slot when looking for overlaps.
    pub async fn update_booking(
        &self,
        actor: Ulid,
        booking_id: Ulid,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(booking_id).await?;
        let existing = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::MutateBooking(&existing)).check()?;

        let start = patch.start.unwrap_or(existing.span.start);
        let end = patch.end.unwrap_or(existing.span.end);
        let span = check_interval(start, end)?;
        validate_span(&span)?;
        let title = patch.title.unwrap_or_else(|| existing.title.clone());
        let description = patch
            .description
            .unwrap_or_else(|| existing.description.clone());
        validate_text(title.as_deref(), MAX_TITLE_LEN, "booking title too long")?;
        validate_text(description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;

        check_no_conflict(&guard, &span, Some(booking_id))?;

        let event = Event::BookingUpdated {
            id: booking_id,
            room_id,
            span,
            title: title.clone(),
            description: description.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Booking {
            span,
            title,
            description,
            ..existing
        })
    }

    pub async fn delete_booking(&self, actor: Ulid, booking_id: Ulid) -> Result<Ulid, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(booking_id).await?;
        let existing = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::MutateBooking(&existing)).check()?;

        let event = Event::BookingDeleted {
            id: booking_id,
            room_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("booking {booking_id} deleted by {actor}");
        Ok(room_id)
    }

    // ── Participants ─────────────────────────────────────────

    /// Join a booking. Only members of the booking's room (or system admins) may join.
    pub async fn join_booking(
        &self,
        actor: Ulid,
        booking_id: Ulid,
    ) -> Result<Participant, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(booking_id).await?;
        let principal = self.principal(actor);
        evaluate(&principal, &guard, Action::ReadRoom).check()?;

        let participants = match guard.booking(&booking_id) {
            Some(b) if b.has_participant(&actor) => {
                return Err(EngineError::AlreadyJoined {
                    booking_id,
                    user_id: actor,
                });
            }
            Some(b) => b.participants.len(),
            None => return Err(EngineError::NotFound(booking_id)),
        };
        if participants >= MAX_PARTICIPANTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many participants"));
        }

        let participant = Participant {
            booking_id,
            user_id: actor,
            joined_at: now_ms(),
        };
        let event = Event::ParticipantJoined {
            booking_id,
            room_id,
            user_id: actor,
            joined_at: participant.joined_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(participant)
    }

    pub async fn leave_booking(&self, actor: Ulid, booking_id: Ulid) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(booking_id).await?;
        let joined = guard
            .booking(&booking_id)
            .is_some_and(|b| b.has_participant(&actor));
        if !joined {
            return Err(EngineError::NotAParticipant {
                booking_id,
                user_id: actor,
            });
        }

        let event = Event::ParticipantLeft {
            booking_id,
            room_id,
            user_id: actor,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Minimal event list that recreates the current state. Caller holds the persist gate
    /// exclusively, so no room is mid-mutation.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|entry| {
                let u = entry.value();
                Event::UserRegistered {
                    id: u.id,
                    name: u.name.clone(),
                    email: u.email.clone(),
                    credential_hash: u.credential_hash.clone(),
                    system_admin: u.system_admin,
                    created_at: u.created_at,
                }
            })
            .collect();

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            let mut members: Vec<(Ulid, Role)> =
                guard.members.iter().map(|(id, role)| (*id, *role)).collect();
            members.sort_by_key(|(id, _)| *id);
            events.push(Event::RoomCreated {
                id: guard.id,
                title: guard.title.clone(),
                description: guard.description.clone(),
                created_at: guard.created_at,
                members,
            });
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    room_id: b.room_id,
                    created_by: b.created_by,
                    span: b.span,
                    title: b.title.clone(),
                    description: b.description.clone(),
                    created_at: b.created_at,
                    participants: b.participants.clone(),
                });
            }
        }
        events
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.persist_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(WalControl::Compact { events, response: tx }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Control(WalControl::AppendsSinceCompact { response: tx }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
