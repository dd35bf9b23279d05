mod access;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use access::{
    can_access_room, can_mutate_booking, evaluate, is_room_admin, Action, Denial, Permission,
    Principal,
};
pub use conflict::{check_interval, find_conflict};
pub use error::EngineError;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) struct PendingAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

pub(super) enum WalCommand {
    Append(PendingAppend),
    Control(WalControl),
}

/// Commands that run between batches, never inside one.
pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
///
/// Everything already queued behind the first append joins its batch and is made durable
/// by a single flush + fsync. A control command found while draining ends the batch and
/// runs after it is committed, so it observes every earlier append.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append(pending) => batch.push(pending),
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        }

        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append(pending) => batch.push(pending),
                WalCommand::Control(control) => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for pending in batch.iter() {
        if let Err(e) = wal.append_buffered(&pending.event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't lead the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for pending in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = pending.response.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalControl) {
    match cmd {
        WalControl::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Locked room handles ──────────────────────────────────

/// Write access to one room, plus a share of the persist gate.
///
/// Mutations take the gate before the room lock; compaction takes the gate exclusively,
/// so a snapshot never races an append. Field order makes the room lock drop first.
pub(super) struct RoomWriteGuard {
    guard: OwnedRwLockWriteGuard<RoomState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for RoomWriteGuard {
    type Target = RoomState;

    fn deref(&self) -> &RoomState {
        &self.guard
    }
}

impl DerefMut for RoomWriteGuard {
    fn deref_mut(&mut self) -> &mut RoomState {
        &mut self.guard
    }
}

pub struct Engine {
    pub(super) users: DashMap<Ulid, User>,
    /// Normalized email → user id. Entries are reserved before the WAL append.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Reverse lookup: booking id → room id
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    /// Held from the id and bootstrap checks until the new user is applied.
    pub(super) registrations: Mutex<()>,
    pub(super) persist_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Apply a room-scoped event (no locking; caller holds the room lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated {
            title, description, ..
        } => {
            rs.title = title.clone();
            rs.description = description.clone();
        }
        Event::MemberAdded { user_id, role, .. } => {
            rs.members.insert(*user_id, *role);
        }
        Event::MemberRemoved { user_id, .. } => {
            rs.members.remove(user_id);
        }
        Event::BookingCreated {
            id,
            room_id,
            created_by,
            span,
            title,
            description,
            created_at,
            participants,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                room_id: *room_id,
                created_by: *created_by,
                span: *span,
                title: title.clone(),
                description: description.clone(),
                created_at: *created_at,
                participants: participants.clone(),
            });
            booking_index.insert(*id, *room_id);
        }
        Event::BookingUpdated {
            id,
            span,
            title,
            description,
            ..
        } => {
            // Re-insert so the start-ordered index stays sorted.
            if let Some(mut booking) = rs.remove_booking(*id) {
                booking.span = *span;
                booking.title = title.clone();
                booking.description = description.clone();
                rs.insert_booking(booking);
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        Event::ParticipantJoined {
            booking_id,
            user_id,
            joined_at,
            ..
        } => {
            if let Some(booking) = rs.booking_mut(booking_id) {
                booking.participants.push(Participant {
                    booking_id: *booking_id,
                    user_id: *user_id,
                    joined_at: *joined_at,
                });
            }
        }
        Event::ParticipantLeft {
            booking_id, user_id, ..
        } => {
            if let Some(booking) = rs.booking_mut(booking_id) {
                booking.participants.retain(|p| p.user_id != *user_id);
            }
        }
        // Handled at the map level
        Event::UserRegistered { .. } | Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            users: DashMap::new(),
            emails: DashMap::new(),
            rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            registrations: Mutex::new(()),
            persist_gate: Arc::new(RwLock::new(())),
            wal_tx,
        };

        // Sole owner of every room lock during replay, so try_write never contends.
        // Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::UserRegistered { .. } | Event::RoomCreated { .. } => {
                    engine.apply_global(event);
                }
                Event::RoomDeleted { id } => {
                    if let Some(rs) = engine.get_room(id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        engine.detach_room(&mut guard);
                    }
                }
                other => {
                    let Some(room_id) = other.room_id() else { continue };
                    match engine.get_room(&room_id) {
                        Some(rs) => match rs.try_write() {
                            Ok(mut guard) => {
                                apply_to_room(&mut guard, other, &engine.booking_to_room)
                            }
                            Err(_) => warn!("replay: room {room_id} unexpectedly locked"),
                        },
                        None => warn!("replay: event for unknown room {room_id} skipped"),
                    }
                }
            }
        }

        info!(
            "replayed {} events: {} users, {} rooms, {} bookings",
            events.len(),
            engine.users.len(),
            engine.rooms.len(),
            engine.booking_to_room.len()
        );
        Ok(engine)
    }

    /// Apply events that add users or rooms to the top-level maps.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                name,
                email,
                credential_hash,
                system_admin,
                created_at,
            } => {
                self.emails.insert(normalize_email(email), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        credential_hash: credential_hash.clone(),
                        system_admin: *system_admin,
                        created_at: *created_at,
                    },
                );
            }
            Event::RoomCreated {
                id,
                title,
                description,
                created_at,
                members,
            } => {
                let mut rs = RoomState::new(*id, title.clone(), description.clone(), *created_at);
                rs.members.extend(members.iter().copied());
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
            }
            _ => {}
        }
    }

    /// Unlink a room and everything it owns. Caller holds the room lock.
    fn detach_room(&self, rs: &mut RoomState) {
        rs.deleted = true;
        for booking in &rs.bookings {
            self.booking_to_room.remove(&booking.id);
        }
        self.rooms.remove(&rs.id);
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append(PendingAppend {
                event: event.clone(),
                response: tx,
            }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Resolve the requesting user once; unknown ids get no privileges.
    pub fn principal(&self, user_id: Ulid) -> Principal {
        self.users
            .get(&user_id)
            .map(|u| Principal::from(u.value()))
            .unwrap_or_else(|| Principal::unknown(user_id))
    }

    pub(super) async fn enter_persist_gate(&self) -> OwnedRwLockReadGuard<()> {
        self.persist_gate.clone().read_owned().await
    }

    /// Take the persist gate, then the room's write lock.
    pub(super) async fn lock_room(&self, room_id: Ulid) -> Result<RoomWriteGuard, EngineError> {
        let gate = self.enter_persist_gate().await;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(RoomWriteGuard {
            guard,
            _gate: gate,
        })
    }

    pub(super) async fn read_room(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<RoomState>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(guard)
    }

    /// Lookup booking → room, acquire the room's write lock, confirm the booking survived.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<(Ulid, RoomWriteGuard), EngineError> {
        let room_id = self
            .get_room_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self.lock_room(room_id).await?;
        if guard.booking(&booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok((room_id, guard))
    }

    pub(super) async fn resolve_booking_read(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<RoomState>, EngineError> {
        let room_id = self
            .get_room_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self.read_room(room_id).await?;
        if guard.booking(&booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(guard)
    }

    /// WAL-append then apply, under a room lock the caller already holds.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room);
        Ok(())
    }
}
