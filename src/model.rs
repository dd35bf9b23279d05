use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Callers validate `start < end` first; see `engine::check_interval`.
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict on both sides: spans that only touch at an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::User => "USER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "USER" => Ok(Role::User),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    /// Opaque to this crate; produced and checked by the identity provider.
    pub credential_hash: String,
    pub system_admin: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub joined_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub created_by: Ulid,
    pub span: Span,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_at: Ms,
    pub participants: Vec<Participant>,
}

impl Booking {
    pub fn has_participant(&self, user_id: &Ulid) -> bool {
        self.participants.iter().any(|p| p.user_id == *user_id)
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub created_at: Ms,
    pub members: HashMap<Ulid, Role>,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Set once the room is deleted, for writers that were already waiting on its lock.
    pub deleted: bool,
}

impl RoomState {
    pub fn new(id: Ulid, title: String, description: Option<String>, created_at: Ms) -> Self {
        Self {
            id,
            title,
            description,
            created_at,
            members: HashMap::new(),
            bookings: Vec::new(),
            deleted: false,
        }
    }

    pub fn role_of(&self, user_id: &Ulid) -> Option<Role> {
        self.members.get(user_id).copied()
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query window.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub credential_hash: String,
    pub system_admin: bool,
}

#[derive(Debug, Clone)]
pub struct NewRoom {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
}

/// `None` keeps the current value; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl NewBooking {
    pub fn new(room_id: Ulid, start: Ms, end: Ms) -> Self {
        Self {
            id: Ulid::new(),
            room_id,
            start,
            end,
            title: None,
            description: None,
        }
    }

    pub fn with_id(mut self, id: Ulid) -> Self {
        self.id = id;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Absent time fields fall back to the stored ones. Title and description are patched
/// independently: `None` keeps, `Some(None)` clears, `Some(Some(_))` replaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub title: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        credential_hash: String,
        system_admin: bool,
        created_at: Ms,
    },
    RoomCreated {
        id: Ulid,
        title: String,
        description: Option<String>,
        created_at: Ms,
        members: Vec<(Ulid, Role)>,
    },
    RoomUpdated {
        id: Ulid,
        title: String,
        description: Option<String>,
    },
    RoomDeleted {
        id: Ulid,
    },
    MemberAdded {
        room_id: Ulid,
        user_id: Ulid,
        role: Role,
    },
    MemberRemoved {
        room_id: Ulid,
        user_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        room_id: Ulid,
        created_by: Ulid,
        span: Span,
        title: Option<String>,
        description: Option<String>,
        created_at: Ms,
        participants: Vec<Participant>,
    },
    BookingUpdated {
        id: Ulid,
        room_id: Ulid,
        span: Span,
        title: Option<String>,
        description: Option<String>,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
    ParticipantJoined {
        booking_id: Ulid,
        room_id: Ulid,
        user_id: Ulid,
        joined_at: Ms,
    },
    ParticipantLeft {
        booking_id: Ulid,
        room_id: Ulid,
        user_id: Ulid,
    },
}

impl Event {
    /// The room an event mutates, for events applied under a room lock.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomUpdated { id, .. } => Some(*id),
            Event::MemberAdded { room_id, .. }
            | Event::MemberRemoved { room_id, .. }
            | Event::BookingCreated { room_id, .. }
            | Event::BookingUpdated { room_id, .. }
            | Event::BookingDeleted { room_id, .. }
            | Event::ParticipantJoined { room_id, .. }
            | Event::ParticipantLeft { room_id, .. } => Some(*room_id),
            Event::UserRegistered { .. } | Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {
                None
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub system_admin: bool,
    pub created_at: Ms,
}

impl From<&User> for UserInfo {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
            system_admin: u.system_admin,
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub created_at: Ms,
    pub member_count: usize,
    /// The caller's role in the room, if a member.
    pub role: Option<Role>,
}

impl RoomInfo {
    pub fn from_state(rs: &RoomState, viewer: &Ulid) -> Self {
        Self {
            id: rs.id,
            title: rs.title.clone(),
            description: rs.description.clone(),
            created_at: rs.created_at,
            member_count: rs.members.len(),
            role: rs.role_of(viewer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id: Ulid::nil(),
            created_by: Ulid::nil(),
            span: Span::new(start, end),
            title: None,
            description: None,
            created_at: 0,
            participants: Vec::new(),
        }
    }

    fn room() -> RoomState {
        RoomState::new(Ulid::new(), "Board room".into(), None, 0)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(10, 20),
            Span::new(-5, 0),
            Span::new(2, 3),
            Span::new(9, 11),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn role_parse_and_display() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" USER ".parse::<Role>().unwrap(), Role::User);
        assert!("owner".parse::<Role>().is_err());
        assert_eq!(Role::Admin.to_string(), "ADMIN");
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut rs = room();
        rs.insert_booking(booking(300, 400));
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(200, 300));
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = room();
        let ids: Vec<Ulid> = (0..3)
            .map(|i| {
                let b = booking(i * 100, i * 100 + 50);
                let id = b.id;
                rs.insert_booking(b);
                id
            })
            .collect();
        assert!(rs.remove_booking(ids[1]).is_some());
        assert_eq!(rs.bookings.len(), 2);
        assert_eq!(rs.bookings[0].id, ids[0]);
        assert_eq!(rs.bookings[1].id, ids[2]);
        assert!(rs.remove_booking(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = room();
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(300, 400));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut rs = room();
        rs.insert_booking(booking(100, 201));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let mut rs = room();
        rs.insert_booking(booking(0, 10_000));
        rs.insert_booking(booking(20_000, 30_000));
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 600)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(0, 10_000));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RoomCreated {
            id: Ulid::new(),
            title: "Focus".into(),
            description: Some("2nd floor".into()),
            created_at: 42,
            members: vec![(Ulid::new(), Role::Admin)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
