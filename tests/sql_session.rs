use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roombook::engine::Engine;
use roombook::wire;

const PASSWORD: &str = "roombook";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roombook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("roombook.wal")).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn try_connect(addr: SocketAddr, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roombook")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    try_connect(addr, user).await.unwrap()
}

/// Data rows of a simple query, each as column name → text value.
async fn rows(client: &Client, sql: &str) -> Vec<Vec<(String, Option<String>)>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name().to_string(), row.get(i).map(str::to_string)))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn column<'a>(row: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    row.iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_deref())
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

struct World {
    addr: SocketAddr,
    root: Ulid,
    alice: Ulid,
    bob: Ulid,
    room: Ulid,
}

/// Root (system admin), alice (room admin), bob (member), one room.
async fn world() -> World {
    let addr = start_test_server().await;
    let anon = connect(addr, "anonymous").await;

    let (root, alice, bob) = (Ulid::new(), Ulid::new(), Ulid::new());
    anon.batch_execute(&format!(
        "INSERT INTO users (id, name, email, credential, system_admin) VALUES ('{root}', 'Root', 'root@example.com', 'h', true)"
    ))
    .await
    .unwrap();
    for (id, name) in [(alice, "alice"), (bob, "bob")] {
        anon.batch_execute(&format!(
            "INSERT INTO users (id, name, email, credential) VALUES ('{id}', '{name}', '{name}@example.com', 'h')"
        ))
        .await
        .unwrap();
    }

    let room = Ulid::new();
    let a = connect(addr, "alice@example.com").await;
    a.batch_execute(&format!(
        "INSERT INTO rooms (id, title, description) VALUES ('{room}', 'Atrium', 'Ground floor')"
    ))
    .await
    .unwrap();
    a.batch_execute(&format!(
        "INSERT INTO members (room_id, email) VALUES ('{room}', 'BOB@example.com')"
    ))
    .await
    .unwrap();

    World {
        addr,
        root,
        alice,
        bob,
        room,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_login_is_rejected() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "nobody@example.com").await.is_err());
    assert!(try_connect(addr, "anonymous").await.is_ok());
}

#[tokio::test]
async fn anonymous_sessions_only_register() {
    let w = world().await;
    let anon = connect(w.addr, "anonymous").await;
    assert_eq!(sqlstate(&anon, "SELECT * FROM rooms").await, "28000");
    assert_eq!(
        sqlstate(
            &anon,
            "INSERT INTO users (name, email, credential) VALUES ('Dup', 'alice@example.com', 'h')"
        )
        .await,
        "23505"
    );
    // Only the first user may bootstrap as system admin.
    assert_eq!(
        sqlstate(
            &anon,
            "INSERT INTO users (name, email, credential, system_admin) VALUES ('Eve', 'eve@example.com', 'h', true)"
        )
        .await,
        "42501"
    );
}

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let w = world().await;
    let alice = connect(w.addr, &w.alice.to_string()).await;
    let bob = connect(w.addr, "bob@example.com").await;

    let booking = Ulid::new();
    alice
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, room_id, start, "end", title) VALUES ('{booking}', '{}', '2024-05-01T09:00:00Z', '2024-05-01T10:00:00Z', 'Standup')"#,
            w.room
        ))
        .await
        .unwrap();

    // Overlap is an exclusion violation; touching is fine.
    assert_eq!(
        sqlstate(
            &alice,
            &format!(
                r#"INSERT INTO bookings (room_id, start, "end") VALUES ('{}', '2024-05-01T09:59:00Z', '2024-05-01T11:00:00Z')"#,
                w.room
            )
        )
        .await,
        "23P01"
    );
    alice
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, start, "end") VALUES ('{}', '2024-05-01T10:00:00Z', '2024-05-01T11:00:00Z')"#,
            w.room
        ))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(
            &alice,
            &format!(
                r#"INSERT INTO bookings (room_id, start, "end") VALUES ('{}', 5000, 5000)"#,
                w.room
            )
        )
        .await,
        "22007"
    );

    // Members may read and join, not create.
    assert_eq!(
        sqlstate(
            &bob,
            &format!(
                r#"INSERT INTO bookings (room_id, start, "end") VALUES ('{}', '2024-05-02T09:00:00Z', '2024-05-02T10:00:00Z')"#,
                w.room
            )
        )
        .await,
        "42501"
    );
    bob.batch_execute(&format!(
        "INSERT INTO participants (booking_id) VALUES ('{booking}')"
    ))
    .await
    .unwrap();

    let listed = rows(&bob, &format!("SELECT * FROM bookings WHERE room_id = '{}'", w.room)).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(column(&listed[0], "id"), Some(booking.to_string().as_str()));
    assert_eq!(column(&listed[0], "start"), Some("2024-05-01T09:00:00.000Z"));
    assert_eq!(column(&listed[0], "title"), Some("Standup"));
    assert_eq!(
        column(&listed[0], "participants"),
        Some(format!(r#"["{}"]"#, w.bob).as_str())
    );

    let mine = rows(&bob, "SELECT * FROM bookings").await;
    assert_eq!(mine.len(), 1);

    let conflicts = rows(
        &bob,
        &format!(
            r#"SELECT * FROM conflicts WHERE room_id = '{}' AND start = '2024-05-01T09:30:00Z' AND "end" = '2024-05-01T09:45:00Z' AND exclude = '{booking}'"#,
            w.room
        ),
    )
    .await;
    assert_eq!(column(&conflicts[0], "conflict"), Some("f"));

    // Moving the booking onto its neighbour conflicts; renaming it does not.
    assert_eq!(
        sqlstate(
            &alice,
            &format!(r#"UPDATE bookings SET "end" = '2024-05-01T10:30:00Z' WHERE id = '{booking}'"#)
        )
        .await,
        "23P01"
    );
    alice
        .batch_execute(&format!(
            "UPDATE bookings SET title = 'Retro', description = NULL WHERE id = '{booking}'"
        ))
        .await
        .unwrap();

    bob.batch_execute(&format!(
        "DELETE FROM participants WHERE booking_id = '{booking}'"
    ))
    .await
    .unwrap();
    assert_eq!(sqlstate(&bob, &format!("DELETE FROM bookings WHERE id = '{booking}'")).await, "42501");
    alice
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&alice, &format!("DELETE FROM bookings WHERE id = '{booking}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn conflict_queries_need_room_access() {
    let w = world().await;
    let anon = connect(w.addr, "anonymous").await;
    anon.batch_execute(
        "INSERT INTO users (name, email, credential) VALUES ('Carol', 'carol@example.com', 'h')",
    )
    .await
    .unwrap();
    let carol = connect(w.addr, "carol@example.com").await;
    let bob = connect(w.addr, "bob@example.com").await;

    let busy = |room: Ulid| {
        format!(
            r#"SELECT * FROM conflicts WHERE room_id = '{room}' AND start = 1000 AND "end" = 2000"#
        )
    };
    assert_eq!(sqlstate(&carol, &busy(w.room)).await, "42501");
    assert_eq!(sqlstate(&bob, &busy(Ulid::new())).await, "P0002");

    let answer = rows(&bob, &busy(w.room)).await;
    assert_eq!(column(&answer[0], "conflict"), Some("f"));
}

#[tokio::test]
async fn rooms_and_members_over_the_wire() {
    let w = world().await;
    let alice = connect(w.addr, "alice@example.com").await;
    let bob = connect(w.addr, "bob@example.com").await;
    let root = connect(w.addr, "root@example.com").await;

    let rooms = rows(&bob, "SELECT * FROM rooms").await;
    assert_eq!(rooms.len(), 1);
    assert_eq!(column(&rooms[0], "role"), Some("USER"));
    assert_eq!(column(&rooms[0], "member_count"), Some("2"));

    let members = rows(&bob, &format!("SELECT * FROM members WHERE room_id = '{}'", w.room)).await;
    assert_eq!(members.len(), 2);
    assert_eq!(column(&members[0], "user_id"), Some(w.alice.to_string().as_str()));
    assert_eq!(column(&members[0], "role"), Some("ADMIN"));

    assert_eq!(
        sqlstate(&bob, &format!("UPDATE rooms SET title = 'Mine' WHERE id = '{}'", w.room)).await,
        "42501"
    );
    alice
        .batch_execute(&format!("UPDATE rooms SET description = NULL WHERE id = '{}'", w.room))
        .await
        .unwrap();
    let room = rows(&alice, &format!("SELECT * FROM rooms WHERE id = '{}'", w.room)).await;
    assert_eq!(column(&room[0], "description"), None);

    assert_eq!(
        sqlstate(
            &alice,
            &format!("INSERT INTO members (room_id, email) VALUES ('{}', 'bob@example.com')", w.room)
        )
        .await,
        "23505"
    );
    assert_eq!(
        sqlstate(
            &alice,
            &format!("INSERT INTO members (room_id, email) VALUES ('{}', 'ghost@example.com')", w.room)
        )
        .await,
        "P0002"
    );

    // Bob leaves; the room disappears from his list.
    bob.batch_execute(&format!(
        "DELETE FROM members WHERE room_id = '{}' AND user_id = '{}'",
        w.room, w.bob
    ))
    .await
    .unwrap();
    assert!(rows(&bob, "SELECT * FROM rooms").await.is_empty());

    // A system admin may delete any room.
    root.batch_execute(&format!("DELETE FROM rooms WHERE id = '{}'", w.room))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&alice, &format!("SELECT * FROM rooms WHERE id = '{}'", w.room)).await,
        "P0002"
    );

    let me = rows(&root, "SELECT * FROM users").await;
    assert_eq!(column(&me[0], "id"), Some(w.root.to_string().as_str()));
    assert_eq!(column(&me[0], "system_admin"), Some("t"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let w = world().await;
    let alice = connect(w.addr, "alice@example.com").await;

    let booking = Ulid::new().to_string();
    let room = w.room.to_string();
    alice
        .execute(
            r#"INSERT INTO bookings (id, room_id, start, "end") VALUES ($1, $2, $3, $4)"#,
            &[&booking, &room, &"2030-01-01T08:00:00Z", &"2030-01-01T09:00:00Z"],
        )
        .await
        .unwrap();

    let found = alice
        .query("SELECT * FROM bookings WHERE id = $1", &[&booking])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let start: String = found[0].get("start");
    assert_eq!(start, "2030-01-01T08:00:00.000Z");
    let created_by: String = found[0].get("created_by");
    assert_eq!(created_by, w.alice.to_string());
}
