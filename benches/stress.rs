use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roombook::engine::Engine;
use roombook::sql::parse_instant;
use roombook::wire;

const MINUTE: i64 = 60_000;
const HOUR: i64 = 3_600_000;
const PASSWORD: &str = "roombook";
const ADMIN: &str = "bench-admin@example.com";

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let dir = std::env::temp_dir().join(format!("roombook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create data dir");
    let engine = Arc::new(Engine::new(dir.join("roombook.wal")).expect("open WAL"));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roombook")
        .user(user)
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len().max(1) as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().copied().unwrap_or_default().as_secs_f64() * 1000.0,
    );
}

async fn create_room(client: &tokio_postgres::Client, title: &str) -> Ulid {
    let room = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, title) VALUES ('{room}', '{title}')"
        ))
        .await
        .expect("create room");
    room
}

async fn book(
    client: &tokio_postgres::Client,
    room: Ulid,
    start: i64,
    end: i64,
) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, start, "end") VALUES ('{room}', {start}, {end})"#
        ))
        .await
}

async fn phase1_sequential(addr: SocketAddr) {
    let client = connect(addr, ADMIN).await;
    let room = create_room(&client, "sequential").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = (i as i64) * HOUR;
        let t = Instant::now();
        book(&client, room, s, s + HOUR).await.expect("booking failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task races for the same overlapping slots in one room. Afterwards no two
/// committed bookings may overlap.
async fn phase2_contention(addr: SocketAddr) {
    let setup = connect(addr, ADMIN).await;
    let room = create_room(&setup, "contended").await;

    let n_tasks = 16;
    let n_per_task = 200;
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, ADMIN).await;
            for j in 0..n_per_task {
                // 45-minute bookings on a 30-minute grid, shifted per task: heavy overlap.
                let s = (j as i64) * 30 * MINUTE + (task as i64 % 3) * 10 * MINUTE;
                match book(&client, room, s, s + 45 * MINUTE).await {
                    Ok(()) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        let code = e.code().map(|c| c.code().to_string());
                        assert_eq!(code.as_deref(), Some("23P01"), "unexpected error: {e}");
                        rejected.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} attempts = {total} in {:.2}s: {} accepted, {} conflicts",
        elapsed.as_secs_f64(),
        accepted.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed)
    );

    let mut spans: Vec<(i64, i64)> = setup
        .simple_query(&format!("SELECT * FROM bookings WHERE room_id = '{room}'"))
        .await
        .expect("list bookings")
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some((
                parse_instant(row.get("start")?).ok()?,
                parse_instant(row.get("end")?).ok()?,
            )),
            _ => None,
        })
        .collect();
    spans.sort();
    assert_eq!(spans.len(), accepted.load(Ordering::Relaxed));
    for pair in spans.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "overlapping bookings committed: {pair:?}"
        );
    }
    println!("  verified: {} committed bookings, none overlap", spans.len());
}

async fn phase3_read_under_load(addr: SocketAddr) {
    let setup = connect(addr, ADMIN).await;
    let room = create_room(&setup, "busy").await;
    for i in 0..200 {
        let s = (i as i64) * HOUR;
        book(&setup, room, s, s + HOUR).await.expect("prefill");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(addr, ADMIN).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = (1_000 + w as i64 * 100_000 + i) * HOUR;
                let _ = book(&client, room, s, s + HOUR).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        reader_handles.push(tokio::spawn(async move {
            let client = connect(addr, ADMIN).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let s = ((r * reads_per_reader + i) as i64 % 200) * HOUR + 15 * MINUTE;
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM conflicts WHERE room_id = '{room}' AND start = {s} AND "end" = {}"#,
                        s + 30 * MINUTE
                    ))
                    .await
                    .expect("conflict query");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader panicked"));
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("conflict query", &mut all_latencies);
}

async fn phase4_connection_storm(addr: SocketAddr) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, ADMIN).await;
            let room = create_room(&client, &format!("storm-{c}")).await;
            for i in 0..ops_per_conn {
                let s = (i as i64) * HOUR;
                book(&client, room, s, s + HOUR).await.expect("storm booking");
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== roombook stress benchmark ===");
    let addr = start_server().await;
    println!("target: {addr}\n");

    let anon = connect(addr, "anonymous").await;
    anon.batch_execute(&format!(
        "INSERT INTO users (name, email, credential, system_admin) VALUES ('Bench', '{ADMIN}', 'x', true)"
    ))
    .await
    .expect("register bench user");
    drop(anon);

    println!("[phase 1] sequential write throughput");
    phase1_sequential(addr).await;

    println!("\n[phase 2] contended writes to one room");
    phase2_contention(addr).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(addr).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr).await;

    println!("\n=== done ===");
}
