use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use agendad::tenant::{TenantManager, TenantTasks};
use agendad::wire;

const PASSWORD: &str = "agendad";
const POOL_DATE: &str = "2099-06-10";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("agendad_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantTasks::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, tenant: &str) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(tenant)
        .user("dispatcher")
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn create_pool(client: &Client, capacity: u32, reservations: bool) -> Ulid {
    let id = Ulid::new();
    let shift = Ulid::new();
    let region = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO pools (id, date, shift_id, shift_name, shift_start, shift_end, region_id, capacity, reservations_allowed) \
             VALUES ('{id}', '{POOL_DATE}', '{shift}', 'Tarde', '14:00', '18:00', '{region}', {capacity}, {reservations})"
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &Client, pool: Ulid, worker: Ulid) -> Result<(Ulid, String), tokio_postgres::Error> {
    let id = Ulid::new();
    let messages = client
        .simple_query(&format!(
            "INSERT INTO bookings (id, pool_id, worker_id) VALUES ('{id}', '{pool}', '{worker}')"
        ))
        .await?;
    let row = rows(messages).pop().expect("booking outcome row");
    Ok((id, row.get("kind").unwrap().to_string()))
}

fn db_message(err: &tokio_postgres::Error) -> String {
    err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn seats_then_reservation_then_promotion() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let pool = create_pool(&client, 1, true).await;

    let (first, kind) = book(&client, pool, Ulid::new()).await.unwrap();
    assert_eq!(kind, "seat");
    let (second, kind) = book(&client, pool, Ulid::new()).await.unwrap();
    assert_eq!(kind, "reservation");

    let listed = select(&client, &format!("SELECT * FROM pools WHERE id = '{pool}'")).await;
    assert_eq!(listed[0].get("occupied"), Some("1"));
    assert_eq!(listed[0].get("waitlisted"), Some("1"));

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{first}'"))
        .await
        .unwrap();

    let promoted = select(&client, &format!("SELECT * FROM bookings WHERE id = '{second}'")).await;
    assert_eq!(promoted[0].get("status"), Some("confirmed"));
    assert_eq!(promoted[0].get("kind"), Some("seat"));

    let listed = select(&client, &format!("SELECT * FROM pools WHERE id = '{pool}'")).await;
    assert_eq!(listed[0].get("occupied"), Some("1"));
    assert_eq!(listed[0].get("waitlisted"), Some("0"));
}

#[tokio::test]
async fn rejections_carry_stable_messages() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let pool = create_pool(&client, 1, false).await;
    let worker = Ulid::new();

    book(&client, pool, worker).await.unwrap();

    let err = book(&client, pool, worker).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
    assert_eq!(db_message(&err), "already booked on this pool");

    let err = book(&client, pool, Ulid::new()).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
    assert_eq!(db_message(&err), "pool is full");

    client
        .batch_execute(&format!("UPDATE pools SET active = false WHERE id = '{pool}'"))
        .await
        .unwrap();
    let err = book(&client, pool, Ulid::new()).await.unwrap_err();
    assert_eq!(db_message(&err), "pool unavailable");
}

#[tokio::test]
async fn bad_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;

    let err = client.simple_query("SELECT * FROM resources").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = client.simple_query("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn second_pool_for_same_slot_is_refused() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let (shift, region) = (Ulid::new(), Ulid::new());
    let insert = |id: Ulid| {
        format!(
            "INSERT INTO pools (id, date, shift_id, shift_name, shift_start, shift_end, region_id, capacity) \
             VALUES ('{id}', '{POOL_DATE}', '{shift}', 'Noite', '22:00', '02:00', '{region}', 3)"
        )
    };

    client.batch_execute(&insert(Ulid::new())).await.unwrap();
    let err = client.batch_execute(&insert(Ulid::new())).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
}

#[tokio::test]
async fn duplicates_report_each_date() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let pool = create_pool(&client, 4, true).await;

    let report = select(
        &client,
        &format!(
            "INSERT INTO duplicates (pool_id, date) VALUES ('{pool}', '2099-06-11'), ('{pool}', '{POOL_DATE}'), ('{pool}', '2000-01-01')"
        ),
    )
    .await;
    let outcomes: Vec<(String, String)> = report
        .iter()
        .map(|r| (r.get("date").unwrap().to_string(), r.get("outcome").unwrap().to_string()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("2099-06-11".to_string(), "created".to_string()),
            (POOL_DATE.to_string(), "conflict".to_string()),
            ("2000-01-01".to_string(), "past_date".to_string()),
        ]
    );
    assert_eq!(select(&client, "SELECT * FROM pools").await.len(), 2);
}

#[tokio::test]
async fn config_round_trips_through_sql() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;

    client
        .batch_execute("UPDATE config SET release_tier_5 = '07:30', cancellation_enabled = false")
        .await
        .unwrap();

    let config = select(&client, "SELECT * FROM config").await;
    let value = |key: &str| {
        config
            .iter()
            .find(|r| r.get("key") == Some(key))
            .and_then(|r| r.get("value"))
            .map(str::to_string)
    };
    assert_eq!(value("release_tier_5").as_deref(), Some("07:30"));
    assert_eq!(value("cancellation_enabled").as_deref(), Some("false"));
    assert_eq!(value("utc_offset_minutes").as_deref(), Some("-180"));
}

#[tokio::test]
async fn cancellation_disabled_is_refused() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let pool = create_pool(&client, 2, true).await;
    let (booking, _) = book(&client, pool, Ulid::new()).await.unwrap();

    client
        .batch_execute("UPDATE config SET cancellation_enabled = false")
        .await
        .unwrap();
    let err = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
    assert_eq!(db_message(&err), "cannot cancel: cancellation is disabled");
}

#[tokio::test]
async fn worker_views_over_extended_protocol() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let pool = create_pool(&client, 3, true).await;
    let worker = Ulid::new();

    client
        .batch_execute(&format!("INSERT INTO workers (id, tier) VALUES ('{worker}', 5)"))
        .await
        .unwrap();
    book(&client, pool, worker).await.unwrap();

    let visible = client
        .query("SELECT * FROM visible_pools WHERE worker_id = $1", &[&worker.to_string()])
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get::<_, String>("id"), pool.to_string());

    let mine = client
        .query("SELECT * FROM bookings WHERE worker_id = $1", &[&worker.to_string()])
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get::<_, String>("status"), "confirmed");
}

#[tokio::test]
async fn audit_and_reconcile_on_a_consistent_tenant() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    let pool = create_pool(&client, 2, true).await;
    book(&client, pool, Ulid::new()).await.unwrap();

    let audit = select(&client, &format!("SELECT * FROM audit WHERE pool_id = '{pool}'")).await;
    assert_eq!(audit[0].get("true_occupied"), Some("1"));
    assert_eq!(audit[0].get("drift"), Some("0"));
    assert_eq!(audit[0].get("finding"), None);

    assert!(select(&client, "SELECT * FROM reconcile").await.is_empty());
}

#[tokio::test]
async fn tenants_do_not_share_pools() {
    let addr = start_test_server().await;
    let (a, _) = connect(addr, "tenant_a").await;
    let (b, _) = connect(addr, "tenant_b").await;

    create_pool(&a, 1, false).await;
    assert_eq!(select(&a, "SELECT * FROM pools").await.len(), 1);
    assert!(select(&b, "SELECT * FROM pools").await.is_empty());
}

#[tokio::test]
async fn listener_gets_pool_events_with_next_statement() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr, "acme").await;
    let (writer, _) = connect(addr, "acme").await;
    let pool = create_pool(&writer, 2, true).await;

    listener.batch_execute(&format!("LISTEN pool_{pool}")).await.unwrap();
    book(&writer, pool, Ulid::new()).await.unwrap();

    listener.simple_query("SELECT * FROM config").await.unwrap();
    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("pool_{pool}"));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(payload.get("BookingPlaced").is_some());
}

#[tokio::test]
async fn only_subscribed_pools_notify() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr, "acme").await;
    let (writer, _) = connect(addr, "acme").await;
    let watched = create_pool(&writer, 2, true).await;
    let other = create_pool_on(&writer, "2099-06-12").await;

    listener.batch_execute(&format!("LISTEN pool_{watched}")).await.unwrap();
    book(&writer, other, Ulid::new()).await.unwrap();
    listener.simple_query("SELECT * FROM config").await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());

    listener.batch_execute(&format!("UNLISTEN pool_{watched}")).await.unwrap();
    book(&writer, watched, Ulid::new()).await.unwrap();
    listener.simple_query("SELECT * FROM config").await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_rejects_foreign_channels() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "acme").await;
    assert!(client.batch_execute("LISTEN resource_1").await.is_err());
    client.batch_execute("UNLISTEN *").await.unwrap();
}

async fn create_pool_on(client: &Client, date: &str) -> Ulid {
    let id = Ulid::new();
    let (shift, region) = (Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO pools (id, date, shift_id, shift_name, shift_start, shift_end, region_id, capacity) \
             VALUES ('{id}', '{date}', '{shift}', 'Manhã', '08:00', '12:00', '{region}', 2)"
        ))
        .await
        .unwrap();
    id
}
