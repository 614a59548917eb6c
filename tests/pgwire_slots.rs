use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use teamslot::engine::EngineConfig;
use teamslot::model::{time_of_day, CalendarId, Ms, Span, TimeZoneSpec};
use teamslot::provider::{Credentials, InMemoryCalendar};
use teamslot::tenant::TenantManager;
use teamslot::wire;

const HOUR: Ms = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<InMemoryCalendar>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("teamslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let calendar = Arc::new(InMemoryCalendar::new());
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        calendar.clone(),
        Arc::new(Credentials::new()),
        EngineConfig::default(),
        CancellationToken::new(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "teamslot".to_string(), None).await;
            });
        }
    });

    (addr, calendar)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("teamslot")
        .password("teamslot");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 19).unwrap()
}

fn at(hour: u32) -> Ms {
    TimeZoneSpec::tokyo().instant(monday(), time_of_day(hour, 0))
}

fn slot_hours(rows: &[SimpleQueryRow]) -> Vec<Ms> {
    rows.iter()
        .map(|r| {
            let start: Ms = r.get("start").unwrap().parse().unwrap();
            (start - at(0)) / HOUR
        })
        .collect()
}

const SLOTS_SQL: &str = "SELECT * FROM slots WHERE owner = 'alice' AND date = '2026-01-19'";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn monday_slots_skip_busy_hour() {
    let (addr, calendar) = start_test_server().await;
    calendar.add_busy(CalendarId::new("alice"), Span::new(at(13), at(14)));
    let client = connect(addr).await;

    let slots = rows(&client, SLOTS_SQL).await;
    assert_eq!(slot_hours(&slots), vec![10, 11, 12, 14, 15, 16, 17]);
    assert!(slots.iter().all(|r| r.get("owner") == Some("alice")));
    assert!(slots.iter().all(|r| r.get("unverified").is_none()));
}

#[tokio::test]
async fn schedule_round_trip_and_inactive_day() {
    let (addr, calendar) = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query(
            r#"INSERT INTO schedules (owner, weekday, active, start, "end") VALUES
                ('alice', 'monday', false, '10:00', '18:00'),
                ('alice', 'tuesday', true, '09:00', '12:00')"#,
        )
        .await
        .unwrap();

    let schedule = rows(&client, "SELECT * FROM schedules WHERE owner = 'alice'").await;
    assert_eq!(schedule.len(), 7);
    let tuesday = schedule.iter().find(|r| r.get("weekday") == Some("tuesday")).unwrap();
    assert_eq!(tuesday.get("start"), Some("09:00"));
    assert_eq!(tuesday.get("end"), Some("12:00"));

    assert!(rows(&client, SLOTS_SQL).await.is_empty());
    assert_eq!(calendar.fetch_count(), 0);

    let inverted = client
        .simple_query(
            r#"INSERT INTO schedules (owner, weekday, active, start, "end") VALUES ('alice', 'friday', true, '18:00', '10:00')"#,
        )
        .await;
    assert!(inverted.is_err());
}

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let (addr, calendar) = start_test_server().await;
    let client = connect(addr).await;
    let id = Ulid::new();

    client
        .simple_query(&format!(
            r#"INSERT INTO requests (id, owner, start, "end", guest_name, guest_email, note)
               VALUES ('{id}', 'alice', '2026-01-19T13:00:00+09:00', '2026-01-19T14:00:00+09:00', 'Hanako', 'hanako@example.com', NULL)"#
        ))
        .await
        .unwrap();

    // Pending request already holds the hour.
    assert!(!slot_hours(&rows(&client, SLOTS_SQL).await).contains(&13));

    let clash = client
        .simple_query(&format!(
            r#"INSERT INTO requests (id, owner, start, "end", guest_name, guest_email)
               VALUES ('{}', 'alice', {}, {}, 'Taro', 'taro@example.com')"#,
            Ulid::new(),
            at(13) + HOUR / 2,
            at(14) + HOUR / 2,
        ))
        .await
        .unwrap_err();
    assert_eq!(clash.as_db_error().unwrap().code().code(), "P0001");

    client
        .simple_query(&format!("INSERT INTO approvals (request_id) VALUES ('{id}')"))
        .await
        .unwrap();

    let requests = rows(&client, "SELECT * FROM requests WHERE owner = 'alice'").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].get("status"), Some("confirmed"));
    assert_eq!(requests[0].get("guest_email"), Some("hanako@example.com"));

    let created = calendar.created_events(&CalendarId::new("alice"));
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].span, Span::new(at(13), at(14)));

    // A second approval must not write another event.
    assert!(client
        .simple_query(&format!("INSERT INTO approvals (request_id) VALUES ('{id}')"))
        .await
        .is_err());
    assert_eq!(calendar.created_events(&CalendarId::new("alice")).len(), 1);
}

#[tokio::test]
async fn members_drive_slot_union_and_unverified() {
    let (addr, calendar) = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO members (owner, identity) VALUES ('alice', 'a@example.com')")
        .await
        .unwrap();
    client
        .simple_query("INSERT INTO members (owner, identity) VALUES ('alice', 'b@example.com')")
        .await
        .unwrap();
    calendar.add_busy(CalendarId::new("a@example.com"), Span::new(at(10), at(12)));
    calendar.fail_with(
        CalendarId::new("b@example.com"),
        teamslot::provider::ProviderError::Unauthorized("expired".into()),
    );

    let members = rows(&client, "SELECT identity FROM members WHERE owner = 'alice'").await;
    assert_eq!(members.len(), 2);

    let slots = rows(&client, SLOTS_SQL).await;
    assert_eq!(slot_hours(&slots), vec![12, 13, 14, 15, 16, 17]);
    assert!(slots.iter().all(|r| r.get("unverified") == Some("b@example.com")));
}

#[tokio::test]
async fn unsupported_statement_is_rejected() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.simple_query("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "42601");
}
