use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotd::automation::AutomationCycle;
use slotd::notify::BroadcastDispatcher;
use slotd::opslog::TracingOpsLog;
use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

const MONDAY: &str = "2026-10-19";

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("slotd")
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
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

struct Shop {
    service: Ulid,
    contact: Ulid,
}

/// Monday 09:00-17:00 in 30 minute steps, a 30 minute service, one contact.
async fn setup_shop(client: &Client) -> Shop {
    let service = Ulid::new();
    let contact = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO availability (day_of_week, is_open, intervals, slot_minutes) VALUES (1, true, '09:00-17:00', 30);
             INSERT INTO services (id, name, duration_minutes, buffer_minutes) VALUES ('{service}', 'Haircut', 30, 0);
             INSERT INTO contacts (id, name, email) VALUES ('{contact}', 'Ana', 'ana@example.com');"
        ))
        .await
        .unwrap();
    Shop { service, contact }
}

async fn book(client: &Client, shop: &Shop, start: &str) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, contact_id, service_id, date, start_time) VALUES ('{id}', '{}', '{}', '{MONDAY}', '{start}')",
            shop.contact, shop.service
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_shrink_after_booking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;

    let sql = format!("SELECT * FROM slots WHERE service_id = '{}' AND date = '{MONDAY}'", shop.service);
    let free = rows(&client, &sql).await;
    assert_eq!(free.len(), 16);
    assert_eq!(free[0].get("start_time"), Some("09:00"));
    assert_eq!(free[15].get("end_time"), Some("17:00"));
    assert!(free.iter().all(|r| r.get("available") == Some("t")));

    book(&client, &shop, "10:00").await.unwrap();
    let free = rows(&client, &sql).await;
    assert_eq!(free.len(), 15);
    assert!(free.iter().all(|r| r.get("start_time") != Some("10:00")));
}

#[tokio::test]
async fn double_booking_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;

    book(&client, &shop, "14:00").await.unwrap();
    let err = book(&client, &shop, "14:00").await.unwrap_err();
    let db = err.as_db_error().expect("database error");
    assert_eq!(db.code(), &SqlState::EXCLUSION_VIOLATION);
    assert!(db.message().contains("this time slot is no longer available"));

    // Back-to-back is fine.
    book(&client, &shop, "14:30").await.unwrap();
    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("start_time"), Some("14:00"));
    assert_eq!(listed[0].get("status"), Some("confirmed"));
}

#[tokio::test]
async fn batch_stops_at_first_failing_statement() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;

    let insert = |start: &str| {
        format!(
            "INSERT INTO bookings (id, contact_id, service_id, date, start_time) VALUES ('{}', '{}', '{}', '{MONDAY}', '{start}');",
            Ulid::new(),
            shop.contact,
            shop.service
        )
    };
    let batch = format!("{}{}{}", insert("09:00"), insert("09:00"), insert("10:00"));
    let err = client.batch_execute(&batch).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("start_time"), Some("09:00"));

    // A statement that does not parse rejects the batch before anything runs.
    let batch = format!("{}INSERT INTO nowhere (id) VALUES (1)", insert("11:00"));
    let err = client.batch_execute(&batch).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn slot_check_reports_availability() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;
    let id = book(&client, &shop, "11:00").await.unwrap();

    let check = |start: &str, end: &str, exclude: Option<Ulid>| {
        let mut sql = format!(
            "SELECT * FROM slot_check WHERE date = '{MONDAY}' AND start_time = '{start}' AND end_time = '{end}'"
        );
        if let Some(id) = exclude {
            sql.push_str(&format!(" AND exclude_id = '{id}'"));
        }
        sql
    };
    let taken = rows(&client, &check("11:15", "11:45", None)).await;
    assert_eq!(taken[0].get("available"), Some("f"));
    let own = rows(&client, &check("11:15", "11:45", Some(id))).await;
    assert_eq!(own[0].get("available"), Some("t"));
    let after = rows(&client, &check("11:30", "12:00", None)).await;
    assert_eq!(after[0].get("available"), Some("t"));
}

#[tokio::test]
async fn reschedule_and_cancel() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;
    let a = book(&client, &shop, "09:00").await.unwrap();
    book(&client, &shop, "10:00").await.unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO reschedules (booking_id, date, start_time) VALUES ('{a}', '{MONDAY}', '10:00')"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    client
        .batch_execute(&format!(
            "INSERT INTO reschedules (booking_id, date, start_time) VALUES ('{a}', '{MONDAY}', '09:15')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{a}'"))
        .await
        .unwrap();

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    let cancelled: Vec<_> = listed.iter().filter(|r| r.get("status") == Some("cancelled")).collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].get("start_time"), Some("09:15"));
}

#[tokio::test]
async fn extended_protocol_insert() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;

    let id = Ulid::new().to_string();
    let inserted = client
        .execute(
            "INSERT INTO bookings (id, contact_id, service_id, date, start_time) VALUES ($1, $2, $3, $4, $5)",
            &[
                &id,
                &shop.contact.to_string(),
                &shop.service.to_string(),
                &MONDAY,
                &"15:00",
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    assert_eq!(listed[0].get("id"), Some(id.as_str()));
}

#[tokio::test]
async fn booking_issues_post_booking_forms() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;
    let template = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO form_templates (id, service_id, name, due_in_hours) VALUES ('{template}', '{}', 'Intake', 24)",
            shop.service
        ))
        .await
        .unwrap();

    let id = book(&client, &shop, "13:00").await.unwrap();
    let forms = rows(&client, &format!("SELECT * FROM forms WHERE booking_id = '{id}'")).await;
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0].get("contact_id"), Some(shop.contact.to_string().as_str()));
    assert_eq!(forms[0].get("template_id"), Some(template.to_string().as_str()));
    assert_eq!(forms[0].get("status"), Some("pending"));
    assert_eq!(forms[0].get("reminder_count"), Some("0"));

    let form_id = forms[0].get("id").unwrap().to_string();
    client
        .batch_execute(&format!("INSERT INTO form_completions (form_id) VALUES ('{form_id}')"))
        .await
        .unwrap();
    let forms = rows(&client, &format!("SELECT * FROM forms WHERE booking_id = '{id}'")).await;
    assert_eq!(forms[0].get("status"), Some("completed"));
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, _tm) = start_test_server().await;
    let a = connect(addr, "salon_a").await;
    let b = connect(addr, "salon_b").await;
    let shop = setup_shop(&a).await;
    book(&a, &shop, "09:00").await.unwrap();

    let listed = rows(&b, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    assert!(listed.is_empty());
    // The contact and service only exist in salon_a.
    let err = book(&b, &shop, "09:00").await.unwrap_err();
    assert!(err.as_db_error().is_some());
}

#[tokio::test]
async fn malformed_statements_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "salon").await;

    let err = client.batch_execute("INSERT INTO nowhere (id) VALUES (1)").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
    let err = client
        .batch_execute("INSERT INTO availability (day_of_week, is_open, intervals) VALUES (1, true, '17:00-09:00')")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn reminder_visible_through_bookings_query() {
    let (addr, tm) = start_test_server().await;
    let client = connect(addr, "salon").await;
    let shop = setup_shop(&client).await;
    client
        .batch_execute("INSERT INTO settings (active, email_channel) VALUES (true, true)")
        .await
        .unwrap();
    book(&client, &shop, "14:00").await.unwrap();

    let dispatcher = Arc::new(BroadcastDispatcher::new());
    let mut delivered = dispatcher.subscribe();
    let cycle = AutomationCycle::new(tm, dispatcher, Arc::new(TracingOpsLog));
    let now = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap().and_hms_opt(13, 30, 0).unwrap();
    let report = cycle.run_at(now).await;
    assert_eq!(report.booking_reminders, 1);
    assert_eq!(delivered.recv().await.unwrap().target, "ana@example.com");

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE date = '{MONDAY}'")).await;
    assert_eq!(listed[0].get("reminder_sent"), Some("t"));
}
