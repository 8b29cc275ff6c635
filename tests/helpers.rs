#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use job_locker::{JobDescriptor, JobRow, LockerOptions};
use sqlx::postgres::PgConnectOptions;
use sqlx::{FromRow, PgPool};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(FromRow, Debug, PartialEq, Eq)]
pub struct LockerRow {
    pub pid: i32,
    pub process_id: i32,
    pub hostname: String,
    pub worker_count: i16,
    pub listening: bool,
}

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    /// Options preloaded with the test pool, a snappy control loop tick
    /// and a job runner that deletes the row it was handed.
    pub fn locker_options(&self) -> LockerOptions {
        let pool = self.test_pool.clone();
        LockerOptions::default()
            .pg_pool(self.test_pool.clone())
            .wait_period(Duration::from_millis(10))
            .job_runner(move |descriptor: JobDescriptor| {
                let pool = pool.clone();
                async move {
                    sqlx::query("DELETE FROM jobs WHERE job_id = $1")
                        .bind(*descriptor.job_id())
                        .execute(&pool)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            })
    }

    pub async fn insert_job(&self, priority: i16, run_at: DateTime<Utc>, job_class: &str) -> i64 {
        sqlx::query_scalar(
            r#"
                INSERT INTO jobs (priority, run_at, job_class, args)
                VALUES ($1, $2, $3, '[]')
                RETURNING job_id
            "#,
        )
        .bind(priority)
        .bind(run_at)
        .bind(job_class)
        .fetch_one(&self.test_pool)
        .await
        .expect("Failed to insert job")
    }

    pub async fn insert_jobs(&self, count: i64, priority: i16, job_class: &str) {
        sqlx::query(
            r#"
                INSERT INTO jobs (priority, run_at, job_class, args)
                SELECT $1, now(), $2, '[]' FROM generate_series(1, $3)
            "#,
        )
        .bind(priority)
        .bind(job_class)
        .bind(count)
        .execute(&self.test_pool)
        .await
        .expect("Failed to insert jobs");
    }

    pub async fn get_jobs(&self) -> Vec<JobRow> {
        sqlx::query_as("SELECT * FROM jobs ORDER BY job_id ASC")
            .fetch_all(&self.test_pool)
            .await
            .expect("Failed to get jobs")
    }

    pub async fn count_jobs(&self) -> i64 {
        sqlx::query_scalar("SELECT count(*) FROM jobs")
            .fetch_one(&self.test_pool)
            .await
            .expect("Failed to count jobs")
    }

    pub async fn get_lockers(&self) -> Vec<LockerRow> {
        sqlx::query_as("SELECT * FROM lockers ORDER BY pid ASC")
            .fetch_all(&self.test_pool)
            .await
            .expect("Failed to get lockers")
    }

    pub async fn insert_locker_row(&self, pid: i32) {
        sqlx::query(
            r#"
                INSERT INTO lockers (pid, process_id, hostname, worker_count, listening)
                VALUES ($1, 0, 'bogus', 0, false)
            "#,
        )
        .bind(pid)
        .execute(&self.test_pool)
        .await
        .expect("Failed to insert locker row");
    }

    /// Sends the notification an enqueuer would send after inserting a job
    /// targeted at the locker registered under `pid`.
    pub async fn notify(&self, pid: i32, priority: i16, run_at: DateTime<Utc>, job_id: i64) {
        sqlx::query(
            r#"
                SELECT pg_notify(
                    'locker_' || $1::text,
                    json_build_object(
                        'priority', $2::int2,
                        'run_at', $3::timestamptz,
                        'job_id', $4::int8
                    )::text
                )
            "#,
        )
        .bind(pid)
        .bind(priority)
        .bind(run_at)
        .bind(job_id)
        .execute(&self.test_pool)
        .await
        .expect("Failed to notify locker");
    }

    pub async fn notify_raw(&self, pid: i32, payload: &str) {
        sqlx::query("SELECT pg_notify('locker_' || $1::text, $2)")
            .bind(pid)
            .bind(payload)
            .execute(&self.test_pool)
            .await
            .expect("Failed to notify locker");
    }

    /// How many sessions hold an advisory lock on `job_id` right now.
    pub async fn advisory_lock_count(&self, job_id: i64) -> i64 {
        sqlx::query_scalar(
            r#"
                SELECT count(*) FROM pg_locks
                WHERE locktype = 'advisory'
                AND ((classid::bigint << 32) | objid::bigint) = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.test_pool)
        .await
        .expect("Failed to count advisory locks")
    }
}

pub async fn create_test_database() -> TestDatabase {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut pg_conn_options: PgConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");
    pg_conn_options = pg_conn_options.application_name("__test_job_locker");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = uuid::Uuid::now_v7();
    let db_name = format!("__test_job_locker_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);

    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    create_tables(&test_pool).await;

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

/// The schema the locker consumes; migrations live outside the crate, so
/// tests lay the tables down themselves.
async fn create_tables(pool: &PgPool) {
    sqlx::query(
        r#"
            CREATE TABLE jobs (
                job_id bigserial PRIMARY KEY,
                priority smallint NOT NULL DEFAULT 100,
                run_at timestamptz NOT NULL DEFAULT now(),
                job_class text NOT NULL,
                args json NOT NULL DEFAULT '[]',
                error_count integer NOT NULL DEFAULT 0,
                last_error text
            )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create jobs table");

    sqlx::query("CREATE INDEX jobs_poll_idx ON jobs (priority, run_at, job_id)")
        .execute(pool)
        .await
        .expect("Failed to create jobs index");

    // Advisory lock keys are server-wide, not per-database, so parallel
    // tests must not hand out overlapping job ids.
    sqlx::query("SELECT setval('jobs_job_id_seq', trunc(random() * 1e12)::bigint + 1000)")
        .execute(pool)
        .await
        .expect("Failed to randomize job id sequence");

    sqlx::query(
        r#"
            CREATE TABLE lockers (
                pid integer PRIMARY KEY,
                process_id integer NOT NULL,
                hostname text NOT NULL,
                worker_count smallint NOT NULL,
                listening boolean NOT NULL
            )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create lockers table");
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database().await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

pub struct StaticCounter {
    cell: OnceCell<Mutex<u32>>,
}

async fn init_count() -> Mutex<u32> {
    Mutex::new(0)
}

impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
