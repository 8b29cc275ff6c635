use indoc::indoc;
use sqlx::PgConnection;

use crate::errors::Result;

/// The server-side pid of the session behind `conn`. Identifies this
/// locker in the `lockers` table and in its notification channel name.
pub async fn backend_pid(conn: &mut PgConnection) -> Result<i32> {
    let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
        .fetch_one(conn)
        .await?;
    Ok(pid)
}

/// Removes registration rows left behind by lockers whose sessions are
/// gone: any row claiming this session's pid, and any row whose pid no
/// longer appears in the server's backend list. Run on every startup
/// before registering.
pub async fn clean_stale_lockers(conn: &mut PgConnection) -> Result<u64> {
    let result = sqlx::query(indoc! {r#"
        DELETE FROM lockers
        WHERE pid = pg_backend_pid()
        OR pid NOT IN (SELECT pid FROM pg_stat_activity)
    "#})
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Registers this locker under the session pid of `conn`.
pub async fn register_locker(
    conn: &mut PgConnection,
    process_id: i32,
    hostname: &str,
    worker_count: i16,
    listening: bool,
) -> Result<()> {
    sqlx::query(indoc! {r#"
        INSERT INTO lockers (pid, process_id, hostname, worker_count, listening)
        VALUES (pg_backend_pid(), $1, $2, $3, $4)
    "#})
    .bind(process_id)
    .bind(hostname)
    .bind(worker_count)
    .bind(listening)
    .execute(conn)
    .await?;
    Ok(())
}

/// Deletes this locker's registration row. Returns the affected row count
/// so the caller can notice an already-missing row.
pub async fn deregister_locker(conn: &mut PgConnection) -> Result<u64> {
    let result = sqlx::query("DELETE FROM lockers WHERE pid = pg_backend_pid()")
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}
