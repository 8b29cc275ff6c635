use sqlx::PgConnection;

use crate::errors::Result;

/// Attempts a non-blocking session-level advisory lock on `job_id`.
///
/// The lock is bound to the session of `conn`; only that session can
/// release it, and it vanishes with the session if the process dies.
pub async fn try_advisory_lock(conn: &mut PgConnection, job_id: i64) -> Result<bool> {
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(job_id)
        .fetch_one(conn)
        .await?;
    Ok(locked)
}

/// Releases the advisory lock on `job_id`. Returns false when the session
/// did not hold it.
pub async fn advisory_unlock(conn: &mut PgConnection, job_id: i64) -> Result<bool> {
    let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(job_id)
        .fetch_one(conn)
        .await?;
    Ok(released)
}
