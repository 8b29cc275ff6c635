use indoc::indoc;
use sqlx::PgConnection;

use crate::errors::Result;
use crate::job::JobDescriptor;

/// Walks the `(priority, run_at, job_id)` index in order, attempting a
/// non-blocking advisory lock on every visited row, until `limit` locks
/// have been acquired or the supply of due jobs runs out.
///
/// Each recursive step advances strictly past the previous row via the
/// full-tuple comparison, so locked or excluded rows are skipped without
/// stalling the walk; they come back into view on the next batch. The
/// outer LIMIT cuts the recursion off after enough acquisitions.
const POLL_JOBS_SQL: &str = indoc! {r#"
    WITH RECURSIVE candidates AS (
        SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
        FROM (
            SELECT j
            FROM jobs AS j
            WHERE j.job_id <> ALL($1::bigint[])
            AND j.run_at <= now()
            ORDER BY priority, run_at, job_id
            LIMIT 1
        ) AS t1
        UNION ALL (
            SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
            FROM (
                SELECT (
                    SELECT j
                    FROM jobs AS j
                    WHERE j.job_id <> ALL($1::bigint[])
                    AND j.run_at <= now()
                    AND (j.priority, j.run_at, j.job_id) >
                        (candidates.priority, candidates.run_at, candidates.job_id)
                    ORDER BY priority, run_at, job_id
                    LIMIT 1
                ) AS j
                FROM candidates
                WHERE candidates.job_id IS NOT NULL
                LIMIT 1
            ) AS t1
        )
    )
    SELECT priority, run_at, job_id
    FROM candidates
    WHERE locked
    LIMIT $2
"#};

/// Selects and advisory-locks up to `limit` of the most urgent due jobs,
/// skipping ids in `excluded_ids` (those this process already holds).
///
/// The locks land on the session of `conn`, so callers must run this on
/// the connection that will later release them.
pub async fn poll_jobs(
    conn: &mut PgConnection,
    excluded_ids: &[i64],
    limit: i64,
) -> Result<Vec<JobDescriptor>> {
    let descriptors = sqlx::query_as(POLL_JOBS_SQL)
        .bind(excluded_ids)
        .bind(limit)
        .fetch_all(conn)
        .await?;
    Ok(descriptors)
}
