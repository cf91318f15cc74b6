use crate::errors::EnqueueError;
use crate::retry::FailedJobUpdate;
use crate::schema::{Job, NewJob};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use std::time::Duration;

const JOB_COLUMNS: &str = "id, payload, queue_name, priority, run_at, attempts, \
     locked_at, locked_by, last_error, failed_at, created_at";

/// Create the `background_jobs` table and its indexes.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Inserts a new job after validating it.
///
/// The returned record has no attempts, no lock and a `run_at`.
pub async fn insert_job(pool: &PgPool, job: &NewJob) -> Result<Job, EnqueueError> {
    job.validate()?;

    let job = sqlx::query_as::<_, Job>(&format!(
        "INSERT INTO background_jobs (payload, queue_name, priority, run_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(&job.payload)
    .bind(&job.queue_name)
    .bind(job.priority)
    .bind(job.run_at)
    .fetch_one(pool)
    .await?;

    Ok(job)
}

/// Parameters for a single claim.
#[derive(Debug, Clone)]
pub struct Claim<'a> {
    /// Claim time; also written to `locked_at`.
    pub now: DateTime<Utc>,
    /// Written to `locked_by`.
    pub worker_name: &'a str,
    /// Restrict to these queues; `None` claims from every queue.
    pub queues: Option<&'a [String]>,
    /// Locks older than this are treated as abandoned; `None` never
    /// reclaims a lock.
    pub stale_after: Option<Duration>,
}

impl Claim<'_> {
    fn stale_before(&self) -> Option<DateTime<Utc>> {
        let stale_after = TimeDelta::from_std(self.stale_after?).ok()?;
        self.now.checked_sub_signed(stale_after)
    }
}

/// Atomically picks the next eligible job and locks it.
///
/// A job is eligible when it is due, not failed permanently, and either
/// unlocked or locked at or before the stale cutoff. The most urgent priority
/// wins, then the earliest `run_at`. The row is chosen with
/// `FOR UPDATE SKIP LOCKED`, so concurrent claimers never receive the same
/// job. Returns `None` when nothing is eligible.
pub async fn claim_next_job(pool: &PgPool, claim: &Claim<'_>) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE background_jobs
        SET locked_at = $1, locked_by = $2
        WHERE id = (
            SELECT id
            FROM background_jobs
            WHERE (locked_at IS NULL OR locked_at <= $3)
              AND run_at IS NOT NULL
              AND run_at <= $1
              AND ($4::text[] IS NULL OR queue_name = ANY($4))
            ORDER BY priority ASC, run_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(claim.now)
    .bind(claim.worker_name)
    .bind(claim.stale_before())
    .bind(claim.queues)
    .fetch_optional(pool)
    .await
}

/// The lock a worker obtained when it claimed a job.
///
/// Outcome writes only apply while the row still carries this lock. Once the
/// lock went stale and another worker reclaimed the job, the row belongs to
/// that worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeldLock<'a> {
    pub(crate) job_id: i64,
    pub(crate) locked_at: DateTime<Utc>,
    pub(crate) locked_by: &'a str,
}

impl<'a> HeldLock<'a> {
    /// The lock recorded on a freshly claimed job.
    pub(crate) fn of(job: &'a Job) -> Option<Self> {
        Some(Self {
            job_id: job.id,
            locked_at: job.locked_at?,
            locked_by: job.locked_by.as_deref()?,
        })
    }
}

/// Whether an outcome write found the job still locked by its claimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStatus {
    Held,
    Lost,
}

impl LockStatus {
    fn from_rows_affected(rows: u64) -> Self {
        match rows {
            0 => Self::Lost,
            _ => Self::Held,
        }
    }
}

/// Deletes a job that has successfully completed running
pub(crate) async fn delete_successful_job(
    pool: &PgPool,
    lock: &HeldLock<'_>,
) -> Result<LockStatus, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM background_jobs WHERE id = $1 AND locked_at = $2 AND locked_by = $3",
    )
    .bind(lock.job_id)
    .bind(lock.locked_at)
    .bind(lock.locked_by)
    .execute(pool)
    .await?;

    Ok(LockStatus::from_rows_affected(result.rows_affected()))
}

/// Records a failed attempt and releases the lock in a single write.
///
/// The attempt counter is incremented in place; `update.attempts` is the
/// value the retry decision was based on and must match the stored one.
pub(crate) async fn update_failed_job(
    pool: &PgPool,
    lock: &HeldLock<'_>,
    update: &FailedJobUpdate,
) -> Result<LockStatus, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET attempts = attempts + 1,
            run_at = $4,
            failed_at = $5,
            last_error = $6,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
          AND locked_at = $2
          AND locked_by = $3
          AND attempts + 1 = $7
        ",
    )
    .bind(lock.job_id)
    .bind(lock.locked_at)
    .bind(lock.locked_by)
    .bind(update.run_at)
    .bind(update.failed_at)
    .bind(&update.last_error)
    .bind(update.attempts)
    .execute(pool)
    .await?;

    Ok(LockStatus::from_rows_affected(result.rows_affected()))
}

/// Fetch a single job by id.
pub async fn find_job(pool: &PgPool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// The number of jobs that have failed permanently
pub async fn failed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs WHERE failed_at IS NOT NULL")
        .fetch_one(pool)
        .await
}

/// Jobs that have failed permanently, most recent first
pub async fn get_failed_jobs(pool: &PgPool, limit: Option<i64>) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs \
         WHERE failed_at IS NOT NULL \
         ORDER BY failed_at DESC \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}
