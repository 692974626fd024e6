//! Job record operations: idempotent create, compare-and-swap update,
//! filtered listing, and event append.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{EVENTS_CHANNEL, PgJobStore};
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, Payload};
use crate::model::{
    Expected, Job, JobFilter, JobId, JobPatch, JobState, NewJob, Sequence, SessionId, UpdateOutcome,
};
use crate::store::{ChangeFeed, JobStore};

/// Advisory lock key serializing event appends.
const EVENT_LOCK_KEY: i64 = 0x5a4b_6a6f_6273;

const JOB_COLUMNS: &str =
    "id, session_id, input, state, result, error, attempts, created_at, updated_at";

pub(super) const EVENT_COLUMNS: &str =
    "seq, job_id, session_id, input, state, result, error, attempts, created_at, updated_at";

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let mut tx = self.pool().begin().await?;

        let inserted: Option<JobRow> = sqlx::query_as(&format!(
            "INSERT INTO jobs (id, session_id, input, state, attempts, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', 0, clock_timestamp(), clock_timestamp())
             ON CONFLICT (id) DO NOTHING
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new.id.0)
        .bind(new.session_id.0)
        .bind(&new.input)
        .fetch_optional(&mut *tx)
        .await?;

        let job = match inserted {
            Some(row) => row.try_into_job()?,
            None => {
                // Same id submitted before: hand back the existing record.
                let existing = fetch_job(&mut tx, new.id).await?;
                tx.rollback().await?;
                if existing.session_id != new.session_id || existing.input != new.input {
                    return Err(Error::Validation(format!(
                        "job id {} already used for a different submission",
                        new.id
                    )));
                }
                return Ok(existing);
            }
        };

        append_event(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        row.ok_or(Error::NotFound(id))?.try_into_job()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        if let Some(session) = filter.session_id {
            qb.push(" AND session_id = ").push_bind(session.0);
        }
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(ids) = &filter.ids {
            let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
            qb.push(" AND id = ANY(").push_bind(ids).push(")");
        }
        if let Some(before) = filter.updated_before {
            qb.push(" AND updated_at < ").push_bind(before);
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn update(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<UpdateOutcome> {
        let mut tx = self.pool().begin().await?;

        let updated: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET state = $1, result = $2, error = $3, attempts = attempts + $4,
                 updated_at = GREATEST(clock_timestamp(), updated_at + interval '1 microsecond')
             WHERE id = $5 AND state = $6 AND ($7::INTEGER IS NULL OR attempts = $7)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(patch.state.as_str())
        .bind(&patch.result)
        .bind(&patch.error)
        .bind(i32::from(patch.increment_attempts))
        .bind(id.0)
        .bind(expected.state.as_str())
        .bind(expected.attempts.map(|a| a as i32))
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => {
                let job = row.try_into_job()?;
                append_event(&mut tx, &job).await?;
                tx.commit().await?;
                Ok(UpdateOutcome::Applied(job))
            }
            None => {
                let actual = fetch_job(&mut tx, id).await?;
                tx.rollback().await?;
                Ok(UpdateOutcome::Conflict(actual))
            }
        }
    }

    async fn change_feed(&self, since: Option<Sequence>) -> Result<ChangeFeed> {
        self.open_feed(since).await
    }

    async fn replay(&self, since: Sequence) -> Result<Vec<ChangeEvent>> {
        events_after(self.pool(), since, None).await
    }
}

async fn fetch_job(tx: &mut Transaction<'_, Postgres>, id: JobId) -> Result<Job> {
    let row: Option<JobRow> =
        sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await?;
    row.ok_or(Error::NotFound(id))?.try_into_job()
}

/// Append the job's new state to the feed and notify listeners on commit.
async fn append_event(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<Sequence> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(EVENT_LOCK_KEY)
        .execute(&mut **tx)
        .await?;

    let (seq,): (i64,) = sqlx::query_as(
        "INSERT INTO job_events
          (seq, job_id, session_id, input, state, result, error, attempts, created_at, updated_at)
         SELECT COALESCE(MAX(seq), 0) + 1, $1, $2, $3, $4, $5, $6, $7, $8, $9 FROM job_events
         RETURNING seq",
    )
    .bind(job.id.0)
    .bind(job.session_id.0)
    .bind(&job.input)
    .bind(job.state.as_str())
    .bind(&job.result)
    .bind(&job.error)
    .bind(job.attempts as i32)
    .bind(job.created_at)
    .bind(job.updated_at)
    .fetch_one(&mut **tx)
    .await?;

    // NOTIFY is transactional: only fires on commit
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(EVENTS_CHANNEL)
        .bind(seq.to_string())
        .execute(&mut **tx)
        .await?;

    Ok(Sequence(seq as u64))
}

/// Events with sequence > `after`, optionally capped at `until`.
pub(super) async fn events_after(
    pool: &sqlx::PgPool,
    after: Sequence,
    until: Option<Sequence>,
) -> Result<Vec<ChangeEvent>> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM job_events
         WHERE seq > $1 AND ($2::BIGINT IS NULL OR seq <= $2)
         ORDER BY seq"
    ))
    .bind(after.0 as i64)
    .bind(until.map(|s| s.0 as i64))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(EventRow::try_into_event).collect()
}

pub(super) async fn head(pool: &sqlx::PgPool) -> Result<Sequence> {
    let (seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM job_events")
        .fetch_one(pool)
        .await?;
    Ok(Sequence(seq.unwrap_or(0) as u64))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    session_id: Uuid,
    input: String,
    state: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            session_id: SessionId(self.session_id),
            input: self.input,
            state: self.state.parse::<JobState>()?,
            result: self.result,
            error: self.error,
            attempts: self.attempts.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    job_id: Uuid,
    session_id: Uuid,
    input: String,
    state: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EventRow {
    fn try_into_event(self) -> Result<ChangeEvent> {
        let payload = match (self.result, self.error) {
            (Some(r), _) => Some(Payload::Result(r)),
            (None, Some(e)) => Some(Payload::Error(e)),
            (None, None) => None,
        };
        Ok(ChangeEvent {
            sequence: Sequence(self.seq.max(0) as u64),
            job_id: JobId(self.job_id),
            session_id: SessionId(self.session_id),
            state: self.state.parse::<JobState>()?,
            payload,
            input: self.input,
            attempts: self.attempts.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
