#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use claims::{assert_none, assert_ok, assert_some};
use futures_util::future::join_all;
use insta::assert_compact_json_snapshot;
use pgjobs::schema::NewJob;
use pgjobs::{
    BackgroundJob, Claim, EnqueueError, EnqueueOptions, ValidationError, claim_next_job, find_job,
    insert_job,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        pgjobs::setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// A claim at `now` from every queue that never reclaims locks
    pub(super) fn claim_at(now: DateTime<Utc>) -> Claim<'static> {
        Claim {
            now,
            worker_name: "test-worker",
            queues: None,
            stale_after: None,
        }
    }

    /// Insert a raw job with the given priority and run time
    pub(super) async fn insert(
        pool: &PgPool,
        priority: i16,
        run_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let job = NewJob {
            priority,
            run_at,
            ..NewJob::new(json!({ "job_type": "test", "arguments": { "priority": priority } }))
        };
        Ok(insert_job(pool, &job).await?.id)
    }
}

#[derive(Serialize, Deserialize)]
struct TestJob {
    value: String,
}

impl BackgroundJob for TestJob {
    const JOB_TYPE: &'static str = "test";
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn enqueued_jobs_are_unlocked_and_due() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let before = Utc::now().trunc_subsecs(6);
    let job = TestJob {
        value: "foo".into(),
    }
    .enqueue(&pool)
    .await?;

    assert_eq!(job.attempts, 0);
    assert_none!(job.locked_at);
    assert_none!(job.locked_by.as_ref());
    assert_none!(job.last_error.as_ref());
    assert_none!(job.failed_at);
    assert_none!(job.queue_name.as_ref());
    assert_eq!(job.priority, 0);
    assert!(assert_some!(job.run_at) >= before);
    assert_eq!(job.job_type(), Some("test"));
    assert_compact_json_snapshot!(job.payload, @r#"{"arguments": {"value": "foo"}, "job_type": "test"}"#);

    Ok(())
}

#[tokio::test]
async fn enqueue_options_are_stored() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let run_at = (Utc::now() + TimeDelta::hours(1)).trunc_subsecs(6);
    let job = TestJob {
        value: "foo".into(),
    }
    .enqueue_with(
        &pool,
        EnqueueOptions::default()
            .priority(-32_768)
            .queue("reports")
            .run_at(run_at),
    )
    .await?;

    let stored = assert_some!(find_job(&pool, job.id).await?);
    assert_eq!(stored.priority, -32_768);
    assert_eq!(stored.queue_name.as_deref(), Some("reports"));
    assert_eq!(stored.run_at, Some(run_at));

    Ok(())
}

#[tokio::test]
async fn empty_payloads_are_rejected() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let error = insert_job(&pool, &NewJob::new(json!({}))).await.unwrap_err();
    assert!(matches!(
        error,
        EnqueueError::InvalidJob(ValidationError::EmptyPayload)
    ));

    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 0);

    Ok(())
}

#[tokio::test]
async fn out_of_range_attempts_are_rejected_by_the_database() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = test_utils::insert(&pool, 0, Utc::now()).await?;

    let result = sqlx::query("UPDATE background_jobs SET attempts = -1 WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await;
    assert!(result.is_err());

    let result = sqlx::query("UPDATE background_jobs SET attempts = 32768 WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await;
    assert!(result.is_err());

    let result = sqlx::query("UPDATE background_jobs SET priority = -32769 WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await;
    assert!(result.is_err());

    Ok(())
}

#[tokio::test]
async fn claims_follow_priority_order() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let now = Utc::now();
    for priority in [5, 1, 3] {
        test_utils::insert(&pool, priority, now - TimeDelta::seconds(1)).await?;
    }

    let mut claimed = Vec::new();
    while let Some(job) = claim_next_job(&pool, &test_utils::claim_at(now)).await? {
        claimed.push(job.priority);
    }
    assert_eq!(claimed, vec![1, 3, 5]);

    Ok(())
}

#[tokio::test]
async fn equal_priorities_claim_the_earliest_run_at_first() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let t = Utc::now() - TimeDelta::minutes(1);
    let later = test_utils::insert(&pool, 0, t + TimeDelta::seconds(1)).await?;
    let earlier = test_utils::insert(&pool, 0, t).await?;

    let now = Utc::now();
    let first = assert_some!(claim_next_job(&pool, &test_utils::claim_at(now)).await?);
    let second = assert_some!(claim_next_job(&pool, &test_utils::claim_at(now)).await?);
    assert_eq!(first.id, earlier);
    assert_eq!(second.id, later);

    Ok(())
}

#[tokio::test]
async fn claiming_locks_the_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let now = Utc::now().trunc_subsecs(6);
    let id = test_utils::insert(&pool, 0, now).await?;

    let job = assert_some!(claim_next_job(&pool, &test_utils::claim_at(now)).await?);
    assert_eq!(job.id, id);
    assert_eq!(job.locked_at, Some(now));
    assert_eq!(job.locked_by.as_deref(), Some("test-worker"));

    // Locked jobs are not handed out again
    assert_none!(claim_next_job(&pool, &test_utils::claim_at(now)).await?);

    Ok(())
}

#[tokio::test]
async fn jobs_that_are_not_due_are_not_claimed() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let now = Utc::now();
    test_utils::insert(&pool, 0, now + TimeDelta::minutes(5)).await?;
    assert_none!(claim_next_job(&pool, &test_utils::claim_at(now)).await?);

    let later = now + TimeDelta::minutes(5);
    assert_some!(claim_next_job(&pool, &test_utils::claim_at(later)).await?);

    Ok(())
}

#[tokio::test]
async fn jobs_without_run_at_are_never_claimed() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = test_utils::insert(&pool, 0, Utc::now()).await?;
    sqlx::query("UPDATE background_jobs SET run_at = NULL WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await?;

    let far_future = Utc::now() + TimeDelta::days(365);
    let claim = Claim {
        stale_after: Some(Duration::from_secs(1)),
        ..test_utils::claim_at(far_future)
    };
    assert_none!(claim_next_job(&pool, &claim).await?);

    Ok(())
}

#[tokio::test]
async fn concurrent_claims_lock_a_job_exactly_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    test_utils::insert(&pool, 0, Utc::now() - TimeDelta::seconds(1)).await?;

    let claimers = (0..16).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let worker_name = format!("worker-{i}");
            let claim = Claim {
                now: Utc::now(),
                worker_name: &worker_name,
                queues: None,
                stale_after: Some(Duration::from_secs(3600)),
            };
            claim_next_job(&pool, &claim).await
        })
    });

    let mut claimed = Vec::new();
    for result in join_all(claimers).await {
        if let Some(job) = assert_ok!(result?) {
            claimed.push(job);
        }
    }

    assert_eq!(claimed.len(), 1);
    let stored = assert_some!(find_job(&pool, claimed[0].id).await?);
    assert_eq!(stored.locked_by, claimed[0].locked_by);

    Ok(())
}

#[tokio::test]
async fn stale_locks_are_reclaimed() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let locked_at = Utc::now().trunc_subsecs(6);
    let id = test_utils::insert(&pool, 0, locked_at).await?;
    let timeout = Duration::from_secs(3600);

    let crashed = Claim {
        worker_name: "crashed-worker",
        stale_after: Some(timeout),
        ..test_utils::claim_at(locked_at)
    };
    assert_some!(claim_next_job(&pool, &crashed).await?);

    let almost = Claim {
        worker_name: "rescuer",
        stale_after: Some(timeout),
        ..test_utils::claim_at(locked_at + TimeDelta::minutes(59))
    };
    assert_none!(claim_next_job(&pool, &almost).await?);

    let expired_at = locked_at + TimeDelta::hours(1);
    let expired = Claim {
        now: expired_at,
        ..almost
    };
    let job = assert_some!(claim_next_job(&pool, &expired).await?);
    assert_eq!(job.id, id);
    assert_eq!(job.locked_by.as_deref(), Some("rescuer"));
    assert_eq!(job.locked_at, Some(expired_at));

    Ok(())
}

#[tokio::test]
async fn locks_are_kept_without_a_run_timeout() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let now = Utc::now();
    test_utils::insert(&pool, 0, now).await?;
    assert_some!(claim_next_job(&pool, &test_utils::claim_at(now)).await?);

    let much_later = now + TimeDelta::days(30);
    assert_none!(claim_next_job(&pool, &test_utils::claim_at(much_later)).await?);

    Ok(())
}

#[tokio::test]
async fn claims_can_be_restricted_to_queues() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    for queue in ["mailers", "reports"] {
        TestJob {
            value: queue.into(),
        }
        .enqueue_with(&pool, EnqueueOptions::default().queue(queue))
        .await?;
    }
    TestJob {
        value: "default".into(),
    }
    .enqueue(&pool)
    .await?;

    let now = Utc::now();
    let queues = vec!["reports".to_string()];
    let only_reports = Claim {
        queues: Some(&queues),
        ..test_utils::claim_at(now)
    };
    let job = assert_some!(claim_next_job(&pool, &only_reports).await?);
    assert_eq!(job.queue_name.as_deref(), Some("reports"));
    assert_none!(claim_next_job(&pool, &only_reports).await?);

    let mut remaining = Vec::new();
    while let Some(job) = claim_next_job(&pool, &test_utils::claim_at(now)).await? {
        remaining.push(job.queue_name);
    }
    remaining.sort();
    assert_eq!(remaining, vec![None, Some("mailers".to_string())]);

    Ok(())
}
