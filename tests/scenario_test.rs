//! End-to-end scenarios: session, dispatcher, runner and state machine over
//! the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sakhi_rs::dispatcher::{Dispatcher, DispatcherConfig};
use sakhi_rs::error::Error;
use sakhi_rs::machine::{JobMachine, MachineConfig};
use sakhi_rs::model::*;
use sakhi_rs::reconciler::{EntryStatus, Session, SessionConfig};
use sakhi_rs::retry::RetryPolicy;
use sakhi_rs::store::{InMemoryJobStore, JobStore};
use sakhi_rs::worker::{Runner, RunnerConfig, Worker};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Answers from a fixed script and counts how often it was asked.
struct ScriptedWorker {
    calls: AtomicUsize,
}

impl ScriptedWorker {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn process(&self, _id: JobId, input: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if input.contains("fail") {
            anyhow::bail!("model backend returned 500");
        }
        Ok(format!(
            "Regarding \"{input}\": you can file a complaint with the Internal Committee."
        ))
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5))
}

struct Stack {
    store: Arc<InMemoryJobStore>,
    machine: JobMachine,
    dispatcher: Dispatcher,
}

async fn stack() -> Stack {
    let store = Arc::new(InMemoryJobStore::new());
    let machine = JobMachine::new(
        store.clone(),
        MachineConfig {
            retry: fast_retry(),
            reclaim_after: Duration::from_secs(60),
        },
    );
    let dispatcher = Dispatcher::start(
        store.clone(),
        DispatcherConfig {
            retry: fast_retry(),
            ..DispatcherConfig::default()
        },
    )
    .await
    .unwrap();
    Stack {
        store,
        machine,
        dispatcher,
    }
}

fn runner(stack: &Stack, worker: Arc<ScriptedWorker>) -> Runner {
    Runner::new(
        stack.machine.clone(),
        worker,
        RunnerConfig {
            poll_interval: Duration::from_millis(50),
            max_concurrent: 2,
            reclaim_interval: Duration::from_secs(30),
        },
    )
    .with_dispatcher(stack.dispatcher.clone())
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn question_is_answered_and_confirmed_in_the_view() {
    let stack = stack().await;
    let worker = Arc::new(ScriptedWorker::new());
    let runner = runner(&stack, worker.clone());
    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };

    let session = Session::open(
        SessionId::new(),
        stack.machine.clone(),
        stack.dispatcher.clone(),
        SessionConfig::default(),
    )
    .await
    .unwrap();

    let id = session.submit_local("I am facing workplace harassment").unwrap();
    let entry = timeout(WAIT, session.wait_for(id)).await.unwrap().unwrap();

    assert_eq!(entry.status, EntryStatus::Confirmed(JobState::Done));
    assert_eq!(entry.status.label(), "confirmed-done");
    assert!(
        entry
            .result
            .as_deref()
            .is_some_and(|r| r.contains("workplace harassment"))
    );
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

    // pending, processing, done
    assert_eq!(stack.store.event_count().await, 3);
    let job = stack.machine.get(id).await.unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.is_consistent());

    runner.shutdown();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    session.close();
    stack.dispatcher.shutdown().await;
}

#[tokio::test]
async fn worker_error_marks_the_job_failed() {
    let stack = stack().await;
    let worker = Arc::new(ScriptedWorker::new());
    let runner = runner(&stack, worker);
    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };

    let session = Session::open(
        SessionId::new(),
        stack.machine.clone(),
        stack.dispatcher.clone(),
        SessionConfig::default(),
    )
    .await
    .unwrap();
    let id = session.submit_local("please fail this one").unwrap();
    let entry = timeout(WAIT, session.wait_for(id)).await.unwrap().unwrap();

    assert_eq!(entry.status, EntryStatus::Confirmed(JobState::Failed));
    assert!(entry.result.is_none());
    assert!(entry.error.is_some_and(|e| e.contains("500")));

    runner.shutdown();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    stack.dispatcher.shutdown().await;
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_runners_never_answer_the_same_job_twice() {
    let stack = stack().await;
    let worker = Arc::new(ScriptedWorker::new());
    let a = runner(&stack, worker.clone());
    let b = runner(&stack, worker.clone());
    let handles = [a.clone(), b.clone()].map(|r| tokio::spawn(async move { r.run().await }));

    let session = SessionId::new();
    let mut ids = Vec::new();
    for i in 0..6 {
        let job = stack
            .machine
            .submit(NewJob::new(session, format!("question {i}")))
            .await
            .unwrap();
        ids.push(job.id);
    }

    timeout(WAIT, async {
        loop {
            let done = stack
                .machine
                .list(&JobFilter::session(session).with_state(JobState::Done))
                .await
                .unwrap();
            if done.len() == ids.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all jobs should finish");

    assert_eq!(worker.calls.load(Ordering::SeqCst), ids.len());
    for id in ids {
        assert_eq!(stack.machine.get(id).await.unwrap().attempts, 1);
    }

    a.shutdown();
    b.shutdown();
    for handle in handles {
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    }
    stack.dispatcher.shutdown().await;
}

#[tokio::test]
async fn two_workers_claim_one_job() {
    let stack = stack().await;
    let job = stack
        .machine
        .submit(NewJob::new(SessionId::new(), "can my employer withhold salary"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(stack.machine.claim(job.id), stack.machine.claim(job.id));
    let (winner, loser) = match (a, b) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        other => panic!("expected one winner and one loser, got {other:?}"),
    };
    assert_eq!(winner.state, JobState::Processing);
    assert!(matches!(
        loser,
        Error::ClaimConflict {
            state: JobState::Processing,
            ..
        }
    ));

    stack.dispatcher.shutdown().await;
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abandoned_claim_is_reclaimed_and_answered() {
    let stack = stack().await;
    let session = SessionId::new();
    let job = stack
        .machine
        .submit(NewJob::new(session, "what is a protection order"))
        .await
        .unwrap();

    // a worker claims it and then disappears
    stack.machine.claim(job.id).await.unwrap();
    stack
        .store
        .backdate(job.id, Utc::now() - chrono::TimeDelta::seconds(600))
        .await
        .unwrap();

    let worker = Arc::new(ScriptedWorker::new());
    let runner = Runner::new(
        stack.machine.clone(),
        worker.clone(),
        RunnerConfig {
            poll_interval: Duration::from_millis(20),
            max_concurrent: 1,
            reclaim_interval: Duration::from_millis(20),
        },
    );
    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };

    let done = timeout(WAIT, async {
        loop {
            let job = stack.machine.get(job.id).await.unwrap();
            if job.state == JobState::Done {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reclaimed job should be answered");

    assert_eq!(done.attempts, 2);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

    runner.shutdown();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    stack.dispatcher.shutdown().await;
}

#[tokio::test]
async fn session_catches_up_after_missing_the_live_feed() {
    let stack = stack().await;
    let session_id = SessionId::new();
    let session = Session::open(
        session_id,
        stack.machine.clone(),
        stack.dispatcher.clone(),
        SessionConfig {
            reconcile_interval: Duration::from_millis(20),
            retry: fast_retry(),
            ..SessionConfig::default()
        },
    )
    .await
    .unwrap();

    // written straight to the store while the dispatcher is reconnecting
    stack.store.drop_feeds().await;
    let job = stack
        .store
        .create(NewJob::new(session_id, "asked from another tab"))
        .await
        .unwrap();

    let entry = timeout(WAIT, async {
        loop {
            if let Some(entry) = session.entry(job.id).await.unwrap() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job should appear through replay or reconciliation");
    assert_eq!(entry.status, EntryStatus::Confirmed(JobState::Pending));
    assert_eq!(session.view().await.unwrap().len(), 1);

    session.close();
    stack.dispatcher.shutdown().await;
}

#[tokio::test]
async fn zero_periods_are_accepted() {
    let stack = stack().await;
    let runner = Runner::new(
        stack.machine.clone(),
        Arc::new(ScriptedWorker::new()),
        RunnerConfig {
            poll_interval: Duration::ZERO,
            max_concurrent: 1,
            reclaim_interval: Duration::ZERO,
        },
    );
    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };
    let session = Session::open(
        SessionId::new(),
        stack.machine.clone(),
        stack.dispatcher.clone(),
        SessionConfig {
            reconcile_interval: Duration::ZERO,
            retry: fast_retry(),
            ..SessionConfig::default()
        },
    )
    .await
    .unwrap();

    let id = session.submit_local("does the runner still answer").unwrap();
    let job = timeout(WAIT, async {
        loop {
            if let Ok(job) = stack.machine.get(id).await {
                if job.state == JobState::Done {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job should be answered");
    assert_eq!(job.attempts, 1);

    runner.shutdown();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    session.close();
    stack.dispatcher.shutdown().await;
}
