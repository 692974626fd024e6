//! Integration tests for the client reconciler: the pure view merge and the
//! session actor over a live dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;
use sakhi_rs::dispatcher::{Dispatcher, DispatcherConfig};
use sakhi_rs::error::Error;
use sakhi_rs::event::ChangeEvent;
use sakhi_rs::machine::{JobMachine, MachineConfig};
use sakhi_rs::model::*;
use sakhi_rs::reconciler::{EntryStatus, LinkStatus, Session, SessionConfig, View, ViewEntry};
use sakhi_rs::retry::RetryPolicy;
use sakhi_rs::store::InMemoryJobStore;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_retry() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5))
}

// ---------------------------------------------------------------------------
// View merge properties
// ---------------------------------------------------------------------------

/// The feed history of one job: queued, claimed, reclaimed, ... and finally
/// answered.
fn history(id: JobId, session: SessionId, n: usize) -> Vec<ChangeEvent> {
    let created = Utc::now();
    (0..n)
        .map(|i| {
            let state = if n > 1 && i == n - 1 {
                JobState::Done
            } else if i % 2 == 0 {
                JobState::Pending
            } else {
                JobState::Processing
            };
            let job = Job {
                id,
                session_id: session,
                input: "I am facing workplace harassment".into(),
                state,
                result: (state == JobState::Done).then(|| "You can approach the ICC".to_string()),
                error: None,
                attempts: i.div_ceil(2) as u32,
                created_at: created,
                updated_at: created + TimeDelta::milliseconds(i as i64),
            };
            ChangeEvent::from_job(Sequence(i as u64 + 1), &job)
        })
        .collect()
}

/// Delivery order with duplicates, each item marked as feed event or
/// re-fetched snapshot.
fn deliveries() -> impl Strategy<Value = (usize, Vec<(usize, bool)>)> {
    (1usize..8).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec((0..n, any::<bool>()), 1..4 * n),
        )
    })
}

fn apply(view: &mut View, event: &ChangeEvent, as_snapshot: bool) {
    if as_snapshot {
        view.apply_snapshot(&event.to_job());
    } else {
        view.apply_event(event);
    }
}

fn observable(entry: &ViewEntry) -> (EntryStatus, Option<String>, Option<String>) {
    (entry.status, entry.result.clone(), entry.error.clone())
}

proptest! {
    #[test]
    fn duplicated_or_reordered_delivery_converges(
        (n, order) in deliveries(),
        optimistic in any::<bool>(),
    ) {
        let id = JobId::new();
        let events = history(id, SessionId::new(), n);
        let now = Utc::now();

        let mut scrambled = View::new(Duration::from_secs(30));
        let mut in_order = View::new(Duration::from_secs(30));
        if optimistic {
            scrambled.insert_optimistic(id, "I am facing workplace harassment", now);
            in_order.insert_optimistic(id, "I am facing workplace harassment", now);
        }

        for &(i, as_snapshot) in &order {
            apply(&mut scrambled, &events[i], as_snapshot);
        }
        let newest = order.iter().map(|&(i, _)| i).max().unwrap();
        for event in &events[..=newest] {
            in_order.apply_event(event);
        }

        let got = scrambled.get(id).unwrap();
        let want = in_order.get(id).unwrap();
        prop_assert_eq!(observable(got), observable(want));
        prop_assert_eq!(got.updated_at, Some(events[newest].updated_at));
        prop_assert_eq!(scrambled.len(), 1);
    }

    #[test]
    fn listing_never_rolls_back_a_newer_event(n in 2usize..8, stale_at in 0usize..8) {
        let id = JobId::new();
        let events = history(id, SessionId::new(), n);
        let stale_at = stale_at % n;

        let mut view = View::new(Duration::from_secs(30));
        view.apply_event(&events[n - 1]);
        view.reconcile_full(&[events[stale_at].to_job()], Utc::now());

        prop_assert_eq!(view.get(id).unwrap().status, EntryStatus::Confirmed(JobState::Done));
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<InMemoryJobStore>,
    machine: JobMachine,
    dispatcher: Dispatcher,
}

async fn harness() -> Harness {
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
    Harness {
        store,
        machine,
        dispatcher,
    }
}

async fn open(h: &Harness, session: SessionId) -> Session {
    Session::open(
        session,
        h.machine.clone(),
        h.dispatcher.clone(),
        SessionConfig {
            retry: fast_retry(),
            ..SessionConfig::default()
        },
    )
    .await
    .unwrap()
}

async fn eventually(session: &Session, id: JobId, status: EntryStatus) -> ViewEntry {
    timeout(WAIT, async {
        loop {
            if let Some(entry) = session.entry(id).await.unwrap() {
                if entry.status == status {
                    return entry;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("entry {id} never reached {status}"))
}

#[tokio::test]
async fn local_submission_is_visible_immediately_and_confirmed_later() {
    let h = harness().await;
    let session = open(&h, SessionId::new()).await;

    let id = session.submit_local("I am facing workplace harassment").unwrap();
    let entry = session.entry(id).await.unwrap().unwrap();
    assert!(matches!(
        entry.status,
        EntryStatus::Optimistic | EntryStatus::Confirmed(JobState::Pending)
    ));
    assert_eq!(entry.input, "I am facing workplace harassment");

    let confirmed = eventually(&session, id, EntryStatus::Confirmed(JobState::Pending)).await;
    assert!(confirmed.submitted_at.is_some());
    assert_eq!(session.view().await.unwrap().len(), 1);

    let claimed = h.machine.claim(id).await.unwrap();
    h.machine
        .complete(id, claimed.attempts, "You can file with the ICC.")
        .await
        .unwrap();

    let done = timeout(WAIT, session.wait_for(id)).await.unwrap().unwrap();
    assert_eq!(done.status, EntryStatus::Confirmed(JobState::Done));
    assert_eq!(done.result.as_deref(), Some("You can file with the ICC."));

    session.close();
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn blank_input_is_rejected_locally() {
    let h = harness().await;
    let session = open(&h, SessionId::new()).await;

    assert!(matches!(session.submit_local("   "), Err(Error::Validation(_))));
    assert!(session.view().await.unwrap().is_empty());

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn failed_submission_leaves_a_stale_entry() {
    let h = harness().await;
    let session = open(&h, SessionId::new()).await;

    h.store.set_available(false).await;
    let id = session.submit_local("is my landlord allowed to do this").unwrap();

    let err = timeout(WAIT, async {
        loop {
            match session.wait_for(id).await {
                Err(Error::StaleOptimisticEntry(stale)) => return stale,
                Err(e) => panic!("unexpected error: {e}"),
                Ok(entry) => panic!("entry unexpectedly finished: {entry:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(err, id);
    assert_eq!(session.entry(id).await.unwrap().unwrap().status.label(), "stale");

    h.store.set_available(true).await;
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn existing_jobs_are_loaded_on_open() {
    let h = harness().await;
    let session_id = SessionId::new();
    let earlier = h
        .machine
        .submit(NewJob::new(session_id, "asked yesterday"))
        .await
        .unwrap();
    h.machine
        .submit(NewJob::new(SessionId::new(), "someone else's"))
        .await
        .unwrap();

    let session = open(&h, session_id).await;
    let view = session.view().await.unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, earlier.id);
    assert_eq!(view[0].status, EntryStatus::Confirmed(JobState::Pending));

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn jobs_from_another_device_arrive_live() {
    let h = harness().await;
    let session_id = SessionId::new();
    let session = open(&h, session_id).await;

    let job = h
        .machine
        .submit(NewJob::new(session_id, "typed on the phone"))
        .await
        .unwrap();

    let entry = eventually(&session, job.id, EntryStatus::Confirmed(JobState::Pending)).await;
    assert!(entry.submitted_at.is_none());
    assert!(entry.sequence.is_some());

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn link_status_follows_feed_reconnects() {
    let h = harness().await;
    let session = open(&h, SessionId::new()).await;
    let mut status = session.watch_status();
    assert_eq!(session.status(), LinkStatus::Live);

    h.store.set_available(false).await;
    h.store.drop_feeds().await;
    timeout(WAIT, status.wait_for(|s| *s == LinkStatus::Reconnecting))
        .await
        .unwrap()
        .unwrap();

    h.store.set_available(true).await;
    timeout(WAIT, status.wait_for(|s| *s == LinkStatus::Live))
        .await
        .unwrap()
        .unwrap();

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn closed_session_rejects_reads() {
    let h = harness().await;
    let session = open(&h, SessionId::new()).await;
    session.close();

    let result = timeout(WAIT, async {
        loop {
            if session.view().await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok());

    h.dispatcher.shutdown().await;
}
