//! Live change feed over LISTEN/NOTIFY.
//!
//! Notifications are only wake-ups: on each one the stream fetches every
//! event after its cursor, so coalesced or duplicate notifications are
//! harmless. A dropped listener connection ends the stream instead of
//! silently reconnecting, because notifications sent in between are lost
//! and the consumer has to replay from its cursor.

use std::collections::VecDeque;

use futures::StreamExt;
use futures::stream;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{debug, warn};

use super::jobs::{events_after, head};
use super::{EVENTS_CHANNEL, PgJobStore};
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::model::Sequence;
use crate::store::ChangeFeed;

struct Live {
    listener: PgListener,
    pool: PgPool,
    cursor: Sequence,
    buffered: VecDeque<ChangeEvent>,
}

impl PgJobStore {
    pub(super) async fn open_feed(&self, since: Option<Sequence>) -> Result<ChangeFeed> {
        // LISTEN before reading the head so no commit falls between them
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(EVENTS_CHANNEL).await?;

        let head = head(self.pool()).await?;
        let backlog = match since {
            Some(cursor) if cursor < head => events_after(self.pool(), cursor, Some(head)).await?,
            _ => Vec::new(),
        };

        let live = Live {
            listener,
            pool: self.pool().clone(),
            cursor: head,
            buffered: VecDeque::new(),
        };
        let live = stream::unfold(live, |mut live| async move {
            loop {
                if let Some(event) = live.buffered.pop_front() {
                    return Some((event, live));
                }
                match live.listener.try_recv().await {
                    Ok(Some(notification)) => {
                        debug!(seq = notification.payload(), "job event notified");
                        match events_after(&live.pool, live.cursor, None).await {
                            Ok(events) => {
                                if let Some(last) = events.last() {
                                    live.cursor = last.sequence;
                                }
                                live.buffered.extend(events);
                            }
                            Err(e) => {
                                warn!("event fetch failed, closing feed: {e}");
                                return None;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("listener connection lost, closing feed");
                        return None;
                    }
                    Err(e) => {
                        warn!("PgListener error: {e}, closing feed");
                        return None;
                    }
                }
            }
        })
        .boxed();

        Ok(ChangeFeed {
            head,
            backlog,
            live,
        })
    }
}
