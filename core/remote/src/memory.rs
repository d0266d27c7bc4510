//! In-memory remote authority for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use ledgerkeep_common::{AccountId, Actor, ChangeKind, EntityType, Error, RecordId, Result};

use crate::authority::{
    ChangeBatch, RemoteAck, RemoteAuthority, RemoteChange, RemoteRow, RemoteSubscription,
    RemoteWrite,
};

type RowKey = (String, EntityType, String);

struct StoredRow {
    row: RemoteRow,
    seq: u64,
}

struct Subscriber {
    account: String,
    entity_type: EntityType,
    sender: mpsc::UnboundedSender<RemoteChange>,
}

#[derive(Default)]
struct State {
    rows: HashMap<RowKey, StoredRow>,
    feed: Vec<RemoteChange>,
    subscribers: Vec<Subscriber>,
    offline: bool,
    fail_next: u32,
    latency: Option<Duration>,
    next_subscription: u64,
    writes_accepted: u64,
}

impl State {
    fn check(&mut self) -> Result<()> {
        if self.offline {
            return Err(Error::Transport("remote authority unreachable".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::Transport("remote authority returned 503".to_string()));
        }
        Ok(())
    }

    fn publish(&mut self, change: RemoteChange) {
        self.subscribers.retain(|s| !s.sender.is_closed());
        for sub in &self.subscribers {
            if sub.account == change.row.account_id && sub.entity_type == change.row.entity_type {
                let _ = sub.sender.send(change.clone());
            }
        }
        self.feed.push(change);
    }
}

/// In-memory remote authority.
///
/// Keeps rows, a global change feed and live subscribers for any number of
/// accounts. Clones share the same state, so several devices can talk to
/// one instance. Connectivity and failures can be simulated.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Transport("remote state lock poisoned".to_string()))
    }

    /// Simulate losing or regaining the network.
    ///
    /// Going offline drops every live subscription.
    pub fn set_online(&self, online: bool) {
        if let Ok(mut state) = self.lock() {
            state.offline = !online;
            if !online {
                state.subscribers.clear();
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().map(|s| !s.offline).unwrap_or(false)
    }

    /// Fail the next `n` calls with a transport error.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut state) = self.lock() {
            state.fail_next = n;
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut state) = self.lock() {
            state.latency = latency;
        }
    }

    /// Number of open subscriptions for one (account, entity type) pair.
    pub fn active_subscriptions(&self, account: &AccountId, entity_type: EntityType) -> usize {
        self.lock()
            .map(|state| {
                state
                    .subscribers
                    .iter()
                    .filter(|s| {
                        !s.sender.is_closed()
                            && s.account == account.as_str()
                            && s.entity_type == entity_type
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Writes that produced a new revision.
    pub fn writes_accepted(&self) -> u64 {
        self.lock().map(|s| s.writes_accepted).unwrap_or(0)
    }

    /// Current row, tombstones included.
    pub fn row(&self, account: &AccountId, entity_type: EntityType, id: &RecordId) -> Option<RemoteRow> {
        let state = self.lock().ok()?;
        state
            .rows
            .get(&(account.as_str().to_string(), entity_type, id.as_str().to_string()))
            .map(|stored| stored.row.clone())
    }

    /// All live (non-tombstoned) rows of one type.
    pub fn rows(&self, account: &AccountId, entity_type: EntityType) -> Vec<RemoteRow> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut rows: Vec<RemoteRow> = state
            .rows
            .iter()
            .filter(|((acct, ty, _), stored)| {
                acct == account.as_str() && *ty == entity_type && !stored.row.deleted
            })
            .map(|(_, stored)| stored.row.clone())
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Publish a row exactly as given, bypassing validation.
    ///
    /// Stands in for writes by other clients, including ones whose payload
    /// does not match the entity schema.
    pub fn inject(
        &self,
        account: &AccountId,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
        actor: Option<Actor>,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let now = ledgerkeep_common::now();
        let key = (account.as_str().to_string(), entity_type, id.to_string());
        let previous = state.rows.get(&key).map(|s| s.row.clone());
        let seq = state.feed.len() as u64 + 1;

        let row = RemoteRow {
            id: id.to_string(),
            account_id: account.as_str().to_string(),
            entity_type,
            payload,
            created_at: previous.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
            revision: previous.as_ref().map_or(1, |r| r.revision + 1),
            deleted: false,
            actor,
        };
        let kind = if previous.is_some() { ChangeKind::Update } else { ChangeKind::Insert };

        state.rows.insert(key, StoredRow { row: row.clone(), seq });
        state.publish(RemoteChange { seq, kind, row });
        Ok(seq)
    }

    async fn delay(&self) {
        let latency = self.lock().ok().and_then(|s| s.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn write(
        &self,
        account: &AccountId,
        write: RemoteWrite,
        deleted: bool,
    ) -> Result<RemoteAck> {
        self.delay().await;

        let mut state = self.lock()?;
        state.check()?;

        let key = (
            account.as_str().to_string(),
            write.entity_type,
            write.id.as_str().to_string(),
        );

        // Re-sent write of content already accepted.
        if let Some(stored) = state.rows.get(&key) {
            if stored.row.payload == write.payload && stored.row.deleted == deleted {
                debug!("Idempotent write to {} {}", write.entity_type, write.id);
                return Ok(RemoteAck {
                    id: stored.row.id.clone(),
                    revision: stored.row.revision,
                    updated_at: stored.row.updated_at,
                    seq: stored.seq,
                });
            }
        }

        let now = ledgerkeep_common::now();
        let previous = state.rows.get(&key).map(|s| s.row.clone());
        let seq = state.feed.len() as u64 + 1;
        let kind = match (&previous, deleted) {
            (_, true) => ChangeKind::Delete,
            (None, false) => ChangeKind::Insert,
            (Some(_), false) => ChangeKind::Update,
        };

        let row = RemoteRow {
            id: write.id.as_str().to_string(),
            account_id: account.as_str().to_string(),
            entity_type: write.entity_type,
            payload: write.payload,
            created_at: previous.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
            revision: previous.as_ref().map_or(1, |r| r.revision + 1),
            deleted,
            actor: Some(write.actor),
        };

        let ack = RemoteAck {
            id: row.id.clone(),
            revision: row.revision,
            updated_at: row.updated_at,
            seq,
        };

        state.rows.insert(key, StoredRow { row: row.clone(), seq });
        state.writes_accepted += 1;
        state.publish(RemoteChange { seq, kind, row });
        Ok(ack)
    }
}

#[async_trait]
impl RemoteAuthority for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, account: &AccountId, write: RemoteWrite) -> Result<RemoteAck> {
        self.write(account, write, false).await
    }

    async fn update(&self, account: &AccountId, write: RemoteWrite) -> Result<RemoteAck> {
        self.write(account, write, false).await
    }

    async fn delete(&self, account: &AccountId, write: RemoteWrite) -> Result<RemoteAck> {
        self.write(account, write, true).await
    }

    async fn changes_since(
        &self,
        account: &AccountId,
        entity_type: EntityType,
        cursor: u64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        self.delay().await;

        let mut state = self.lock()?;
        state.check()?;

        let mut matching = state.feed.iter().filter(|c| {
            c.seq > cursor && c.row.account_id == account.as_str() && c.row.entity_type == entity_type
        });
        let changes: Vec<RemoteChange> = matching.by_ref().take(limit.max(1)).cloned().collect();
        let has_more = matching.next().is_some();
        let next_cursor = changes.last().map_or(cursor, |c| c.seq);

        Ok(ChangeBatch {
            changes,
            next_cursor,
            has_more,
        })
    }

    async fn subscribe(
        &self,
        account: &AccountId,
        entity_type: EntityType,
    ) -> Result<RemoteSubscription> {
        self.delay().await;

        let mut state = self.lock()?;
        state.check()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscribers.push(Subscriber {
            account: account.as_str().to_string(),
            entity_type,
            sender,
        });
        debug!("Subscription {} opened for {} {}", id, account, entity_type);

        Ok(RemoteSubscription::new(id, receiver))
    }
}
