//! Live change delivery from the remote authority.
//!
//! One listener task per entity type forwards subscription events into
//! [`RecordStore::apply_remote`], the same path the pull uses, so conflict
//! handling does not depend on how a change arrived. Listeners never touch
//! the pull cursor; a change later re-delivered by a pull is recognized by
//! its revision and ignored.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ledgerkeep_common::{AccountId, EntityType, Result};
use ledgerkeep_remote::{RemoteAuthority, RemoteChange, RemoteSubscription};
use ledgerkeep_store::{ApplyOutcome, RecordStore};

struct Listener {
    subscription_id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Cancel the task and wait until it has released its subscription.
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Listener for subscription {} ended abnormally: {}", self.subscription_id, e);
        }
    }
}

/// Live subscriptions of one account, at most one per entity type.
pub struct ChangeChannel<R: RemoteAuthority + ?Sized> {
    remote: Arc<R>,
    records: RecordStore,
    listeners: Mutex<HashMap<EntityType, Listener>>,
}

impl<R: RemoteAuthority + ?Sized + 'static> ChangeChannel<R> {
    pub fn new(remote: Arc<R>, records: RecordStore) -> Self {
        Self {
            remote,
            records,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn account(&self) -> &AccountId {
        self.records.account()
    }

    /// Replace the subscription for `entity_type`.
    ///
    /// The previous listener is torn down before the new subscription is
    /// opened, so no event is delivered twice.
    pub async fn resubscribe(&self, entity_type: EntityType) -> Result<()> {
        let mut listeners = self.listeners.lock().await;

        if let Some(old) = listeners.remove(&entity_type) {
            debug!("Tearing down {} subscription {}", entity_type, old.subscription_id);
            old.stop().await;
        }

        let subscription = self.remote.subscribe(self.account(), entity_type).await?;
        let subscription_id = subscription.id();
        let token = CancellationToken::new();
        let handle = tokio::spawn(listen(
            self.records.clone(),
            entity_type,
            subscription,
            token.clone(),
        ));

        info!(
            "Subscribed to {} changes for {} (subscription {})",
            entity_type,
            self.account(),
            subscription_id
        );
        listeners.insert(
            entity_type,
            Listener {
                subscription_id,
                token,
                handle,
            },
        );
        Ok(())
    }

    /// (Re)subscribe every entity type. Returns the number of live listeners.
    pub async fn subscribe_all(&self) -> Result<usize> {
        for entity_type in EntityType::ALL {
            self.resubscribe(entity_type).await?;
        }
        Ok(self.active_count().await)
    }

    /// Stop every listener.
    pub async fn unsubscribe_all(&self) {
        let listeners: Vec<Listener> = {
            let mut listeners = self.listeners.lock().await;
            listeners.drain().map(|(_, listener)| listener).collect()
        };
        if listeners.is_empty() {
            return;
        }
        let count = listeners.len();
        futures::future::join_all(listeners.into_iter().map(Listener::stop)).await;
        info!("Closed {} subscriptions for {}", count, self.account());
    }

    /// React to connectivity changes.
    ///
    /// Losing the network invalidates every subscription; regaining it
    /// re-establishes them.
    pub async fn on_connectivity(&self, online: bool) -> Result<usize> {
        if online {
            self.subscribe_all().await
        } else {
            self.unsubscribe_all().await;
            Ok(0)
        }
    }

    /// The app returned to the foreground; subscriptions may have gone stale.
    pub async fn on_foreground(&self) -> Result<usize> {
        self.subscribe_all().await
    }

    /// Listeners whose subscription is still delivering.
    pub async fn active_count(&self) -> usize {
        self.listeners
            .lock()
            .await
            .values()
            .filter(|l| !l.handle.is_finished())
            .count()
    }
}

async fn listen(
    records: RecordStore,
    entity_type: EntityType,
    mut subscription: RemoteSubscription,
    token: CancellationToken,
) {
    let subscription_id = subscription.id();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("{} listener cancelled", entity_type);
                break;
            }
            next = subscription.next() => match next {
                Some(change) => {
                    let records = records.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || deliver(&records, &change)).await {
                        error!("Delivery of {} change failed to complete: {}", entity_type, e);
                    }
                }
                None => {
                    info!("Remote closed {} subscription {}", entity_type, subscription_id);
                    break;
                }
            }
        }
    }
}

fn deliver(records: &RecordStore, change: &RemoteChange) {
    let incoming = match change.decode() {
        Ok(incoming) => incoming,
        Err(e) => {
            // The next pull re-reads this change and records the diagnostic.
            warn!("Ignoring live change {}: {}", change.seq, e);
            return;
        }
    };

    match records.apply_remote(&incoming) {
        Ok(ApplyOutcome::Conflicted) => warn!(
            "Live change left {} {} in conflict",
            incoming.entity_type(),
            incoming.record_id
        ),
        Ok(outcome) => debug!(
            "Live change {} for {} {}: {:?}",
            change.seq,
            incoming.entity_type(),
            incoming.record_id,
            outcome
        ),
        Err(e) => error!(
            "Failed to apply live change for {} {}: {}",
            incoming.entity_type(),
            incoming.record_id,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerkeep_common::{Actor, RecordId, SyncState};
    use ledgerkeep_remote::MemoryRemote;
    use ledgerkeep_store::{AuditFilter, AuditTrail, CursorStore, Database};
    use serde_json::json;
    use std::time::Duration;

    fn account() -> AccountId {
        AccountId::new("shop-1").unwrap()
    }

    fn setup() -> (MemoryRemote, Arc<Database>, ChangeChannel<MemoryRemote>) {
        let remote = MemoryRemote::new();
        let db = Arc::new(Database::in_memory().unwrap());
        let channel = ChangeChannel::new(
            Arc::new(remote.clone()),
            RecordStore::new(db.clone(), account()),
        );
        (remote, db, channel)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn inject_contact(remote: &MemoryRemote, id: &str, name: &str) {
        remote
            .inject(
                &account(),
                EntityType::Contact,
                id,
                json!({"name": name, "kind": "customer"}),
                Some(Actor::new("u-2", "cashier")),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_all_opens_one_per_type() {
        let (remote, _db, channel) = setup();
        assert_eq!(channel.subscribe_all().await.unwrap(), EntityType::ALL.len());
        for entity_type in EntityType::ALL {
            assert_eq!(remote.active_subscriptions(&account(), entity_type), 1);
        }
        channel.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_resubscribe_never_duplicates() {
        let (remote, _db, channel) = setup();
        channel.resubscribe(EntityType::Contact).await.unwrap();
        channel.resubscribe(EntityType::Contact).await.unwrap();
        channel.resubscribe(EntityType::Contact).await.unwrap();

        assert_eq!(remote.active_subscriptions(&account(), EntityType::Contact), 1);
        assert_eq!(channel.active_count().await, 1);
        channel.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_live_change_applied_without_moving_cursor() {
        let (remote, db, channel) = setup();
        channel.resubscribe(EntityType::Contact).await.unwrap();

        inject_contact(&remote, "c-1", "Ada");

        let records = RecordStore::new(db.clone(), account());
        let id = RecordId::new("c-1").unwrap();
        assert!(
            wait_for(|| matches!(records.get(EntityType::Contact, &id), Ok(Some(_)))).await
        );
        let record = records.get(EntityType::Contact, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);

        let cursors = CursorStore::new(db, account());
        assert_eq!(cursors.get(EntityType::Contact).unwrap(), 0);
        channel.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_offline_then_online_delivers_once() {
        let (remote, db, channel) = setup();
        channel.subscribe_all().await.unwrap();

        remote.set_online(false);
        channel.on_connectivity(false).await.unwrap();
        assert_eq!(channel.active_count().await, 0);

        remote.set_online(true);
        channel.on_connectivity(true).await.unwrap();
        for entity_type in EntityType::ALL {
            assert_eq!(remote.active_subscriptions(&account(), entity_type), 1);
        }

        inject_contact(&remote, "c-7", "Tunde");

        let audit = AuditTrail::new(db, account());
        let count = || {
            audit
                .query(AuditFilter::default().actor("u-2"))
                .filter(|e| e.is_ok())
                .count()
        };
        assert!(wait_for(|| count() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(), 1);
        channel.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_subscribe_fails_while_offline() {
        let (remote, _db, channel) = setup();
        remote.set_online(false);
        assert!(channel.on_foreground().await.is_err());
        assert_eq!(channel.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_remote_close_ends_listener() {
        let (remote, _db, channel) = setup();
        channel.resubscribe(EntityType::Inventory).await.unwrap();
        remote.set_online(false);

        let mut ended = false;
        for _ in 0..100 {
            if channel.active_count().await == 0 {
                ended = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ended);
    }
}
