//! Tenant state held in memory and persisted as one snapshot per tenant.
//!
//! Tenants are loaded lazily on first access (or eagerly via [`StateStore::preload`]).
//! Every mutation marks the tenant dirty and enqueues a save request for the
//! persistence worker. The request is dropped if the queue is full; the dirty
//! mark is what the sweep and the shutdown flush go by.
//!
//! A tenant whose snapshot exists but cannot be read stays out of memory.
//! Mutations to it fail, so the unreadable file is never replaced.

mod persister;
pub mod snapshot;

pub use persister::PersistenceConfig;
pub use snapshot::StoreError;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use slacker_core::{Assignee, ItemKey, TenantData, TrackedItem, UserPreferences};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct StateStore {
    data_dir: PathBuf,
    tenants: RwLock<HashMap<String, TenantData>>,
    config: PersistenceConfig,
    save_tx: mpsc::Sender<String>,
    /// Handed to the persistence worker when it starts.
    save_rx: StdMutex<Option<mpsc::Receiver<String>>>,
    /// Serialize read-modify-write cycles on a single item.
    item_locks: RwLock<HashMap<(String, ItemKey), Arc<Mutex<()>>>>,
    /// Tenants changed since their last successful write.
    dirty: Mutex<HashSet<String>>,
    saves_completed: AtomicU64,
}

impl StateStore {
    /// Open (creating if needed) the data directory. Nothing is loaded yet.
    pub async fn open(data_dir: &Path, config: PersistenceConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let (save_tx, save_rx) = mpsc::channel(config.queue_capacity.max(1));
        Ok(Arc::new(Self {
            data_dir: data_dir.to_path_buf(),
            tenants: RwLock::new(HashMap::new()),
            config,
            save_tx,
            save_rx: StdMutex::new(Some(save_rx)),
            item_locks: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            saves_completed: AtomicU64::new(0),
        }))
    }

    /// Spawn the persistence worker. It runs until `cancel` fires, then
    /// flushes pending saves and exits.
    pub fn start_persistence(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let receiver = self
            .save_rx
            .lock()
            .map_err(|_| anyhow!("save queue lock poisoned"))?
            .take()
            .context("Persistence worker already started")?;

        Ok(tokio::spawn(persister::run(
            self.clone(),
            receiver,
            self.config.clone(),
            cancel,
        )))
    }

    /// Load every snapshot in the data directory. Returns how many tenants
    /// were loaded.
    pub async fn preload(&self) -> Result<usize> {
        let dir = self.data_dir.clone();
        let tenants = tokio::task::spawn_blocking(move || snapshot::list_tenants(&dir))
            .await
            .context("spawn_blocking panicked")?
            .context("Failed to list snapshots")?;

        for tenant in &tenants {
            if let Err(e) = self.ensure_loaded(tenant).await {
                error!("{:#}", e);
            }
        }
        let loaded = self.tenants.read().await.len();
        info!("Preloaded {} tenant(s) from {}", loaded, self.data_dir.display());
        Ok(loaded)
    }

    /// Bring a tenant into memory if it is not there yet.
    ///
    /// A missing snapshot is fine: the tenant starts empty on first write. A
    /// corrupt one is moved aside first. If the snapshot cannot be read, or
    /// cannot be moved aside, the tenant stays unloaded and the next access
    /// tries again.
    pub async fn ensure_loaded(&self, tenant_id: &str) -> Result<()> {
        if self.tenants.read().await.contains_key(tenant_id) {
            return Ok(());
        }

        let path = snapshot::snapshot_path(&self.data_dir, tenant_id);
        let loaded = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            match snapshot::load(&path) {
                Err(StoreError::Corrupt { path, source }) => {
                    error!("Snapshot {} is corrupt: {}", path.display(), source);
                    let moved = snapshot::quarantine(&path)?;
                    warn!("Moved corrupt snapshot to {}", moved.display());
                    Ok(None)
                }
                other => other,
            }
        })
        .await
        .context("spawn_blocking panicked")?
        .with_context(|| format!("Tenant {} is unavailable", tenant_id))?;

        let Some(mut data) = loaded else {
            return Ok(());
        };
        data.tenant_id = tenant_id.to_string();

        let mut tenants = self.tenants.write().await;
        match tenants.entry(tenant_id.to_string()) {
            Entry::Occupied(_) => {
                debug!("Tenant {} was loaded concurrently, keeping the first copy", tenant_id);
            }
            Entry::Vacant(slot) => {
                info!("Loaded tenant {} ({} items)", tenant_id, data.items.len());
                slot.insert(data);
            }
        }
        Ok(())
    }

    /// Reads of a tenant that failed to load see no data.
    async fn read<R>(&self, tenant_id: &str, f: impl FnOnce(Option<&TenantData>) -> R) -> R {
        if let Err(e) = self.ensure_loaded(tenant_id).await {
            warn!("{:#}", e);
        }
        let tenants = self.tenants.read().await;
        f(tenants.get(tenant_id))
    }

    async fn mutate<R>(&self, tenant_id: &str, f: impl FnOnce(&mut TenantData) -> R) -> Result<R> {
        self.ensure_loaded(tenant_id).await?;
        let result = {
            let mut tenants = self.tenants.write().await;
            let tenant = tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| TenantData::new(tenant_id));
            let result = f(tenant);
            tenant.last_updated = Utc::now();
            self.dirty.lock().await.insert(tenant_id.to_string());
            result
        };
        self.request_save(tenant_id);
        Ok(result)
    }

    fn request_save(&self, tenant_id: &str) {
        match self.save_tx.try_send(tenant_id.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Save queue full, tenant {} stays dirty for the sweep", tenant_id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Persistence worker stopped, not queueing tenant {}", tenant_id);
            }
        }
    }

    /// Preferences for `user`, or the defaults if none were ever stored.
    pub async fn user_preferences(&self, tenant_id: &str, user: &str) -> UserPreferences {
        self.read(tenant_id, |t| t.map(|t| t.preferences(user)).unwrap_or_default())
            .await
    }

    pub async fn set_user_preferences(
        &self,
        tenant_id: &str,
        user: &str,
        prefs: UserPreferences,
    ) -> Result<()> {
        self.mutate(tenant_id, |t| {
            t.users.insert(user.to_string(), prefs);
        })
        .await
    }

    /// Record that `user` was just notified.
    pub async fn touch_last_notified(&self, tenant_id: &str, user: &str) -> Result<()> {
        let now = Utc::now();
        self.mutate(tenant_id, |t| {
            t.users.entry(user.to_string()).or_default().last_notified = Some(now);
        })
        .await
    }

    pub async fn touch_item_notified(&self, tenant_id: &str, key: &ItemKey) -> Result<()> {
        let now = Utc::now();
        self.mutate(tenant_id, |t| {
            if let Some(item) = t.items.get_mut(key) {
                item.last_notified = Some(now);
            }
        })
        .await
    }

    pub async fn item(&self, tenant_id: &str, key: &ItemKey) -> Option<TrackedItem> {
        self.read(tenant_id, |t| t.and_then(|t| t.items.get(key).cloned()))
            .await
    }

    /// Insert or replace an item, keeping the reverse index consistent.
    /// An existing thread reference is never dropped or replaced.
    pub async fn set_item(
        &self,
        tenant_id: &str,
        mut item: TrackedItem,
    ) -> Result<Option<TrackedItem>> {
        self.mutate(tenant_id, |t| {
            if let Some(existing) = t.items.get(&item.key()) {
                if existing.thread.is_some() {
                    item.thread = existing.thread.clone();
                }
            }
            t.upsert_item(item)
        })
        .await
    }

    /// Items currently attributed to `identity` (a login or `team:<slug>`).
    pub async fn items_for_user(&self, tenant_id: &str, identity: &str) -> Vec<TrackedItem> {
        self.read(tenant_id, |t| {
            t.map(|t| t.items_for(identity).into_iter().cloned().collect())
                .unwrap_or_default()
        })
        .await
    }

    /// Individual users with at least one open item waiting on them.
    pub async fn blocked_users(&self, tenant_id: &str) -> Vec<String> {
        self.read(tenant_id, |t| {
            let Some(t) = t else { return Vec::new() };
            t.user_items
                .keys()
                .filter(|identity| t.items_for(identity).iter().any(|i| i.status.is_open()))
                .filter_map(|identity| identity.parse::<Assignee>().ok())
                .filter_map(|a| a.login().map(str::to_string))
                .collect()
        })
        .await
    }

    pub async fn tenant_items(&self, tenant_id: &str) -> Vec<TrackedItem> {
        self.read(tenant_id, |t| {
            t.map(|t| t.items.values().cloned().collect()).unwrap_or_default()
        })
        .await
    }

    /// Ids of the tenants currently in memory.
    pub async fn tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Lock held while an item is fetched, recomputed and written back.
    pub async fn item_lock(&self, tenant_id: &str, key: &ItemKey) -> Arc<Mutex<()>> {
        let id = (tenant_id.to_string(), key.clone());
        {
            let locks = self.item_locks.read().await;
            if let Some(lock) = locks.get(&id) {
                return lock.clone();
            }
        }

        let mut locks = self.item_locks.write().await;
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget an item's lock once no task holds a handle to it. Call after
    /// dropping the handle from [`StateStore::item_lock`].
    pub async fn release_item_lock(&self, tenant_id: &str, key: &ItemKey) {
        let id = (tenant_id.to_string(), key.clone());
        let mut locks = self.item_locks.write().await;
        if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&id);
        }
    }

    /// Tenants with changes not yet written.
    pub(crate) async fn dirty_tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.dirty.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of snapshot writes that have succeeded.
    pub fn saves_completed(&self) -> u64 {
        self.saves_completed.load(Ordering::SeqCst)
    }

    /// Write one tenant's snapshot now. Returns false if the write failed.
    ///
    /// Only tenants held in memory are written, so a snapshot that failed to
    /// load is left as it is on disk.
    pub(crate) async fn persist(&self, tenant_id: &str) -> bool {
        let data = {
            let tenants = self.tenants.read().await;
            let Some(data) = tenants.get(tenant_id).cloned() else {
                return true;
            };
            // Mutations need the write lock, so none can slip in between the
            // copy and clearing the mark.
            self.dirty.lock().await.remove(tenant_id);
            data
        };
        let path = snapshot::snapshot_path(&self.data_dir, tenant_id);

        let write = tokio::task::spawn_blocking(move || snapshot::write_atomic(&path, &data));
        let saved = match write.await {
            Ok(Ok(())) => {
                self.saves_completed.fetch_add(1, Ordering::SeqCst);
                debug!("Saved tenant {}", tenant_id);
                true
            }
            Ok(Err(e)) => {
                error!("Failed to save tenant {}: {}", tenant_id, e);
                false
            }
            Err(e) => {
                error!("spawn_blocking panicked while saving tenant {}: {}", tenant_id, e);
                false
            }
        };
        if !saved {
            self.dirty.lock().await.insert(tenant_id.to_string());
        }
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slacker_core::{NotifyDelay, ReviewStatus, ThreadRef};
    use std::time::Duration;
    use tempfile::TempDir;

    fn item(number: u64, blocked_on: &[&str]) -> TrackedItem {
        TrackedItem {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            number,
            title: format!("PR {}", number),
            author: "alice".to_string(),
            status: ReviewStatus::AwaitingReview,
            blocked_on: blocked_on.iter().map(|s| s.parse().unwrap()).collect(),
            thread: None,
            last_updated: Utc::now(),
            last_notified: None,
        }
    }

    fn quiet_config() -> PersistenceConfig {
        PersistenceConfig {
            sweep_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(3600),
            ..PersistenceConfig::default()
        }
    }

    async fn open(dir: &TempDir, config: PersistenceConfig) -> Arc<StateStore> {
        StateStore::open(dir.path(), config).await.unwrap()
    }

    #[tokio::test]
    async fn test_same_key_replaces_item() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;

        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        let previous = store.set_item("acme", item(1, &["carol"])).await.unwrap();

        assert_eq!(previous.unwrap().blocked_on, vec![Assignee::user("bob")]);
        assert_eq!(store.tenant_items("acme").await.len(), 1);
        assert!(store.items_for_user("acme", "bob").await.is_empty());
        assert_eq!(store.items_for_user("acme", "carol").await.len(), 1);
    }

    #[tokio::test]
    async fn test_thread_is_never_replaced() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;
        let original = ThreadRef {
            channel: "C1".to_string(),
            ts: "1.0".to_string(),
        };

        let mut first = item(1, &["bob"]);
        first.thread = Some(original.clone());
        store.set_item("acme", first).await.unwrap();

        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        let mut other = item(1, &["bob"]);
        other.thread = Some(ThreadRef {
            channel: "C2".to_string(),
            ts: "2.0".to_string(),
        });
        store.set_item("acme", other).await.unwrap();

        let key = ItemKey::new("acme", "widgets", 1);
        assert_eq!(store.item("acme", &key).await.unwrap().thread, Some(original));
    }

    #[tokio::test]
    async fn test_unknown_user_gets_default_preferences() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;

        let prefs = store.user_preferences("acme", "nobody").await;

        assert_eq!(prefs, UserPreferences::default());
        assert!(store.tenants().await.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_users_skips_teams_and_closed_items() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;

        store.set_item("acme", item(1, &["bob", "team:platform"])).await.unwrap();
        let mut merged = item(2, &["carol"]);
        merged.status = ReviewStatus::Merged;
        store.set_item("acme", merged).await.unwrap();

        assert_eq!(store.blocked_users("acme").await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let store = open(&dir, quiet_config()).await;
        let worker = store.start_persistence(cancel.clone()).unwrap();

        let prefs = UserPreferences {
            notify_delay: NotifyDelay::Minutes60,
            timezone: "Europe/London".to_string(),
            ..UserPreferences::default()
        };
        store.set_user_preferences("acme", "bob", prefs.clone()).await.unwrap();
        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        store.set_item("acme", item(2, &["bob", "carol"])).await.unwrap();

        cancel.cancel();
        worker.await.unwrap();
        drop(store);

        let reopened = open(&dir, quiet_config()).await;
        assert_eq!(reopened.preload().await.unwrap(), 1);
        assert_eq!(reopened.user_preferences("acme", "bob").await, prefs);
        assert_eq!(reopened.items_for_user("acme", "bob").await.len(), 2);
        assert_eq!(reopened.items_for_user("acme", "carol").await.len(), 1);
    }

    #[tokio::test]
    async fn test_lazy_load_without_preload() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let store = open(&dir, quiet_config()).await;
        let worker = store.start_persistence(cancel.clone()).unwrap();
        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        cancel.cancel();
        worker.await.unwrap();

        let reopened = open(&dir, quiet_config()).await;
        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let store = reopened.clone();
                tokio::spawn(async move { store.items_for_user("acme", "bob").await.len() })
            })
            .collect();
        for lookup in lookups {
            assert_eq!(lookup.await.unwrap(), 1);
        }
        assert_eq!(reopened.tenants().await, vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        std::fs::write(snapshot::snapshot_path(dir.path(), "acme"), b"garbage").unwrap();
        let store = open(&dir, quiet_config()).await;

        assert!(store.tenant_items("acme").await.is_empty());
        assert!(dir.path().join("acme.json.gz.corrupt").exists());

        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        assert_eq!(store.tenant_items("acme").await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_to_one_tenant() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;

        let writers: Vec<_> = (1..=50)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move { store.set_item("acme", item(n, &["bob"])).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(store.tenant_items("acme").await.len(), 50);
        assert_eq!(store.items_for_user("acme", "bob").await.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_mutations_are_debounced() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let config = PersistenceConfig {
            debounce: Duration::from_millis(500),
            ..quiet_config()
        };
        let store = open(&dir, config).await;
        let worker = store.start_persistence(cancel.clone()).unwrap();

        for n in 1..=10 {
            store.set_item("acme", item(n, &["bob"])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.saves_completed() <= 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.saves_completed(), 2);

        cancel.cancel();
        worker.await.unwrap();

        let reopened = open(&dir, quiet_config()).await;
        reopened.preload().await.unwrap();
        assert_eq!(reopened.tenant_items("acme").await.len(), 10);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_that_cannot_be_moved_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = snapshot::snapshot_path(dir.path(), "acme");
        std::fs::write(&path, b"garbage").unwrap();
        // A non-empty directory where the quarantine copy would go makes the
        // rename fail.
        let blocker = dir.path().join("acme.json.gz.corrupt");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();
        let store = open(&dir, quiet_config()).await;

        assert!(store.set_item("acme", item(1, &["bob"])).await.is_err());
        assert!(store.tenant_items("acme").await.is_empty());
        assert!(store.tenants().await.is_empty());
        assert!(store.dirty_tenants().await.is_empty());
        assert!(store.persist("acme").await);
        assert_eq!(std::fs::read(&path).unwrap(), b"garbage");

        std::fs::remove_dir_all(&blocker).unwrap();
        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        assert_eq!(std::fs::read(&blocker).unwrap(), b"garbage");
        assert_eq!(store.tenant_items("acme").await.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_snapshot_is_never_replaced() {
        let dir = TempDir::new().unwrap();
        let path = snapshot::snapshot_path(dir.path(), "acme");
        // Opening a symlink to itself fails with ELOOP rather than NotFound.
        std::os::unix::fs::symlink(&path, &path).unwrap();
        let store = open(&dir, quiet_config()).await;

        let err = store.set_item("acme", item(1, &["bob"])).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Tenant acme is unavailable"));
        assert!(store.ensure_loaded("acme").await.is_err());

        let cancel = CancellationToken::new();
        let worker = store.start_persistence(cancel.clone()).unwrap();
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(store.saves_completed(), 0);
        assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_tenants_whose_request_was_dropped() {
        let dir = TempDir::new().unwrap();
        let config = PersistenceConfig {
            queue_capacity: 1,
            ..quiet_config()
        };
        let store = open(&dir, config).await;

        store.set_item("acme", item(1, &["bob"])).await.unwrap();
        // The queue already holds "acme", so this request is dropped.
        store.set_item("globex", item(2, &["carol"])).await.unwrap();
        assert_eq!(
            store.dirty_tenants().await,
            vec!["acme".to_string(), "globex".to_string()]
        );

        let cancel = CancellationToken::new();
        let worker = store.start_persistence(cancel.clone()).unwrap();
        cancel.cancel();
        worker.await.unwrap();

        assert!(store.dirty_tenants().await.is_empty());
        let reopened = open(&dir, quiet_config()).await;
        assert_eq!(reopened.preload().await.unwrap(), 2);
        assert_eq!(reopened.items_for_user("globex", "carol").await.len(), 1);
    }

    #[tokio::test]
    async fn test_item_lock_is_released_when_unused() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;
        let key = ItemKey::new("acme", "widgets", 1);

        let first = store.item_lock("acme", &key).await;
        let second = store.item_lock("acme", &key).await;
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        store.release_item_lock("acme", &key).await;
        assert_eq!(store.item_locks.read().await.len(), 1);

        drop(second);
        store.release_item_lock("acme", &key).await;
        assert!(store.item_locks.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_starts_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, quiet_config()).await;
        let cancel = CancellationToken::new();

        let _worker = store.start_persistence(cancel.clone()).unwrap();
        assert!(store.start_persistence(cancel.clone()).is_err());
        cancel.cancel();
    }
}
