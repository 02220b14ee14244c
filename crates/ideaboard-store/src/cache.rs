//! Collection cache for idea records.
//!
//! [`IdeaCache`] owns the local snapshot of one remote collection and is the
//! single source of truth for what observers see. Every write goes to the
//! store first; the snapshot is then resynchronized according to the
//! configured [`SyncPolicy`]. Observers follow two `watch` channels (the
//! projected idea list and the busy flag) and may subscribe to a broadcast
//! stream of [`CacheUpdate`] events.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::{
    CacheError, IDEA_COLLECTION, Idea, IdeaId, RecordRef, RecordStore, StoreError, StoredRecord,
};

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// How the snapshot is brought back in line after a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Re-read the whole collection after every write. Always matches the
    /// server, at the cost of a round-trip per write.
    #[default]
    FullRefetch,
    /// Apply the acknowledged write to the local snapshot directly.
    OptimisticPatch,
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPolicy::FullRefetch => "full-refetch",
            SyncPolicy::OptimisticPatch => "optimistic-patch",
        })
    }
}

/// Error when parsing a [`SyncPolicy`].
#[derive(Debug, Error)]
#[error("unknown sync policy '{0}', expected full-refetch or optimistic-patch")]
pub struct ParseSyncPolicyError(String);

impl FromStr for SyncPolicy {
    type Err = ParseSyncPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full-refetch" | "refetch" => Ok(SyncPolicy::FullRefetch),
            "optimistic-patch" | "patch" => Ok(SyncPolicy::OptimisticPatch),
            _ => Err(ParseSyncPolicyError(s.to_string())),
        }
    }
}

/// Freshness of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    /// Nothing has been fetched yet.
    Unloaded = 0,
    /// The snapshot reflects the last completed read or patch.
    Ready = 1,
    /// A write succeeded but the refresh after it failed.
    Stale = 2,
}

impl From<u8> for CacheState {
    fn from(v: u8) -> Self {
        match v {
            1 => CacheState::Ready,
            2 => CacheState::Stale,
            _ => CacheState::Unloaded,
        }
    }
}

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// The snapshot was replaced by a fresh read.
    Refreshed { count: usize },
    /// An idea was written as a new record.
    Added { id: IdeaId, handle: RecordRef },
    /// An idea's record was replaced.
    Updated { id: IdeaId, handle: RecordRef },
    /// An idea's record was deleted.
    Removed { id: IdeaId, handle: RecordRef },
    /// The busy flag changed.
    Loading { busy: bool },
}

/// Records of one collection exactly as last read from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    records: Vec<StoredRecord>,
}

impl Snapshot {
    pub fn new(records: Vec<StoredRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[StoredRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Project every record into an [`Idea`], keeping snapshot order.
    pub fn project(&self) -> Vec<Idea> {
        self.records
            .iter()
            .map(|r| Idea::from_record(&r.value))
            .collect()
    }
}

/// Find the handle of the record whose embedded id is `id`.
///
/// Linear scan in snapshot order; the first match wins if ids repeat.
pub fn resolve_handle(snapshot: &Snapshot, id: &IdeaId) -> Option<RecordRef> {
    snapshot
        .records
        .iter()
        .find(|r| r.idea_id() == Some(id.as_str()))
        .map(|r| r.handle.clone())
}

/// A local change mirroring an acknowledged write.
enum Patch {
    Insert(StoredRecord),
    Replace(StoredRecord),
    Remove(RecordRef),
}

struct Current {
    /// Ticket of the read or patch that produced `snapshot`.
    generation: u64,
    snapshot: Arc<Snapshot>,
}

/// Marks an operation as in flight for as long as it is alive.
struct BusyGuard<'a> {
    cache: &'a IdeaCache,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.cache.leave_busy();
    }
}

/// Cache of one idea collection.
///
/// Shared behind an `Arc`; every operation takes `&self` and operations may
/// overlap. Dropping the cache closes its channels.
pub struct IdeaCache {
    store: Arc<dyn RecordStore>,
    collection: String,
    policy: SyncPolicy,
    current: RwLock<Current>,
    /// Source of read/patch tickets, in issue order.
    next_generation: AtomicU64,
    /// Operations currently in flight.
    in_flight: AtomicUsize,
    state: AtomicU8,
    items_tx: watch::Sender<Arc<Vec<Idea>>>,
    loading_tx: watch::Sender<bool>,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl IdeaCache {
    /// Create a cache over `collection` with the default sync policy.
    pub fn new(store: Arc<dyn RecordStore>, collection: impl Into<String>) -> Arc<Self> {
        IdeaCacheBuilder::new(store).collection(collection).build()
    }

    fn with_policy(store: Arc<dyn RecordStore>, collection: String, policy: SyncPolicy) -> Self {
        let (items_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (loading_tx, _) = watch::channel(false);
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);

        Self {
            store,
            collection,
            policy,
            current: RwLock::new(Current {
                generation: 0,
                snapshot: Arc::new(Snapshot::default()),
            }),
            next_generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            state: AtomicU8::new(CacheState::Unloaded as u8),
            items_tx,
            loading_tx,
            updates_tx,
        }
    }

    /// The collection this cache mirrors.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn state(&self) -> CacheState {
        CacheState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Stream of the projected idea list.
    pub fn items(&self) -> watch::Receiver<Arc<Vec<Idea>>> {
        self.items_tx.subscribe()
    }

    /// Stream of the busy flag.
    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading_tx.subscribe()
    }

    /// Subscribe to cache updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    /// Current projected ideas.
    pub fn ideas(&self) -> Arc<Vec<Idea>> {
        self.items_tx.borrow().clone()
    }

    /// Look up a projected idea by id.
    pub fn get(&self, id: &IdeaId) -> Option<Idea> {
        self.items_tx.borrow().iter().find(|i| &i.id == id).cloned()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading_tx.borrow()
    }

    /// The raw snapshot as last read or patched.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().await.snapshot)
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    fn busy(&self) -> BusyGuard<'_> {
        // Counter, flag and edge event all move under the watch lock so
        // subscribers see edges in the same order as the flag.
        self.loading_tx.send_if_modified(|busy| {
            let was_idle = self.in_flight.fetch_add(1, Ordering::SeqCst) == 0;
            let raise = was_idle && !*busy;
            if raise {
                *busy = true;
                self.broadcast(CacheUpdate::Loading { busy: true });
            }
            raise
        });
        BusyGuard { cache: self }
    }

    fn leave_busy(&self) {
        self.loading_tx.send_if_modified(|busy| {
            let now_idle = self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
            let lower = now_idle && *busy;
            if lower {
                *busy = false;
                self.broadcast(CacheUpdate::Loading { busy: false });
            }
            lower
        });
    }

    fn ticket(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Read the whole collection and replace the snapshot.
    pub async fn fetch_all(&self) -> Result<Arc<Vec<Idea>>, CacheError> {
        let _busy = self.busy();
        self.refresh().await.map_err(CacheError::from)
    }

    async fn refresh(&self) -> Result<Arc<Vec<Idea>>, StoreError> {
        let ticket = self.ticket();

        let records = match self.store.list(&self.collection).await {
            Ok(records) => records,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "failed to fetch ideas");
                return Err(e);
            }
        };

        Ok(self.apply_snapshot(ticket, Snapshot::new(records)).await)
    }

    async fn apply_snapshot(&self, ticket: u64, snapshot: Snapshot) -> Arc<Vec<Idea>> {
        let mut current = self.current.write().await;

        if ticket < current.generation {
            debug!(
                ticket,
                generation = current.generation,
                "discarding read issued before the current snapshot"
            );
            return self.ideas();
        }

        let items = Arc::new(snapshot.project());
        let count = snapshot.len();
        current.generation = ticket;
        current.snapshot = Arc::new(snapshot);
        self.items_tx.send_replace(Arc::clone(&items));
        self.set_state(CacheState::Ready);
        drop(current);

        debug!(collection = %self.collection, count, "snapshot replaced");
        self.broadcast(CacheUpdate::Refreshed { count });
        items
    }

    async fn apply_patch(&self, patch: Patch) {
        let mut current = self.current.write().await;
        let ticket = self.ticket();

        let mut records = current.snapshot.records.clone();
        match patch {
            Patch::Insert(record) => records.push(record),
            Patch::Replace(record) => {
                if let Some(slot) = records.iter_mut().find(|r| r.handle == record.handle) {
                    *slot = record;
                } else {
                    records.push(record);
                }
            }
            Patch::Remove(handle) => records.retain(|r| r.handle != handle),
        }

        let snapshot = Snapshot::new(records);
        self.items_tx.send_replace(Arc::new(snapshot.project()));
        current.generation = ticket;
        current.snapshot = Arc::new(snapshot);
        self.set_state(CacheState::Ready);
        trace!(ticket, "snapshot patched");
    }

    /// Bring the snapshot in line after an acknowledged write.
    async fn resync(&self, patch: Patch) -> Result<(), CacheError> {
        match self.policy {
            SyncPolicy::OptimisticPatch => {
                self.apply_patch(patch).await;
                Ok(())
            }
            SyncPolicy::FullRefetch => match self.refresh().await {
                Ok(_) => Ok(()),
                Err(source) => {
                    self.set_state(CacheState::Stale);
                    Err(CacheError::RefreshFailed { source })
                }
            },
        }
    }

    async fn resolve(&self, op: &'static str, id: &IdeaId) -> Result<RecordRef, CacheError> {
        let current = self.current.read().await;
        resolve_handle(&current.snapshot, id).ok_or_else(|| {
            warn!(op, id = %id, "idea not present in snapshot");
            CacheError::NotFound { id: id.clone() }
        })
    }

    fn write_failed(&self, op: &'static str, id: &IdeaId, err: StoreError) -> CacheError {
        warn!(op, id = %id, error = %err, "store write failed");
        CacheError::from(err)
    }

    /// Write `idea` as a new record and resynchronize.
    ///
    /// No deduplication happens here: adding the same idea twice creates two
    /// records.
    pub async fn add(&self, idea: &Idea) -> Result<RecordRef, CacheError> {
        let _busy = self.busy();

        let stored = self
            .store
            .create(&self.collection, &idea.to_record())
            .await
            .map_err(|e| self.write_failed("add", &idea.id, e))?;

        let handle = stored.handle.clone();
        info!(id = %idea.id, handle = %handle, "idea added");
        self.broadcast(CacheUpdate::Added {
            id: idea.id.clone(),
            handle: handle.clone(),
        });

        self.resync(Patch::Insert(stored)).await?;
        Ok(handle)
    }

    /// Replace the record holding `idea.id` with every field of `idea`.
    pub async fn update(&self, idea: &Idea) -> Result<(), CacheError> {
        let _busy = self.busy();
        let handle = self.resolve("update", &idea.id).await?;

        let stored = self
            .store
            .replace(&handle, &idea.to_record())
            .await
            .map_err(|e| self.write_failed("update", &idea.id, e))?;

        info!(id = %idea.id, handle = %handle, votes = idea.votes, "idea updated");
        self.broadcast(CacheUpdate::Updated {
            id: idea.id.clone(),
            handle,
        });

        self.resync(Patch::Replace(stored)).await
    }

    /// Delete the record holding `idea.id`.
    pub async fn remove(&self, idea: &Idea) -> Result<(), CacheError> {
        let _busy = self.busy();
        let handle = self.resolve("remove", &idea.id).await?;

        self.store
            .delete(&handle)
            .await
            .map_err(|e| self.write_failed("remove", &idea.id, e))?;

        info!(id = %idea.id, handle = %handle, "idea removed");
        self.broadcast(CacheUpdate::Removed {
            id: idea.id.clone(),
            handle: handle.clone(),
        });

        self.resync(Patch::Remove(handle)).await
    }
}

/// Builder for an [`IdeaCache`].
pub struct IdeaCacheBuilder {
    store: Arc<dyn RecordStore>,
    collection: Option<String>,
    policy: SyncPolicy,
}

impl IdeaCacheBuilder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            collection: None,
            policy: SyncPolicy::default(),
        }
    }

    /// Collection to mirror. Defaults to [`IDEA_COLLECTION`].
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Arc<IdeaCache> {
        let collection = self
            .collection
            .unwrap_or_else(|| IDEA_COLLECTION.to_string());
        Arc::new(IdeaCache::with_policy(self.store, collection, self.policy))
    }
}
