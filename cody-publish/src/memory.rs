//! In-memory collaborators for tests and embedding.
//!
//! Each type keeps its state behind one `Mutex`; every trait call is a single
//! critical section, which makes them linearizable like their durable
//! counterparts.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use cody_core::{
    ActionQueue, BackendError, BlobId, BlobStore, CommitId, Delivery, DiffEntry, DiffSource,
    MemoryStatusStore, Notifier, ObjectLocation, PublishAction, RepositoryName,
};

use crate::pipeline::Backends;

fn lock<'a, T>(mutex: &'a Mutex<T>, service: &'static str) -> Result<MutexGuard<'a, T>, BackendError> {
    mutex.lock().map_err(|_| BackendError::Unavailable {
        service,
        message: "lock poisoned".to_string(),
    })
}

/// Content-addressed blob id: hex SHA-256 of the content.
pub fn blob_id_of(content: &[u8]) -> BlobId {
    BlobId(hex::encode(Sha256::digest(content)))
}

// ---------------------------------------------------------------------------
// MemoryRepository
// ---------------------------------------------------------------------------

type Tree = BTreeMap<String, BlobId>;

#[derive(Debug, Default)]
struct RepositoryState {
    trees: HashMap<(RepositoryName, CommitId), Tree>,
    blobs: HashMap<BlobId, Vec<u8>>,
}

/// Snapshot repository: every commit is a full `path → content` tree.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<RepositoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `commit` as the full tree `files`.
    pub fn commit<P, C>(
        &self,
        repository: &str,
        commit: &str,
        files: impl IntoIterator<Item = (P, C)>,
    ) -> Result<(), BackendError>
    where
        P: Into<String>,
        C: AsRef<[u8]>,
    {
        let mut state = lock(&self.state, "repository")?;
        let mut tree = Tree::new();
        for (path, content) in files {
            let content = content.as_ref();
            let blob_id = blob_id_of(content);
            state.blobs.insert(blob_id.clone(), content.to_vec());
            tree.insert(path.into(), blob_id);
        }
        state
            .trees
            .insert((RepositoryName::from(repository), CommitId::from(commit)), tree);
        Ok(())
    }

    /// Record `commit` as `parent` with `changes` applied; `None` deletes.
    pub fn commit_on(
        &self,
        repository: &str,
        parent: &str,
        commit: &str,
        changes: &[(&str, Option<&[u8]>)],
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state, "repository")?;
        let parent_key = (RepositoryName::from(repository), CommitId::from(parent));
        let mut tree = state
            .trees
            .get(&parent_key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("commit {parent}")))?;
        for (path, content) in changes {
            match content {
                Some(content) => {
                    let blob_id = blob_id_of(content);
                    state.blobs.insert(blob_id.clone(), content.to_vec());
                    tree.insert((*path).to_string(), blob_id);
                }
                None => {
                    tree.remove(*path);
                }
            }
        }
        state
            .trees
            .insert((RepositoryName::from(repository), CommitId::from(commit)), tree);
        Ok(())
    }

    /// The full tree of `commit`, with content.
    pub fn files(&self, repository: &str, commit: &str) -> Result<BTreeMap<String, Vec<u8>>, BackendError> {
        let state = lock(&self.state, "repository")?;
        let tree = state
            .trees
            .get(&(RepositoryName::from(repository), CommitId::from(commit)))
            .ok_or_else(|| BackendError::NotFound(format!("commit {commit}")))?;
        Ok(tree
            .iter()
            .filter_map(|(path, id)| state.blobs.get(id).map(|c| (path.clone(), c.clone())))
            .collect())
    }
}

impl DiffSource for MemoryRepository {
    fn diff(
        &self,
        repository: &RepositoryName,
        from: Option<&CommitId>,
        to: &CommitId,
    ) -> Result<Vec<DiffEntry>, BackendError> {
        let state = lock(&self.state, "repository")?;
        let tree_of = |commit: &CommitId| {
            state
                .trees
                .get(&(repository.clone(), commit.clone()))
                .ok_or_else(|| BackendError::NotFound(format!("commit {commit} in {repository}")))
        };
        let empty = Tree::new();
        let before = match from {
            Some(commit) => tree_of(commit)?,
            None => &empty,
        };
        let after = tree_of(to)?;

        let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        let mut entries = Vec::new();
        for path in paths {
            match (before.get(path), after.get(path)) {
                (None, Some(new)) => entries.push(DiffEntry::added(path.clone(), new.clone())),
                (Some(old), None) => entries.push(DiffEntry::deleted(path.clone(), old.clone())),
                (Some(old), Some(new)) if old != new => {
                    entries.push(DiffEntry::modified(path.clone(), old.clone(), new.clone()))
                }
                _ => {}
            }
        }
        Ok(entries)
    }

    fn get_blob(&self, _repository: &RepositoryName, blob_id: &BlobId) -> Result<Vec<u8>, BackendError> {
        lock(&self.state, "repository")?
            .blobs
            .get(blob_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("blob {blob_id}")))
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

/// Which visible message `dequeue_one` hands out. The queue is only
/// best-effort FIFO; the other orders exercise reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DequeueOrder {
    #[default]
    Fifo,
    Lifo,
    /// Alternate between the oldest and the newest visible message.
    Alternate,
}

#[derive(Debug)]
struct QueuedMessage {
    id: u64,
    action: PublishAction,
    invisible_until: Option<Instant>,
    receives: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    next_id: u64,
    dequeues: u64,
}

/// At-least-once queue with a visibility timeout.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    visibility_timeout: Duration,
    order: DequeueOrder,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_order(visibility_timeout, DequeueOrder::Fifo)
    }

    pub fn with_order(visibility_timeout: Duration, order: DequeueOrder) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
            order,
        }
    }

    /// Make every leased message visible again, as if its visibility timeout
    /// had lapsed.
    pub fn expire_leases(&self) -> Result<usize, BackendError> {
        let mut state = lock(&self.state, "action queue")?;
        let mut expired = 0;
        for message in state.messages.iter_mut() {
            if message.invisible_until.take().is_some() {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Messages not yet acked, leased or not.
    pub fn len(&self) -> usize {
        lock(&self.state, "action queue")
            .map(|state| state.messages.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every unacked action, oldest first.
    pub fn actions(&self) -> Vec<PublishAction> {
        lock(&self.state, "action queue")
            .map(|state| state.messages.iter().map(|m| m.action.clone()).collect())
            .unwrap_or_default()
    }

    /// How often the message carrying `action` has been handed out.
    pub fn receive_count(&self, action: &PublishAction) -> u32 {
        lock(&self.state, "action queue")
            .ok()
            .and_then(|state| {
                state
                    .messages
                    .iter()
                    .find(|m| &m.action == action)
                    .map(|m| m.receives)
            })
            .unwrap_or(0)
    }
}

impl ActionQueue for MemoryQueue {
    fn enqueue(&self, action: &PublishAction) -> Result<(), BackendError> {
        let mut state = lock(&self.state, "action queue")?;
        let id = state.next_id;
        state.next_id += 1;
        state.messages.push_back(QueuedMessage {
            id,
            action: action.clone(),
            invisible_until: None,
            receives: 0,
        });
        Ok(())
    }

    fn dequeue_one(&self) -> Result<Option<Delivery>, BackendError> {
        let mut state = lock(&self.state, "action queue")?;
        let now = Instant::now();
        let visible: Vec<usize> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.invisible_until.map_or(true, |until| until <= now))
            .map(|(index, _)| index)
            .collect();
        let pick = match self.order {
            DequeueOrder::Fifo => visible.first(),
            DequeueOrder::Lifo => visible.last(),
            DequeueOrder::Alternate if state.dequeues % 2 == 0 => visible.first(),
            DequeueOrder::Alternate => visible.last(),
        };
        let Some(&index) = pick else {
            return Ok(None);
        };
        state.dequeues += 1;
        let timeout = self.visibility_timeout;
        let Some(message) = state.messages.get_mut(index) else {
            return Ok(None);
        };
        message.invisible_until = Some(now + timeout);
        message.receives += 1;
        Ok(Some(Delivery {
            receipt: message.id.to_string(),
            action: message.action.clone(),
        }))
    }

    fn ack(&self, receipt: &str) -> Result<(), BackendError> {
        let mut state = lock(&self.state, "action queue")?;
        state.messages.retain(|m| m.id.to_string() != receipt);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CountingNotifier
// ---------------------------------------------------------------------------

/// Counts pending drain triggers; [`run_trampoline`](crate::run_trampoline)
/// consumes them one at a time.
#[derive(Debug, Default)]
pub struct CountingNotifier {
    pending: AtomicUsize,
    total: AtomicUsize,
}

impl CountingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Triggers sent since creation.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Consume one pending trigger, if any.
    pub fn take_one(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Drop every pending trigger.
    pub fn clear(&self) -> usize {
        self.pending.swap(0, Ordering::SeqCst)
    }
}

impl Notifier for CountingNotifier {
    fn trigger(&self) -> Result<(), BackendError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Default)]
struct BlobState {
    objects: HashMap<ObjectLocation, StoredObject>,
    fail_puts: usize,
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    state: Mutex<BlobState>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let location = ObjectLocation {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        lock(&self.state, "blob store")
            .ok()
            .and_then(|state| state.objects.get(&location).cloned())
    }

    /// Sorted keys stored in `bucket`.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state, "blob store")
            .map(|state| {
                state
                    .objects
                    .keys()
                    .filter(|location| location.bucket == bucket)
                    .map(|location| location.key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Make the next `count` puts fail with a transient error.
    pub fn fail_next_puts(&self, count: usize) {
        if let Ok(mut state) = lock(&self.state, "blob store") {
            state.fail_puts = count;
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, location: &ObjectLocation, body: &[u8], content_type: &str) -> Result<(), BackendError> {
        let mut state = lock(&self.state, "blob store")?;
        if state.fail_puts > 0 {
            state.fail_puts -= 1;
            return Err(BackendError::Unavailable {
                service: "blob store",
                message: format!("injected failure for {location}"),
            });
        }
        state.objects.insert(
            location.clone(),
            StoredObject {
                body: body.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), BackendError> {
        lock(&self.state, "blob store")?.objects.remove(location);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBackends
// ---------------------------------------------------------------------------

/// A full set of in-memory collaborators with typed handles.
#[derive(Clone)]
pub struct MemoryBackends {
    pub repository: Arc<MemoryRepository>,
    pub status: Arc<MemoryStatusStore>,
    pub queue: Arc<MemoryQueue>,
    pub notifier: Arc<CountingNotifier>,
    pub blobs: Arc<MemoryBlobStore>,
}

impl Default for MemoryBackends {
    fn default() -> Self {
        Self::with_queue(MemoryQueue::default())
    }
}

impl MemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(queue: MemoryQueue) -> Self {
        Self {
            repository: Arc::new(MemoryRepository::new()),
            status: Arc::new(MemoryStatusStore::new()),
            queue: Arc::new(queue),
            notifier: Arc::new(CountingNotifier::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            source: self.repository.clone(),
            status: self.status.clone(),
            queue: self.queue.clone(),
            notifier: self.notifier.clone(),
            blobs: self.blobs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cody_core::{ChangeKind, CommitEvent};

    fn action(path: &str) -> PublishAction {
        let event = CommitEvent::new("site", "main", "c1");
        PublishAction::from_entry(&event, 1, 0, &DiffEntry::added(path, "b")).expect("action")
    }

    #[test]
    fn repository_diff_against_empty_tree_adds_everything() {
        let repo = MemoryRepository::new();
        repo.commit("site", "c1", [("content/a.txt", "A"), ("README", "r")])
            .expect("commit");
        let diff = repo
            .diff(&RepositoryName::from("site"), None, &CommitId::from("c1"))
            .expect("diff");
        assert_eq!(diff.len(), 2);
        assert!(diff.iter().all(|e| e.kind == ChangeKind::AddedOrModified));
    }

    #[test]
    fn repository_diff_reports_modify_and_delete() {
        let repo = MemoryRepository::new();
        repo.commit("site", "c1", [("a", "1"), ("b", "2")]).expect("commit");
        repo.commit_on("site", "c1", "c2", &[("a", Some(b"changed".as_slice())), ("b", None)])
            .expect("commit");
        let diff = repo
            .diff(
                &RepositoryName::from("site"),
                Some(&CommitId::from("c1")),
                &CommitId::from("c2"),
            )
            .expect("diff");
        assert_eq!(diff[0], DiffEntry::modified("a", blob_id_of(b"1"), blob_id_of(b"changed")));
        assert_eq!(diff[1], DiffEntry::deleted("b", blob_id_of(b"2")));
    }

    #[test]
    fn unknown_commit_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo
            .diff(&RepositoryName::from("site"), None, &CommitId::from("nope"))
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[test]
    fn leased_message_is_invisible_until_expired() {
        let queue = MemoryQueue::default();
        queue.enqueue(&action("content/a.txt")).expect("enqueue");
        let first = queue.dequeue_one().expect("dequeue").expect("message");
        assert!(queue.dequeue_one().expect("dequeue").is_none());

        assert_eq!(queue.expire_leases().expect("expire"), 1);
        let again = queue.dequeue_one().expect("dequeue").expect("redelivered");
        assert_eq!(again.action, first.action);
        assert_eq!(queue.receive_count(&first.action), 2);

        queue.ack(&again.receipt).expect("ack");
        assert!(queue.is_empty());
    }

    #[test]
    fn lifo_order_hands_out_newest_first() {
        let queue = MemoryQueue::with_order(Duration::from_secs(60), DequeueOrder::Lifo);
        queue.enqueue(&action("content/a.txt")).expect("enqueue");
        queue.enqueue(&action("content/b.txt")).expect("enqueue");
        let first = queue.dequeue_one().expect("dequeue").expect("message");
        assert_eq!(first.action.path, "content/b.txt");
    }

    #[test]
    fn counting_notifier_tracks_pending_triggers() {
        let notifier = CountingNotifier::new();
        notifier.trigger().expect("trigger");
        notifier.trigger().expect("trigger");
        assert!(notifier.take_one());
        assert_eq!(notifier.pending(), 1);
        assert_eq!(notifier.clear(), 1);
        assert!(!notifier.take_one());
        assert_eq!(notifier.total(), 2);
    }

    #[test]
    fn blob_store_failure_injection_is_one_shot() {
        let blobs = MemoryBlobStore::new();
        let location = ObjectLocation {
            bucket: "site".to_string(),
            key: "main/a.txt".to_string(),
        };
        blobs.fail_next_puts(1);
        assert!(blobs.put(&location, b"A", "text/plain").is_err());
        blobs.put(&location, b"A", "text/plain").expect("put");
        assert_eq!(blobs.keys("site"), vec!["main/a.txt".to_string()]);
        blobs.delete(&location).expect("delete");
        blobs.delete(&location).expect("delete absent");
        assert!(blobs.get("site", "main/a.txt").is_none());
    }
}
