// Per-key serializing processor with last-write-wins coalescing.
//
// Guarantees exactly one concurrent execution per key. An item submitted
// while its key is busy replaces any already-pending item for that key and
// runs once the in-flight execution completes; intermediate items are
// dropped. A burst of rapid "notebook updated" events therefore costs one
// download for the first event plus one for the latest.
//
// Execution failures are caught here, logged, and do not poison the slot.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::warn;

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFn<K, T> = dyn Fn(K, T) -> TaskFuture + Send + Sync;

/// Per-key slot state. A key with no entry is idle.
enum Slot<T> {
    /// An execution is in flight and nothing is queued behind it.
    Processing,
    /// An execution is in flight; `T` runs next (last submission wins).
    Pending(T),
}

/// Keyed work serializer. Cheap to clone; clones share the slot map.
pub struct SerialQueue<K, T> {
    inner: Arc<Inner<K, T>>,
}

struct Inner<K, T> {
    slots: StdMutex<HashMap<K, Slot<T>>>,
    task: Box<TaskFn<K, T>>,
}

impl<K, T> Clone for SerialQueue<K, T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, T> SerialQueue<K, T>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Build a queue around the execution function applied to each item.
    pub fn new<F, Fut>(task: F) -> Self
    where
        F: Fn(K, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                slots: StdMutex::new(HashMap::new()),
                task: Box::new(move |key, item| Box::pin(task(key, item))),
            }),
        }
    }

    /// Submit an item for `key`.
    ///
    /// Starts executing immediately when the key is idle; otherwise records
    /// the item as pending, overwriting any previous pending item.
    pub fn submit(&self, key: K, item: T) {
        let mut slots = self.inner.slots.lock().expect("serial queue lock poisoned");
        match slots.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Processing);
                drop(slots);
                tokio::spawn(run_key(Arc::clone(&self.inner), key, item));
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(Slot::Pending(item));
            }
        }
    }

    /// Number of keys with an execution currently in flight.
    pub fn active_keys(&self) -> usize {
        self.inner.slots.lock().expect("serial queue lock poisoned").len()
    }
}

/// Drive one key until its slot drains: run the current item, then the
/// pending item if one was recorded meanwhile, until nothing is queued.
async fn run_key<K, T>(inner: Arc<Inner<K, T>>, key: K, mut item: T)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    loop {
        if let Err(error) = (inner.task)(key.clone(), item).await {
            warn!(key = ?key, %error, "serialized task failed");
        }

        let mut slots = inner.slots.lock().expect("serial queue lock poisoned");
        match slots.remove(&key) {
            Some(Slot::Pending(next)) => {
                slots.insert(key.clone(), Slot::Processing);
                drop(slots);
                item = next;
            }
            // Processing with nothing pending: the remove cleared the slot.
            _ => break,
        }
    }
}
