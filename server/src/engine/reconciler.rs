use std::ops::Deref;
use std::sync::Arc;

use futures_util::future::ready;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Serialize, Serializer};

/// Something with a stable identity and a display name that can be mirrored
/// into a [`Snapshot`].
pub trait Resource: Clone + PartialEq + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
}

/// A membership change observed on the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent<T> {
    Create(T),
    Update(T),
    Delete(T),
}

/// Immutable, name-sorted view of a resource set at a point in time.
///
/// Sorting by name rather than insertion order makes a pure rename observable
/// as a different snapshot.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot<T>(Arc<[T]>);

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl<T: Resource> Snapshot<T> {
    pub fn from_items(mut items: Vec<T>) -> Self {
        items.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        Self(Arc::from(items))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(Resource::id)
    }

    pub fn find(&self, id: &str) -> Option<&T> {
        self.0.iter().find(|item| item.id() == id)
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Serialize> Serialize for Snapshot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Accumulator for the create/update/delete fold.
#[derive(Debug, Clone)]
pub struct ResourceSet<T> {
    items: Vec<T>,
}

impl<T: Resource> ResourceSet<T> {
    /// Seed the set. Duplicate ids in the seed collapse to the last occurrence.
    pub fn new(initial: impl IntoIterator<Item = T>) -> Self {
        let mut set = Self { items: Vec::new() };
        for item in initial {
            set.upsert(item);
        }
        set
    }

    /// Apply one event. Returns true if the set changed.
    pub fn apply(&mut self, event: ResourceEvent<T>) -> bool {
        match event {
            ResourceEvent::Create(item) | ResourceEvent::Update(item) => self.upsert(item),
            ResourceEvent::Delete(item) => self.remove(&item),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot::from_items(self.items.clone())
    }

    fn upsert(&mut self, item: T) -> bool {
        match self.items.iter_mut().find(|existing| existing.id() == item.id()) {
            Some(existing) if *existing == item => false,
            Some(existing) => {
                *existing = item;
                true
            }
            None => {
                self.items.push(item);
                true
            }
        }
    }

    fn remove(&mut self, item: &T) -> bool {
        // Delete events may carry a stale copy; fall back to a full-value match.
        let position = self
            .items
            .iter()
            .position(|existing| existing.id() == item.id())
            .or_else(|| self.items.iter().position(|existing| existing == item));

        match position {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Fold `events` over `initial`, yielding the seed snapshot first and then a
/// new snapshot after every event that actually changed the set.
pub fn reconcile<T, S>(initial: Vec<T>, events: S) -> impl Stream<Item = Snapshot<T>> + Send
where
    T: Resource,
    S: Stream<Item = ResourceEvent<T>> + Send,
{
    let mut set = ResourceSet::new(initial);
    let seed = set.snapshot();

    stream::once(ready(seed)).chain(events.filter_map(move |event| {
        let changed = set.apply(event);
        ready(changed.then(|| set.snapshot()))
    }))
}
