//! Typed attachments.
//!
//! An [`Attachments`] store maps process-wide key constants to values. Keys
//! carry their value type, so `get` and `put` are statically typed even
//! though the store itself is type-erased:
//!
//! ```
//! use deploy_core::{AttachmentKey, Attachments, ListKey};
//!
//! static RUNTIME_NAME: AttachmentKey<String> = AttachmentKey::new("runtime-name");
//! static RESOURCE_ROOTS: ListKey<String> = ListKey::new("resource-roots");
//!
//! let attachments = Attachments::new();
//! attachments.put(&RUNTIME_NAME, "app.war".to_string());
//! attachments.add_to_list(&RESOURCE_ROOTS, "WEB-INF/classes".to_string());
//!
//! assert_eq!(attachments.get(&RUNTIME_NAME).as_deref().map(String::as_str), Some("app.war"));
//! assert_eq!(attachments.get_list(&RESOURCE_ROOTS).len(), 1);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::error::{CoreError, Result};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Per-key identity, drawn from a process-wide counter on first use.
/// Zero means not yet assigned.
struct KeyIdentity(AtomicU64);

impl KeyIdentity {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn get(&self) -> u64 {
        let current = self.0.load(Ordering::Acquire);
        if current != 0 {
            return current;
        }
        let fresh = NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed);
        match self
            .0
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(assigned) => assigned,
        }
    }
}

/// Slot identity. Two key declarations never share a slot, even when their
/// names and value types agree; the name is kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct KeyId {
    id: u64,
    name: &'static str,
    list: bool,
}

/// Names a single-valued attachment slot holding a `T`.
///
/// Keys are compared by identity: every declaration is its own slot. Keys are
/// neither `Clone` nor `Copy`; pass them by reference.
pub struct AttachmentKey<T> {
    name: &'static str,
    identity: KeyIdentity,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AttachmentKey<T> {
    /// Declare a key. Intended for `static` items; an empty name is rejected
    /// at compile time when evaluated in a const context.
    pub const fn new(name: &'static str) -> Self {
        assert!(!name.is_empty(), "attachment key name must not be empty");
        Self {
            name,
            identity: KeyIdentity::new(),
            _marker: PhantomData,
        }
    }

    /// Runtime variant of [`AttachmentKey::new`].
    pub fn try_new(name: &'static str) -> Result<Self> {
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "attachment key name must not be empty".to_string(),
            ));
        }
        Ok(Self::new(name))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> KeyId {
        KeyId {
            id: self.identity.get(),
            name: self.name,
            list: false,
        }
    }
}

/// Names a list-valued attachment slot whose elements are `T`.
pub struct ListKey<T> {
    name: &'static str,
    identity: KeyIdentity,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> ListKey<T> {
    pub const fn new(name: &'static str) -> Self {
        assert!(!name.is_empty(), "attachment key name must not be empty");
        Self {
            name,
            identity: KeyIdentity::new(),
            _marker: PhantomData,
        }
    }

    pub fn try_new(name: &'static str) -> Result<Self> {
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "attachment key name must not be empty".to_string(),
            ));
        }
        Ok(Self::new(name))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> KeyId {
        KeyId {
            id: self.identity.get(),
            name: self.name,
            list: true,
        }
    }
}

impl<T> fmt::Debug for AttachmentKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentKey({})", self.name)
    }
}

impl<T> fmt::Debug for ListKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListKey({})", self.name)
    }
}

enum Slot {
    Value(Arc<dyn Any + Send + Sync>),
    List(Box<dyn Any + Send + Sync>),
}

/// Thread-safe typed key/value store.
///
/// Every operation takes the store's lock once, so operations on the same
/// instance are atomic with respect to each other.
#[derive(Default)]
pub struct Attachments {
    slots: RwLock<HashMap<KeyId, Slot>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> Option<Arc<T>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&key.id()) {
            Some(Slot::Value(value)) => downcast_value(key.name, value.clone()),
            _ => None,
        }
    }

    pub fn contains<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key.id())
    }

    /// Store `value`, returning the value it replaced.
    pub fn put<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: T,
    ) -> Option<Arc<T>> {
        self.put_arc(key, Arc::new(value))
    }

    pub fn put_arc<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: Arc<T>,
    ) -> Option<Arc<T>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.insert(key.id(), Slot::Value(value)) {
            Some(Slot::Value(previous)) => downcast_value(key.name, previous),
            _ => None,
        }
    }

    /// `put` for optional values; `None` removes the slot.
    pub fn put_opt<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: Option<T>,
    ) -> Option<Arc<T>> {
        match value {
            Some(value) => self.put(key, value),
            None => self.remove(key),
        }
    }

    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> Option<Arc<T>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.remove(&key.id()) {
            Some(Slot::Value(previous)) => downcast_value(key.name, previous),
            _ => None,
        }
    }

    /// The list stored under `key`, in insertion order; empty if absent.
    pub fn get_list<T: Clone + Send + Sync + 'static>(&self, key: &ListKey<T>) -> Vec<T> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&key.id()) {
            Some(Slot::List(list)) => match list.downcast_ref::<Vec<T>>() {
                Some(list) => list.clone(),
                None => {
                    warn!(key = key.name, "Attachment list holds an unexpected type");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        }
    }

    /// Append `value` without disturbing existing entries.
    pub fn add_to_list<T: Clone + Send + Sync + 'static>(&self, key: &ListKey<T>, value: T) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(key.id())
            .or_insert_with(|| Slot::List(Box::new(Vec::<T>::new())));
        match slot {
            Slot::List(list) => match list.downcast_mut::<Vec<T>>() {
                Some(list) => list.push(value),
                None => warn!(key = key.name, "Attachment list holds an unexpected type"),
            },
            Slot::Value(_) => warn!(key = key.name, "Attachment slot is not a list"),
        }
    }

    pub fn remove_list<T: Clone + Send + Sync + 'static>(&self, key: &ListKey<T>) -> Vec<T> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.remove(&key.id()) {
            Some(Slot::List(list)) => list.downcast::<Vec<T>>().map(|l| *l).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Names of every populated slot, sorted. Diagnostics only.
    pub fn names(&self) -> Vec<&'static str> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = slots.keys().map(|id| id.name).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every attachment.
    pub fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachments")
            .field("names", &self.names())
            .finish()
    }
}

fn downcast_value<T: Send + Sync + 'static>(
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
) -> Option<Arc<T>> {
    match value.downcast::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = name, "Attachment holds an unexpected type");
            None
        }
    }
}

/// Anything that carries an [`Attachments`] store.
///
/// Implementors only provide [`Attachable::attachments`]; the remaining
/// methods forward to the store.
pub trait Attachable {
    fn attachments(&self) -> &Attachments;

    fn get_attachment<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> Option<Arc<T>> {
        self.attachments().get(key)
    }

    fn has_attachment<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> bool {
        self.attachments().contains(key)
    }

    fn put_attachment<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: T,
    ) -> Option<Arc<T>> {
        self.attachments().put(key, value)
    }

    fn remove_attachment<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
    ) -> Option<Arc<T>> {
        self.attachments().remove(key)
    }

    fn get_attachment_list<T: Clone + Send + Sync + 'static>(&self, key: &ListKey<T>) -> Vec<T> {
        self.attachments().get_list(key)
    }

    fn add_to_attachment_list<T: Clone + Send + Sync + 'static>(&self, key: &ListKey<T>, value: T) {
        self.attachments().add_to_list(key, value)
    }
}

impl Attachable for Attachments {
    fn attachments(&self) -> &Attachments {
        self
    }
}
