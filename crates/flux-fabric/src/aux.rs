//! Ordered key→value attachments for host objects.
//!
//! Handles, futures, watchers and plugins all carry one of these so callers
//! can hang arbitrary state off them. Keyed entries live at the head of the
//! list; anonymous entries are appended to the tail and are invisible to
//! lookups; they exist only to be dropped with the container. Lookups stop
//! at the first keyless item.
use std::any::Any;

use crate::errno::Errno;

struct AuxItem {
    key: Option<String>,
    val: Box<dyn Any>,
}

/// An ordered sequence of `(key, value)` attachments.
#[derive(Default)]
pub struct Aux {
    items: Vec<AuxItem>,
}

impl Aux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `val` under `key`, dropping any existing value first.
    pub fn set<T: Any>(&mut self, key: &str, val: T) {
        self.remove(key);
        self.items.insert(
            0,
            AuxItem {
                key: Some(key.to_owned()),
                val: Box::new(val),
            },
        );
    }

    /// Append an anonymous value, dropped only at container teardown.
    pub fn append<T: Any>(&mut self, val: T) {
        self.items.push(AuxItem {
            key: None,
            val: Box::new(val),
        });
    }

    /// Look up `key`.
    ///
    /// Fails with `ENOENT` when absent or stored under a different type.
    pub fn get<T: Any>(&self, key: &str) -> Result<&T, Errno> {
        for item in &self.items {
            match &item.key {
                None => break,
                Some(k) if k == key => {
                    return item.val.downcast_ref::<T>().ok_or(Errno::ENOENT);
                }
                Some(_) => {}
            }
        }
        Err(Errno::ENOENT)
    }

    /// Remove the entry under `key`, running its destructor. Returns whether
    /// an entry was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        for (i, item) in self.items.iter().enumerate() {
            match &item.key {
                None => break,
                Some(k) if k == key => {
                    self.items.remove(i);
                    return true;
                }
                Some(_) => {}
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for Aux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self
            .items
            .iter()
            .map(|i| i.key.as_deref().unwrap_or("<anon>"))
            .collect();
        f.debug_struct("Aux").field("keys", &keys).finish()
    }
}
