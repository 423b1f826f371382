//! The shared state table: category → field → last-known value.
//!
//! [`StateTable`] is the single writer handle and is owned by the
//! flight-controller link. Readers (the relay's rate sampler, diagnostic
//! dumps) obtain a cloneable [`StateView`] through [`StateTable::view`],
//! which exposes no mutating methods. Every write is last-write-wins per
//! `(category, field)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::value::FieldValue;

type Table = HashMap<String, HashMap<String, FieldValue>>;

/// One detected delta produced by [`StateTable::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    /// `None` when the field had never been seen before.
    pub old: Option<FieldValue>,
    pub new: FieldValue,
}

/// Writer handle for the shared state table.
#[derive(Debug, Default)]
pub struct StateTable {
    inner: Arc<RwLock<Table>>,
}

/// Read-only, cheaply cloneable view of a [`StateTable`].
#[derive(Debug, Clone)]
pub struct StateView {
    inner: Arc<RwLock<Table>>,
}

impl StateTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a read-only view sharing this table's storage.
    pub fn view(&self) -> StateView {
        StateView {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Merge `fields` into `category`, returning every field whose value
    /// differs from the stored one.
    ///
    /// Fields named in `ignore` are neither compared nor stored.
    pub fn apply<I>(&self, category: &str, fields: I, ignore: &[&str]) -> Vec<FieldChange>
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = table.entry(category.to_string()).or_default();

        let mut changes = Vec::new();
        for (field, value) in fields {
            if ignore.contains(&field.as_str()) {
                continue;
            }
            match stored.get_mut(&field) {
                Some(current) if current.same_as(&value) => {}
                Some(current) => {
                    let old = std::mem::replace(current, value.clone());
                    changes.push(FieldChange {
                        field,
                        old: Some(old),
                        new: value,
                    });
                }
                None => {
                    stored.insert(field.clone(), value.clone());
                    changes.push(FieldChange {
                        field,
                        old: None,
                        new: value,
                    });
                }
            }
        }
        changes
    }

    /// Set a single field unconditionally. Returns the change if the value
    /// differed.
    pub fn set(
        &self,
        category: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Option<FieldChange> {
        self.apply(category, [(field.to_string(), value.into())], &[])
            .into_iter()
            .next()
    }

    /// See [`StateView::get`].
    pub fn get(&self, category: &str, field: &str) -> Option<FieldValue> {
        self.view().get(category, field)
    }

    /// Number of categories currently tracked.
    pub fn category_count(&self) -> usize {
        self.view().category_count()
    }
}

impl StateView {
    /// Last-known value of `category.field`, if any.
    pub fn get(&self, category: &str, field: &str) -> Option<FieldValue> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table.get(category).and_then(|c| c.get(field)).cloned()
    }

    /// Copy of every field currently stored under `category`.
    pub fn category(&self, category: &str) -> Option<BTreeMap<String, FieldValue>> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(category)
            .map(|fields| fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Point-in-time copy of the whole table, ordered for stable output.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, FieldValue>> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .map(|(category, fields)| {
                (
                    category.clone(),
                    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )
            })
            .collect()
    }

    /// Number of categories currently tracked.
    pub fn category_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
