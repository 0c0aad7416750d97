//! In-memory mirror of server-side objects, keyed by schema class.
//!
//! The store tracks what the client believes exists on the server so
//! later tests can reference earlier objects and GET responses can be
//! cross-validated. A plan holds one store; each suite runs against an
//! empty clone typed by the same schemas.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::spec::{SchemaRef, Spec};
use crate::values::interface_equals;

/// Match predicate applied to `(criteria, candidate)` pairs.
pub type Matcher = fn(&JsonValue, &JsonValue) -> bool;

/// Accepts every candidate; used for random picks.
pub fn match_always(_criteria: &JsonValue, _candidate: &JsonValue) -> bool {
    true
}

/// Associated-object constraints: class name to criteria that some stored
/// object of that class must satisfy.
pub type Assoc = BTreeMap<String, JsonValue>;

/// A store shared between a suite and its concurrently running fuzz
/// variants.
pub type SharedStore = Arc<Mutex<DataStore>>;

/// Locks a shared store, recovering from a poisoned mutex.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, DataStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, Default)]
pub struct DataStore {
    schemas: BTreeMap<String, SchemaRef>,
    objects: BTreeMap<String, Vec<JsonValue>>,
}

impl DataStore {
    /// An empty store typed by the document's named schemas.
    pub fn new(spec: &Spec) -> DataStore {
        DataStore {
            schemas: spec.schemas(),
            objects: BTreeMap::new(),
        }
    }

    /// An empty store with the same schema typing, for suite isolation.
    pub fn clone_schema(&self) -> DataStore {
        DataStore {
            schemas: self.schemas.clone(),
            objects: BTreeMap::new(),
        }
    }

    pub fn schema(&self, class: &str) -> Option<&SchemaRef> {
        self.schemas.get(class)
    }

    pub fn count(&self, class: &str) -> usize {
        self.objects.get(class).map(Vec::len).unwrap_or(0)
    }

    fn assoc_satisfied(&self, assoc: Option<&Assoc>) -> bool {
        let Some(assoc) = assoc else {
            return true;
        };
        assoc.iter().all(|(class, criteria)| {
            self.objects
                .get(class)
                .is_some_and(|entries| entries.iter().any(|entry| interface_equals(criteria, entry)))
        })
    }

    pub fn insert(&mut self, class: &str, object: JsonValue, assoc: Option<&Assoc>) -> Result<()> {
        if !self.schemas.contains_key(class) {
            return Err(Error::not_found(format!("unknown class: {class}")));
        }
        if !self.assoc_satisfied(assoc) {
            return Err(Error::not_found(format!(
                "association objects missing for class {class}"
            )));
        }
        self.objects.entry(class.to_string()).or_default().push(object);
        Ok(())
    }

    /// Returns up to `limit` matching objects; `limit < 0` means all.
    pub fn find(
        &self,
        class: &str,
        criteria: Option<&JsonValue>,
        assoc: Option<&Assoc>,
        matcher: Matcher,
        limit: isize,
    ) -> Vec<JsonValue> {
        if limit == 0 || !self.assoc_satisfied(assoc) {
            return Vec::new();
        }
        let mut found = Vec::new();
        for entry in self.objects.get(class).into_iter().flatten() {
            if criteria.is_none_or(|criteria| matcher(criteria, entry)) {
                found.push(entry.clone());
                if limit > 0 && found.len() as isize >= limit {
                    break;
                }
            }
        }
        found
    }

    /// Updates at most `limit` matching objects. With `patch` the new
    /// values overlay the old (maps merge, arrays replace); without, they
    /// replace the stored object. Returns the number updated.
    pub fn update(
        &mut self,
        class: &str,
        criteria: Option<&JsonValue>,
        assoc: Option<&Assoc>,
        matcher: Matcher,
        new_values: &JsonValue,
        limit: isize,
        patch: bool,
    ) -> usize {
        if limit == 0 || !self.assoc_satisfied(assoc) {
            return 0;
        }
        let mut updated = 0;
        for entry in self.objects.get_mut(class).into_iter().flatten() {
            if !criteria.is_none_or(|criteria| matcher(criteria, entry)) {
                continue;
            }
            *entry = if patch {
                crate::values::deep_merge(entry, new_values)
            } else {
                new_values.clone()
            };
            updated += 1;
            if limit > 0 && updated as isize >= limit {
                break;
            }
        }
        updated
    }

    /// Removes at most `limit` matching objects, returning the count.
    pub fn delete(
        &mut self,
        class: &str,
        criteria: Option<&JsonValue>,
        assoc: Option<&Assoc>,
        matcher: Matcher,
        limit: isize,
    ) -> usize {
        if limit == 0 || !self.assoc_satisfied(assoc) {
            return 0;
        }
        let Some(entries) = self.objects.get_mut(class) else {
            return 0;
        };
        let mut deleted = 0;
        entries.retain(|entry| {
            if (limit < 0 || (deleted as isize) < limit)
                && criteria.is_none_or(|criteria| matcher(criteria, entry))
            {
                deleted += 1;
                false
            } else {
                true
            }
        });
        deleted
    }

    /// Best-effort reverse lookup of the class whose schema validates the
    /// object. Ties resolve to the lexicographically first schema name.
    pub fn find_matching_schema(
        &self,
        object: &JsonValue,
        spec: &Spec,
    ) -> Option<(String, SchemaRef)> {
        for (name, schema) in &self.schemas {
            if schema.properties().is_none() && schema.ref_path().is_none() {
                continue;
            }
            if schema.matches(object, spec) {
                return Some((name.clone(), schema.clone()));
            }
        }
        None
    }
}
