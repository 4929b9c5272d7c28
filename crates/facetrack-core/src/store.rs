//! Enrolled embeddings per identity.

use crate::types::{Embedding, Enrollment, EnrollmentId, IdentityId, VectorError, VectorOrigin};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Storage of enrollments, shared across scan sessions.
///
/// Implementations serialize writes so that two concurrent enrollments for
/// the same identity both land.
pub trait VectorStore: Send + Sync {
    /// Dimensionality every stored embedding must have.
    fn dimension(&self) -> usize;

    /// Validate and store a new enrollment.
    fn add(&self, identity: IdentityId, embedding: Embedding) -> Result<Enrollment, StoreError>;

    /// Remove an enrollment. Returns `false` if it did not exist.
    fn remove(&self, enrollment: EnrollmentId) -> Result<bool, StoreError>;

    fn list_by_identity(&self, identity: IdentityId) -> Result<Vec<Enrollment>, StoreError>;

    /// Bulk lookup in one pass. Every requested identity is present in the
    /// result, with an empty list if it has no enrollments.
    fn list_by_identities(
        &self,
        identities: &[IdentityId],
    ) -> Result<HashMap<IdentityId, Vec<Enrollment>>, StoreError>;
}

/// Build an enrollment after checking it against the store dimension.
pub fn new_enrollment(
    dimension: usize,
    identity: IdentityId,
    embedding: Embedding,
) -> Result<Enrollment, VectorError> {
    embedding.validate(dimension, VectorOrigin::Ingest { identity })?;
    Ok(Enrollment {
        id: EnrollmentId::new(),
        identity,
        embedding,
        created_at: Utc::now(),
    })
}

#[derive(Default)]
struct MemoryInner {
    by_identity: HashMap<IdentityId, Vec<Enrollment>>,
    owners: HashMap<EnrollmentId, IdentityId>,
}

impl MemoryInner {
    fn insert(&mut self, enrollment: Enrollment) {
        self.owners.insert(enrollment.id, enrollment.identity);
        self.by_identity
            .entry(enrollment.identity)
            .or_default()
            .push(enrollment);
    }
}

/// In-memory store guarded by a single `RwLock`.
pub struct MemoryStore {
    dimension: usize,
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Hydrate from enrollments exported by a backing store. Every record is
    /// validated; the first corrupt one aborts the load.
    pub fn load<I>(dimension: usize, enrollments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = Enrollment>,
    {
        let mut inner = MemoryInner::default();
        for e in enrollments {
            e.embedding.validate(
                dimension,
                VectorOrigin::Enrollment {
                    identity: e.identity,
                    enrollment: e.id,
                },
            )?;
            if !inner.owners.contains_key(&e.id) {
                inner.insert(e);
            }
        }
        tracing::info!(
            identities = inner.by_identity.len(),
            enrollments = inner.owners.len(),
            "loaded enrollments into memory"
        );
        Ok(Self {
            dimension,
            inner: RwLock::new(inner),
        })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().map_err(poisoned)?.owners.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

impl VectorStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn add(&self, identity: IdentityId, embedding: Embedding) -> Result<Enrollment, StoreError> {
        let enrollment = new_enrollment(self.dimension, identity, embedding)?;
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.insert(enrollment.clone());
        tracing::info!(identity = %identity, enrollment = %enrollment.id, "enrollment added");
        Ok(enrollment)
    }

    fn remove(&self, enrollment: EnrollmentId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let Some(identity) = inner.owners.remove(&enrollment) else {
            tracing::debug!(enrollment = %enrollment, "remove: no such enrollment");
            return Ok(false);
        };
        if let Some(list) = inner.by_identity.get_mut(&identity) {
            list.retain(|e| e.id != enrollment);
            if list.is_empty() {
                inner.by_identity.remove(&identity);
            }
        }
        tracing::info!(identity = %identity, enrollment = %enrollment, "enrollment removed");
        Ok(true)
    }

    fn list_by_identity(&self, identity: IdentityId) -> Result<Vec<Enrollment>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.by_identity.get(&identity).cloned().unwrap_or_default())
    }

    fn list_by_identities(
        &self,
        identities: &[IdentityId],
    ) -> Result<HashMap<IdentityId, Vec<Enrollment>>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(identities
            .iter()
            .map(|id| (*id, inner.by_identity.get(id).cloned().unwrap_or_default()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_add_and_list() {
        let store = MemoryStore::new(3);
        let a = store.add(IdentityId(1), emb(&[1.0, 0.0, 0.0])).unwrap();
        store.add(IdentityId(1), emb(&[0.9, 0.1, 0.0])).unwrap();
        store.add(IdentityId(2), emb(&[0.0, 1.0, 0.0])).unwrap();

        let list = store.list_by_identity(IdentityId(1)).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|e| e.id == a.id));
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_add_dimension_mismatch_leaves_store_unchanged() {
        let store = MemoryStore::new(3);
        store.add(IdentityId(1), emb(&[1.0, 0.0, 0.0])).unwrap();

        let err = store.add(IdentityId(1), emb(&[1.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Vector(VectorError::DimensionMismatch { got: 2, want: 3, .. })
        ));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.list_by_identity(IdentityId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_add_rejects_non_finite() {
        let store = MemoryStore::new(2);
        let err = store.add(IdentityId(1), emb(&[f32::INFINITY, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Vector(VectorError::InvalidVector { index: 0, .. })
        ));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = MemoryStore::new(2);
        let e = store.add(IdentityId(1), emb(&[1.0, 0.0])).unwrap();
        assert!(store.remove(e.id).unwrap());
        assert!(!store.remove(e.id).unwrap());
        assert!(!store.remove(EnrollmentId::new()).unwrap());
        assert!(store.list_by_identity(IdentityId(1)).unwrap().is_empty());
    }

    #[test]
    fn test_list_by_identities_includes_unenrolled() {
        let store = MemoryStore::new(2);
        store.add(IdentityId(1), emb(&[1.0, 0.0])).unwrap();
        store.add(IdentityId(2), emb(&[0.0, 1.0])).unwrap();
        store.add(IdentityId(2), emb(&[0.5, 0.5])).unwrap();

        let ids = [IdentityId(1), IdentityId(2), IdentityId(3)];
        let map = store.list_by_identities(&ids).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&IdentityId(1)].len(), 1);
        assert_eq!(map[&IdentityId(2)].len(), 2);
        assert!(map[&IdentityId(3)].is_empty());
    }

    #[test]
    fn test_load_validates_records() {
        let good = new_enrollment(2, IdentityId(1), emb(&[1.0, 0.0])).unwrap();
        let mut bad = new_enrollment(2, IdentityId(2), emb(&[0.0, 1.0])).unwrap();
        bad.embedding.values.push(0.5);
        let bad_id = bad.id;

        let err = MemoryStore::load(2, vec![good.clone(), bad]).err().unwrap();
        match err {
            StoreError::Vector(VectorError::DimensionMismatch { origin, .. }) => {
                assert_eq!(
                    origin,
                    VectorOrigin::Enrollment {
                        identity: IdentityId(2),
                        enrollment: bad_id
                    }
                );
            }
            other => panic!("unexpected error: {other}"),
        }

        let store = MemoryStore::load(2, vec![good.clone(), good]).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_adds_for_same_identity() {
        let store = Arc::new(MemoryStore::new(2));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .add(IdentityId(42), emb(&[i as f32, 1.0]))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.list_by_identity(IdentityId(42)).unwrap().len(), 8);
    }

    #[test]
    fn test_poisoned_lock_is_an_error() {
        let store = Arc::new(MemoryStore::new(2));
        let writer = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = writer.inner.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(matches!(store.len(), Err(StoreError::Backend(_))));
        assert!(store.is_empty().is_err());
        assert!(store.add(IdentityId(1), emb(&[1.0, 0.0])).is_err());
    }
}
