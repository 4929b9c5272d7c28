//! Candidate set assembly for a scan scope.

use crate::store::{StoreError, VectorStore};
use crate::types::{Candidate, EnrollmentId, IdentityId, Scope};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("resolving roster: {0}")]
    Roster(#[from] RosterError),
    #[error("loading enrollments: {0}")]
    Store(#[from] StoreError),
}

/// Resolves a scope to the identities that belong to it.
pub trait RosterSource: Send + Sync {
    fn members(&self, scope: &Scope) -> Result<Vec<IdentityId>, RosterError>;
}

/// Roster held in memory. Unknown scopes have no members.
#[derive(Default)]
pub struct MemoryRoster {
    scopes: RwLock<HashMap<Scope, Vec<IdentityId>>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, scope: &Scope, identity: IdentityId) -> Result<(), RosterError> {
        let mut scopes = self.scopes.write().map_err(poisoned)?;
        let members = scopes.entry(scope.clone()).or_default();
        if !members.contains(&identity) {
            members.push(identity);
        }
        Ok(())
    }

    pub fn remove_member(&self, scope: &Scope, identity: IdentityId) -> Result<bool, RosterError> {
        let mut scopes = self.scopes.write().map_err(poisoned)?;
        let Some(members) = scopes.get_mut(scope) else {
            return Ok(false);
        };
        let before = members.len();
        members.retain(|m| *m != identity);
        Ok(members.len() != before)
    }
}

fn poisoned<T>(_: T) -> RosterError {
    RosterError::Backend("roster lock poisoned".into())
}

impl RosterSource for MemoryRoster {
    fn members(&self, scope: &Scope) -> Result<Vec<IdentityId>, RosterError> {
        let scopes = self.scopes.read().map_err(poisoned)?;
        Ok(scopes.get(scope).cloned().unwrap_or_default())
    }
}

/// Candidate set for one scan session, fixed at build time.
///
/// Enrollments added after `built_at` are not visible until the next build.
#[derive(Debug, Clone)]
pub struct Gallery {
    scope: Scope,
    members: Vec<IdentityId>,
    candidates: Vec<Candidate>,
    unenrolled: Vec<IdentityId>,
    built_at: DateTime<Utc>,
}

impl Gallery {
    /// An empty gallery, for scans that proceed with nothing to match against.
    pub fn empty(scope: Scope) -> Self {
        Self {
            scope,
            members: Vec::new(),
            candidates: Vec::new(),
            unenrolled: Vec::new(),
            built_at: Utc::now(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Deduplicated roster members, in roster order.
    pub fn members(&self) -> &[IdentityId] {
        &self.members
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Members with no enrolled face data.
    pub fn unenrolled(&self) -> &[IdentityId] {
        &self.unenrolled
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Number of distinct identities that can be matched.
    pub fn identity_count(&self) -> usize {
        self.members.len() - self.unenrolled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Assembles galleries from a roster and a vector store.
pub struct GalleryBuilder<'a> {
    roster: &'a dyn RosterSource,
    store: &'a dyn VectorStore,
}

impl<'a> GalleryBuilder<'a> {
    pub fn new(roster: &'a dyn RosterSource, store: &'a dyn VectorStore) -> Self {
        Self { roster, store }
    }

    pub fn build(&self, scope: &Scope) -> Result<Gallery, GalleryError> {
        let mut seen = HashSet::new();
        let members: Vec<IdentityId> = self
            .roster
            .members(scope)?
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let mut enrollments = self.store.list_by_identities(&members)?;

        let mut candidates = Vec::new();
        let mut unenrolled = Vec::new();
        let mut seen_enrollments: HashSet<EnrollmentId> = HashSet::new();
        let mut versions: BTreeSet<Option<String>> = BTreeSet::new();

        for id in &members {
            let list = enrollments.remove(id).unwrap_or_default();
            let before = candidates.len();
            for e in list {
                if e.identity != *id || !seen_enrollments.insert(e.id) {
                    continue;
                }
                versions.insert(e.embedding.model_version.clone());
                candidates.push(Candidate::from(e));
            }
            if candidates.len() == before {
                unenrolled.push(*id);
            }
        }

        if versions.len() > 1 {
            tracing::warn!(
                scope = %scope,
                versions = ?versions,
                "gallery mixes embeddings from different model versions"
            );
        }
        if !unenrolled.is_empty() {
            tracing::warn!(
                scope = %scope,
                count = unenrolled.len(),
                "identities have no registered face data"
            );
        }
        tracing::info!(
            scope = %scope,
            members = members.len(),
            candidates = candidates.len(),
            unenrolled = unenrolled.len(),
            "gallery built"
        );

        Ok(Gallery {
            scope: scope.clone(),
            members,
            candidates,
            unenrolled,
            built_at: Utc::now(),
        })
    }
}
