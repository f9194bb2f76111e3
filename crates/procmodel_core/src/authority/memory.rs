//! In-process permission authority.
//!
//! Backs tests and single-node embeddings. Behaves like the remote authority
//! for the calls the core makes: grants are keyed by `(topic, id)` and writes
//! to unregistered topics are rejected.

use super::{AuthorityError, AuthorityResult, PermissionAuthority};
use crate::model::caller::Caller;
use crate::model::permission::{PageOptions, Permission, ResourcePermissions, TopicRegistration};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct AuthorityState {
    topics: BTreeSet<String>,
    resources: BTreeMap<String, BTreeMap<String, ResourcePermissions>>,
}

/// Thread-safe in-memory authority with failure injection.
#[derive(Default)]
pub struct InMemoryAuthority {
    state: Mutex<AuthorityState>,
    unavailable: AtomicBool,
    failures_remaining: AtomicU64,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: u64) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Ids with a grant entry under `topic`.
    pub fn resource_ids(&self, topic: &str) -> BTreeSet<String> {
        self.lock()
            .map(|state| {
                state
                    .resources
                    .get(topic)
                    .map(|resources| resources.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn is_topic_registered(&self, topic: &str) -> bool {
        self.lock()
            .map(|state| state.topics.contains(topic))
            .unwrap_or(false)
    }

    fn lock(&self) -> AuthorityResult<MutexGuard<'_, AuthorityState>> {
        self.state
            .lock()
            .map_err(|_| AuthorityError::Unavailable("authority state lock poisoned".to_string()))
    }

    /// Applies injected failures before touching state.
    fn guard(&self) -> AuthorityResult<MutexGuard<'_, AuthorityState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthorityError::Unavailable("injected outage".to_string()));
        }
        let consumed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if consumed {
            return Err(AuthorityError::Unavailable("injected failure".to_string()));
        }
        self.lock()
    }
}

fn caller_allowed(
    permissions: &ResourcePermissions,
    caller: &Caller,
    permission: Permission,
) -> bool {
    caller.is_admin()
        || permissions.allows(&caller.user_id, &caller.groups, &caller.roles, permission)
}

fn paginate(ids: impl Iterator<Item = String>, page: PageOptions) -> Vec<String> {
    let skipped = ids.skip(usize::try_from(page.offset).unwrap_or(usize::MAX));
    if page.limit == 0 {
        skipped.collect()
    } else {
        skipped
            .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
            .collect()
    }
}

#[async_trait]
impl PermissionAuthority for InMemoryAuthority {
    async fn set_topic(&self, registration: &TopicRegistration) -> AuthorityResult<()> {
        let mut state = self.guard()?;
        state.topics.insert(registration.id.clone());
        Ok(())
    }

    async fn check_permission(
        &self,
        caller: &Caller,
        topic: &str,
        id: &str,
        permission: Permission,
    ) -> AuthorityResult<bool> {
        let state = self.guard()?;
        Ok(state
            .resources
            .get(topic)
            .and_then(|resources| resources.get(id))
            .is_some_and(|permissions| caller_allowed(permissions, caller, permission)))
    }

    async fn check_multiple_permissions(
        &self,
        caller: &Caller,
        topic: &str,
        ids: &[String],
        permission: Permission,
    ) -> AuthorityResult<BTreeMap<String, bool>> {
        let state = self.guard()?;
        let resources = state.resources.get(topic);
        Ok(ids
            .iter()
            .map(|id| {
                let allowed = resources
                    .and_then(|resources| resources.get(id))
                    .is_some_and(|permissions| caller_allowed(permissions, caller, permission));
                (id.clone(), allowed)
            })
            .collect())
    }

    async fn list_accessible_resource_ids(
        &self,
        caller: &Caller,
        topic: &str,
        page: PageOptions,
        permission: Permission,
    ) -> AuthorityResult<Vec<String>> {
        let state = self.guard()?;
        let Some(resources) = state.resources.get(topic) else {
            return Ok(Vec::new());
        };
        let accessible = resources
            .iter()
            .filter(|(_, permissions)| caller_allowed(permissions, caller, permission))
            .map(|(id, _)| id.clone());
        Ok(paginate(accessible, page))
    }

    async fn admin_list_resource_ids(
        &self,
        topic: &str,
        page: PageOptions,
    ) -> AuthorityResult<Vec<String>> {
        let state = self.guard()?;
        if !state.topics.contains(topic) {
            return Err(AuthorityError::UnknownTopic(topic.to_string()));
        }
        let ids = state
            .resources
            .get(topic)
            .map(|resources| resources.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(paginate(ids.into_iter(), page))
    }

    async fn get_resource(
        &self,
        topic: &str,
        id: &str,
    ) -> AuthorityResult<Option<ResourcePermissions>> {
        let state = self.guard()?;
        Ok(state
            .resources
            .get(topic)
            .and_then(|resources| resources.get(id))
            .cloned())
    }

    async fn set_permission(
        &self,
        topic: &str,
        id: &str,
        permissions: &ResourcePermissions,
    ) -> AuthorityResult<()> {
        let mut state = self.guard()?;
        if !state.topics.contains(topic) {
            return Err(AuthorityError::UnknownTopic(topic.to_string()));
        }
        state
            .resources
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string(), permissions.clone());
        Ok(())
    }

    async fn remove_resource(&self, topic: &str, id: &str) -> AuthorityResult<()> {
        let mut state = self.guard()?;
        if let Some(resources) = state.resources.get_mut(topic) {
            resources.remove(id);
        }
        Ok(())
    }
}
