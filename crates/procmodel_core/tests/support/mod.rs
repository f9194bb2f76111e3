//! Shared test doubles.
#![allow(dead_code)]

use async_trait::async_trait;
use procmodel_core::authority::AuthorityResult;
use procmodel_core::{
    Caller, InMemoryAuthority, PageOptions, Permission, PermissionAuthority, ProcessDocument,
    ProcessRepository, ResourcePermissions, TopicRegistration,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Delegates to an in-memory authority and interleaves scripted events with
/// its calls, standing in for concurrent consumers and slow networks.
pub struct ScriptedAuthority {
    pub inner: Arc<InMemoryAuthority>,
    /// Signalled when a gated admin listing starts.
    pub entered: Notify,
    /// Lets a gated admin listing continue.
    pub release: Notify,
    gate_listing: AtomicBool,
    revoke_after_first_page: Mutex<Option<String>>,
    store_before_remove: Mutex<Option<(Arc<dyn ProcessRepository>, ProcessDocument)>>,
    dropped_grants: AtomicUsize,
}

impl ScriptedAuthority {
    pub fn new(inner: Arc<InMemoryAuthority>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
            gate_listing: AtomicBool::new(false),
            revoke_after_first_page: Mutex::new(None),
            store_before_remove: Mutex::new(None),
            dropped_grants: AtomicUsize::new(0),
        }
    }

    /// Parks the next admin listing until `release` is notified.
    pub fn gate_next_listing(self) -> Self {
        self.gate_listing.store(true, Ordering::SeqCst);
        self
    }

    /// Removes the grant on `id` right after the first page has been served.
    pub fn revoke_after_first_page(self, id: &str) -> Self {
        *self.revoke_after_first_page.lock().unwrap() = Some(id.to_string());
        self
    }

    /// Stores `document` just before the next grant removal reaches the inner authority.
    pub fn store_before_remove(
        self,
        repo: Arc<dyn ProcessRepository>,
        document: ProcessDocument,
    ) -> Self {
        *self.store_before_remove.lock().unwrap() = Some((repo, document));
        self
    }

    /// Acknowledges the next `count` grant writes without applying them.
    pub fn drop_grants(self, count: usize) -> Self {
        self.dropped_grants.store(count, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl PermissionAuthority for ScriptedAuthority {
    async fn set_topic(&self, registration: &TopicRegistration) -> AuthorityResult<()> {
        self.inner.set_topic(registration).await
    }

    async fn check_permission(
        &self,
        caller: &Caller,
        topic: &str,
        id: &str,
        permission: Permission,
    ) -> AuthorityResult<bool> {
        self.inner
            .check_permission(caller, topic, id, permission)
            .await
    }

    async fn check_multiple_permissions(
        &self,
        caller: &Caller,
        topic: &str,
        ids: &[String],
        permission: Permission,
    ) -> AuthorityResult<BTreeMap<String, bool>> {
        self.inner
            .check_multiple_permissions(caller, topic, ids, permission)
            .await
    }

    async fn list_accessible_resource_ids(
        &self,
        caller: &Caller,
        topic: &str,
        page: PageOptions,
        permission: Permission,
    ) -> AuthorityResult<Vec<String>> {
        self.inner
            .list_accessible_resource_ids(caller, topic, page, permission)
            .await
    }

    async fn admin_list_resource_ids(
        &self,
        topic: &str,
        page: PageOptions,
    ) -> AuthorityResult<Vec<String>> {
        if self.gate_listing.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let ids = self.inner.admin_list_resource_ids(topic, page).await?;
        if page.offset == 0 {
            let revoked = self.revoke_after_first_page.lock().unwrap().take();
            if let Some(id) = revoked {
                self.inner.remove_resource(topic, &id).await?;
            }
        }
        Ok(ids)
    }

    async fn get_resource(
        &self,
        topic: &str,
        id: &str,
    ) -> AuthorityResult<Option<ResourcePermissions>> {
        self.inner.get_resource(topic, id).await
    }

    async fn set_permission(
        &self,
        topic: &str,
        id: &str,
        permissions: &ResourcePermissions,
    ) -> AuthorityResult<()> {
        let dropped = self
            .dropped_grants
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dropped {
            return Ok(());
        }
        self.inner.set_permission(topic, id, permissions).await
    }

    async fn remove_resource(&self, topic: &str, id: &str) -> AuthorityResult<()> {
        let pending = self.store_before_remove.lock().unwrap().take();
        if let Some((repo, document)) = pending {
            repo.upsert_process(&document).unwrap();
        }
        self.inner.remove_resource(topic, id).await
    }
}
