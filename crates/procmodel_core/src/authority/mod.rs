//! Permission authority client contract.
//!
//! # Responsibility
//! - Define the narrow capability set the core consumes from the external
//!   permission authority.
//! - Provide the paging helper the reconciler uses to read the full resource set.
//!
//! # Invariants
//! - User-scope calls carry the caller's credential; admin-scope calls use the
//!   client's own internal credential.
//! - `remove_resource` on an unknown id succeeds.

use crate::model::caller::Caller;
use crate::model::permission::{PageOptions, Permission, ResourcePermissions, TopicRegistration};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod http;
pub mod memory;

pub use http::HttpPermissionAuthority;
pub use memory::InMemoryAuthority;

pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Failure talking to the permission authority.
#[derive(Debug)]
pub enum AuthorityError {
    Transport(reqwest::Error),
    Status { status: u16, message: String },
    Decode(String),
    InvalidUrl(String),
    UnknownTopic(String),
    Unavailable(String),
}

impl Display for AuthorityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "permission authority request failed: {err}"),
            Self::Status { status, message } => {
                write!(f, "permission authority answered {status}: {message}")
            }
            Self::Decode(message) => {
                write!(f, "unable to decode permission authority response: {message}")
            }
            Self::InvalidUrl(message) => write!(f, "invalid permission authority url: {message}"),
            Self::UnknownTopic(topic) => {
                write!(f, "topic `{topic}` is not registered at the permission authority")
            }
            Self::Unavailable(message) => write!(f, "permission authority unavailable: {message}"),
        }
    }
}

impl Error for AuthorityError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AuthorityError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

/// Capability set consumed from the permission authority.
#[async_trait]
pub trait PermissionAuthority: Send + Sync {
    /// Registers the resource kind so the authority accepts grant writes for it.
    async fn set_topic(&self, registration: &TopicRegistration) -> AuthorityResult<()>;

    async fn check_permission(
        &self,
        caller: &Caller,
        topic: &str,
        id: &str,
        permission: Permission,
    ) -> AuthorityResult<bool>;

    async fn check_multiple_permissions(
        &self,
        caller: &Caller,
        topic: &str,
        ids: &[String],
        permission: Permission,
    ) -> AuthorityResult<BTreeMap<String, bool>>;

    async fn list_accessible_resource_ids(
        &self,
        caller: &Caller,
        topic: &str,
        page: PageOptions,
        permission: Permission,
    ) -> AuthorityResult<Vec<String>>;

    /// Admin-scope listing of every resource id under `topic`.
    async fn admin_list_resource_ids(
        &self,
        topic: &str,
        page: PageOptions,
    ) -> AuthorityResult<Vec<String>>;

    /// Returns `None` when the authority has no entry for `id`.
    async fn get_resource(
        &self,
        topic: &str,
        id: &str,
    ) -> AuthorityResult<Option<ResourcePermissions>>;

    async fn set_permission(
        &self,
        topic: &str,
        id: &str,
        permissions: &ResourcePermissions,
    ) -> AuthorityResult<()>;

    async fn remove_resource(&self, topic: &str, id: &str) -> AuthorityResult<()>;
}

/// Reads every resource id of `topic`, page by page.
///
/// Stops at the first page shorter than `page_size`. A `page_size` of zero
/// issues a single unpaged request.
pub async fn collect_all_resource_ids(
    authority: &dyn PermissionAuthority,
    topic: &str,
    page_size: u64,
) -> AuthorityResult<BTreeSet<String>> {
    let mut ids = BTreeSet::new();
    let mut page = PageOptions {
        limit: page_size,
        offset: 0,
    };
    loop {
        let batch = authority.admin_list_resource_ids(topic, page).await?;
        let fetched = batch.len() as u64;
        ids.extend(batch);
        if page_size == 0 || fetched < page_size {
            return Ok(ids);
        }
        page.offset += fetched;
    }
}
