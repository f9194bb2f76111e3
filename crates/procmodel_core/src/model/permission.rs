//! Permission vocabulary shared with the permission authority.
//!
//! Grants are owned by the authority; these types only describe what is read
//! from or written to it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Single right checked against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "x")]
    Execute,
    #[serde(rename = "a")]
    Administrate,
}

impl Permission {
    /// Short code used in authority query strings and paths.
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::Execute => "x",
            Self::Administrate => "a",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "r" => Some(Self::Read),
            "w" => Some(Self::Write),
            "x" => Some(Self::Execute),
            "a" => Some(Self::Administrate),
            _ => None,
        }
    }
}

/// Rights held by one subject on one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsMap {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub administrate: bool,
}

impl PermissionsMap {
    /// Every right; the default grant for a resource owner.
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
            administrate: true,
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
            Permission::Execute => self.execute,
            Permission::Administrate => self.administrate,
        }
    }
}

/// Complete grant set of one resource, keyed by subject kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePermissions {
    pub user_permissions: BTreeMap<String, PermissionsMap>,
    pub group_permissions: BTreeMap<String, PermissionsMap>,
    pub role_permissions: BTreeMap<String, PermissionsMap>,
}

impl ResourcePermissions {
    /// Grant set seeded for newly created or backfilled documents.
    pub fn owner_default(owner: &str) -> Self {
        let mut permissions = Self::default();
        permissions
            .user_permissions
            .insert(owner.to_string(), PermissionsMap::all());
        permissions
    }

    /// Whether any of the subject identities holds `permission`.
    pub fn allows(
        &self,
        user_id: &str,
        groups: &[String],
        roles: &[String],
        permission: Permission,
    ) -> bool {
        let user = self
            .user_permissions
            .get(user_id)
            .is_some_and(|rights| rights.allows(permission));
        let group = groups.iter().any(|group| {
            self.group_permissions
                .get(group)
                .is_some_and(|rights| rights.allows(permission))
        });
        let role = roles.iter().any(|role| {
            self.role_permissions
                .get(role)
                .is_some_and(|rights| rights.allows(permission))
        });
        user || group || role
    }
}

/// One-time registration that lets the authority accept grants for a resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRegistration {
    pub id: String,
    /// Log topic the authority announces grant changes on.
    pub publish_to_kafka_topic: String,
}

impl TopicRegistration {
    pub fn for_topic(topic: &str) -> Self {
        Self {
            id: topic.to_string(),
            publish_to_kafka_topic: topic.to_string(),
        }
    }
}

/// Paging for authority list calls. `limit == 0` requests everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOptions {
    pub limit: u64,
    pub offset: u64,
}
