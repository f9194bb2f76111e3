//! Permission-gated process use-cases.
//!
//! # Responsibility
//! - Serve the API layer: permission checks, reads, and publishing write intents.
//! - Serve the consumer: apply decoded commands to the authority and the store.
//!
//! # Invariants
//! - The request path never writes the store; it only publishes commands.
//! - Admin callers bypass per-resource checks.
//! - A PUT apply seeds the owner grant only when the authority has no entry,
//!   so replays never overwrite grants changed in the meantime.
//! - A PUT apply checks the grant again after the upsert, so a cleanup pass
//!   running between the two steps cannot leave the document without one.
//! - A DELETE apply removes the authority resource before the document.

use crate::authority::{AuthorityError, PermissionAuthority};
use crate::model::caller::Caller;
use crate::model::command::Command;
use crate::model::permission::{PageOptions, Permission, ResourcePermissions, TopicRegistration};
use crate::model::process::{unix_now, ProcessDocument, ProcessId, ProcessValidationError};
use crate::repo::process_repo::{ListOptions, ProcessPage, RepoError};
use crate::service::materializer::{ApplyOutcome, Materializer};
use crate::source::producer::{CommandProducer, PublishError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

pub type ControlResult<T> = Result<T, ControlError>;

/// Use-case failure, mapped to an HTTP status by the API layer.
#[derive(Debug)]
pub enum ControlError {
    Forbidden,
    NotFound(ProcessId),
    BadRequest(String),
    Validation(ProcessValidationError),
    Repo(RepoError),
    Authority(AuthorityError),
    Publish(PublishError),
}

impl ControlError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::NotFound(_) => 404,
            Self::BadRequest(_) | Self::Validation(_) => 400,
            Self::Repo(_) | Self::Authority(_) | Self::Publish(_) => 500,
        }
    }
}

impl Display for ControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forbidden => write!(f, "access denied"),
            Self::NotFound(id) => write!(f, "process `{id}` not found"),
            Self::BadRequest(message) => write!(f, "{message}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Authority(err) => write!(f, "{err}"),
            Self::Publish(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ControlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Authority(err) => Some(err),
            Self::Publish(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ControlError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<AuthorityError> for ControlError {
    fn from(value: AuthorityError) -> Self {
        Self::Authority(value)
    }
}

impl From<PublishError> for ControlError {
    fn from(value: PublishError) -> Self {
        Self::Publish(value)
    }
}

impl From<ProcessValidationError> for ControlError {
    fn from(value: ProcessValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Request body of the publish toggle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicCommand {
    pub publish: bool,
    pub description: String,
}

/// Entry point shared by the API layer and the command listener.
pub struct ProcessController {
    materializer: Materializer,
    authority: Arc<dyn PermissionAuthority>,
    producer: CommandProducer,
}

impl ProcessController {
    /// The authority topic is the producer's topic.
    pub fn new(
        materializer: Materializer,
        authority: Arc<dyn PermissionAuthority>,
        producer: CommandProducer,
    ) -> Self {
        Self {
            materializer,
            authority,
            producer,
        }
    }

    pub fn topic(&self) -> &str {
        self.producer.topic()
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    pub fn authority(&self) -> &Arc<dyn PermissionAuthority> {
        &self.authority
    }

    /// Registers the process topic so the authority accepts grants for it.
    pub async fn register_topic(&self) -> ControlResult<()> {
        self.authority
            .set_topic(&TopicRegistration::for_topic(self.topic()))
            .await?;
        info!(
            "event=topic_register module=service status=ok topic={}",
            self.topic()
        );
        Ok(())
    }

    async fn check(&self, caller: &Caller, id: &str, permission: Permission) -> ControlResult<bool> {
        if caller.is_admin() {
            return Ok(true);
        }
        Ok(self
            .authority
            .check_permission(caller, self.topic(), id, permission)
            .await?)
    }

    pub async fn read_process(
        &self,
        caller: &Caller,
        id: &str,
        action: Permission,
    ) -> ControlResult<ProcessDocument> {
        if !self.check(caller, id, action).await? {
            return Err(ControlError::Forbidden);
        }
        let key = id.to_string();
        self.materializer
            .run_blocking(move |m| m.repository().get_process(&key))
            .await?
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    /// Lists documents the caller holds `permission` on.
    ///
    /// Explicit id lists are checked in one batch call and ignore paging.
    pub async fn list_processes(
        &self,
        caller: &Caller,
        mut options: ListOptions,
        permission: Permission,
    ) -> ControlResult<ProcessPage> {
        options.ids = match options.ids.take() {
            None if caller.is_admin() => None,
            None => Some(
                self.authority
                    .list_accessible_resource_ids(
                        caller,
                        self.topic(),
                        PageOptions::default(),
                        permission,
                    )
                    .await?,
            ),
            Some(requested) => {
                options.limit = None;
                options.offset = 0;
                let allowed = self
                    .authority
                    .check_multiple_permissions(caller, self.topic(), &requested, permission)
                    .await?;
                Some(
                    allowed
                        .into_iter()
                        .filter_map(|(id, ok)| ok.then_some(id))
                        .collect(),
                )
            }
        };
        Ok(self
            .materializer
            .run_blocking(move |m| m.repository().list_processes(&options))
            .await?)
    }

    pub async fn read_all_public_processes(&self) -> ControlResult<Vec<ProcessDocument>> {
        Ok(self
            .materializer
            .run_blocking(|m| m.repository().list_public_processes())
            .await?)
    }

    /// Publishes a new document under a fresh id owned by the caller.
    pub async fn publish_create(
        &self,
        caller: &Caller,
        mut document: ProcessDocument,
    ) -> ControlResult<ProcessDocument> {
        document.id = Uuid::new_v4().to_string();
        document.validate_for_publish()?;
        document.owner = caller.user_id.clone();
        document.last_updated_unix = unix_now();
        self.producer.publish_put(&caller.user_id, document.clone()).await?;
        debug!(
            "event=process_create module=service status=ok id={}",
            document.id
        );
        Ok(document)
    }

    /// Publishes a full replace of `id`; the stored owner is preserved.
    pub async fn publish_update(
        &self,
        caller: &Caller,
        id: &str,
        mut document: ProcessDocument,
    ) -> ControlResult<ProcessDocument> {
        if document.id != id {
            return Err(ControlError::BadRequest(
                "path id does not match process id".to_string(),
            ));
        }
        let previous_owner = match self.read_process(caller, id, Permission::Write).await {
            Ok(previous) => previous.owner,
            Err(ControlError::NotFound(_)) => String::new(),
            Err(err) => return Err(err),
        };
        document.owner = if previous_owner.is_empty() {
            caller.user_id.clone()
        } else {
            previous_owner
        };
        document.validate_for_publish()?;
        document.last_updated_unix = unix_now();
        self.producer.publish_put(&caller.user_id, document.clone()).await?;
        Ok(document)
    }

    /// Toggles public visibility; the description is cleared on unpublish.
    pub async fn publish_public_update(
        &self,
        caller: &Caller,
        id: &str,
        command: PublicCommand,
    ) -> ControlResult<ProcessDocument> {
        let mut document = self.read_process(caller, id, Permission::Write).await?;
        let now = unix_now();
        document.publish = command.publish;
        document.publish_date = now.to_string();
        document.description = if command.publish {
            command.description
        } else {
            String::new()
        };
        document.last_updated_unix = now;
        self.producer.publish_put(&caller.user_id, document.clone()).await?;
        Ok(document)
    }

    pub async fn publish_delete(&self, caller: &Caller, id: &str) -> ControlResult<()> {
        if !self.check(caller, id, Permission::Administrate).await? {
            return Err(ControlError::Forbidden);
        }
        self.producer.publish_delete(id, &caller.user_id).await?;
        Ok(())
    }

    /// Applies one decoded command on the consumer side.
    pub async fn apply_command(&self, command: &Command) -> ControlResult<ApplyOutcome> {
        match command {
            Command::Put { owner, document } => {
                self.seed_owner_grant(owner, &document.id).await?;
                let stored = document.clone();
                self.materializer
                    .run_blocking(move |m| m.upsert(&stored))
                    .await?;
                // A cleanup pass may have dropped the seeded grant before the row landed.
                if self.seed_owner_grant(owner, &document.id).await? {
                    warn!(
                        "event=grant_seed module=service status=warn id={} reason=removed_before_upsert",
                        document.id
                    );
                }
                Ok(ApplyOutcome::Upserted)
            }
            Command::Delete { id, .. } => {
                self.authority.remove_resource(self.topic(), id).await?;
                let key = id.clone();
                Ok(self
                    .materializer
                    .run_blocking(move |m| m.remove(&key))
                    .await?)
            }
        }
    }

    /// Grants `owner` the default permissions on `id` unless the authority
    /// already has an entry. Returns whether a grant was written.
    async fn seed_owner_grant(&self, owner: &str, id: &str) -> ControlResult<bool> {
        if self.authority.get_resource(self.topic(), id).await?.is_some() {
            return Ok(false);
        }
        self.authority
            .set_permission(self.topic(), id, &ResourcePermissions::owner_default(owner))
            .await?;
        debug!("event=grant_seed module=service status=ok id={}", id);
        Ok(true)
    }
}
