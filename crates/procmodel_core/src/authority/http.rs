//! HTTP client for the permission authority.
//!
//! Paths are resolved below the configured base URL:
//!
//! | call | request |
//! |------|---------|
//! | `set_topic` | `PUT admin/topics/{topic}` |
//! | `check_permission` | `GET check/{topic}/{id}/{permission}` |
//! | `check_multiple_permissions` | `GET check/{topic}?ids=..&permissions=..` |
//! | `list_accessible_resource_ids` | `GET accessible/{topic}?permissions=..&limit=..&offset=..` |
//! | `admin_list_resource_ids` | `GET admin/resources/{topic}?limit=..&offset=..` |
//! | `get_resource` | `GET manage/{topic}/{id}` |
//! | `set_permission` | `PUT manage/{topic}/{id}` |
//! | `remove_resource` | `DELETE manage/{topic}/{id}` |

use super::{AuthorityError, AuthorityResult, PermissionAuthority};
use crate::model::caller::Caller;
use crate::model::permission::{PageOptions, Permission, ResourcePermissions, TopicRegistration};
use async_trait::async_trait;
use log::debug;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// `reqwest`-backed authority client.
#[derive(Debug, Clone)]
pub struct HttpPermissionAuthority {
    client: Client,
    base_url: Url,
    admin_token: String,
}

impl HttpPermissionAuthority {
    /// Builds a client with a per-request timeout.
    ///
    /// `admin_token` is sent on admin-scope calls (topic registration, resource
    /// management and full listings).
    pub fn new(
        base_url: &str,
        admin_token: impl Into<String>,
        timeout: Duration,
    ) -> AuthorityResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|err| AuthorityError::InvalidUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(AuthorityError::InvalidUrl(format!(
                "`{base_url}` cannot be used as a base url"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            admin_token: admin_token.into(),
        })
    }

    fn url(&self, segments: &[&str]) -> AuthorityResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| AuthorityError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn admin(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, self.admin_token.as_str())
    }

    fn as_caller(request: RequestBuilder, caller: &Caller) -> RequestBuilder {
        request.header(AUTHORIZATION, caller.token.as_str())
    }

    /// Sends `request` and decodes a JSON body; `404` maps to `None`.
    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> AuthorityResult<Option<T>> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| AuthorityError::Decode(err.to_string()))
    }

    /// Sends `request` expecting no body; `404` is tolerated when `allow_missing`.
    async fn execute(&self, request: RequestBuilder, allow_missing: bool) -> AuthorityResult<()> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || (allow_missing && status == StatusCode::NOT_FOUND) {
            return Ok(());
        }
        Err(status_error(status, response).await)
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> AuthorityError {
    let body = response.text().await.unwrap_or_default();
    let message = body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
    AuthorityError::Status {
        status: status.as_u16(),
        message,
    }
}

fn page_query(page: PageOptions) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if page.limit > 0 {
        query.push(("limit", page.limit.to_string()));
    }
    if page.offset > 0 {
        query.push(("offset", page.offset.to_string()));
    }
    query
}

#[async_trait]
impl PermissionAuthority for HttpPermissionAuthority {
    async fn set_topic(&self, registration: &TopicRegistration) -> AuthorityResult<()> {
        let url = self.url(&["admin", "topics", registration.id.as_str()])?;
        debug!(
            "event=authority_set_topic module=authority status=start topic={}",
            registration.id
        );
        self.execute(self.admin(self.client.put(url).json(registration)), false)
            .await
    }

    async fn check_permission(
        &self,
        caller: &Caller,
        topic: &str,
        id: &str,
        permission: Permission,
    ) -> AuthorityResult<bool> {
        let url = self.url(&["check", topic, id, permission.as_code()])?;
        let allowed = self
            .fetch_json::<bool>(Self::as_caller(self.client.get(url), caller))
            .await?;
        Ok(allowed.unwrap_or(false))
    }

    async fn check_multiple_permissions(
        &self,
        caller: &Caller,
        topic: &str,
        ids: &[String],
        permission: Permission,
    ) -> AuthorityResult<BTreeMap<String, bool>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let url = self.url(&["check", topic])?;
        let request = self.client.get(url).query(&[
            ("ids", ids.join(",")),
            ("permissions", permission.as_code().to_string()),
        ]);
        let result = self
            .fetch_json::<BTreeMap<String, bool>>(Self::as_caller(request, caller))
            .await?;
        Ok(result.unwrap_or_default())
    }

    async fn list_accessible_resource_ids(
        &self,
        caller: &Caller,
        topic: &str,
        page: PageOptions,
        permission: Permission,
    ) -> AuthorityResult<Vec<String>> {
        let url = self.url(&["accessible", topic])?;
        let mut query = page_query(page);
        query.push(("permissions", permission.as_code().to_string()));
        let request = self.client.get(url).query(&query);
        let result = self
            .fetch_json::<Vec<String>>(Self::as_caller(request, caller))
            .await?;
        Ok(result.unwrap_or_default())
    }

    async fn admin_list_resource_ids(
        &self,
        topic: &str,
        page: PageOptions,
    ) -> AuthorityResult<Vec<String>> {
        let url = self.url(&["admin", "resources", topic])?;
        let request = self.client.get(url).query(&page_query(page));
        match self.fetch_json::<Vec<String>>(self.admin(request)).await? {
            Some(ids) => Ok(ids),
            None => Err(AuthorityError::UnknownTopic(topic.to_string())),
        }
    }

    async fn get_resource(
        &self,
        topic: &str,
        id: &str,
    ) -> AuthorityResult<Option<ResourcePermissions>> {
        let url = self.url(&["manage", topic, id])?;
        self.fetch_json::<ResourcePermissions>(self.admin(self.client.get(url)))
            .await
    }

    async fn set_permission(
        &self,
        topic: &str,
        id: &str,
        permissions: &ResourcePermissions,
    ) -> AuthorityResult<()> {
        let url = self.url(&["manage", topic, id])?;
        self.execute(self.admin(self.client.put(url).json(permissions)), false)
            .await
    }

    async fn remove_resource(&self, topic: &str, id: &str) -> AuthorityResult<()> {
        let url = self.url(&["manage", topic, id])?;
        self.execute(self.admin(self.client.delete(url)), true).await
    }
}
