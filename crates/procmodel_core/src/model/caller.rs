//! Identity of the user behind an API-layer request.

const ADMIN_ROLE: &str = "admin";

/// Authenticated caller as seen by the controller.
///
/// `token` is forwarded verbatim to the permission authority; the controller
/// never parses it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub token: String,
    pub user_id: String,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Admins bypass per-resource permission checks.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == ADMIN_ROLE)
    }
}
