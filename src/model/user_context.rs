use serde::{Deserialize, Serialize};

/// The user behind a session or request. `user_id` is what lands in
/// `created_by` of every audit record and decides whether a schema event
/// was authored by the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            display_name: None,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name;
        self
    }

    /// Acting user of requests that carry no identity (local solo mode)
    pub fn development() -> Self {
        Self::new("dev-user")
            .with_email(Some("dev@localhost".to_string()))
            .with_display_name(Some("Development User".to_string()))
    }

    /// Whether an audit record's `created_by` names this user
    pub fn authored(&self, created_by: &str) -> bool {
        self.user_id == created_by
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorship_compares_user_ids_only() {
        let alice = UserContext::new("alice").with_display_name(Some("Alice".to_string()));
        assert!(alice.authored("alice"));
        assert!(!alice.authored("Alice"));
        assert!(!UserContext::development().authored("alice"));
    }
}
