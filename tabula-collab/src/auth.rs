//! Admission control for relay connections.
//!
//! The server asks an [`Authorizer`] during the WebSocket upgrade, with the
//! room name from the URL path and the `token` query parameter if present.
//! A refusal answers the upgrade with `403 Forbidden`.

use std::collections::{HashMap, HashSet};

pub trait Authorizer: Send + Sync {
    fn authorize(&self, room: &str, token: Option<&str>) -> bool;
}

/// Admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _room: &str, _token: Option<&str>) -> bool {
        true
    }
}

/// Admits connections whose token grants the room. A token granted `"*"`
/// opens every room.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    grants: HashMap<String, HashSet<String>>,
}

impl TokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, token: impl Into<String>, room: impl Into<String>) -> Self {
        self.grants
            .entry(token.into())
            .or_default()
            .insert(room.into());
        self
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, room: &str, token: Option<&str>) -> bool {
        let Some(rooms) = token.and_then(|t| self.grants.get(t)) else {
            return false;
        };
        rooms.contains("*") || rooms.contains(room)
    }
}

/// `"/team/sheet"` → `"team/sheet"`; the bare root maps to `"default"`.
pub fn room_from_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Value of the first `token=` pair in a query string.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/budget"), "budget");
        assert_eq!(room_from_path("/team/budget/"), "team/budget");
        assert_eq!(room_from_path("/"), "default");
        assert_eq!(room_from_path(""), "default");
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query(Some("a=1&token=s3cret")), Some("s3cret".into()));
        assert_eq!(token_from_query(Some("a=1")), None);
        assert_eq!(token_from_query(None), None);
    }

    #[test]
    fn test_token_grants() {
        let auth = TokenAuthorizer::new()
            .grant("alice", "budget")
            .grant("admin", "*");
        assert!(auth.authorize("budget", Some("alice")));
        assert!(!auth.authorize("payroll", Some("alice")));
        assert!(auth.authorize("payroll", Some("admin")));
        assert!(!auth.authorize("budget", None));
        assert!(AllowAll.authorize("anything", None));
    }
}
