//! Data models for the Nodo platform.

mod achievement;
mod commerce;
mod feed;
mod media;
mod node;
mod notification;
mod user;

pub use achievement::*;
pub use commerce::*;
pub use feed::*;
pub use media::*;
pub use node::*;
pub use notification::*;
pub use user::*;

/// Collection names of the document store.
pub mod collections {
    pub const NODES: &str = "nodes";
    pub const USERS: &str = "users";
    pub const STORES: &str = "stores";
    pub const PRODUCTS: &str = "products";
    pub const FEED: &str = "feed";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const ACHIEVEMENTS: &str = "achievements";
    pub const USER_ACHIEVEMENTS: &str = "user_achievements";
    pub const USER_POINTS: &str = "user_points";
    pub const USER_ACTIVITY: &str = "user_activity";
    pub const STATISTICS: &str = "statistics";
    pub const TEMP_FILES: &str = "temp_files";

    /// Follower sub-collection of a node.
    pub fn node_followers(node_id: &str) -> String {
        format!("{}/{}/followers", NODES, node_id)
    }
}

/// A rejected field value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl From<ValidationError> for crate::errors::AppError {
    fn from(err: ValidationError) -> Self {
        crate::errors::AppError::Validation(err.to_string())
    }
}

/// Absolute http(s) URL check.
pub fn is_valid_url(raw: &str) -> bool {
    match reqwest::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

pub(crate) fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = value.trim().chars().count();
    if len < min || len > max {
        return Err(ValidationError::new(
            field,
            format!("must be between {} and {} characters", min, max),
        ));
    }
    Ok(())
}

pub(crate) fn check_urls(
    field: &'static str,
    urls: &[String],
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    if urls.len() < min || urls.len() > max {
        return Err(ValidationError::new(
            field,
            format!("must contain between {} and {} URLs", min, max),
        ));
    }
    if let Some(bad) = urls.iter().find(|u| !is_valid_url(u)) {
        return Err(ValidationError::new(field, format!("invalid URL {}", bad)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.org/a.png"));
        assert!(!is_valid_url("ftp://example.org/a.png"));
        assert!(!is_valid_url("not a url"));
    }

    #[test]
    fn test_length_counts_characters() {
        assert!(check_length("title", "Ñoño", 3, 100).is_ok());
        assert!(check_length("title", "  ab  ", 3, 100).is_err());
    }
}
