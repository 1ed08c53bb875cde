//! Entities stored by the repositories and their request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity names; physical tables are `{entity}_{NNN}` for sharded entities
pub const USERS: &str = "users";
pub const POSTS: &str = "posts";
pub const NEWS: &str = "news";

/// Sharded entities, in creation order
pub const SHARDED_ENTITIES: &[&str] = &[USERS, POSTS];

/// User, sharded by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Post, sharded by `user_id` so it lives next to its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Post joined with its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserPost {
    pub post_id: String,
    pub post_title: String,
    pub post_content: String,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub created_at: DateTime<Utc>,
}

/// News item, stored unsharded in the master group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct News {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
}

/// Partial update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePost {
    pub user_id: String,
    pub title: String,
    pub content: String,
}

/// Partial update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNews {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}
