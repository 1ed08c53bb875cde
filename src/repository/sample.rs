//! Sample data for development databases

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::idgen::generate_id;
use crate::model::{News, Post, User};

use super::exec::now;
use super::{NewsRepository, PostRepository, RepoError, UserRepository};

/// Rows written by [`generate_sample_data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSummary {
    pub users: usize,
    pub posts: usize,
    pub news: usize,
}

/// Insert `count` users, `count` posts by those users and `count` news items
///
/// Each entity goes through its repository's batch insert, so users and
/// posts are grouped per table and land next to each other.
pub async fn generate_sample_data(
    users: &dyn UserRepository,
    posts: &dyn PostRepository,
    news: &dyn NewsRepository,
    count: usize,
) -> Result<SampleSummary, RepoError> {
    let (sample_users, sample_posts, sample_news) = build(count, now());

    users.insert_batch(&sample_users).await?;
    info!(count = sample_users.len(), "Inserted sample users");
    posts.insert_batch(&sample_posts).await?;
    info!(count = sample_posts.len(), "Inserted sample posts");
    news.insert_batch(&sample_news).await?;
    info!(count = sample_news.len(), "Inserted sample news");

    Ok(SampleSummary {
        users: sample_users.len(),
        posts: sample_posts.len(),
        news: sample_news.len(),
    })
}

fn build(count: usize, at: DateTime<Utc>) -> (Vec<User>, Vec<Post>, Vec<News>) {
    let mut rng = rand::thread_rng();

    let users: Vec<User> = (0..count)
        .map(|i| User {
            id: generate_id(),
            name: format!("Sample User {i}"),
            email: format!("sample{i}.{:04x}@example.com", rng.gen::<u16>()),
            created_at: at,
            updated_at: at,
        })
        .collect();

    let posts = (0..count)
        .filter_map(|i| {
            let author = users.choose(&mut rng)?;
            Some(Post {
                id: generate_id(),
                user_id: author.id.clone(),
                title: format!("Sample post {i}"),
                content: format!("Written by {} for the sample data set.", author.name),
                created_at: at,
                updated_at: at,
            })
        })
        .collect();

    // published somewhere in the last year
    let news = (0..count)
        .map(|i| News {
            id: generate_id(),
            title: format!("Sample headline {i}"),
            content: "Generated news body.".to_string(),
            author_id: users.choose(&mut rng).map(|u| u.id.clone()),
            published_at: Some(at - chrono::Duration::minutes(rng.gen_range(0..525_600))),
            created_at: at,
            updated_at: at,
        })
        .collect();

    (users, posts, news)
}
