//! Repositories over the sharded and master groups

use std::sync::Arc;

use sqlx::Row;
use tokio_util::sync::CancellationToken;

use shardgroup::idgen::generate_id;
use shardgroup::model::{CreateNews, CreatePost, CreateUser, Post, POSTS, USERS};
use shardgroup::repository::{
    NewsRepository, PostRepository, RepoError, SqlNewsRepository, SqlPostRepository,
    SqlUserRepository, UserRepository,
};
use shardgroup::sharding::physical_table_name;

use crate::{context, first_table_of, setup, user_on_table, TABLES_PER_DATABASE};

#[tokio::test]
async fn test_batch_insert_one_per_shard_then_list() {
    let (_dir, manager) = setup().await;
    let users: Arc<dyn UserRepository> = Arc::new(SqlUserRepository::new(context(&manager)));

    let batch: Vec<_> = (1..=4)
        .map(|shard_id| user_on_table(first_table_of(shard_id), &format!("shard{shard_id}")))
        .collect();
    users.insert_batch(&batch).await.unwrap();

    let listed = users.list(100, 0, CancellationToken::new()).await.unwrap();
    assert!(listed.len() >= 4);
    for user in &batch {
        assert!(listed.contains(user), "missing {}", user.id);
    }

    let counts = context(&manager)
        .shard_counts(USERS, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        counts.iter().map(|c| (c.shard_id, c.rows)).collect::<Vec<_>>(),
        vec![(1, 1), (2, 1), (3, 1), (4, 1)]
    );
}

#[tokio::test]
async fn test_failing_shard_returns_no_rows() {
    let (_dir, manager) = setup().await;
    let users = SqlUserRepository::new(context(&manager));

    let batch: Vec<_> = (1..=4)
        .map(|shard_id| user_on_table(first_table_of(shard_id), &format!("u{shard_id}")))
        .collect();
    users.insert_batch(&batch).await.unwrap();

    // break shard 3 by dropping one of its resident tables
    let broken = physical_table_name(USERS, first_table_of(3) + TABLES_PER_DATABASE - 1).unwrap();
    let shard3 = manager.sharding().get(3).unwrap();
    sqlx::query(&format!("DROP TABLE {broken}"))
        .execute(shard3.pool())
        .await
        .unwrap();

    let result = users.list(100, 0, CancellationToken::new()).await;
    match result {
        Err(RepoError::Shard { shard_id, .. }) => assert_eq!(shard_id, 3),
        other => panic!("expected shard 3 failure, got {other:?}"),
    }
    assert!(matches!(
        users.count(CancellationToken::new()).await,
        Err(RepoError::Shard { shard_id: 3, .. })
    ));

    // routed reads on healthy shards are unaffected
    assert_eq!(users.get_by_id(&batch[0].id).await.unwrap(), batch[0]);
}

#[tokio::test]
async fn test_cancelled_list_is_reported() {
    let (_dir, manager) = setup().await;
    let users = SqlUserRepository::new(context(&manager));
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        users.list(10, 0, cancel).await,
        Err(RepoError::Cancelled)
    ));
}

#[tokio::test]
async fn test_posts_join_authors_on_every_shard() {
    let (_dir, manager) = setup().await;
    let ctx = context(&manager);
    let users = SqlUserRepository::new(ctx.clone());
    let posts = SqlPostRepository::new(ctx);

    let authors: Vec<_> = (1..=4)
        .map(|shard_id| user_on_table(first_table_of(shard_id) + 1, &format!("a{shard_id}")))
        .collect();
    users.insert_batch(&authors).await.unwrap();
    for author in &authors {
        posts
            .create(CreatePost {
                user_id: author.id.clone(),
                title: format!("by {}", author.name),
                content: "text".into(),
            })
            .await
            .unwrap();
    }

    let joined = posts
        .user_posts(100, 0, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(joined.len(), 4);
    for author in &authors {
        let row = joined.iter().find(|j| j.user_id == author.id).unwrap();
        assert_eq!(row.user_email, author.email);
        assert_eq!(row.post_title, format!("by {}", author.name));
    }
    assert_eq!(posts.count(CancellationToken::new()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_post_batch_lands_beside_authors() {
    let (_dir, manager) = setup().await;
    let ctx = context(&manager);
    let users = SqlUserRepository::new(ctx.clone());
    let posts: Arc<dyn PostRepository> = Arc::new(SqlPostRepository::new(ctx));

    let authors: Vec<_> = (1..=4)
        .map(|shard_id| user_on_table(first_table_of(shard_id) + 2, &format!("b{shard_id}")))
        .collect();
    users.insert_batch(&authors).await.unwrap();

    // shard n gets n posts
    let batch: Vec<Post> = authors
        .iter()
        .enumerate()
        .flat_map(|(i, author)| {
            (0..=i).map(move |j| Post {
                id: generate_id(),
                user_id: author.id.clone(),
                title: format!("{} #{j}", author.name),
                content: "batched".into(),
                created_at: author.created_at,
                updated_at: author.created_at,
            })
        })
        .collect();
    posts.insert_batch(&batch).await.unwrap();

    let counts = context(&manager)
        .shard_counts(POSTS, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        counts.iter().map(|c| (c.shard_id, c.rows)).collect::<Vec<_>>(),
        vec![(1, 1), (2, 2), (3, 3), (4, 4)]
    );
    for post in &batch {
        assert_eq!(&posts.get_by_id(&post.id, &post.user_id).await.unwrap(), post);
    }
}

#[tokio::test]
async fn test_user_crud_through_trait_object() {
    let (_dir, manager) = setup().await;
    let users: Arc<dyn UserRepository> = Arc::new(SqlUserRepository::new(context(&manager)));

    let user = users
        .create(CreateUser {
            name: "Ada".into(),
            email: "ada@example.com".into(),
        })
        .await
        .unwrap();
    assert_eq!(users.get_by_id(&user.id).await.unwrap(), user);

    users.delete(&user.id).await.unwrap();
    assert!(users.get_by_id(&user.id).await.unwrap_err().is_not_found());
    assert!(users.delete(&user.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_news_lives_on_master() {
    let (_dir, manager) = setup().await;
    let news = SqlNewsRepository::new(context(&manager));

    for i in 0..3 {
        news.create(CreateNews {
            title: format!("headline {i}"),
            content: "body".into(),
            author_id: None,
            published_at: None,
        })
        .await
        .unwrap();
    }

    assert_eq!(news.count().await.unwrap(), 3);
    let page = news.list(2, 1).await.unwrap();
    assert_eq!(page.len(), 2);

    let master = manager.master_connection().unwrap();
    let row = sqlx::query("SELECT COUNT(*) AS n FROM news")
        .fetch_one(master.pool())
        .await
        .unwrap();
    assert_eq!(row.try_get::<i64, _>("n").unwrap(), 3);
}
