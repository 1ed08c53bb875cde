use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;
use sqlx::any::AnyRow;
use sqlx::{Any, Row};
use tokio_util::sync::CancellationToken;

use crate::idgen::generate_id;
use crate::model::{CreatePost, Post, UpdatePost, UserPost, POSTS, USERS};
use crate::pool::Connection;
use crate::sharding::{physical_table_name, ShardKey};

use super::exec::{from_millis, insert_sql, now, query_error, run, tables_label, union_all};
use super::{PostRepository, RepoContext, RepoError, BATCH_SIZE};

const COLUMNS: &str = "id, user_id, title, content, created_at, updated_at";
const INSERT_COLUMNS: &[&str] = &["id", "user_id", "title", "content", "created_at", "updated_at"];
const JOIN_COLUMNS: &str =
    "post_id, post_title, post_content, user_id, user_name, user_email, created_at";

fn post_from_row(row: &AnyRow) -> Result<Post, sqlx::Error> {
    Ok(Post {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn user_post_from_row(row: &AnyRow) -> Result<UserPost, sqlx::Error> {
    Ok(UserPost {
        post_id: row.try_get("post_id")?,
        post_title: row.try_get("post_title")?,
        post_content: row.try_get("post_content")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        user_email: row.try_get("user_email")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn not_found(id: &str) -> RepoError {
    RepoError::NotFound {
        entity: "post",
        id: id.to_string(),
    }
}

/// Local join of each colocated posts/users pair on one shard
fn join_sql(table_numbers: &[u32]) -> Result<String, RepoError> {
    let mut parts = Vec::with_capacity(table_numbers.len());
    for &n in table_numbers {
        let posts = physical_table_name(POSTS, n)?;
        let users = physical_table_name(USERS, n)?;
        parts.push(format!(
            "SELECT p.id AS post_id, p.title AS post_title, p.content AS post_content, \
             u.id AS user_id, u.name AS user_name, u.email AS user_email, \
             p.created_at AS created_at \
             FROM {posts} p JOIN {users} u ON u.id = p.user_id"
        ));
    }
    Ok(parts.join(" UNION ALL "))
}

/// SQL-backed posts repository; posts share their author's table number
#[derive(Debug, Clone)]
pub struct SqlPostRepository {
    ctx: RepoContext,
}

impl SqlPostRepository {
    pub fn new(ctx: RepoContext) -> Self {
        Self { ctx }
    }

    fn route(&self, user_id: &str) -> Result<(String, std::sync::Arc<Connection>), RepoError> {
        let key = ShardKey::parse_uuid(user_id)?;
        let (route, conn) = self.ctx.manager.route(POSTS, &key)?;
        Ok((route.table_name, conn))
    }

    /// Insert posts whose authors all live in one logical table
    async fn insert_table(&self, table_number: u32, posts: Vec<&Post>) -> Result<(), RepoError> {
        let table = physical_table_name(POSTS, table_number)?;
        let conn = self.ctx.manager.sharding_connection(table_number)?;

        for chunk in posts.chunks(BATCH_SIZE) {
            let sql = insert_sql(conn.driver(), &table, INSERT_COLUMNS, chunk.len());
            run(&self.ctx.retry, &conn, &table, "insert_batch", &sql, || {
                let mut query = sqlx::query::<Any>(&sql);
                for post in chunk {
                    query = query
                        .bind(post.id.as_str())
                        .bind(post.user_id.as_str())
                        .bind(post.title.as_str())
                        .bind(post.content.as_str())
                        .bind(post.created_at.timestamp_millis())
                        .bind(post.updated_at.timestamp_millis());
                }
                query.execute(conn.pool())
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PostRepository for SqlPostRepository {
    async fn create(&self, req: CreatePost) -> Result<Post, RepoError> {
        let (table, conn) = self.route(&req.user_id)?;
        let now = now();
        let post = Post {
            id: generate_id(),
            user_id: req.user_id,
            title: req.title,
            content: req.content,
            created_at: now,
            updated_at: now,
        };

        let sql = insert_sql(conn.driver(), &table, INSERT_COLUMNS, 1);
        run(&self.ctx.retry, &conn, &table, "insert", &sql, || {
            sqlx::query(&sql)
                .bind(post.id.as_str())
                .bind(post.user_id.as_str())
                .bind(post.title.as_str())
                .bind(post.content.as_str())
                .bind(post.created_at.timestamp_millis())
                .bind(post.updated_at.timestamp_millis())
                .execute(conn.pool())
        })
        .await?;

        Ok(post)
    }

    async fn insert_batch(&self, posts: &[Post]) -> Result<(), RepoError> {
        let selector = self.ctx.manager.table_selector();
        let mut by_table: BTreeMap<u32, Vec<&Post>> = BTreeMap::new();
        for post in posts {
            let key = ShardKey::parse_uuid(&post.user_id)?;
            by_table
                .entry(selector.table_number(&key))
                .or_default()
                .push(post);
        }

        try_join_all(
            by_table
                .into_iter()
                .map(|(table_number, group)| self.insert_table(table_number, group)),
        )
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str, user_id: &str) -> Result<Post, RepoError> {
        let (table, conn) = self.route(user_id)?;
        let driver = conn.driver();
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = {} AND user_id = {}",
            driver.bind_marker(1),
            driver.bind_marker(2)
        );

        let row = run(&self.ctx.retry, &conn, &table, "select", &sql, || {
            sqlx::query(&sql).bind(id).bind(user_id).fetch_optional(conn.pool())
        })
        .await?
        .ok_or_else(|| not_found(id))?;

        post_from_row(&row).map_err(|e| query_error(&conn, &table, e))
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Post>, RepoError> {
        let (table, conn) = self.route(user_id)?;
        let driver = conn.driver();
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE user_id = {} \
             ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            driver.bind_marker(1),
            driver.bind_marker(2),
            driver.bind_marker(3)
        );

        let rows = run(&self.ctx.retry, &conn, &table, "list_by_user", &sql, || {
            sqlx::query(&sql)
                .bind(user_id)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(conn.pool())
        })
        .await?;

        rows.iter()
            .map(post_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| query_error(&conn, &table, e))
    }

    async fn list(
        &self,
        limit: u32,
        offset: u32,
        cancel: CancellationToken,
    ) -> Result<Vec<Post>, RepoError> {
        let retry = self.ctx.retry.clone();
        let posts = self
            .ctx
            .fanout(cancel)
            .collect(move |unit| {
                let retry = retry.clone();
                async move {
                    let tables = unit.table_names(POSTS)?;
                    let label = tables_label(&tables);
                    let driver = unit.connection.driver();
                    let sql = format!(
                        "SELECT {COLUMNS} FROM ({}) AS p \
                         ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
                        union_all(&tables, COLUMNS),
                        driver.bind_marker(1),
                        driver.bind_marker(2)
                    );

                    let rows = run(&retry, &unit.connection, &label, "list", &sql, || {
                        sqlx::query(&sql)
                            .bind(i64::from(limit))
                            .bind(i64::from(offset))
                            .fetch_all(unit.connection.pool())
                    })
                    .await?;

                    rows.iter()
                        .map(post_from_row)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| query_error(&unit.connection, &label, e))
                }
            })
            .await?;
        Ok(posts)
    }

    async fn user_posts(
        &self,
        limit: u32,
        offset: u32,
        cancel: CancellationToken,
    ) -> Result<Vec<UserPost>, RepoError> {
        let retry = self.ctx.retry.clone();
        let rows = self
            .ctx
            .fanout(cancel)
            .collect(move |unit| {
                let retry = retry.clone();
                async move {
                    let label = tables_label(&unit.table_names(POSTS)?);
                    let driver = unit.connection.driver();
                    let sql = format!(
                        "SELECT {JOIN_COLUMNS} FROM ({}) AS j \
                         ORDER BY created_at DESC, post_id DESC LIMIT {} OFFSET {}",
                        join_sql(&unit.table_numbers)?,
                        driver.bind_marker(1),
                        driver.bind_marker(2)
                    );

                    let rows = run(&retry, &unit.connection, &label, "user_posts", &sql, || {
                        sqlx::query(&sql)
                            .bind(i64::from(limit))
                            .bind(i64::from(offset))
                            .fetch_all(unit.connection.pool())
                    })
                    .await?;

                    rows.iter()
                        .map(user_post_from_row)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| query_error(&unit.connection, &label, e))
                }
            })
            .await?;
        Ok(rows)
    }

    async fn update(&self, id: &str, user_id: &str, req: UpdatePost) -> Result<Post, RepoError> {
        let (table, conn) = self.route(user_id)?;
        let driver = conn.driver();

        let mut sets = Vec::new();
        for (column, value) in [("title", &req.title), ("content", &req.content)] {
            if value.is_some() {
                sets.push(format!("{column} = {}", driver.bind_marker(sets.len() + 1)));
            }
        }
        sets.push(format!("updated_at = {}", driver.bind_marker(sets.len() + 1)));
        let sql = format!(
            "UPDATE {table} SET {} WHERE id = {} AND user_id = {}",
            sets.join(", "),
            driver.bind_marker(sets.len() + 1),
            driver.bind_marker(sets.len() + 2)
        );

        let updated_at = now().timestamp_millis();
        let result = run(&self.ctx.retry, &conn, &table, "update", &sql, || {
            let mut query = sqlx::query::<Any>(&sql);
            for value in [&req.title, &req.content].into_iter().flatten() {
                query = query.bind(value.as_str());
            }
            query
                .bind(updated_at)
                .bind(id)
                .bind(user_id)
                .execute(conn.pool())
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        self.get_by_id(id, user_id).await
    }

    async fn delete(&self, id: &str, user_id: &str) -> Result<(), RepoError> {
        let (table, conn) = self.route(user_id)?;
        let driver = conn.driver();
        let sql = format!(
            "DELETE FROM {table} WHERE id = {} AND user_id = {}",
            driver.bind_marker(1),
            driver.bind_marker(2)
        );

        let result = run(&self.ctx.retry, &conn, &table, "delete", &sql, || {
            sqlx::query(&sql).bind(id).bind(user_id).execute(conn.pool())
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn count(&self, cancel: CancellationToken) -> Result<i64, RepoError> {
        let counts = self.ctx.shard_counts(POSTS, cancel).await?;
        Ok(counts.iter().map(|c| c.rows).sum())
    }
}
