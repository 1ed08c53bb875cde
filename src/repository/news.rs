use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{Any, Row};

use crate::idgen::generate_id;
use crate::model::{CreateNews, News, NEWS};

use super::exec::{from_millis, insert_sql, now, query_error, run};
use super::{NewsRepository, RepoContext, RepoError, BATCH_SIZE};

const COLUMNS: &str = "id, title, content, author_id, published_at, created_at, updated_at";
const INSERT_COLUMNS: &[&str] = &[
    "id",
    "title",
    "content",
    "author_id",
    "published_at",
    "created_at",
    "updated_at",
];

fn news_from_row(row: &AnyRow) -> Result<News, sqlx::Error> {
    let published_at: Option<i64> = row.try_get("published_at")?;
    Ok(News {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        author_id: row.try_get("author_id")?,
        published_at: published_at.map(from_millis).transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

/// SQL-backed news repository over the master group
#[derive(Debug, Clone)]
pub struct SqlNewsRepository {
    ctx: RepoContext,
}

impl SqlNewsRepository {
    pub fn new(ctx: RepoContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl NewsRepository for SqlNewsRepository {
    async fn create(&self, req: CreateNews) -> Result<News, RepoError> {
        let now = now();
        let news = News {
            id: generate_id(),
            title: req.title,
            content: req.content,
            author_id: req.author_id,
            published_at: req.published_at,
            created_at: now,
            updated_at: now,
        };
        self.insert_batch(std::slice::from_ref(&news)).await?;
        Ok(news)
    }

    async fn insert_batch(&self, news: &[News]) -> Result<(), RepoError> {
        if news.is_empty() {
            return Ok(());
        }
        let conn = self.ctx.manager.master_connection()?;

        for chunk in news.chunks(BATCH_SIZE) {
            let sql = insert_sql(conn.driver(), NEWS, INSERT_COLUMNS, chunk.len());
            run(&self.ctx.retry, &conn, NEWS, "insert_batch", &sql, || {
                let mut query = sqlx::query::<Any>(&sql);
                for item in chunk {
                    query = query
                        .bind(item.id.as_str())
                        .bind(item.title.as_str())
                        .bind(item.content.as_str())
                        .bind(item.author_id.as_deref())
                        .bind(item.published_at.map(|t| t.timestamp_millis()))
                        .bind(item.created_at.timestamp_millis())
                        .bind(item.updated_at.timestamp_millis());
                }
                query.execute(conn.pool())
            })
            .await?;
        }
        Ok(())
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<News>, RepoError> {
        let conn = self.ctx.manager.master_connection()?;
        let driver = conn.driver();
        let sql = format!(
            "SELECT {COLUMNS} FROM {NEWS} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            driver.bind_marker(1),
            driver.bind_marker(2)
        );

        let rows = run(&self.ctx.retry, &conn, NEWS, "list", &sql, || {
            sqlx::query(&sql)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(conn.pool())
        })
        .await?;

        rows.iter()
            .map(news_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| query_error(&conn, NEWS, e))
    }

    async fn count(&self) -> Result<i64, RepoError> {
        let conn = self.ctx.manager.master_connection()?;
        let sql = format!("SELECT COUNT(*) AS n FROM {NEWS}");

        let row = run(&self.ctx.retry, &conn, NEWS, "count", &sql, || {
            sqlx::query(&sql).fetch_one(conn.pool())
        })
        .await?;

        row.try_get::<i64, _>("n")
            .map_err(|e| query_error(&conn, NEWS, e))
    }
}
