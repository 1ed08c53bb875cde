use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;
use sqlx::any::AnyRow;
use sqlx::{Any, Row};
use tokio_util::sync::CancellationToken;

use crate::idgen::generate_keyed_id;
use crate::model::{CreateUser, UpdateUser, User, USERS};
use crate::sharding::{physical_table_name, ShardKey};

use super::exec::{from_millis, insert_sql, now, query_error, run, tables_label, union_all};
use super::{RepoContext, RepoError, UserRepository, BATCH_SIZE};

const COLUMNS: &str = "id, name, email, created_at, updated_at";
const INSERT_COLUMNS: &[&str] = &["id", "name", "email", "created_at", "updated_at"];

fn user_from_row(row: &AnyRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn not_found(id: &str) -> RepoError {
    RepoError::NotFound {
        entity: "user",
        id: id.to_string(),
    }
}

/// SQL-backed users repository over the sharding group
#[derive(Debug, Clone)]
pub struct SqlUserRepository {
    ctx: RepoContext,
}

impl SqlUserRepository {
    pub fn new(ctx: RepoContext) -> Self {
        Self { ctx }
    }

    /// Insert users that all live in one logical table
    async fn insert_table(&self, table_number: u32, users: Vec<&User>) -> Result<(), RepoError> {
        let table = physical_table_name(USERS, table_number)?;
        let conn = self.ctx.manager.sharding_connection(table_number)?;

        for chunk in users.chunks(BATCH_SIZE) {
            let sql = insert_sql(conn.driver(), &table, INSERT_COLUMNS, chunk.len());
            run(&self.ctx.retry, &conn, &table, "insert_batch", &sql, || {
                let mut query = sqlx::query::<Any>(&sql);
                for user in chunk {
                    query = query
                        .bind(user.id.as_str())
                        .bind(user.name.as_str())
                        .bind(user.email.as_str())
                        .bind(user.created_at.timestamp_millis())
                        .bind(user.updated_at.timestamp_millis());
                }
                query.execute(conn.pool())
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for SqlUserRepository {
    async fn create(&self, req: CreateUser) -> Result<User, RepoError> {
        let (id, key) = generate_keyed_id();
        let now = now();
        let user = User {
            id,
            name: req.name,
            email: req.email,
            created_at: now,
            updated_at: now,
        };

        let (route, conn) = self.ctx.manager.route(USERS, &key)?;
        let sql = insert_sql(conn.driver(), &route.table_name, INSERT_COLUMNS, 1);
        run(&self.ctx.retry, &conn, &route.table_name, "insert", &sql, || {
            sqlx::query(&sql)
                .bind(user.id.as_str())
                .bind(user.name.as_str())
                .bind(user.email.as_str())
                .bind(user.created_at.timestamp_millis())
                .bind(user.updated_at.timestamp_millis())
                .execute(conn.pool())
        })
        .await?;

        Ok(user)
    }

    async fn create_batch(&self, reqs: Vec<CreateUser>) -> Result<Vec<User>, RepoError> {
        let now = now();
        let users: Vec<User> = reqs
            .into_iter()
            .map(|req| User {
                id: generate_keyed_id().0,
                name: req.name,
                email: req.email,
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.insert_batch(&users).await?;
        Ok(users)
    }

    async fn insert_batch(&self, users: &[User]) -> Result<(), RepoError> {
        let selector = self.ctx.manager.table_selector();
        let mut by_table: BTreeMap<u32, Vec<&User>> = BTreeMap::new();
        for user in users {
            let key = ShardKey::parse_uuid(&user.id)?;
            by_table
                .entry(selector.table_number(&key))
                .or_default()
                .push(user);
        }

        try_join_all(
            by_table
                .into_iter()
                .map(|(table_number, group)| self.insert_table(table_number, group)),
        )
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<User, RepoError> {
        let key = ShardKey::parse_uuid(id)?;
        let (route, conn) = self.ctx.manager.route(USERS, &key)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = {}",
            route.table_name,
            conn.driver().bind_marker(1)
        );

        let row = run(&self.ctx.retry, &conn, &route.table_name, "select", &sql, || {
            sqlx::query(&sql).bind(id).fetch_optional(conn.pool())
        })
        .await?
        .ok_or_else(|| not_found(id))?;

        user_from_row(&row).map_err(|e| query_error(&conn, &route.table_name, e))
    }

    async fn list(
        &self,
        limit: u32,
        offset: u32,
        cancel: CancellationToken,
    ) -> Result<Vec<User>, RepoError> {
        let retry = self.ctx.retry.clone();
        let users = self
            .ctx
            .fanout(cancel)
            .collect(move |unit| {
                let retry = retry.clone();
                async move {
                    let tables = unit.table_names(USERS)?;
                    let label = tables_label(&tables);
                    let driver = unit.connection.driver();
                    let sql = format!(
                        "SELECT {COLUMNS} FROM ({}) AS u ORDER BY id LIMIT {} OFFSET {}",
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
                        .map(user_from_row)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| query_error(&unit.connection, &label, e))
                }
            })
            .await?;
        Ok(users)
    }

    async fn update(&self, id: &str, req: UpdateUser) -> Result<User, RepoError> {
        let key = ShardKey::parse_uuid(id)?;
        let (route, conn) = self.ctx.manager.route(USERS, &key)?;
        let driver = conn.driver();

        let mut sets = Vec::new();
        for (column, value) in [("name", &req.name), ("email", &req.email)] {
            if value.is_some() {
                sets.push(format!("{column} = {}", driver.bind_marker(sets.len() + 1)));
            }
        }
        sets.push(format!("updated_at = {}", driver.bind_marker(sets.len() + 1)));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = {}",
            route.table_name,
            sets.join(", "),
            driver.bind_marker(sets.len() + 1)
        );

        let updated_at = now().timestamp_millis();
        let result = run(&self.ctx.retry, &conn, &route.table_name, "update", &sql, || {
            let mut query = sqlx::query::<Any>(&sql);
            for value in [&req.name, &req.email].into_iter().flatten() {
                query = query.bind(value.as_str());
            }
            query.bind(updated_at).bind(id).execute(conn.pool())
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        self.get_by_id(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let key = ShardKey::parse_uuid(id)?;
        let (route, conn) = self.ctx.manager.route(USERS, &key)?;
        let sql = format!(
            "DELETE FROM {} WHERE id = {}",
            route.table_name,
            conn.driver().bind_marker(1)
        );

        let result = run(&self.ctx.retry, &conn, &route.table_name, "delete", &sql, || {
            sqlx::query(&sql).bind(id).execute(conn.pool())
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn count(&self, cancel: CancellationToken) -> Result<i64, RepoError> {
        let counts = self.ctx.shard_counts(USERS, cancel).await?;
        Ok(counts.iter().map(|c| c.rows).sum())
    }
}
