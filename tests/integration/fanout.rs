//! Cross-shard execution over real connections

use std::time::{Duration, Instant};

use sqlx::Row;
use tokio_util::sync::CancellationToken;

use shardgroup::fanout::{FanOut, FanOutError};

use crate::setup;

#[derive(Debug, thiserror::Error)]
enum UnitError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("shard {0} rejected the unit")]
    Rejected(u32),
}

#[tokio::test]
async fn test_each_shard_sees_only_its_tables() {
    let (_dir, manager) = setup().await;

    let per_shard = FanOut::new(&manager)
        .run(|unit| async move {
            let rows = sqlx::query(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name LIKE 'users_%' ORDER BY name",
            )
            .fetch_all(unit.connection.pool())
            .await?;
            let names = rows
                .iter()
                .map(|r| r.try_get::<String, _>("name"))
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, UnitError>((unit.table_names("users").unwrap(), names))
        })
        .await
        .unwrap();

    assert_eq!(per_shard.len(), 4);
    for (expected, actual) in per_shard {
        assert_eq!(expected.len(), 8);
        assert_eq!(expected, actual);
    }
}

#[tokio::test]
async fn test_one_failing_shard_fails_the_aggregate() {
    let (_dir, manager) = setup().await;

    let result = FanOut::new(&manager)
        .collect(|unit| async move {
            if unit.shard_id() == 2 {
                return Err(UnitError::Rejected(2));
            }
            Ok(unit.table_numbers)
        })
        .await;

    match result {
        Err(FanOutError::Shard { shard_id, source }) => {
            assert_eq!(shard_id, 2);
            assert!(matches!(source, UnitError::Rejected(2)));
        }
        other => panic!("expected shard failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_resolves_barrier_early() {
    let (_dir, manager) = setup().await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = FanOut::new(&manager)
        .with_cancel(cancel)
        .run(|unit| async move {
            if unit.shard_id() == 4 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, UnitError>(unit.shard_id())
        })
        .await;

    assert!(matches!(result, Err(FanOutError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_deadline_on_slow_shard() {
    let (_dir, manager) = setup().await;

    let result = FanOut::new(&manager)
        .with_timeout(Duration::from_millis(50))
        .run(|unit| async move {
            let _ = sqlx::query("SELECT 1").execute(unit.connection.pool()).await?;
            if unit.shard_id() == 1 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, UnitError>(())
        })
        .await;

    assert!(matches!(result, Err(FanOutError::DeadlineExceeded)));
}
