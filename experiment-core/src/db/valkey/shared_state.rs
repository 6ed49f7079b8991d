//! Valkey-backed idempotency markers, mutexes and quota ledger.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, RetryableWithContext};
use redis::aio::ConnectionLike;
use uuid::Uuid;

use crate::db::{DistributedLock, IdempotentQueries, QuotaQueries, QuotaUpdater};
use crate::entity::QuotaSpaceExpt;
use crate::error::{Error, ErrorDetails};

use super::ValkeyConnectionInfo;

const QUOTA_LOCK_TTL: Duration = Duration::from_secs(5);
const QUOTA_LOCK_RETRIES: usize = 50;
const QUOTA_LOCK_BACKOFF: Duration = Duration::from_millis(20);

fn quota_key(space_id: i64) -> String {
    format!("expt_quota:space:{space_id}")
}

fn quota_lock_key(space_id: i64) -> String {
    format!("expt_quota:space:{space_id}:lock")
}

async fn execute_set_nx<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    value: &str,
    ttl: Duration,
) -> Result<bool, Error> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("NX")
        .arg("PX")
        .arg(ttl.as_millis() as u64)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

async fn execute_exists<C: ConnectionLike>(conn: &mut C, key: &str) -> Result<bool, Error> {
    let count: i64 = redis::cmd("EXISTS").arg(key).query_async(conn).await?;
    Ok(count > 0)
}

async fn execute_del<C: ConnectionLike>(conn: &mut C, key: &str) -> Result<bool, Error> {
    let count: i64 = redis::cmd("DEL").arg(key).query_async(conn).await?;
    Ok(count > 0)
}

async fn execute_unlock_if_owner<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    owner: &str,
) -> Result<bool, Error> {
    let released: i64 = redis::cmd("FCALL")
        .arg("expt_unlock_if_owner")
        .arg(1)
        .arg(key)
        .arg(owner)
        .query_async(conn)
        .await?;
    Ok(released > 0)
}

async fn execute_get_quota<C: ConnectionLike>(
    conn: &mut C,
    space_id: i64,
) -> Result<Option<QuotaSpaceExpt>, Error> {
    let raw: Option<String> = redis::cmd("GET")
        .arg(quota_key(space_id))
        .query_async(conn)
        .await?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| {
            Error::new(ErrorDetails::ValkeyQuery {
                message: format!("Failed to parse quota ledger for space {space_id}: {e}"),
            })
        })
    })
    .transpose()
}

async fn execute_set_quota<C: ConnectionLike>(
    conn: &mut C,
    space_id: i64,
    ledger: &QuotaSpaceExpt,
) -> Result<(), Error> {
    let raw = serde_json::to_string(ledger)?;
    let _: () = redis::cmd("SET")
        .arg(quota_key(space_id))
        .arg(raw)
        .query_async(conn)
        .await?;
    Ok(())
}

/// One attempt at the ledger lock. Hands the connection back for the next attempt.
async fn try_quota_lock<'c, C: ConnectionLike>(
    conn: &'c mut C,
    lock_key: &str,
    owner: &str,
) -> (&'c mut C, Result<(), Error>) {
    let result = match execute_set_nx(conn, lock_key, owner, QUOTA_LOCK_TTL).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::new(ErrorDetails::LockHeld {
            key: lock_key.to_string(),
        })),
        Err(e) => Err(e),
    };
    (conn, result)
}

/// Takes the ledger lock, polling at a fixed pace while another writer holds it.
async fn acquire_quota_lock<C: ConnectionLike>(
    conn: &mut C,
    lock_key: &str,
    owner: &str,
) -> Result<(), Error> {
    let (_, acquired) = (move |conn| try_quota_lock(conn, lock_key, owner))
        .retry(
            ConstantBuilder::new()
                .with_delay(QUOTA_LOCK_BACKOFF)
                .with_max_times(QUOTA_LOCK_RETRIES),
        )
        .context(conn)
        .when(|e: &Error| matches!(e.get_details(), ErrorDetails::LockHeld { .. }))
        .await;
    acquired
}

/// Read-modify-write of the ledger under a short owner-checked lock.
async fn execute_update_quota<C: ConnectionLike>(
    conn: &mut C,
    space_id: i64,
    updater: QuotaUpdater,
) -> Result<QuotaSpaceExpt, Error> {
    let lock_key = quota_lock_key(space_id);
    let owner = Uuid::now_v7().to_string();
    acquire_quota_lock(conn, &lock_key, &owner).await?;

    let result = async {
        let current = execute_get_quota(conn, space_id).await?;
        let updated = updater(current)?;
        execute_set_quota(conn, space_id, &updated).await?;
        Ok(updated)
    }
    .await;

    if let Err(e) = execute_unlock_if_owner(conn, &lock_key, &owner).await {
        tracing::warn!(space_id, "Failed to release quota lock: {e}");
    }
    result
}

#[async_trait]
impl IdempotentQueries for ValkeyConnectionInfo {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.connection()?;
        execute_set_nx(&mut conn, key, "1", ttl).await
    }

    async fn exist(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.connection()?;
        execute_exists(&mut conn, key).await
    }
}

#[async_trait]
impl DistributedLock for ValkeyConnectionInfo {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.connection()?;
        execute_set_nx(&mut conn, key, owner, ttl).await
    }

    async fn unlock(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.connection()?;
        execute_del(&mut conn, key).await
    }

    async fn unlock_owned(&self, key: &str, owner: &str) -> Result<bool, Error> {
        let mut conn = self.connection()?;
        execute_unlock_if_owner(&mut conn, key, owner).await
    }
}

#[async_trait]
impl QuotaQueries for ValkeyConnectionInfo {
    async fn update_space_expt_quota(
        &self,
        space_id: i64,
        updater: QuotaUpdater,
    ) -> Result<QuotaSpaceExpt, Error> {
        let mut conn = self.connection()?;
        execute_update_quota(&mut conn, space_id, updater).await
    }

    async fn get_space_expt_quota(&self, space_id: i64) -> Result<Option<QuotaSpaceExpt>, Error> {
        let mut conn = self.connection()?;
        execute_get_quota(&mut conn, space_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_test::{MockCmd, MockRedisConnection};

    #[tokio::test]
    async fn test_disabled_connection_errors() {
        let client = ValkeyConnectionInfo::new_disabled();
        let err = client
            .set_nx("CompleteRun:1", Duration::from_secs(1))
            .await
            .expect_err("disabled connection should return error");
        assert!(
            matches!(err.get_details(), ErrorDetails::ValkeyConnection { .. }),
            "error should be ValkeyConnection"
        );
    }

    #[tokio::test]
    async fn test_set_nx_sends_correct_command() {
        let mut mock = MockRedisConnection::new(vec![
            MockCmd::new(
                redis::cmd("SET")
                    .arg("FinishExpt:9")
                    .arg("1")
                    .arg("NX")
                    .arg("PX")
                    .arg(60_000u64),
                Ok("OK"),
            ),
            MockCmd::new(
                redis::cmd("SET")
                    .arg("FinishExpt:9")
                    .arg("1")
                    .arg("NX")
                    .arg("PX")
                    .arg(60_000u64),
                Ok(redis::Value::Nil),
            ),
        ])
        .assert_all_commands_consumed();

        let first = execute_set_nx(&mut mock, "FinishExpt:9", "1", Duration::from_secs(60))
            .await
            .unwrap();
        let second = execute_set_nx(&mut mock, "FinishExpt:9", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first, "first writer should win");
        assert!(!second, "second writer should be rejected");
    }

    #[tokio::test]
    async fn test_unlock_if_owner_calls_function() {
        let mut mock = MockRedisConnection::new(vec![MockCmd::new(
            redis::cmd("FCALL")
                .arg("expt_unlock_if_owner")
                .arg(1)
                .arg("expt:42")
                .arg("run-7"),
            Ok(1i64),
        )])
        .assert_all_commands_consumed();

        let released = execute_unlock_if_owner(&mut mock, "expt:42", "run-7")
            .await
            .unwrap();
        assert!(released);
    }

    fn set_lock(owner: &str) -> redis::Cmd {
        redis::cmd("SET")
            .arg("expt_quota:space:3:lock")
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(5_000u64)
            .clone()
    }

    #[tokio::test]
    async fn test_quota_lock_waits_for_holder() {
        let mut mock = MockRedisConnection::new(vec![
            MockCmd::new(set_lock("writer-b"), Ok(redis::Value::Nil)),
            MockCmd::new(set_lock("writer-b"), Ok(redis::Value::Nil)),
            MockCmd::new(set_lock("writer-b"), Ok("OK")),
        ])
        .assert_all_commands_consumed();

        acquire_quota_lock(&mut mock, "expt_quota:space:3:lock", "writer-b")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quota_lock_does_not_retry_query_errors() {
        let mut mock = MockRedisConnection::new(vec![MockCmd::new(
            set_lock("writer-b"),
            Err::<String, _>(redis::RedisError::from((
                redis::ErrorKind::Io,
                "connection reset",
            ))),
        )])
        .assert_all_commands_consumed();

        let err = acquire_quota_lock(&mut mock, "expt_quota:space:3:lock", "writer-b")
            .await
            .unwrap_err();
        assert!(
            matches!(err.get_details(), ErrorDetails::ValkeyQuery { .. }),
            "query errors should surface without retrying"
        );
    }

    #[tokio::test]
    async fn test_get_quota_parses_ledger() {
        let mut mock = MockRedisConnection::new(vec![MockCmd::new(
            redis::cmd("GET").arg("expt_quota:space:3"),
            Ok(r#"{"expt_id_to_start_at":{"11":1700000000}}"#),
        )])
        .assert_all_commands_consumed();

        let ledger = execute_get_quota(&mut mock, 3).await.unwrap().unwrap();
        assert_eq!(ledger.expt_id_to_start_at.get(&11), Some(&1_700_000_000));
    }
}
