//! Redis implementation of the shared backend, used when several server
//! processes run against one store.
//!
//! Commands go through a multiplexed [`ConnectionManager`] that reconnects
//! on its own. Every subscription opens its own pub/sub connection.

use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::info;

use super::backend::{SharedBackend, StoreError};

/// Deletes KEYS[1] only while it still holds ARGV[1]
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// TTL in whole milliseconds; Redis rejects a zero expiry
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisBackend {
    client: Client,
    conn: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisBackend {
    /// Opens the command connection. Fails fast if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Connected to Redis backend");

        Ok(Self {
            client,
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

impl SharedBackend for RedisBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let value: Option<Vec<u8>> = conn.get(key).await?;
            Ok(value.map(Bytes::from))
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(&value[..]);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        }
        .boxed()
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(&value[..]).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            // "OK" when written, nil when the key already exists
            let written: Option<String> = cmd.query_async(&mut conn).await?;
            Ok(written.is_some())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let removed: i64 = conn.del(key).await?;
            Ok(removed > 0)
        }
        .boxed()
    }

    fn delete_if_equals<'a>(
        &'a self,
        key: &'a str,
        expected: Bytes,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let removed: i64 = self
                .compare_and_delete
                .key(key)
                .arg(&expected[..])
                .invoke_async(&mut conn)
                .await?;
            Ok(removed > 0)
        }
        .boxed()
    }

    fn incr<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<i64, StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let next: i64 = conn.incr(key, 1i64).await?;
            Ok(next)
        }
        .boxed()
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        let mut conn = self.conn.clone();
        async move {
            let receivers: i64 = conn.publish(channel, &payload[..]).await?;
            Ok(receivers.max(0) as usize)
        }
        .boxed()
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Bytes>, StoreError>> {
        async move {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(channel).await?;
            info!(channel, "Subscribed to Redis channel");

            let messages = pubsub
                .into_on_message()
                .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()))
                .boxed();
            Ok(messages)
        }
        .boxed()
    }
}
