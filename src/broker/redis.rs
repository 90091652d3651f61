//! Redis Streams implementation of [`StreamBroker`].
//!
//! One sync connection guarded by a mutex; every worker process builds its
//! own broker, so the mutex only serializes a single worker's own calls with
//! its redelivery sweep. Entry ids, consumer-group cursors, pending lists,
//! and delivery counters are all Redis-native (XADD / XGROUP / XREADGROUP /
//! XACK / XPENDING / XCLAIM).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use redis::Commands;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};

use super::{BrokerResult, Delivery, StreamBroker};
use crate::error::BrokerError;
use crate::event::Fields;

/// Redis Streams broker over one sync connection.
pub struct RedisBroker {
    conn: Mutex<redis::Connection>,
}

impl RedisBroker {
    /// Connect to the broker at `url` (e.g. `redis://localhost:6379/`).
    pub fn connect(url: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Connection {
            message: e.to_string(),
        })?;
        let conn = client
            .get_connection()
            .map_err(|e| BrokerError::Connection {
                message: e.to_string(),
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

impl StreamBroker for RedisBroker {
    fn append(&self, stream: &str, fields: &Fields) -> BrokerResult<String> {
        let mut conn = self.conn.lock().unwrap();
        let id: String = conn
            .xadd_map(stream, "*", fields)
            .map_err(|e| command_error(stream, e))?;
        Ok(id)
    }

    fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let created: redis::RedisResult<String> = conn.xgroup_create_mkstream(stream, group, "0");
        match created {
            Ok(_) => Ok(()),
            Err(e) if is_busygroup(&e) => Ok(()),
            Err(e) => Err(command_error(stream, e)),
        }
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.lock().unwrap();
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .map_err(|e| command_error(stream, e))?;

        let mut batch = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                batch.push(Delivery {
                    stream: stream.to_string(),
                    id: entry.id.clone(),
                    fields: value_map_to_fields(&entry.map),
                    delivery_count: 1,
                });
            }
        }
        Ok(batch)
    }

    fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let _acked: i64 = conn
            .xack(stream, group, &[id])
            .map_err(|e| command_error(stream, e))?;
        Ok(())
    }

    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let mut conn = self.conn.lock().unwrap();

        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .map_err(|e| command_error(stream, e))?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        // times_delivered is the count before this claim; the claim below is
        // one more delivery.
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut candidates = Vec::new();
        for entry in &pending.ids {
            counts.insert(entry.id.clone(), entry.times_delivered as u64 + 1);
            candidates.push(entry.id.clone());
        }

        // XCLAIM enforces min-idle itself: entries touched more recently than
        // the cutoff are silently skipped in the reply.
        let claimed: StreamClaimReply = conn
            .xclaim(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                &candidates,
            )
            .map_err(|e| command_error(stream, e))?;

        let mut batch = Vec::new();
        for entry in claimed.ids {
            let delivery_count = counts.get(&entry.id).copied().unwrap_or(1);
            batch.push(Delivery {
                stream: stream.to_string(),
                id: entry.id.clone(),
                fields: value_map_to_fields(&entry.map),
                delivery_count,
            });
        }
        Ok(batch)
    }

    fn stream_len(&self, stream: &str) -> BrokerResult<u64> {
        let mut conn = self.conn.lock().unwrap();
        let len: u64 = conn.xlen(stream).map_err(|e| command_error(stream, e))?;
        Ok(len)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn command_error(stream: &str, e: redis::RedisError) -> BrokerError {
    BrokerError::Command {
        stream: stream.to_string(),
        message: e.to_string(),
    }
}

/// XGROUP CREATE on an existing group is idempotent for us.
fn is_busygroup(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
}

fn value_map_to_fields(map: &HashMap<String, redis::Value>) -> Fields {
    map.iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v.clone())
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect()
}
