//! In-memory broker double for unit and pipeline tests.
//!
//! Implements the full consumer-group contract — cursor per group, pending
//! lists, delivery counts, `claim_stale` redelivery — without any I/O, so the
//! at-least-once properties of the pipeline can be tested deterministically.
//! Blocking reads return immediately; callers that want pacing sleep themselves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{BrokerResult, Delivery, StreamBroker};
use crate::event::Fields;

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Last entry id handed out via `read_group` (`""` = from the start).
    last_delivered_id: String,
    /// Entry id → pending bookkeeping.
    pending: BTreeMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    /// Entry id → fields. Ids are zero-padded so the map iterates in
    /// append order.
    entries: BTreeMap<String, Fields>,
    seq: u64,
    groups: HashMap<String, GroupState>,
}

/// In-memory [`StreamBroker`] implementation.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries of a stream in append order (for test assertions).
    pub fn dump(&self, stream: &str) -> Vec<(String, Fields)> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| (id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entries pending (delivered, unacked) for a group.
    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }
}

impl StreamBroker for MemoryBroker {
    fn append(&self, stream: &str, fields: &Fields) -> BrokerResult<String> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.seq += 1;
        let id = format!("{:016}-0", state.seq);
        state.entries.insert(id.clone(), fields.clone());
        Ok(id)
    }

    fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();

        let mut batch = Vec::new();
        let group_state = state.groups.entry(group.to_string()).or_default();
        for (id, fields) in state
            .entries
            .range::<String, _>((
                std::ops::Bound::Excluded(group_state.last_delivered_id.clone()),
                std::ops::Bound::Unbounded,
            ))
            .take(count)
        {
            batch.push(Delivery {
                stream: stream.to_string(),
                id: id.clone(),
                fields: fields.clone(),
                delivery_count: 1,
            });
        }

        for delivery in &batch {
            group_state.last_delivered_id = delivery.id.clone();
            group_state.pending.insert(
                delivery.id.clone(),
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
        }

        Ok(batch)
    }

    fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<()> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(stream)
            && let Some(group_state) = state.groups.get_mut(group)
        {
            group_state.pending.remove(id);
        }
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
        let mut streams = self.streams.lock().unwrap();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries = &state.entries;
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(fields) = entries.get(id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(Delivery {
                stream: stream.to_string(),
                id: id.clone(),
                fields: fields.clone(),
                delivery_count: pending.delivery_count,
            });
        }

        Ok(claimed)
    }

    fn stream_len(&self, stream: &str) -> BrokerResult<u64> {
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: u32) -> Fields {
        Fields::from([("n".to_string(), n.to_string())])
    }

    #[test]
    fn append_assigns_ordered_ids() {
        let broker = MemoryBroker::new();
        let a = broker.append("s", &fields(1)).unwrap();
        let b = broker.append("s", &fields(2)).unwrap();
        assert!(a < b);
        assert_eq!(broker.stream_len("s").unwrap(), 2);
    }

    #[test]
    fn read_group_delivers_each_entry_once() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g").unwrap();
        broker.append("s", &fields(1)).unwrap();
        broker.append("s", &fields(2)).unwrap();

        let first = broker
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].delivery_count, 1);

        let second = broker
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn two_groups_both_see_every_entry() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g1").unwrap();
        broker.create_group("s", "g2").unwrap();
        broker.append("s", &fields(1)).unwrap();

        let a = broker.read_group("s", "g1", "c", 10, Duration::ZERO).unwrap();
        let b = broker.read_group("s", "g2", "c", 10, Duration::ZERO).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn group_created_after_appends_starts_at_zero() {
        let broker = MemoryBroker::new();
        broker.append("s", &fields(1)).unwrap();
        broker.create_group("s", "late").unwrap();
        let read = broker
            .read_group("s", "late", "c", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn ack_clears_pending() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g").unwrap();
        broker.append("s", &fields(1)).unwrap();

        let read = broker.read_group("s", "g", "c", 1, Duration::ZERO).unwrap();
        assert_eq!(broker.pending_len("s", "g"), 1);

        broker.ack("s", "g", &read[0].id).unwrap();
        assert_eq!(broker.pending_len("s", "g"), 0);

        // Nothing left to claim.
        let claimed = broker
            .claim_stale("s", "g", "c2", Duration::ZERO, 10)
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn unacked_entry_is_reclaimed_with_bumped_count() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g").unwrap();
        broker.append("s", &fields(1)).unwrap();

        let read = broker.read_group("s", "g", "c1", 1, Duration::ZERO).unwrap();
        assert_eq!(read[0].delivery_count, 1);

        let claimed = broker
            .claim_stale("s", "g", "c2", Duration::ZERO, 10)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, read[0].id);
        assert_eq!(claimed[0].delivery_count, 2);

        let again = broker
            .claim_stale("s", "g", "c1", Duration::ZERO, 10)
            .unwrap();
        assert_eq!(again[0].delivery_count, 3);
    }

    #[test]
    fn claim_respects_min_idle() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g").unwrap();
        broker.append("s", &fields(1)).unwrap();
        broker.read_group("s", "g", "c1", 1, Duration::ZERO).unwrap();

        let claimed = broker
            .claim_stale("s", "g", "c2", Duration::from_secs(3600), 10)
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(broker.pending_len("s", "g"), 1);
    }

    #[test]
    fn ids_sort_in_append_order_past_single_digits() {
        let broker = MemoryBroker::new();
        let mut last = String::new();
        for n in 0..12 {
            let id = broker.append("s", &fields(n)).unwrap();
            assert!(id > last, "{id} should sort after {last}");
            last = id;
        }
    }
}
