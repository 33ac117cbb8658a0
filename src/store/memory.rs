//! In-process fast store
//!
//! One mutex guards all data so an [`AtomicBatch`] is trivially atomic.
//! Blocking stream reads park on a [`Notify`] that every `XADD` wakes.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::{
    AtomicBatch, Command, ExecOutcome, FastStore, Guard, PendingSummary, StoreResult,
    StreamRecord,
};
use crate::core_types::{StreamId, now_ms};
use crate::error::StoreError;

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<StreamId, Vec<(String, String)>>,
    last_id: StreamId,
    groups: FxHashMap<String, ConsumerGroup>,
}

impl Stream {
    fn append(&mut self, fields: Vec<(String, String)>) -> StreamId {
        let id = self.last_id.next_after(now_ms());
        self.last_id = id;
        self.entries.insert(id, fields);
        id
    }
}

#[derive(Debug, Default)]
struct Inner {
    strings: FxHashMap<String, String>,
    hashes: FxHashMap<String, FxHashMap<String, String>>,
    streams: FxHashMap<String, Stream>,
}

impl Inner {
    fn guard_holds(&self, guard: &Guard) -> bool {
        match guard {
            Guard::HashField {
                key,
                field,
                expected,
            } => {
                let current = self.hashes.get(key).and_then(|h| h.get(field));
                current.map(String::as_str) == expected.as_deref()
            }
        }
    }

    fn apply(&mut self, command: Command, ids: &mut Vec<StreamId>) {
        match command {
            Command::Set { key, value } => {
                self.strings.insert(key, value);
            }
            Command::Del { key } => {
                self.strings.remove(&key);
                self.hashes.remove(&key);
                self.streams.remove(&key);
            }
            Command::HSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            Command::HDel { key, field } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    hash.remove(&field);
                    if hash.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            Command::XAdd { stream, fields } => {
                ids.push(self.streams.entry(stream).or_default().append(fields));
            }
        }
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> StoreResult<(&mut ConsumerGroup, &BTreeMap<StreamId, Vec<(String, String)>>)> {
        let no_group = || StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let s = self.streams.get_mut(stream).ok_or_else(no_group)?;
        let g = s.groups.get_mut(group).ok_or_else(no_group)?;
        Ok((g, &s.entries))
    }
}

/// In-process [`FastStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    stream_appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamRecord>> {
        let mut inner = self.lock()?;
        let (g, entries) = inner.group_mut(stream, group)?;

        let start = std::ops::Bound::Excluded(g.last_delivered);
        let mut out = Vec::new();
        for (id, fields) in entries.range((start, std::ops::Bound::Unbounded)).take(count) {
            out.push(StreamRecord {
                id: *id,
                fields: fields.clone(),
                delivery_count: 1,
            });
        }
        let now = Instant::now();
        for record in &out {
            g.last_delivered = record.id;
            g.pending.insert(
                record.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock()?
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .lock()?
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let inner = self.lock()?;
        let hash = inner.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f)).cloned())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .lock()?
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.lock()?
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock()?;
        let mut out: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.streams.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    async fn exec_atomic(&self, batch: AtomicBatch) -> StoreResult<ExecOutcome> {
        let mut ids = Vec::new();
        let appended = {
            let mut inner = self.lock()?;
            if !batch.guards.iter().all(|g| inner.guard_holds(g)) {
                return Ok(ExecOutcome::Aborted);
            }
            let appended = batch
                .commands
                .iter()
                .any(|c| matches!(c, Command::XAdd { .. }));
            for command in batch.commands {
                inner.apply(command, &mut ids);
            }
            appended
        };
        if appended {
            self.stream_appended.notify_waiters();
        }
        Ok(ExecOutcome::Applied(ids))
    }

    async fn xadd(&self, stream: &str, fields: Vec<(String, String)>) -> StoreResult<StreamId> {
        let id = self
            .lock()?
            .streams
            .entry(stream.to_string())
            .or_default()
            .append(fields);
        self.stream_appended.notify_waiters();
        Ok(id)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> StoreResult<()> {
        self.lock()?
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamRecord>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.stream_appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.try_read_group(stream, group, consumer, count)?;
            if !records.is_empty() {
                return Ok(records);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(records);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamRecord>> {
        let mut inner = self.lock()?;
        let (g, entries) = inner.group_mut(stream, group)?;
        let now = Instant::now();

        let mut out = Vec::new();
        let mut vanished = Vec::new();
        for (id, pending) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.delivery_count += 1;
                    out.push(StreamRecord {
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: pending.delivery_count,
                    });
                }
                None => vanished.push(*id),
            }
        }
        // deleted while pending
        for id in vanished {
            g.pending.remove(&id);
        }
        Ok(out)
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[StreamId]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let (g, _) = inner.group_mut(stream, group)?;
        Ok(ids.iter().filter(|id| g.pending.remove(id).is_some()).count())
    }

    async fn xdel(&self, stream: &str, ids: &[StreamId]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let Some(s) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| s.entries.remove(id).is_some()).count())
    }

    async fn xlen(&self, stream: &str) -> StoreResult<usize> {
        Ok(self
            .lock()?
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }

    async fn xpending(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let mut inner = self.lock()?;
        let (g, _) = inner.group_mut(stream, group)?;
        let mut summary = PendingSummary {
            count: g.pending.len(),
            ..Default::default()
        };
        for pending in g.pending.values() {
            *summary
                .consumers
                .entry(pending.consumer.clone())
                .or_default() += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fields(v: &str) -> Vec<(String, String)> {
        vec![("k".to_string(), v.to_string())]
    }

    #[tokio::test]
    async fn test_hash_and_scalar_commands() {
        let store = MemoryStore::new();
        store.set("stock:AAPL", "100").await.unwrap();
        store.hset("user_balance", "1", "1000").await.unwrap();

        assert_eq!(store.get("stock:AAPL").await.unwrap().as_deref(), Some("100"));
        assert_eq!(store.hget("user_balance", "1").await.unwrap().as_deref(), Some("1000"));
        assert_eq!(
            store
                .hmget("user_balance", &["1".into(), "2".into()])
                .await
                .unwrap(),
            vec![Some("1000".to_string()), None]
        );
        assert!(store.hdel("user_balance", "1").await.unwrap());
        assert!(!store.hdel("user_balance", "1").await.unwrap());
        assert_eq!(store.keys("stock:").await.unwrap(), vec!["stock:AAPL".to_string()]);
    }

    #[tokio::test]
    async fn test_exec_atomic_guard_aborts_without_writing() {
        let store = MemoryStore::new();
        store.hset("user_balance", "1", "1000").await.unwrap();

        let mut batch = AtomicBatch::new();
        batch
            .guard_hash_field("user_balance", "1", Some("999".into()))
            .hset("user_balance", "1", "500")
            .xadd("buy_stream", fields("a"));
        assert_eq!(store.exec_atomic(batch).await.unwrap(), ExecOutcome::Aborted);
        assert_eq!(store.hget("user_balance", "1").await.unwrap().as_deref(), Some("1000"));
        assert_eq!(store.xlen("buy_stream").await.unwrap(), 0);

        let mut batch = AtomicBatch::new();
        batch
            .guard_hash_field("user_balance", "1", Some("1000".into()))
            .hset("user_balance", "1", "500")
            .xadd("buy_stream", fields("a"));
        let ExecOutcome::Applied(ids) = store.exec_atomic(batch).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(ids.len(), 1);
        assert_eq!(store.hget("user_balance", "1").await.unwrap().as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn test_stream_ids_increase() {
        let store = MemoryStore::new();
        let a = store.xadd("s", fields("1")).await.unwrap();
        let b = store.xadd("s", fields("2")).await.unwrap();
        let c = store.xadd("s", fields("3")).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_group_delivers_each_entry_once() {
        let store = MemoryStore::new();
        store.xgroup_create("s", "g").await.unwrap();
        for i in 0..5 {
            store.xadd("s", fields(&i.to_string())).await.unwrap();
        }

        let first = store.xreadgroup("s", "g", "c1", 3, Duration::ZERO).await.unwrap();
        let second = store.xreadgroup("s", "g", "c2", 3, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|r| !second.iter().any(|s| s.id == r.id)));

        let pending = store.xpending("s", "g").await.unwrap();
        assert_eq!(pending.count, 5);
        assert_eq!(pending.consumers.get("c1"), Some(&3));

        let ids: Vec<StreamId> = first.iter().map(|r| r.id).collect();
        assert_eq!(store.xack("s", "g", &ids).await.unwrap(), 3);
        assert_eq!(store.xdel("s", &ids).await.unwrap(), 3);
        assert_eq!(store.xlen("s").await.unwrap(), 2);
        assert_eq!(store.xpending("s", "g").await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let store = MemoryStore::new();
        let err = store
            .xreadgroup("s", "missing", "c", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        store.xgroup_create("s", "g").await.unwrap();
        let started = Instant::now();
        let out = store
            .xreadgroup("s", "g", "c", 10, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(MemoryStore::new());
        store.xgroup_create("s", "g").await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .xreadgroup("s", "g", "c", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.xadd("s", fields("x")).await.unwrap();

        let out = reader.await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_autoclaim_takes_over_idle_entries() {
        let store = MemoryStore::new();
        store.xgroup_create("s", "g").await.unwrap();
        let id = store.xadd("s", fields("x")).await.unwrap();
        store.xreadgroup("s", "g", "dead", 10, Duration::ZERO).await.unwrap();

        // not idle long enough yet
        let claimed = store
            .xautoclaim("s", "g", "alive", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = store
            .xautoclaim("s", "g", "alive", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].delivery_count, 2);
        assert_eq!(
            store.xpending("s", "g").await.unwrap().consumers.get("alive"),
            Some(&1)
        );
    }
}
