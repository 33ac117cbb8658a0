//! Append-only event log
//!
//! Topics hold an ordered list of records addressed by offset. A consumer
//! group shares one cursor across all its consumers, so each record is handed
//! to one member at a time. Delivered records stay in flight until the holder
//! either `commit`s them (done) or `release`s them (hand out again). Dropping
//! a consumer releases whatever it still holds.
//!
//! Each group keeps a committed watermark: every offset below it is committed.
//! With a data directory the watermark and the records survive restarts, and a
//! reopened group resumes at its watermark. Anything delivered but not
//! committed before a crash is delivered again.

pub mod segment;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::core_types::LogOffset;
use crate::error::EventLogError;
use segment::SegmentWriter;

pub type LogResult<T> = Result<T, EventLogError>;

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: LogOffset,
    pub payload: Arc<[u8]>,
}

/// Producer side plus group subscription.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> LogResult<LogOffset>;

    /// Join `group` on `topic`. Creates both if needed.
    async fn subscribe(&self, topic: &str, group: &str) -> LogResult<Box<dyn LogConsumer>>;
}

/// One member of a consumer group.
#[async_trait]
pub trait LogConsumer: Send {
    /// Next record for this group, waiting up to `timeout`.
    async fn poll(&mut self, timeout: Duration) -> LogResult<Option<LogRecord>>;

    /// Mark records done. Fails without effect if any offset is not held by
    /// this consumer.
    async fn commit(&mut self, offsets: &[LogOffset]) -> LogResult<()>;

    /// Give records back for redelivery.
    async fn release(&mut self, offsets: &[LogOffset]) -> LogResult<()>;
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: LogOffset,
    redeliver: BTreeSet<LogOffset>,
    /// offset → consumer id
    in_flight: BTreeMap<LogOffset, u64>,
    committed_above: BTreeSet<LogOffset>,
    watermark: LogOffset,
}

impl GroupState {
    fn resume_at(watermark: LogOffset) -> Self {
        Self {
            cursor: watermark,
            watermark,
            ..Default::default()
        }
    }

    fn next_offset(&mut self, available: LogOffset) -> Option<LogOffset> {
        if let Some(offset) = self.redeliver.pop_first() {
            return Some(offset);
        }
        if self.cursor < available {
            let offset = self.cursor;
            self.cursor += 1;
            return Some(offset);
        }
        None
    }

    /// Returns true if the watermark moved.
    fn commit(&mut self, offsets: &[LogOffset]) -> bool {
        for offset in offsets {
            self.in_flight.remove(offset);
            if *offset >= self.watermark {
                self.committed_above.insert(*offset);
            }
        }
        let before = self.watermark;
        while self.committed_above.remove(&self.watermark) {
            self.watermark += 1;
        }
        self.watermark != before
    }

    fn release_consumer(&mut self, consumer_id: u64) -> usize {
        let held: Vec<LogOffset> = self
            .in_flight
            .iter()
            .filter(|(_, c)| **c == consumer_id)
            .map(|(o, _)| *o)
            .collect();
        for offset in &held {
            self.in_flight.remove(offset);
            self.redeliver.insert(*offset);
        }
        held.len()
    }
}

struct TopicState {
    records: Vec<Arc<[u8]>>,
    segment: Option<SegmentWriter<BufWriter<File>>>,
    groups: FxHashMap<String, GroupState>,
}

struct Topic {
    name: String,
    dir: Option<PathBuf>,
    state: Mutex<TopicState>,
    appended: Notify,
}

impl Topic {
    fn open(name: &str, dir: Option<&Path>) -> LogResult<Self> {
        let (records, segment) = match dir {
            Some(dir) => {
                let path = dir.join(format!("{}.log", name));
                let records: Vec<Arc<[u8]>> = segment::recover(&path)?
                    .into_iter()
                    .map(Arc::from)
                    .collect();
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                if !records.is_empty() {
                    tracing::info!(topic = name, records = records.len(), "Recovered topic segment");
                }
                (records, Some(SegmentWriter::new(BufWriter::new(file))))
            }
            None => (Vec::new(), None),
        };
        Ok(Self {
            name: name.to_string(),
            dir: dir.map(Path::to_path_buf),
            state: Mutex::new(TopicState {
                records,
                segment,
                groups: FxHashMap::default(),
            }),
            appended: Notify::new(),
        })
    }

    fn lock(&self) -> LogResult<MutexGuard<'_, TopicState>> {
        self.state.lock().map_err(|_| EventLogError::Closed)
    }

    fn watermark_path(&self, group: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.{}.offset", self.name, group)))
    }

    fn ensure_group(&self, group: &str) -> LogResult<()> {
        let mut state = self.lock()?;
        if state.groups.contains_key(group) {
            return Ok(());
        }
        let watermark = match self.watermark_path(group) {
            Some(path) => segment::read_watermark(&path)?.unwrap_or(0),
            None => 0,
        };
        let watermark = watermark.min(state.records.len() as u64);
        state
            .groups
            .insert(group.to_string(), GroupState::resume_at(watermark));
        Ok(())
    }
}

/// In-process broker. Memory only, or backed by one segment per topic.
pub struct LogBroker {
    dir: Option<PathBuf>,
    topics: Mutex<FxHashMap<String, Arc<Topic>>>,
    closed: AtomicBool,
    next_consumer_id: AtomicU64,
}

impl LogBroker {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            topics: Mutex::new(FxHashMap::default()),
            closed: AtomicBool::new(false),
            next_consumer_id: AtomicU64::new(1),
        }
    }

    /// Durable broker rooted at `dir` (created if missing).
    pub fn open(dir: impl AsRef<Path>) -> LogResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: Some(dir.as_ref().to_path_buf()),
            ..Self::in_memory()
        })
    }

    fn topic(&self, name: &str) -> LogResult<Arc<Topic>> {
        let mut topics = self.topics.lock().map_err(|_| EventLogError::Closed)?;
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic = Arc::new(Topic::open(name, self.dir.as_deref())?);
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    /// Refuse further publishes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn topic_len(&self, topic: &str) -> LogResult<usize> {
        Ok(self.topic(topic)?.lock()?.records.len())
    }

    /// Records of `topic` not yet committed by `group`.
    pub fn backlog(&self, topic: &str, group: &str) -> LogResult<usize> {
        let len = self.topic_len(topic)?;
        let mark = self.watermark(topic, group)?.unwrap_or(0);
        Ok(len.saturating_sub(mark as usize))
    }

    /// Committed watermark of `group`, `None` if the group never subscribed.
    pub fn watermark(&self, topic: &str, group: &str) -> LogResult<Option<LogOffset>> {
        Ok(self
            .topic(topic)?
            .lock()?
            .groups
            .get(group)
            .map(|g| g.watermark))
    }
}

#[async_trait]
impl EventLog for LogBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> LogResult<LogOffset> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventLogError::Closed);
        }
        let topic = self.topic(topic)?;
        let offset = {
            let mut state = topic.lock()?;
            let offset = state.records.len() as LogOffset;
            if let Some(segment) = state.segment.as_mut() {
                segment.append(offset, payload)?;
            }
            state.records.push(Arc::from(payload));
            offset
        };
        topic.appended.notify_waiters();
        Ok(offset)
    }

    async fn subscribe(&self, topic: &str, group: &str) -> LogResult<Box<dyn LogConsumer>> {
        let topic = self.topic(topic)?;
        topic.ensure_group(group)?;
        Ok(Box::new(GroupConsumer {
            topic,
            group: group.to_string(),
            id: self.next_consumer_id.fetch_add(1, Ordering::Relaxed),
        }))
    }
}

struct GroupConsumer {
    topic: Arc<Topic>,
    group: String,
    id: u64,
}

impl GroupConsumer {
    fn try_next(&self) -> LogResult<Option<LogRecord>> {
        let mut state = self.topic.lock()?;
        let available = state.records.len() as LogOffset;
        let TopicState {
            records, groups, ..
        } = &mut *state;
        let group = groups
            .get_mut(&self.group)
            .ok_or(EventLogError::Closed)?;
        match group.next_offset(available) {
            Some(offset) => {
                group.in_flight.insert(offset, self.id);
                Ok(Some(LogRecord {
                    offset,
                    payload: records[offset as usize].clone(),
                }))
            }
            None => Ok(None),
        }
    }

    fn check_held(&self, group: &GroupState, offsets: &[LogOffset]) -> LogResult<()> {
        for offset in offsets {
            if group.in_flight.get(offset) != Some(&self.id) {
                return Err(EventLogError::UnknownOffset(*offset));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for GroupConsumer {
    async fn poll(&mut self, timeout: Duration) -> LogResult<Option<LogRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.topic.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_next()? {
                return Ok(Some(record));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn commit(&mut self, offsets: &[LogOffset]) -> LogResult<()> {
        let persist = {
            let mut state = self.topic.lock()?;
            let group = state
                .groups
                .get_mut(&self.group)
                .ok_or(EventLogError::Closed)?;
            self.check_held(group, offsets)?;
            group.commit(offsets).then_some(group.watermark)
        };
        if let (Some(watermark), Some(path)) = (persist, self.topic.watermark_path(&self.group)) {
            segment::write_watermark(&path, watermark)?;
        }
        Ok(())
    }

    async fn release(&mut self, offsets: &[LogOffset]) -> LogResult<()> {
        {
            let mut state = self.topic.lock()?;
            let group = state
                .groups
                .get_mut(&self.group)
                .ok_or(EventLogError::Closed)?;
            self.check_held(group, offsets)?;
            for offset in offsets {
                group.in_flight.remove(offset);
                group.redeliver.insert(*offset);
            }
        }
        self.topic.appended.notify_waiters();
        Ok(())
    }
}

impl Drop for GroupConsumer {
    fn drop(&mut self) {
        let released = match self.topic.state.lock() {
            Ok(mut state) => state
                .groups
                .get_mut(&self.group)
                .map(|g| g.release_consumer(self.id))
                .unwrap_or(0),
            Err(_) => 0,
        };
        if released > 0 {
            tracing::debug!(
                topic = %self.topic.name,
                group = %self.group,
                released,
                "Consumer left, in-flight records released"
            );
            self.topic.appended.notify_waiters();
        }
    }
}
