use crate::types::WithTimestamp;
use std::{collections::VecDeque, time::Duration};

/// Samples of one stream awaiting a join, ordered by non-decreasing
/// timestamp.
#[derive(Debug)]
pub struct Buffer<T>
where
    T: WithTimestamp,
{
    buffer: VecDeque<T>,
    last_ts: Option<Duration>,
}

impl<T> Default for Buffer<T>
where
    T: WithTimestamp,
{
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> Buffer<T>
where
    T: WithTimestamp,
{
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            last_ts: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Timestamp of the latest accepted message, even if it has since
    /// been consumed.
    pub fn last_ts(&self) -> Option<Duration> {
        self.last_ts
    }

    /// Drops all buffered messages. The timestamp watermark is kept so
    /// that regressions are still rejected.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Drops samples older than `ts` and returns how many were dropped.
    pub fn drop_before(&mut self, ts: Duration) -> usize {
        let count = self.buffer.partition_point(|item| item.timestamp() < ts);
        self.buffer.drain(..count);
        count
    }

    /// Removes every message at or before `ts` and returns the latest of
    /// them.
    pub fn drain_until(&mut self, ts: Duration) -> Option<T> {
        let count = self.buffer.partition_point(|item| item.timestamp() <= ts);
        self.buffer.drain(..count).last()
    }

    /// Finds the most recent message at or before `ts` that is no older
    /// than `window`.
    pub fn nearest_past(&self, ts: Duration, window: Duration) -> Option<&T> {
        let index = self.nearest_past_index(ts, window)?;
        self.buffer.get(index)
    }

    /// Like [nearest_past](Self::nearest_past), but removes the match
    /// together with every older message.
    pub fn take_nearest_past(&mut self, ts: Duration, window: Duration) -> Option<T> {
        let index = self.nearest_past_index(ts, window)?;
        self.buffer.drain(..=index).last()
    }

    fn nearest_past_index(&self, ts: Duration, window: Duration) -> Option<usize> {
        let index = self
            .buffer
            .partition_point(|item| item.timestamp() <= ts)
            .checked_sub(1)?;
        let age = ts.saturating_sub(self.buffer[index].timestamp());
        (age <= window).then_some(index)
    }

    /// Appends a sample, or hands it back when it is older than the
    /// latest accepted one. Equal timestamps are accepted.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        let timestamp = item.timestamp();

        match self.last_ts {
            Some(last_ts) if last_ts > timestamp => return Err(item),
            _ => {}
        }

        self.last_ts = Some(timestamp);
        self.buffer.push_back(item);
        Ok(())
    }
}
