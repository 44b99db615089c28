use std::{collections::VecDeque, sync::Mutex, time::Duration};

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLine {
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioChunk {
    pub lines: Vec<CachedLine>,
    /// The producer closed its stream; nothing more will be appended until
    /// the next `reset`.
    pub finished: bool,
}

impl StdioChunk {
    pub fn last_seq(&self) -> Option<u64> {
        self.lines.last().map(|l| l.seq)
    }
}

#[derive(Debug)]
struct CacheState {
    // Identifies the producer lifetime started by the latest `reset`.
    epoch: u64,
    next_seq: u64,
    lines: VecDeque<CachedLine>,
    finished: bool,
}

/// Bounded, sequence-numbered ring of recent lines for one output stream.
///
/// Sequence numbers start at 1 for every process lifetime and only grow.
/// `since == 0` means "from the start". Once more than `capacity` lines have
/// been appended the oldest are dropped, so a reader whose cursor has aged
/// out gets the oldest tail still held instead of an error.
#[derive(Debug)]
pub struct StdioCache {
    capacity: usize,
    state: Mutex<CacheState>,
    // Bumped on every mutation; readers park on it instead of polling.
    version: watch::Sender<u64>,
}

impl StdioCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                epoch: 0,
                next_seq: 1,
                lines: VecDeque::new(),
                // Nothing is producing until the first reset.
                finished: true,
            }),
            version: watch::channel(0).0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        // A panic while holding the lock cannot leave the ring half-updated
        // in a way readers care about; keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Start a new producer lifetime: drop all lines and restart numbering.
    /// Returns the lifetime's epoch; producers of earlier epochs are ignored
    /// from now on.
    pub fn reset(&self) -> u64 {
        let epoch = {
            let mut st = self.lock();
            st.epoch = st.epoch.wrapping_add(1);
            st.next_seq = 1;
            st.lines.clear();
            st.finished = false;
            st.epoch
        };
        self.bump();
        epoch
    }

    /// Append to the current lifetime.
    pub fn append(&self, text: impl Into<String>) -> u64 {
        let epoch = self.lock().epoch;
        self.append_in(epoch, text).unwrap_or_default()
    }

    /// Append on behalf of lifetime `epoch`. `None` when a later `reset` has
    /// superseded it.
    pub fn append_in(&self, epoch: u64, text: impl Into<String>) -> Option<u64> {
        let seq = {
            let mut st = self.lock();
            if st.epoch != epoch {
                return None;
            }
            let seq = st.next_seq;
            st.next_seq = st.next_seq.saturating_add(1);
            st.lines.push_back(CachedLine {
                seq,
                text: text.into(),
            });
            while st.lines.len() > self.capacity {
                st.lines.pop_front();
            }
            seq
        };
        self.bump();
        Some(seq)
    }

    /// Mark the current producer as done and wake every blocked reader.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.bump();
    }

    /// `finish` for lifetime `epoch`; a no-op once it has been superseded.
    pub fn finish_in(&self, epoch: u64) {
        {
            let mut st = self.lock();
            if st.epoch != epoch {
                return;
            }
            st.finished = true;
        }
        self.bump();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Everything after `since` without blocking.
    pub fn snapshot_after(&self, since: u64) -> StdioChunk {
        let st = self.lock();
        tail_after(&st, since)
    }

    /// Everything after `since`, blocking while nothing new exists and the
    /// producer is still running. Dropping the future abandons the wait.
    pub async fn read(&self, since: u64) -> StdioChunk {
        loop {
            // Subscribe before inspecting so a concurrent append between the
            // check and the await still wakes us.
            let mut rx = self.version.subscribe();
            {
                let st = self.lock();
                let chunk = tail_after(&st, since);
                if !chunk.lines.is_empty() || chunk.finished {
                    return chunk;
                }
            }
            if rx.changed().await.is_err() {
                return self.snapshot_after(since);
            }
        }
    }

    /// Like `read`, but gives up after `max_wait` and returns whatever is
    /// there (possibly an empty, unfinished chunk).
    pub async fn read_timeout(&self, since: u64, max_wait: Duration) -> StdioChunk {
        match tokio::time::timeout(max_wait, self.read(since)).await {
            Ok(chunk) => chunk,
            Err(_) => self.snapshot_after(since),
        }
    }
}

fn tail_after(st: &CacheState, since: u64) -> StdioChunk {
    // A cursor beyond anything assigned in this lifetime belongs to an
    // earlier one.
    let since = if since >= st.next_seq { 0 } else { since };
    StdioChunk {
        lines: st
            .lines
            .iter()
            .filter(|l| l.seq > since)
            .cloned()
            .collect(),
        finished: st.finished,
    }
}
