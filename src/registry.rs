//! In-memory registry of live and recently finished builds.
//!
//! The registry backs both admission (at most one live build per
//! builder/revision pair, a global cap on live builds) and the status page.
//! One mutex guards the live map and the recent ring together; it is only
//! ever held for short in-memory operations, never across I/O.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// A build's combined stdout+stderr is capped at this; the rest is dropped.
pub const MAX_OUTPUT_BYTES: usize = 2 << 20;

/// How many finished builds are retained for the status page.
pub const MAX_RECENT: usize = 30;

/// Key identifying one build attempt: a builder name and a lowercase hex
/// revision hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuilderRev {
    pub name: String,
    pub rev: String,
}

impl BuilderRev {
    pub fn new(name: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rev: rev.into(),
        }
    }
}

impl fmt::Display for BuilderRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.rev)
    }
}

#[derive(Debug, Default)]
struct BuildState {
    done: Option<DateTime<Utc>>,
    succeeded: bool,
    output: Vec<u8>,
}

/// Runtime record of one build attempt.
///
/// The identity fields are immutable. Completion and output live behind an
/// internal mutex with two concurrent writers: the exit waiter and the log
/// streamer.
#[derive(Debug)]
pub struct BuildStatus {
    pub builder_rev: BuilderRev,
    /// Container ID, or a VM name for remote builds.
    pub container: String,
    pub start: DateTime<Utc>,
    state: Mutex<BuildState>,
}

impl BuildStatus {
    pub fn new(builder_rev: BuilderRev, container: impl Into<String>) -> Self {
        Self {
            builder_rev,
            container: container.into(),
            start: Utc::now(),
            state: Mutex::new(BuildState::default()),
        }
    }

    /// Records completion. Idempotent in effect; the last caller wins.
    pub async fn set_done(&self, succeeded: bool) {
        let mut state = self.state.lock().await;
        state.succeeded = succeeded;
        state.done = Some(Utc::now());
    }

    /// Appends combined output, silently truncating once the ceiling is hit.
    pub async fn append_output(&self, chunk: &[u8]) {
        let mut state = self.state.lock().await;
        let room = MAX_OUTPUT_BYTES.saturating_sub(state.output.len());
        let take = chunk.len().min(room);
        state.output.extend_from_slice(&chunk[..take]);
    }

    /// Copy of the output captured so far.
    pub async fn output(&self) -> Vec<u8> {
        self.state.lock().await.output.clone()
    }

    /// Completion time and success flag. The flag is meaningful only once the
    /// completion time is set.
    pub async fn completion(&self) -> (Option<DateTime<Utc>>, bool) {
        let state = self.state.lock().await;
        (state.done, state.succeeded)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    live: HashMap<BuilderRev, Arc<BuildStatus>>,
    recent: VecDeque<Arc<BuildStatus>>,
}

/// Live builds plus a FIFO ring of recently finished ones.
#[derive(Debug)]
pub struct StatusRegistry {
    max_builds: usize,
    max_recent: usize,
    inner: Mutex<RegistryInner>,
}

impl StatusRegistry {
    pub fn new(max_builds: usize) -> Self {
        Self::with_capacities(max_builds, MAX_RECENT)
    }

    pub fn with_capacities(max_builds: usize, max_recent: usize) -> Self {
        Self {
            max_builds,
            max_recent,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// True when a build for `br` may start: the live set is below the
    /// admission cap and no build with the same key is already in flight.
    pub async fn may_build(&self, br: &BuilderRev) -> bool {
        let inner = self.inner.lock().await;
        inner.live.len() < self.max_builds && !inner.live.contains_key(br)
    }

    pub async fn set_status(&self, br: BuilderRev, status: Arc<BuildStatus>) {
        self.inner.lock().await.live.insert(br, status);
    }

    /// Moves a live build into the recent ring, evicting the oldest finished
    /// build when the ring is full. Unknown keys are ignored.
    pub async fn mark_done(&self, br: &BuilderRev) {
        let mut inner = self.inner.lock().await;
        let Some(status) = inner.live.remove(br) else {
            return;
        };
        if inner.recent.len() == self.max_recent {
            inner.recent.pop_front();
        }
        inner.recent.push_back(status);
    }

    /// The live build for `br`, or the most recent finished one.
    pub async fn get(&self, br: &BuilderRev) -> Option<Arc<BuildStatus>> {
        let inner = self.inner.lock().await;
        if let Some(status) = inner.live.get(br) {
            return Some(Arc::clone(status));
        }
        inner
            .recent
            .iter()
            .find(|status| status.builder_rev == *br)
            .map(Arc::clone)
    }

    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    /// Copies of the live set and the recent ring, for rendering outside the
    /// lock. Recent builds come back in completion order.
    pub async fn snapshot(&self) -> (Vec<Arc<BuildStatus>>, Vec<Arc<BuildStatus>>) {
        let inner = self.inner.lock().await;
        let live = inner.live.values().map(Arc::clone).collect();
        let recent = inner.recent.iter().map(Arc::clone).collect();
        (live, recent)
    }
}
