use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotEntry {
    pub timestamp_ms: Option<i64>,
    pub data: Option<Arc<Value>>,
    pub available: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProcessEntry {
    pub name: String,
    pub pid: u32,
    pub command: String,
    pub media: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Crashed,
}

pub struct SharedState {
    started_at_unix: i64,
    snapshot: watch::Sender<SnapshotEntry>,
    processes: RwLock<Arc<Vec<GpuProcessEntry>>>,
    supervisor: RwLock<SupervisorState>,
    spawns: AtomicU64,
}

impl SharedState {
    pub fn new(now_unix: i64) -> Arc<Self> {
        let (snapshot, _) = watch::channel(SnapshotEntry::default());
        Arc::new(Self {
            started_at_unix: now_unix,
            snapshot,
            processes: RwLock::new(Arc::new(Vec::new())),
            supervisor: RwLock::new(SupervisorState::NotStarted),
            spawns: AtomicU64::new(0),
        })
    }

    pub fn started_at_unix(&self) -> i64 {
        self.started_at_unix
    }

    pub fn snapshot(&self) -> SnapshotEntry {
        self.snapshot.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.snapshot.borrow().available
    }

    pub fn subscribe(&self) -> watch::Receiver<SnapshotEntry> {
        self.snapshot.subscribe()
    }

    pub fn publish_snapshot(&self, data: Value) {
        let timestamp_ms = now_unix_ms();
        let data = Arc::new(data);
        self.snapshot.send_modify(|entry| {
            entry.timestamp_ms = Some(timestamp_ms);
            entry.data = Some(data);
            entry.available = true;
            entry.sequence += 1;
        });
    }

    /// Clears the availability flag without waking push subscribers; the
    /// previous snapshot stays readable.
    pub fn mark_unavailable(&self) {
        self.snapshot.send_if_modified(|entry| {
            entry.available = false;
            false
        });
    }

    pub fn processes(&self) -> Arc<Vec<GpuProcessEntry>> {
        match self.processes.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace_processes(&self, list: Vec<GpuProcessEntry>) {
        let list = Arc::new(list);
        match self.processes.write() {
            Ok(mut guard) => *guard = list,
            Err(poisoned) => *poisoned.into_inner() = list,
        }
    }

    pub fn supervisor_state(&self) -> SupervisorState {
        match self.supervisor.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_supervisor_state(&self, next: SupervisorState) {
        match self.supervisor.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn record_spawn(&self) -> u64 {
        self.spawns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
