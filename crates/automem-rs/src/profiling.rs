//! Debug and profile sidecar for the memory core.
//!
//! Three process-global collectors hang off `OnceLock` accessors: a leveled
//! [`DebugLog`] of `(scope, detail)` events, an [`ImplProfile`] recording
//! storage lifetimes and access sequences, and the tiny [`AMemProfiler`] map
//! of per-node execution times. All of them are opt-in through `AUTOMEM_*`
//! environment knobs and otherwise cost a branch per hook. A caller-installed
//! debug callback can be invoked from hot paths to stamp events with an
//! external counter (e.g. a step number).

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::env;

/// Severity of a debug-log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub scope: String,
    pub detail: String,
    pub stamp: i64,
}

#[derive(Default)]
struct LevelLog {
    events: Vec<LogEvent>,
    count: u64,
}

/// Bounded, leveled event collector.
///
/// Each level keeps at most `AUTOMEM_LOG_CAP` events in memory; when the cap
/// is reached the retained block is drained so long runs stay bounded. The
/// per-level `count` keeps the lifetime total across drains.
#[derive(Default)]
pub struct DebugLog {
    inner: Mutex<[LevelLog; 4]>,
}

fn level_index(level: LogLevel) -> usize {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warning => 2,
        LogLevel::Error => 3,
    }
}

impl DebugLog {
    /// Records an event when capture is enabled.
    pub fn add(&self, level: LogLevel, scope: &str, detail: &str) {
        if !env::debug_log_enabled() {
            return;
        }
        let stamp = invoke_debug_callback();
        let mut inner = self.inner.lock().expect("debug log poisoned");
        let slot = &mut inner[level_index(level)];
        slot.count += 1;
        slot.events.push(LogEvent {
            scope: scope.to_string(),
            detail: detail.to_string(),
            stamp,
        });
        if slot.events.len() >= env::log_cap() {
            slot.events.clear();
        }
    }

    /// Returns a copy of the retained events for `level`.
    pub fn events(&self, level: LogLevel) -> Vec<LogEvent> {
        let inner = self.inner.lock().expect("debug log poisoned");
        inner[level_index(level)].events.clone()
    }

    /// Lifetime event count for `level`, including drained events.
    pub fn count(&self, level: LogLevel) -> u64 {
        let inner = self.inner.lock().expect("debug log poisoned");
        inner[level_index(level)].count
    }

    pub fn clear(&self, level: LogLevel) {
        let mut inner = self.inner.lock().expect("debug log poisoned");
        inner[level_index(level)].events.clear();
    }

    /// Serializes the retained events of every level to JSON.
    pub fn export_json(&self) -> String {
        let inner = self.inner.lock().expect("debug log poisoned");
        let report: BTreeMap<&str, &[LogEvent]> = [
            ("debug", inner[0].events.as_slice()),
            ("info", inner[1].events.as_slice()),
            ("warning", inner[2].events.as_slice()),
            ("error", inner[3].events.as_slice()),
        ]
        .into_iter()
        .collect();
        serde_json::to_string(&report).expect("debug log serialization failed")
    }
}

/// Lifetime record for one storage, keyed by its entity/storage id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageProfileEntry {
    pub data_tag: u64,
    pub life_start_us: i64,
    pub life_end_us: i64,
    pub size_bytes: u64,
    pub access_us: Vec<i64>,
}

/// Storage lifetime and access profile.
#[derive(Default)]
pub struct ImplProfile {
    inner: Mutex<BTreeMap<u64, StorageProfileEntry>>,
}

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

impl ImplProfile {
    pub fn storage_life_start(&self, id: u64) {
        if !env::profile_enabled() {
            return;
        }
        let mut inner = self.inner.lock().expect("impl profile poisoned");
        let entry = inner.entry(id).or_default();
        entry.life_start_us = now_us();
    }

    pub fn storage_life_end(&self, id: u64) {
        if !env::profile_enabled() {
            return;
        }
        let mut inner = self.inner.lock().expect("impl profile poisoned");
        let entry = inner.entry(id).or_default();
        entry.life_end_us = now_us();
    }

    pub fn storage_set_storage(&self, id: u64, data_tag: u64, size_bytes: u64) {
        if !env::profile_enabled() {
            return;
        }
        let mut inner = self.inner.lock().expect("impl profile poisoned");
        let entry = inner.entry(id).or_default();
        entry.data_tag = data_tag;
        entry.size_bytes = size_bytes;
    }

    pub fn storage_append_access(&self, id: u64) {
        if !env::profile_enabled() {
            return;
        }
        let mut inner = self.inner.lock().expect("impl profile poisoned");
        let entry = inner.entry(id).or_default();
        entry.access_us.push(now_us());
    }

    pub fn clear(&self) {
        self.inner.lock().expect("impl profile poisoned").clear();
    }

    pub fn snapshot(&self) -> BTreeMap<u64, StorageProfileEntry> {
        self.inner.lock().expect("impl profile poisoned").clone()
    }
}

/// Per-node execution-time map kept for the autograd-side reaper.
#[derive(Default)]
pub struct AMemProfiler {
    grad_execution_time: Mutex<BTreeMap<i32, i32>>,
}

impl AMemProfiler {
    pub fn init(&self) {
        self.grad_execution_time
            .lock()
            .expect("amem profiler poisoned")
            .clear();
    }

    pub fn record(&self, node: i32, millis: i32) {
        self.grad_execution_time
            .lock()
            .expect("amem profiler poisoned")
            .insert(node, millis);
    }

    pub fn snapshot(&self) -> BTreeMap<i32, i32> {
        self.grad_execution_time
            .lock()
            .expect("amem profiler poisoned")
            .clone()
    }
}

type DebugCallback = Box<dyn Fn() -> i64 + Send + Sync>;

static DEBUG_LOG: OnceLock<DebugLog> = OnceLock::new();
static IMPL_PROFILE: OnceLock<ImplProfile> = OnceLock::new();
static AMEM_PROFILER: OnceLock<AMemProfiler> = OnceLock::new();
static DEBUG_CALLBACK: RwLock<Option<DebugCallback>> = RwLock::new(None);

pub fn debug_log() -> &'static DebugLog {
    DEBUG_LOG.get_or_init(DebugLog::default)
}

pub fn impl_profile() -> &'static ImplProfile {
    IMPL_PROFILE.get_or_init(ImplProfile::default)
}

pub fn amem_profiler() -> &'static AMemProfiler {
    AMEM_PROFILER.get_or_init(AMemProfiler::default)
}

/// Installs the process-global debug callback invoked on every captured event.
pub fn set_debug_callback<F>(f: F)
where
    F: Fn() -> i64 + Send + Sync + 'static,
{
    *DEBUG_CALLBACK.write().expect("debug callback poisoned") = Some(Box::new(f));
}

pub(crate) fn invoke_debug_callback() -> i64 {
    match &*DEBUG_CALLBACK.read().expect("debug callback poisoned") {
        Some(f) => f(),
        None => 0,
    }
}
