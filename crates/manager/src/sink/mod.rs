//! Event rows for recording manager activity.
//!
//! Two row schemas:
//! - [`AccessEventRow`]: one per grant or release
//! - [`StateEventRow`]: one per right state transition
//!
//! Rows are written as NDJSON by [`json_stream::EventSink`].

pub mod json_stream;

pub use json_stream::EventSink;

use crate::manager::{AccessStateListener, HierarchicalAccessManager};
use arbiter_core::{AccessRequest, AccessState, ArbiterError, ListenerRef, Right};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// One row per grant or release.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEventRow {
    pub seq: u64,
    pub access_id: String,
    /// `true` on grant, `false` on release.
    pub acquired: bool,
    pub read_rights: Vec<Right>,
    pub write_rights: Vec<Right>,
    pub created_at_ms: u64,
}

impl AccessEventRow {
    pub fn new<I: fmt::Display>(seq: u64, request: &AccessRequest<I>, acquired: bool) -> Self {
        Self {
            seq,
            access_id: request.id().to_string(),
            acquired,
            read_rights: request.read_rights().to_vec(),
            write_rights: request.write_rights().to_vec(),
            created_at_ms: now_millis(),
        }
    }
}

/// One row per right entering a new state.
#[derive(Debug, Clone, Serialize)]
pub struct StateEventRow {
    pub seq: u64,
    pub right: Right,
    pub state: AccessState,
    pub created_at_ms: u64,
}

impl StateEventRow {
    pub fn new(seq: u64, right: &Right, state: AccessState) -> Self {
        Self {
            seq,
            right: right.clone(),
            state,
            created_at_ms: now_millis(),
        }
    }
}

/// Milliseconds since the Unix epoch; zero if the clock is before it.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Streams every grant and release of `manager` into `sink`.
///
/// Write failures surface as listener failures, which the manager logs.
pub fn record_access_events<I, W>(
    manager: &HierarchicalAccessManager<I>,
    sink: Arc<Mutex<EventSink<W>>>,
) -> ListenerRef
where
    I: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static,
    W: Write + Send + 'static,
{
    let seq = AtomicU64::new(0);
    manager.add_access_change_listener(move |request, acquired| {
        let row = AccessEventRow::new(seq.fetch_add(1, Ordering::Relaxed), request, acquired);
        sink.lock()
            .write_row(&row)
            .map_err(|e| ArbiterError::Internal(format!("event sink write failed: {e}")))
    })
}

/// State listener writing one [`StateEventRow`] per transition into
/// `sink`. Install it with [`HierarchicalAccessManager::with_state_listener`].
pub fn record_state_events<W>(sink: Arc<Mutex<EventSink<W>>>) -> impl AccessStateListener
where
    W: Write + Send + 'static,
{
    let seq = AtomicU64::new(0);
    move |right: &Right, state: AccessState| {
        let row = StateEventRow::new(seq.fetch_add(1, Ordering::Relaxed), right, state);
        sink.lock()
            .write_row(&row)
            .map_err(|e| ArbiterError::Internal(format!("event sink write failed: {e}")))
    }
}
