use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::report::ErrorReportState;

/// Payload of the "changed" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportChanged {
    pub base: String,
    pub state: ErrorReportState,
    pub seen: bool,
}

/// Receives "changed" notifications synchronously on the thread that owns the
/// reports.
pub trait ChangeSink: Send + Sync {
    fn changed(&self, change: &ReportChanged);
}

pub struct SilentChangeSink;

impl ChangeSink for SilentChangeSink {
    fn changed(&self, _change: &ReportChanged) {}
}

/// Forwards notifications to a UI loop that polls a channel.
pub struct ChannelChangeSink {
    tx: mpsc::UnboundedSender<ReportChanged>,
}

impl ChannelChangeSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportChanged>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChangeSink for ChannelChangeSink {
    fn changed(&self, change: &ReportChanged) {
        if self.tx.send(change.clone()).is_err() {
            tracing::debug!(
                target: "crashstore",
                event = "change_receiver_closed",
                base = %change.base
            );
        }
    }
}

/// Keeps every notification in arrival order.
#[derive(Default)]
pub struct RecordingChangeSink {
    seen: Mutex<Vec<ReportChanged>>,
}

impl RecordingChangeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<ReportChanged> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count_for(&self, base: &str) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|change| change.base == base)
            .count()
    }
}

impl ChangeSink for RecordingChangeSink {
    fn changed(&self, change: &ReportChanged) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(change.clone());
    }
}

/// Fan-out list shared by the manager and every report it owns.
#[derive(Clone, Default)]
pub struct Subscribers {
    sinks: Arc<Mutex<Vec<Arc<dyn ChangeSink>>>>,
}

impl Subscribers {
    pub fn subscribe(&self, sink: Arc<dyn ChangeSink>) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, change: &ReportChanged) {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for sink in sinks {
            sink.changed(change);
        }
    }
}
