//! Measurement session controller.
//!
//! Owns the reassembler and sample buffer of the active session and drives
//! the session lifecycle:
//!
//! ```text
//! Idle -> Measuring -> Stopping -> Saving -> Success | Error -> Idle
//! ```
//!
//! Finalization happens on END or when the finalize timeout elapses after
//! STOP, whichever comes first. END or link loss while still Measuring
//! passes through Stopping first. Success and Error stay until
//! [`MeasurementController::reset_status`] is called.

use crate::measurement::buffer::SampleBuffer;
use crate::measurement::correlator::correlate_up_to;
use crate::measurement::parser::parse_frame;
use crate::measurement::reassembler::FrameReassembler;
use crate::measurement::types::{
    ControlSignal, CorrelatedPoint, CompanionStatus, DeviceMessage, Sample, SessionConfig,
    SessionOwner, SessionRecord, SessionSnapshot, SessionStatus,
};
use crate::sensors::command::CommandLink;
use crate::sensors::protocol::Command;
use crate::storage::session_store::SessionStore;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Mutable state of the current session.
struct SessionCore {
    status: SessionStatus,
    address: Option<String>,
    reassembler: FrameReassembler,
    buffer: SampleBuffer,
    companion: Option<CompanionStatus>,
    dropped: usize,
    series: Vec<CorrelatedPoint>,
    /// Record kept after a failed save, for retry
    pending: Option<SessionRecord>,
    last_saved: Option<Uuid>,
    /// Bumped on every start so stale timeouts are ignored
    generation: u64,
    finalize_task: Option<JoinHandle<()>>,
}

impl SessionCore {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            address: self.address.clone(),
            sample_count: self.buffer.len(),
            dropped_messages: self.dropped,
            companion: self.companion,
            series: self.series.clone(),
            last_saved: self.last_saved,
        }
    }
}

struct Inner {
    link: Arc<dyn CommandLink>,
    store: Arc<dyn SessionStore>,
    owner: SessionOwner,
    config: SessionConfig,
    core: Mutex<SessionCore>,
    status_tx: watch::Sender<SessionSnapshot>,
    transition_tx: broadcast::Sender<SessionStatus>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, core: &SessionCore) {
        self.status_tx.send_replace(core.snapshot());
    }

    /// Move to `status`, announce the transition and publish a snapshot.
    fn transition(&self, core: &mut SessionCore, status: SessionStatus) {
        if core.status != status {
            tracing::debug!("Session {} -> {}", core.status, status);
            core.status = status;
            let _ = self.transition_tx.send(status);
        }
        self.publish(core);
    }
}

/// Runs measurement sessions against one connected harness.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct MeasurementController {
    inner: Arc<Inner>,
}

impl MeasurementController {
    pub fn new(
        link: Arc<dyn CommandLink>,
        store: Arc<dyn SessionStore>,
        owner: SessionOwner,
        config: SessionConfig,
    ) -> Self {
        let core = SessionCore {
            status: SessionStatus::Idle,
            address: None,
            reassembler: FrameReassembler::new(config.max_message_bytes),
            buffer: SampleBuffer::new(),
            companion: None,
            dropped: 0,
            series: Vec::new(),
            pending: None,
            last_saved: None,
            generation: 0,
            finalize_task: None,
        };
        let (status_tx, _) = watch::channel(core.snapshot());
        let (transition_tx, _) = broadcast::channel(32);

        Self {
            inner: Arc::new(Inner {
                link,
                store,
                owner,
                config,
                core: Mutex::new(core),
                status_tx,
                transition_tx,
            }),
        }
    }

    /// Current session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    /// Receive a snapshot on every session transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Receive every status transition in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SessionStatus> {
        self.inner.transition_tx.subscribe()
    }

    /// Samples buffered for the running session.
    pub fn samples(&self) -> Vec<Sample> {
        self.inner.lock().buffer.samples().to_vec()
    }

    /// Begin a session and send START.
    ///
    /// Requires status Idle and exactly one connected peripheral; returns
    /// `false` without side effects otherwise.
    pub fn start(&self) -> bool {
        let mut core = self.inner.lock();
        if core.status != SessionStatus::Idle {
            tracing::warn!("Start ignored: session is {}", core.status);
            return false;
        }

        let Some(address) = self.single_connected() else {
            return false;
        };

        if let Err(e) = self.inner.link.send_command(&address, Command::Start) {
            tracing::error!("Failed to send START to {}: {}", address, e);
            return false;
        }

        core.buffer.clear();
        core.reassembler.reset();
        core.series.clear();
        core.pending = None;
        core.dropped = 0;
        core.generation += 1;
        tracing::info!("Measurement started on {}", address);
        core.address = Some(address);
        self.inner.transition(&mut core, SessionStatus::Measuring);
        true
    }

    /// Send STOP and arm the finalize timeout.
    ///
    /// Only valid while Measuring.
    pub fn stop(&self) -> bool {
        let mut core = self.inner.lock();
        if core.status != SessionStatus::Measuring {
            tracing::warn!("Stop ignored: session is {}", core.status);
            return false;
        }

        if let Some(address) = core.address.as_deref() {
            if let Err(e) = self.inner.link.send_command(address, Command::Stop) {
                tracing::error!("Failed to send STOP to {}: {}", address, e);
            }
        }

        let generation = core.generation;
        core.finalize_task = self.spawn_finalize_timeout(generation);

        tracing::info!("Measurement stopping, {} samples buffered", core.buffer.len());
        self.inner.transition(&mut core, SessionStatus::Stopping);
        true
    }

    /// Ask the master unit for the secondary unit's status.
    ///
    /// Only valid while Idle with exactly one connected peripheral.
    pub fn check_companion(&self) -> bool {
        let mut core = self.inner.lock();
        if core.status != SessionStatus::Idle {
            tracing::warn!("Companion check ignored: session is {}", core.status);
            return false;
        }

        let Some(address) = self.single_connected() else {
            return false;
        };

        if let Err(e) = self.inner.link.send_command(&address, Command::CheckCompanion) {
            tracing::error!("Failed to send companion check to {}: {}", address, e);
            return false;
        }

        core.reassembler.reset();
        core.companion = None;
        core.address = Some(address);
        self.inner.publish(&core);
        true
    }

    /// Feed one notification payload from `address`.
    pub fn on_notification(&self, address: &str, payload: &[u8]) {
        let mut core = self.inner.lock();
        if core.address.as_deref().is_some_and(|expected| expected != address) {
            tracing::debug!("Ignoring notification from {}", address);
            return;
        }

        let frames = core.reassembler.feed(payload);
        let mut end_of_stream = false;
        for frame in frames {
            match parse_frame(&frame) {
                Ok(DeviceMessage::Sample(sample)) => self.accept_sample(&mut core, sample),
                Ok(DeviceMessage::Control(ControlSignal::Companion(status))) => {
                    tracing::info!("Companion unit status: {:?}", status);
                    core.companion = Some(status);
                }
                Ok(DeviceMessage::Control(ControlSignal::EndOfStream)) => end_of_stream = true,
                Err(e) => {
                    core.dropped += 1;
                    tracing::warn!("Dropped message {:?}: {}", frame.as_str(), e);
                }
            }
        }

        if core.reassembler.is_terminated() {
            core.reassembler.reset();
        }

        let active = matches!(core.status, SessionStatus::Measuring | SessionStatus::Stopping);
        if end_of_stream && active {
            if let Some(record) = self.finalize(core, "END received") {
                self.save(record);
            }
        } else {
            if end_of_stream {
                tracing::debug!("END outside a session ignored");
            }
            self.inner.publish(&core);
        }
    }

    /// The peripheral at `address` went away.
    ///
    /// A running session is finalized with whatever was buffered.
    pub fn on_link_lost(&self, address: &str) {
        let mut core = self.inner.lock();
        if core.address.as_deref() != Some(address) {
            return;
        }

        let status = core.status;
        match status {
            SessionStatus::Measuring | SessionStatus::Stopping => {
                tracing::warn!("Link to {} lost during measurement", address);
                if let Some(record) = self.finalize(core, "link lost") {
                    self.save(record);
                }
            }
            SessionStatus::Idle => {
                core.address = None;
                core.reassembler.reset();
                self.inner.publish(&core);
            }
            _ => {}
        }
    }

    /// Acknowledge Success or Error and return to Idle.
    ///
    /// Samples retained after a failed save are released.
    pub fn reset_status(&self) -> bool {
        let mut core = self.inner.lock();
        if !core.status.is_terminal() {
            tracing::warn!("Reset ignored: session is {}", core.status);
            return false;
        }

        if core.pending.take().is_some() {
            tracing::info!("Discarding unsaved session");
        }
        self.inner.transition(&mut core, SessionStatus::Idle);
        true
    }

    /// Resubmit the record whose save failed.
    pub fn retry_save(&self) -> bool {
        let mut core = self.inner.lock();
        if core.status != SessionStatus::Error {
            tracing::warn!("Retry ignored: session is {}", core.status);
            return false;
        }
        let Some(record) = core.pending.take() else {
            return false;
        };

        self.inner.transition(&mut core, SessionStatus::Saving);
        drop(core);

        tracing::info!("Retrying save of session {}", record.id);
        self.save(record);
        true
    }

    fn single_connected(&self) -> Option<String> {
        let mut addresses = self.inner.link.connected_addresses();
        if addresses.len() != 1 {
            tracing::warn!(
                "Exactly one connected harness required, found {}",
                addresses.len()
            );
            return None;
        }
        addresses.pop()
    }

    fn accept_sample(&self, core: &mut SessionCore, sample: Sample) {
        if !matches!(core.status, SessionStatus::Measuring | SessionStatus::Stopping) {
            tracing::debug!("Sample outside a session ignored");
            return;
        }
        if sample.sequence_index > self.inner.config.max_sequence_index {
            core.dropped += 1;
            tracing::warn!(
                "Dropped sample {} #{}: index out of range",
                sample.source,
                sample.sequence_index
            );
            return;
        }
        core.buffer.push(sample);
    }

    fn spawn_finalize_timeout(&self, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, finalizing on END only");
            return None;
        };

        let inner = Arc::downgrade(&self.inner);
        let timeout = Duration::from_millis(self.inner.config.finalize_timeout_ms);

        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let controller = MeasurementController { inner };
            let Some(record) = controller.finalize_after_timeout(generation) else {
                return;
            };
            // Store backends do blocking I/O
            if let Err(e) = tokio::task::spawn_blocking(move || controller.save(record)).await {
                tracing::error!("Session save task failed: {}", e);
            }
        }))
    }

    fn finalize_after_timeout(&self, generation: u64) -> Option<SessionRecord> {
        let mut core = self.inner.lock();
        if core.status != SessionStatus::Stopping || core.generation != generation {
            return None;
        }
        // This task is the one running; do not abort it
        core.finalize_task = None;
        self.finalize(core, "finalize timeout")
    }

    /// Close the session and return the record to hand to the store.
    ///
    /// Leaves status Saving when a record is returned.
    fn finalize(
        &self,
        mut core: MutexGuard<'_, SessionCore>,
        reason: &str,
    ) -> Option<SessionRecord> {
        if let Some(task) = core.finalize_task.take() {
            task.abort();
        }
        core.reassembler.reset();
        if core.status == SessionStatus::Measuring {
            self.inner.transition(&mut core, SessionStatus::Stopping);
        }

        let samples = core.buffer.take();
        if samples.is_empty() {
            tracing::info!("Session finished ({}) with no samples", reason);
            core.series.clear();
            self.inner.transition(&mut core, SessionStatus::Idle);
            return None;
        }

        let series = correlate_up_to(&samples, self.inner.config.max_sequence_index);
        tracing::info!(
            "Session finished ({}): {} samples, {} points",
            reason,
            samples.len(),
            series.len()
        );

        let record = SessionRecord {
            id: Uuid::new_v4(),
            owner: self.inner.owner.clone(),
            timestamp: Utc::now(),
            samples,
            series: self.inner.config.persist_series.then(|| series.clone()),
        };

        core.series = series;
        self.inner.transition(&mut core, SessionStatus::Saving);
        Some(record)
    }

    fn save(&self, record: SessionRecord) {
        let result = self.inner.store.save(&record);

        let mut core = self.inner.lock();
        match result {
            Ok(()) => {
                core.last_saved = Some(record.id);
                core.pending = None;
                self.inner.transition(&mut core, SessionStatus::Success);
            }
            Err(e) => {
                tracing::error!("Failed to save session {}: {}", record.id, e);
                core.pending = Some(record);
                self.inner.transition(&mut core, SessionStatus::Error);
            }
        }
    }
}
