//! router.rs
//! Data router of one instance: bounded queue -> single consumer -> latest
//! sample + active log sink.
//!
//! - `push` never blocks. On a full queue the incoming sample is dropped,
//!   counted, and every `DROP_LOG_EVERY`th drop is logged.
//! - The consumer thread owns the sink. Switches and closes reach it as control
//!   messages and are acknowledged, so the old sink is drained, flushed and
//!   closed before the new one sees a sample.
//! - The instance lock is only held to copy state in or out, never across a
//!   sink write.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::device::params::ExperimentMode;
use crate::error::{PlatformError, Result};
use crate::host::instance::SharedInstance;
use crate::telemetry::TelemetrySample;
use crate::utils::log_sink::{LogSink, wall_clock};

pub const ROUTER_CAPACITY: usize = 1_000;
pub const DROP_LOG_EVERY: u64 = 100;
const CONSUMER_POLL_MS: u64 = 5;
const BATCH: usize = 256;
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// A routed sample with its host receive time.
#[derive(Debug, Clone, Copy)]
pub struct Routed {
    pub sample: TelemetrySample,
    pub received_at: f64,
}

enum Control {
    Switch {
        sink: Box<dyn LogSink>,
        mode: ExperimentMode,
        ack: Sender<()>,
    },
    Close {
        ack: Sender<()>,
    },
}

pub struct DataRouter {
    instance: String,
    queue: Arc<ArrayQueue<Routed>>,
    dropped: Arc<AtomicU64>,
    control_tx: Sender<Control>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DataRouter {
    pub fn start(instance: &str, state: SharedInstance, capacity: usize) -> Result<Self> {
        let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
        let dropped = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (control_tx, control_rx) = unbounded();

        let consumer = Consumer {
            instance: instance.to_string(),
            queue: queue.clone(),
            dropped: dropped.clone(),
            state,
            sink: None,
            written_since_sync: 0,
        };
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(format!("router-{instance}"))
            .spawn(move || consumer.run(flag, control_rx))?;

        Ok(Self {
            instance: instance.to_string(),
            queue,
            dropped,
            control_tx,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Non-blocking enqueue.
    pub fn push(&self, sample: TelemetrySample) -> Result<()> {
        let routed = Routed {
            sample,
            received_at: wall_clock(),
        };
        if self.queue.push(routed).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % DROP_LOG_EVERY == 1 {
                warn!("[{}] router queue full, {} samples dropped", self.instance, dropped);
            }
            return Err(PlatformError::Overflow { dropped });
        }
        Ok(())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn send_and_wait(&self, build: impl FnOnce(Sender<()>) -> Control) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control_tx
            .send(build(ack_tx))
            .map_err(|_| PlatformError::transport("router stopped"))?;
        ack_rx
            .recv_timeout(ACK_TIMEOUT)
            .map_err(|_| PlatformError::transport("router did not acknowledge"))
    }

    /// Install `sink` for samples of `mode`. Returns once the previous sink is closed.
    pub fn switch_sink(&self, sink: Box<dyn LogSink>, mode: ExperimentMode) -> Result<()> {
        self.send_and_wait(|ack| Control::Switch { sink, mode, ack })
    }

    /// Drain, flush and close the active sink. Samples keep updating the latest value.
    pub fn close_sink(&self) -> Result<()> {
        self.send_and_wait(|ack| Control::Close { ack })
    }

    /// Final drain, close the sink, join the consumer.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.lock().take() {
            if h.join().is_err() {
                error!("[{}] router consumer panicked", self.instance);
            }
        }
    }
}

impl Drop for DataRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveSink {
    sink: Box<dyn LogSink>,
    mode: ExperimentMode,
}

struct Consumer {
    instance: String,
    queue: Arc<ArrayQueue<Routed>>,
    dropped: Arc<AtomicU64>,
    state: SharedInstance,
    sink: Option<ActiveSink>,
    written_since_sync: u64,
}

impl Consumer {
    fn run(mut self, running: Arc<AtomicBool>, control_rx: Receiver<Control>) {
        while running.load(Ordering::SeqCst) {
            while let Ok(ctl) = control_rx.try_recv() {
                self.handle_control(ctl);
            }
            if self.drain(BATCH) == 0 {
                self.sync_counters();
                thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
            }
        }

        // pending switches still get their ack, then everything left is written
        while let Ok(ctl) = control_rx.try_recv() {
            self.handle_control(ctl);
        }
        while self.drain(BATCH) > 0 {}
        self.close_active();
        self.sync_counters();
        debug!(
            "[{}] router consumer exiting, dropped={}",
            self.instance,
            self.dropped.load(Ordering::Relaxed)
        );
    }

    fn handle_control(&mut self, ctl: Control) {
        match ctl {
            Control::Switch { sink, mode, ack } => {
                while self.drain(BATCH) > 0 {}
                self.close_active();
                let label = sink.label().to_string();
                info!("[{}] logging {:?} to {}", self.instance, mode, label);
                self.sink = Some(ActiveSink { sink, mode });
                self.state.lock().sink_label = Some(label);
                let _ = ack.send(());
            }
            Control::Close { ack } => {
                while self.drain(BATCH) > 0 {}
                self.close_active();
                let _ = ack.send(());
            }
        }
    }

    fn close_active(&mut self) {
        if let Some(mut active) = self.sink.take() {
            if let Err(e) = active.sink.close() {
                error!("[{}] closing {} failed: {}", self.instance, active.sink.label(), e);
            }
            self.state.lock().sink_label = None;
        }
    }

    /// Pop up to `max` samples. Returns how many were taken.
    fn drain(&mut self, max: usize) -> usize {
        let mut taken = 0;
        while taken < max {
            let Some(routed) = self.queue.pop() else {
                break;
            };
            taken += 1;

            self.state.lock().update_latest(routed.sample);

            // samples of another mode never land in this mode's log
            let Some(active) = self.sink.as_mut() else {
                continue;
            };
            if active.mode != routed.sample.mode() {
                continue;
            }
            match active.sink.write_row(routed.received_at, &routed.sample.fields()) {
                Ok(()) => self.written_since_sync += 1,
                Err(e) => error!("[{}] log write failed: {}", self.instance, e),
            }
        }
        if taken > 0 {
            self.sync_counters();
        }
        taken
    }

    fn sync_counters(&mut self) {
        let written = std::mem::take(&mut self.written_since_sync);
        let mut st = self.state.lock();
        st.stats.written += written;
        st.stats.dropped = self.dropped.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use crate::host::instance::InstanceState;
    use crate::telemetry::PidSample;
    use crate::utils::log_sink::MemoryLogSink;

    fn pid(i: usize) -> TelemetrySample {
        TelemetrySample::Pid(PidSample {
            elapsed_s: i as f64,
            input: 10.0,
            reference: 10.0,
            error: 0.0,
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            output: 0.0,
        })
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn samples_reach_sink_and_latest() {
        let state = InstanceState::shared();
        let router = DataRouter::start("a", state.clone(), 64).unwrap();
        let (sink, log) = MemoryLogSink::new("a/pid");
        router.switch_sink(Box::new(sink), ExperimentMode::Pid).unwrap();

        for i in 0..10 {
            router.push(pid(i)).unwrap();
        }
        wait_for(|| log.len() == 10);
        assert_eq!(state.lock().latest.map(|s| s.elapsed_s()), Some(9.0));
        router.shutdown();
        assert!(log.is_closed());
        assert_eq!(state.lock().stats.written, 10);
    }

    #[test]
    fn overflow_drops_incoming() {
        let state = InstanceState::shared();
        let router = DataRouter::start("a", state.clone(), 4).unwrap();
        // stop the consumer first so nothing drains
        router.shutdown();
        let mut dropped = 0;
        for i in 0..10 {
            if let Err(PlatformError::Overflow { .. }) = router.push(pid(i)) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 6);
        assert_eq!(router.dropped(), 6);
        assert_eq!(router.queue_len(), 4);
    }

    #[test]
    fn switch_closes_previous_sink_first() {
        let state = InstanceState::shared();
        let router = DataRouter::start("a", state.clone(), 64).unwrap();
        let (first, first_log) = MemoryLogSink::new("first");
        let (second, second_log) = MemoryLogSink::new("second");

        router.switch_sink(Box::new(first), ExperimentMode::Pid).unwrap();
        for i in 0..5 {
            router.push(pid(i)).unwrap();
        }
        router.switch_sink(Box::new(second), ExperimentMode::Pid).unwrap();
        // everything queued before the switch went to the first sink
        assert_eq!(first_log.len(), 5);
        assert!(first_log.is_closed());
        assert_eq!(state.lock().sink_label.as_deref(), Some("second"));

        router.push(pid(5)).unwrap();
        wait_for(|| second_log.len() == 1);
        assert_eq!(first_log.writes_after_close(), 0);
    }

    #[test]
    fn other_mode_samples_are_not_logged() {
        let state = InstanceState::shared();
        let router = DataRouter::start("a", state.clone(), 64).unwrap();
        let (sink, log) = MemoryLogSink::new("a/step");
        router.switch_sink(Box::new(sink), ExperimentMode::Step).unwrap();
        router.push(pid(0)).unwrap();
        router.close_sink().unwrap();
        assert!(log.is_empty());
        assert!(state.lock().latest.is_some());
    }
}
