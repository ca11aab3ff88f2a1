//! param_sync.rs
//! Host side of the parameter channel for one instance.
//!
//! A worker thread owns the channel session. Outgoing commands reach it over a
//! crossbeam channel; confirmations flow back into the instance's confirmed
//! cache and out as `SyncEvent`s. After every (re)connect the worker subscribes
//! to the namespace's confirmation topics and asks the device to republish
//! everything, so the confirmed cache converges after any outage.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::channel::backoff::Backoff;
use crate::channel::bus::{ChannelConnection, Connector, Message};
use crate::channel::topic::{TopicKind, flag, parse_flag};
use crate::device::deadband::CalibrationResult;
use crate::device::params::{ExperimentMode, ParamKey};
use crate::error::{PlatformError, Result};
use crate::host::instance::{InstanceState, ParameterConfirmation, SharedInstance};
use crate::host::namespace::InstanceNamespace;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_SLICE: Duration = Duration::from_millis(25);
/// Unread events beyond this are dropped.
const EVENT_BACKLOG: usize = 1024;

/// Runs on the worker thread for every event, before the next message is read.
pub type SyncHook = Box<dyn FnMut(&SyncEvent) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Confirmed { key: ParamKey, value: f64 },
    Activation { mode: ExperimentMode, active: bool },
    CalibrationResult(CalibrationResult),
    CalibrationError(String),
    DeadbandApplied(f64),
}

struct Outbound {
    topic: String,
    payload: String,
}

pub struct ParamSyncClient {
    ns: InstanceNamespace,
    state: SharedInstance,
    outbound: Sender<Outbound>,
    events: Receiver<SyncEvent>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ParamSyncClient {
    pub fn start<C: Connector>(ns: InstanceNamespace, connector: C, state: SharedInstance) -> Result<Self> {
        Self::start_with_hook(ns, connector, state, None)
    }

    pub fn start_with_hook<C: Connector>(
        ns: InstanceNamespace,
        connector: C,
        state: SharedInstance,
        hook: Option<SyncHook>,
    ) -> Result<Self> {
        let (outbound, outbound_rx) = unbounded();
        let (events_tx, events) = bounded(EVENT_BACKLOG);
        let running = Arc::new(AtomicBool::new(true));

        let worker = SyncWorker {
            ns: ns.clone(),
            state: state.clone(),
            connector,
            conn: None,
            backoff: Backoff::default(),
            outbound: outbound_rx,
            events: events_tx,
            hook,
        };
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(format!("sync-{}", ns.instance_id))
            .spawn(move || worker.run(flag))?;

        Ok(Self {
            ns,
            state,
            outbound,
            events,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn namespace(&self) -> &InstanceNamespace {
        &self.ns
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().channel_connected
    }

    pub fn events(&self) -> &Receiver<SyncEvent> {
        &self.events
    }

    fn send(&self, topic: String, payload: String) -> Result<()> {
        if !self.is_connected() {
            return Err(PlatformError::transport(format!("{}: channel not connected", self.ns.instance_id)));
        }
        self.outbound
            .send(Outbound { topic, payload })
            .map_err(|_| PlatformError::transport("sync worker stopped"))
    }

    /// Clamp to the namespace limits, record as commanded, publish. Returns the sent value.
    pub fn set_param(&self, key: ParamKey, value: f64) -> Result<f64> {
        let (sent, warning) = self.ns.clamp(key, value);
        if let Some(w) = warning {
            warn!("[{}] {}", self.ns.instance_id, w);
        }
        self.send(self.ns.topics.command(key), sent.to_string())?;
        self.state.lock().commanded.insert(key, sent);
        Ok(sent)
    }

    pub fn start_mode(&self, mode: ExperimentMode) -> Result<()> {
        self.send(self.ns.topics.sync(mode), flag(true).to_string())
    }

    pub fn stop_mode(&self, mode: ExperimentMode) -> Result<()> {
        self.send(self.ns.topics.sync(mode), flag(false).to_string())
    }

    pub fn request_params(&self, mode: ExperimentMode) -> Result<()> {
        self.send(self.ns.topics.request_params(mode), String::new())
    }

    pub fn apply_deadband(&self) -> Result<()> {
        self.send(self.ns.topics.deadband_apply(), flag(true).to_string())
    }

    /// Block until `pred` holds for the instance state or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(&InstanceState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.state.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
        self.state.lock().channel_connected = false;
    }
}

impl Drop for ParamSyncClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct SyncWorker<C: Connector> {
    ns: InstanceNamespace,
    state: SharedInstance,
    connector: C,
    conn: Option<C::Connection>,
    backoff: Backoff,
    outbound: Receiver<Outbound>,
    events: Sender<SyncEvent>,
    hook: Option<SyncHook>,
}

impl<C: Connector> SyncWorker<C> {
    fn run(mut self, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            if self.conn.is_none() {
                if let Err(e) = self.connect() {
                    let delay = self.backoff.next_delay();
                    debug!(
                        "[{}] channel connect failed ({}), attempt {}, retry in {:?}",
                        self.ns.instance_id,
                        e,
                        self.backoff.attempts(),
                        delay
                    );
                    sleep_while(&running, delay);
                    continue;
                }
            }
            if let Err(e) = self.service() {
                self.lost(e);
            }
        }
        if self.conn.take().is_some() {
            info!("[{}] channel disconnected", self.ns.instance_id);
        }
    }

    fn connect(&mut self) -> Result<()> {
        let mut conn = self.connector.connect()?;
        for topic in self.ns.topics.host_subscriptions() {
            conn.subscribe(&topic)?;
        }
        for mode in ExperimentMode::ACTIVE {
            conn.publish(&self.ns.topics.request_params(mode), "")?;
        }
        self.conn = Some(conn);
        self.backoff.reset();
        self.state.lock().channel_connected = true;
        info!("[{}] channel connected, resync requested", self.ns.instance_id);
        self.emit(SyncEvent::Connected);
        Ok(())
    }

    fn lost(&mut self, e: PlatformError) {
        warn!("[{}] channel lost: {}", self.ns.instance_id, e);
        self.conn = None;
        self.state.lock().channel_connected = false;
        // queued commands belong to the dead session
        let stale = self.outbound.try_iter().count();
        if stale > 0 {
            warn!("[{}] {} queued commands discarded", self.ns.instance_id, stale);
        }
        self.emit(SyncEvent::Disconnected);
    }

    fn emit(&mut self, event: SyncEvent) {
        if let Some(hook) = self.hook.as_mut() {
            hook(&event);
        }
        let _ = self.events.try_send(event);
    }

    fn service(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        while let Ok(out) = self.outbound.try_recv() {
            conn.publish(&out.topic, &out.payload)?;
        }
        if let Some(msg) = conn.poll(POLL_INTERVAL)? {
            self.handle(msg);
        }
        Ok(())
    }

    fn handle(&mut self, msg: Message) {
        let Some(kind) = self.ns.topics.parse(&msg.topic) else {
            return;
        };
        let id = self.ns.instance_id.clone();
        let event = match kind {
            TopicKind::Status(key) => {
                let Ok(value) = msg.payload.trim().parse::<f64>() else {
                    warn!("[{}] bad confirmation {:?} on {}", id, msg.payload, msg.topic);
                    return;
                };
                self.state.lock().confirmed.insert(
                    key,
                    ParameterConfirmation { key, value, at: Instant::now() },
                );
                SyncEvent::Confirmed { key, value }
            }
            TopicKind::SyncStatus(mode) => {
                let Some(active) = parse_flag(&msg.payload) else {
                    warn!("[{}] bad sync status {:?}", id, msg.payload);
                    return;
                };
                let mut st = self.state.lock();
                if active {
                    st.active_mode = Some(mode);
                } else if st.active_mode == Some(mode) {
                    st.active_mode = None;
                }
                SyncEvent::Activation { mode, active }
            }
            TopicKind::DeadbandResult => match serde_json::from_str::<CalibrationResult>(&msg.payload) {
                Ok(result) => {
                    info!("[{}] deadband calibrated at {}", id, result.drive);
                    let mut st = self.state.lock();
                    st.calibration = Some(result);
                    st.calibration_error = None;
                    st.detected_deadband = Some(result.drive);
                    SyncEvent::CalibrationResult(result)
                }
                Err(e) => {
                    warn!("[{}] bad calibration result {:?}: {}", id, msg.payload, e);
                    return;
                }
            },
            TopicKind::DeadbandError => {
                warn!("[{}] calibration failed: {}", id, msg.payload);
                self.state.lock().calibration_error = Some(msg.payload.clone());
                SyncEvent::CalibrationError(msg.payload)
            }
            TopicKind::DeadbandApplied => match msg.payload.trim().parse::<f64>() {
                Ok(v) => SyncEvent::DeadbandApplied(v),
                Err(_) => return,
            },
            // our own outgoing topics
            TopicKind::Command(_)
            | TopicKind::Sync(_)
            | TopicKind::RequestParams(_)
            | TopicKind::DeadbandApply => return,
        };
        self.emit(event);
    }
}

fn sleep_while(running: &AtomicBool, total: Duration) {
    let end = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= end {
            break;
        }
        thread::sleep(IDLE_SLICE.min(end - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::bus::Broker;

    const WAIT: Duration = Duration::from_secs(2);

    fn next_event(client: &ParamSyncClient) -> SyncEvent {
        client.events().recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn connect_requests_resync_for_every_mode() {
        let broker = Broker::new();
        let ns = InstanceNamespace::new("a", 0, "t/a");
        let mut device = broker.connector().connect().unwrap();
        for mode in ExperimentMode::ACTIVE {
            device.subscribe(&ns.topics.request_params(mode)).unwrap();
        }

        let client = ParamSyncClient::start(ns.clone(), broker.connector(), InstanceState::shared()).unwrap();
        assert_eq!(next_event(&client), SyncEvent::Connected);

        let mut seen = Vec::new();
        while let Some(msg) = device.poll(Duration::from_millis(100)).unwrap() {
            seen.push(msg.topic);
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&"t/a/deadband/request_params".to_string()));
    }

    #[test]
    fn confirmations_fill_the_cache() {
        let broker = Broker::new();
        let ns = InstanceNamespace::new("a", 0, "t/a");
        let state = InstanceState::shared();
        let client = ParamSyncClient::start(ns.clone(), broker.connector(), state.clone()).unwrap();
        assert_eq!(next_event(&client), SyncEvent::Connected);

        let mut device = broker.connector().connect().unwrap();
        device.publish(&ns.topics.status(ParamKey::Kp), "42").unwrap();
        device.publish(&ns.topics.sync_status(ExperimentMode::Step), "true").unwrap();

        assert_eq!(next_event(&client), SyncEvent::Confirmed { key: ParamKey::Kp, value: 42.0 });
        assert_eq!(
            next_event(&client),
            SyncEvent::Activation { mode: ExperimentMode::Step, active: true }
        );
        let st = state.lock();
        assert_eq!(st.confirmed_value(ParamKey::Kp), Some(42.0));
        assert_eq!(st.active_mode, Some(ExperimentMode::Step));
    }

    #[test]
    fn commands_are_clamped_and_refused_offline() {
        let broker = Broker::new();
        broker.set_online(false);
        let mut ns = InstanceNamespace::new("a", 0, "t/a");
        ns.limits.kp_max = 100.0;
        let state = InstanceState::shared();
        let client = ParamSyncClient::start(ns.clone(), broker.connector(), state.clone()).unwrap();

        assert!(matches!(client.set_param(ParamKey::Kp, 5.0), Err(PlatformError::Transport(_))));
        assert!(state.lock().commanded.is_empty());

        broker.set_online(true);
        assert!(client.wait_until(Duration::from_secs(3), |st| st.channel_connected));

        let mut device = broker.connector().connect().unwrap();
        device.subscribe(&ns.topics.command(ParamKey::Kp)).unwrap();
        assert_eq!(client.set_param(ParamKey::Kp, 180.0).unwrap(), 100.0);
        let msg = device.poll(WAIT).unwrap().unwrap();
        assert_eq!(msg.payload, "100");
        assert_eq!(state.lock().unconfirmed(), vec![(ParamKey::Kp, 100.0)]);
    }
}
