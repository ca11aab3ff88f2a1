//! session.rs
//! One managed instance on the host, and the manager holding all of them.
//!
//! An `InstanceSession` wires its namespace to a receiver, a router and a
//! parameter sync client. The log sink follows the device: it is switched when
//! the device confirms an activation and closed when it confirms the stop.

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use log::{error, info, warn};

use crate::channel::bus::Connector;
use crate::config::PlatformConfig;
use crate::device::params::{ExperimentMode, ParamKey};
use crate::error::Result;
use crate::host::instance::{InstanceState, SharedInstance};
use crate::host::namespace::{InstanceNamespace, NamespaceManager};
use crate::host::param_sync::{ParamSyncClient, SyncEvent, SyncHook};
use crate::host::receiver::{RECV_TIMEOUT, TelemetryReceiver, bind_socket};
use crate::host::router::{DataRouter, ROUTER_CAPACITY};
use crate::utils::log_sink::SinkFactory;
use crate::utils::metrics::{ConnectionStatus, InstanceStats};

/// Point-in-time view for status displays.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub status: ConnectionStatus,
    pub channel_connected: bool,
    pub active_mode: Option<ExperimentMode>,
    pub sink_label: Option<String>,
    pub detected_deadband: Option<u16>,
    pub stats: InstanceStats,
}

pub struct InstanceSession {
    ns: InstanceNamespace,
    state: SharedInstance,
    router: Arc<DataRouter>,
    receiver: TelemetryReceiver,
    sync: ParamSyncClient,
    closed: AtomicBool,
}

/// Switches the router's sink on confirmed activations.
fn sink_hook(instance: String, router: Arc<DataRouter>, sinks: Arc<dyn SinkFactory>) -> SyncHook {
    let mut logging: Option<ExperimentMode> = None;
    Box::new(move |event| match *event {
        SyncEvent::Activation { mode, active: true } => {
            // resync republishes the activation of a mode that is already logging
            if logging == Some(mode) {
                return;
            }
            let opened = sinks.open(&instance, mode).and_then(|sink| router.switch_sink(sink, mode));
            match opened {
                Ok(()) => logging = Some(mode),
                Err(e) => {
                    error!("[{}] could not open {:?} log: {}", instance, mode, e);
                    logging = None;
                }
            }
        }
        SyncEvent::Activation { mode, active: false } if logging == Some(mode) => {
            if let Err(e) = router.close_sink() {
                error!("[{}] closing {:?} log failed: {}", instance, mode, e);
            }
            logging = None;
        }
        _ => {}
    })
}

impl InstanceSession {
    pub fn open<C: Connector>(
        ns: InstanceNamespace,
        connector: C,
        sinks: Arc<dyn SinkFactory>,
        bind_ip: IpAddr,
    ) -> Result<Self> {
        let id = ns.instance_id.clone();
        let state = InstanceState::shared();
        let socket = bind_socket(bind_ip, ns.datagram_port, RECV_TIMEOUT)?;
        let router = Arc::new(DataRouter::start(&id, state.clone(), ROUTER_CAPACITY)?);
        let receiver = TelemetryReceiver::start(&id, socket, state.clone(), router.clone())?;
        let hook = sink_hook(id.clone(), router.clone(), sinks);
        let sync = ParamSyncClient::start_with_hook(ns.clone(), connector, state.clone(), Some(hook))?;
        info!("[{}] session open ({})", id, ns.prefix());

        Ok(Self {
            ns,
            state,
            router,
            receiver,
            sync,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.ns.instance_id
    }

    pub fn namespace(&self) -> &InstanceNamespace {
        &self.ns
    }

    pub fn state(&self) -> &SharedInstance {
        &self.state
    }

    pub fn sync(&self) -> &ParamSyncClient {
        &self.sync
    }

    /// Address the receiver is bound to.
    pub fn telemetry_addr(&self) -> SocketAddr {
        self.receiver.local_addr()
    }

    pub fn set_param(&self, key: ParamKey, value: f64) -> Result<f64> {
        self.sync.set_param(key, value)
    }

    /// Start `mode` on the device, stopping whatever mode it reported active.
    /// Calibration results stay until the device publishes a new result or error.
    pub fn start(&self, mode: ExperimentMode) -> Result<()> {
        let previous = self.state.lock().active_mode;
        if let Some(prev) = previous.filter(|p| *p != mode) {
            info!("[{}] switching {:?} -> {:?}", self.id(), prev, mode);
            self.sync.stop_mode(prev)?;
        }
        self.sync.start_mode(mode)
    }

    pub fn stop(&self, mode: ExperimentMode) -> Result<()> {
        self.sync.stop_mode(mode)
    }

    pub fn request_params(&self, mode: ExperimentMode) -> Result<()> {
        self.sync.request_params(mode)
    }

    pub fn apply_deadband(&self) -> Result<()> {
        if self.state.lock().calibration.is_none() {
            warn!("[{}] applying deadband without a calibration result", self.id());
        }
        self.sync.apply_deadband()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let st = self.state.lock();
        InstanceSnapshot {
            instance_id: self.ns.instance_id.clone(),
            status: st.connection_status(Instant::now()),
            channel_connected: st.channel_connected,
            active_mode: st.active_mode,
            sink_label: st.sink_label.clone(),
            detected_deadband: st.detected_deadband,
            stats: st.stats.clone(),
        }
    }

    /// Receiver first, then the sink, then the channel.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.receiver.stop();
        self.router.shutdown();
        self.sync.disconnect();
        info!("[{}] session closed", self.id());
    }
}

impl Drop for InstanceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Every managed instance, keyed by id.
pub struct InstanceManager {
    namespaces: NamespaceManager,
    sessions: BTreeMap<String, InstanceSession>,
}

impl InstanceManager {
    pub fn start<C: Connector + Clone>(
        config: &PlatformConfig,
        connector: C,
        sinks: Arc<dyn SinkFactory>,
        bind_ip: IpAddr,
    ) -> Result<Self> {
        Self::with_namespaces(NamespaceManager::from_config(config)?, connector, sinks, bind_ip)
    }

    pub fn with_namespaces<C: Connector + Clone>(
        namespaces: NamespaceManager,
        connector: C,
        sinks: Arc<dyn SinkFactory>,
        bind_ip: IpAddr,
    ) -> Result<Self> {
        let mut sessions = BTreeMap::new();
        for ns in namespaces.iter() {
            let session = InstanceSession::open(ns.clone(), connector.clone(), sinks.clone(), bind_ip)?;
            sessions.insert(ns.instance_id.clone(), session);
        }
        info!("[MANAGER] {} instances running", sessions.len());
        Ok(Self { namespaces, sessions })
    }

    pub fn namespaces(&self) -> &NamespaceManager {
        &self.namespaces
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceSession> {
        self.sessions.get(instance_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &InstanceSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// `(instance, stats)` rows for the summary export.
    pub fn summary_rows(&self) -> Vec<(String, InstanceStats)> {
        self.sessions
            .values()
            .map(|s| (s.id().to_string(), s.state.lock().stats.clone()))
            .collect()
    }

    pub fn shutdown(&self) {
        for session in self.sessions.values() {
            session.shutdown();
        }
    }
}
