#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, unbounded};

use train_control::{
    channel::bus::{Broker, BrokerConnector},
    device::{
        emitter::ChannelSink,
        hal::ScriptedHal,
        node::Device,
        params::{ExperimentMode, ParamKey, ParameterSet},
    },
    host::{
        instance::{InstanceState, SharedInstance},
        namespace::InstanceNamespace,
        param_sync::{ParamSyncClient, SyncEvent},
    },
    telemetry::TelemetrySample,
};

pub const PREFIX: &str = "lab/t1";

/// One device stepped by the test thread, one host sync client, one broker.
pub struct Rig {
    pub broker: Broker,
    pub ns: InstanceNamespace,
    pub device: Device<BrokerConnector, ScriptedHal, ChannelSink>,
    pub datagrams: Receiver<Vec<u8>>,
    pub state: SharedInstance,
    pub client: ParamSyncClient,
}

impl Rig {
    pub fn new(hal: ScriptedHal, params: ParameterSet) -> Self {
        let broker = Broker::new();
        let ns = InstanceNamespace::new("t1", 0, PREFIX);
        let (tx, datagrams) = unbounded();
        let mut device = Device::new("t1", PREFIX, broker.connector(), hal, ChannelSink(tx), params);
        // first tick opens the device session, so the host's resync is heard
        device.step();

        let state = InstanceState::shared();
        let client = ParamSyncClient::start(ns.clone(), broker.connector(), state.clone()).unwrap();
        let mut rig = Self { broker, ns, device, datagrams, state, client };
        rig.pump_until(|r| r.state.lock().channel_connected);
        // let the connect-time resync finish so tests only see their own traffic
        let last = ExperimentMode::ACTIVE[ExperimentMode::ACTIVE.len() - 1];
        rig.pump_until(|r| {
            r.client
                .events()
                .try_iter()
                .any(|e| matches!(e, SyncEvent::Activation { mode, .. } if mode == last))
        });
        rig
    }

    /// Step the device until `cond` holds.
    pub fn pump_until(&mut self, mut cond: impl FnMut(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond(self) {
            assert!(Instant::now() < deadline, "condition not reached");
            self.device.step();
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn pump(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.device.step();
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn confirmed(&self, key: ParamKey) -> Option<f64> {
        self.state.lock().confirmed_value(key)
    }

    pub fn samples(&self, hint: ExperimentMode) -> Vec<TelemetrySample> {
        self.datagrams
            .try_iter()
            .filter_map(|d| {
                let text = String::from_utf8(d).unwrap();
                TelemetrySample::parse(&text, hint).unwrap()
            })
            .collect()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.client.events().try_iter().collect()
    }
}
