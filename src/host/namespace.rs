//! namespace.rs
//! Instance namespaces: one (port, topic prefix, limits) triple per instance.
//!
//! Uniqueness is checked once, at allocation. After that every per-instance
//! component resolves topics and limits through its own `InstanceNamespace`;
//! there is no process-wide topic table.

use log::info;

use crate::channel::topic::TopicSpace;
use crate::config::{PidLimits, PlatformConfig, TrainConfig};
use crate::device::params::{ParamKey, clamp_into};
use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceNamespace {
    pub instance_id: String,
    pub name: String,
    pub datagram_port: u16,
    pub topics: TopicSpace,
    pub limits: PidLimits,
}

impl InstanceNamespace {
    pub fn new(instance_id: &str, datagram_port: u16, topic_prefix: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            name: instance_id.to_string(),
            datagram_port,
            topics: TopicSpace::new(topic_prefix),
            limits: PidLimits::default(),
        }
    }

    pub fn from_config(train: &TrainConfig) -> Self {
        Self {
            instance_id: train.id.clone(),
            name: train.name.clone(),
            datagram_port: train.udp_port,
            topics: TopicSpace::new(&train.mqtt_prefix),
            limits: train.pid_limits,
        }
    }

    pub fn prefix(&self) -> &str {
        self.topics.prefix()
    }

    /// Host-side clamp for an outgoing command: the namespace limits for the PID
    /// gains and reference, the device range for everything else.
    pub fn clamp(&self, key: ParamKey, value: f64) -> (f64, Option<PlatformError>) {
        let (lo, hi) = key.range();
        let (lo, hi) = match key {
            ParamKey::Kp => (lo, self.limits.kp_max.min(hi)),
            ParamKey::Ki => (lo, self.limits.ki_max.min(hi)),
            ParamKey::Kd => (lo, self.limits.kd_max.min(hi)),
            ParamKey::Reference => (self.limits.reference_min.max(lo), self.limits.reference_max.min(hi)),
            _ => (lo, hi),
        };
        clamp_into(key.name(), value, lo, hi.max(lo))
    }
}

fn prefixes_overlap(a: &str, b: &str) -> bool {
    a == b
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('/'))
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Default)]
pub struct NamespaceManager {
    namespaces: Vec<InstanceNamespace>,
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every enabled train of the config, in id order. Fails on the first clash.
    pub fn from_config(config: &PlatformConfig) -> Result<Self> {
        let mut manager = Self::new();
        for train in config.enabled() {
            manager.allocate(InstanceNamespace::from_config(train))?;
        }
        Ok(manager)
    }

    pub fn allocate(&mut self, ns: InstanceNamespace) -> Result<&InstanceNamespace> {
        if ns.topics.prefix().is_empty() {
            return Err(PlatformError::Config(format!("{}: empty topic prefix", ns.instance_id)));
        }
        for other in &self.namespaces {
            if other.instance_id == ns.instance_id {
                return Err(PlatformError::Config(format!("duplicate instance id {}", ns.instance_id)));
            }
            if other.datagram_port == ns.datagram_port {
                return Err(PlatformError::Config(format!(
                    "{} and {} both use port {}",
                    other.instance_id, ns.instance_id, ns.datagram_port
                )));
            }
            if prefixes_overlap(other.prefix(), ns.prefix()) {
                return Err(PlatformError::Config(format!(
                    "{} and {} topic prefixes overlap ({} / {})",
                    other.instance_id,
                    ns.instance_id,
                    other.prefix(),
                    ns.prefix()
                )));
            }
        }
        info!(
            "[NAMESPACE] {} -> port {}, prefix {}",
            ns.instance_id,
            ns.datagram_port,
            ns.prefix()
        );
        self.namespaces.push(ns);
        Ok(&self.namespaces[self.namespaces.len() - 1])
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceNamespace> {
        self.namespaces.iter().find(|n| n.instance_id == instance_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceNamespace> {
        self.namespaces.iter()
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}
