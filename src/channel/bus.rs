//! bus.rs
//! Pub/sub transport used by the parameter channel.
//!
//! `Connector`/`ChannelConnection` are the seam both sides talk to. `Broker` is
//! the in-process implementation: exact-topic routing over crossbeam channels,
//! at-most-once delivery, optional random loss, and an online switch that drops
//! every live connection to simulate an outage.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use dashmap::DashMap;
use log::{debug, info};
use rand::random_bool;

use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

/// One live session on the channel.
pub trait ChannelConnection: Send {
    fn subscribe(&mut self, topic: &str) -> Result<()>;
    fn publish(&mut self, topic: &str, payload: &str) -> Result<()>;
    /// Next message, or `Ok(None)` if nothing arrived within `timeout`.
    /// Errors mean the session is gone and a new one must be opened.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Message>>;
}

pub trait Connector: Send + Sync + 'static {
    type Connection: ChannelConnection;
    fn connect(&self) -> Result<Self::Connection>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub lost: u64,
    pub connections: u64,
}

struct Subscriber {
    client: u64,
    tx: Sender<Message>,
}

struct BrokerInner {
    subscriptions: DashMap<String, Vec<Subscriber>>,
    online: AtomicBool,
    /// Bumped on every outage; connections from an older epoch are dead.
    epoch: AtomicU64,
    loss_bits: AtomicU64,
    next_client: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    lost: AtomicU64,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscriptions: DashMap::new(),
                online: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                loss_bits: AtomicU64::new(0f64.to_bits()),
                next_client: AtomicU64::new(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                lost: AtomicU64::new(0),
            }),
        }
    }

    pub fn connector(&self) -> BrokerConnector {
        BrokerConnector {
            inner: self.inner.clone(),
        }
    }

    /// Probability in [0, 1] that any single delivery is silently dropped.
    pub fn set_loss(&self, probability: f64) {
        let p = if probability.is_finite() { probability.clamp(0.0, 1.0) } else { 0.0 };
        self.inner.loss_bits.store(p.to_bits(), Ordering::Relaxed);
    }

    /// Going offline kills every live connection and refuses new ones until
    /// the broker is back online.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was && !online {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.subscriptions.clear();
            info!("[broker] offline, all sessions dropped");
        } else if !was && online {
            info!("[broker] back online");
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            lost: self.inner.lost.load(Ordering::Relaxed),
            connections: self.inner.next_client.load(Ordering::Relaxed) - 1,
        }
    }
}

#[derive(Clone)]
pub struct BrokerConnector {
    inner: Arc<BrokerInner>,
}

impl Connector for BrokerConnector {
    type Connection = BrokerConnection;

    fn connect(&self) -> Result<BrokerConnection> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(PlatformError::transport("broker unreachable"));
        }
        let (tx, rx) = unbounded();
        let client = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        debug!("[broker] client {} connected", client);
        Ok(BrokerConnection {
            inner: self.inner.clone(),
            client,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            tx,
            rx,
        })
    }
}

pub struct BrokerConnection {
    inner: Arc<BrokerInner>,
    client: u64,
    epoch: u64,
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl BrokerConnection {
    fn check_alive(&self) -> Result<()> {
        let alive = self.inner.online.load(Ordering::SeqCst)
            && self.inner.epoch.load(Ordering::SeqCst) == self.epoch;
        if alive {
            Ok(())
        } else {
            Err(PlatformError::transport("connection lost"))
        }
    }
}

impl ChannelConnection for BrokerConnection {
    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.check_alive()?;
        let mut subs = self.inner.subscriptions.entry(topic.to_string()).or_default();
        if !subs.iter().any(|s| s.client == self.client) {
            subs.push(Subscriber {
                client: self.client,
                tx: self.tx.clone(),
            });
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        self.check_alive()?;
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let loss = f64::from_bits(self.inner.loss_bits.load(Ordering::Relaxed));

        // clone the targets out so no map shard stays locked while sending
        let targets: Vec<Sender<Message>> = match self.inner.subscriptions.get(topic) {
            Some(subs) => subs.iter().map(|s| s.tx.clone()).collect(),
            None => return Ok(()),
        };
        for tx in targets {
            if loss > 0.0 && random_bool(loss) {
                self.inner.lost.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let msg = Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            };
            if tx.send(msg).is_ok() {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.check_alive()?;
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PlatformError::transport("session closed")),
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        let client = self.client;
        self.inner.subscriptions.retain(|_, subs| {
            subs.retain(|s| s.client != client);
            !subs.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(50);

    #[test]
    fn exact_topic_routing() {
        let broker = Broker::new();
        let conn = broker.connector();
        let mut a = conn.connect().unwrap();
        let mut b = conn.connect().unwrap();
        a.subscribe("x/pid/kp").unwrap();
        b.subscribe("x/pid/kp/status").unwrap();

        b.publish("x/pid/kp", "5").unwrap();
        let msg = a.poll(T).unwrap().unwrap();
        assert_eq!(msg.payload, "5");
        assert_eq!(b.poll(T).unwrap(), None);
    }

    #[test]
    fn outage_kills_sessions_until_back_online() {
        let broker = Broker::new();
        let conn = broker.connector();
        let mut a = conn.connect().unwrap();
        a.subscribe("t").unwrap();

        broker.set_online(false);
        assert!(a.poll(T).is_err());
        assert!(a.publish("t", "x").is_err());
        assert!(conn.connect().is_err());

        broker.set_online(true);
        // the old session stays dead, a new one works
        assert!(a.poll(T).is_err());
        let mut b = conn.connect().unwrap();
        b.subscribe("t").unwrap();
        b.publish("t", "y").unwrap();
        assert_eq!(b.poll(T).unwrap().unwrap().payload, "y");
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let broker = Broker::new();
        broker.set_loss(1.0);
        let mut a = broker.connector().connect().unwrap();
        a.subscribe("t").unwrap();
        for _ in 0..10 {
            a.publish("t", "x").unwrap();
        }
        assert_eq!(a.poll(T).unwrap(), None);
        let stats = broker.stats();
        assert_eq!((stats.published, stats.lost, stats.delivered), (10, 10, 0));
    }

    #[test]
    fn dropped_connection_unsubscribes() {
        let broker = Broker::new();
        let conn = broker.connector();
        let mut a = conn.connect().unwrap();
        a.subscribe("t").unwrap();
        drop(a);
        let mut b = conn.connect().unwrap();
        b.publish("t", "x").unwrap();
        assert_eq!(broker.stats().delivered, 0);
    }
}
