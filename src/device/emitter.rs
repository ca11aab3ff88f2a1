//! emitter.rs
//! Telemetry emitter: one datagram per emitted sample, fire-and-forget.
//!
//! Send failures are counted and logged at debug level; the control loop never
//! waits on the network.

use std::net::{SocketAddr, UdpSocket};

use crossbeam::channel::Sender;
use log::debug;

use crate::error::{PlatformError, Result};
use crate::telemetry::TelemetrySample;

pub trait DatagramSink: Send {
    fn send(&mut self, payload: &[u8]) -> Result<()>;
}

/// UDP sink towards the host receiver of one instance.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    pub fn connect(target: SocketAddr) -> Result<Self> {
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, target })
    }
}

impl DatagramSink for UdpSink {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.socket.send_to(payload, self.target)?;
        Ok(())
    }
}

/// In-process sink: datagrams go over a crossbeam channel instead of a socket.
pub struct ChannelSink(pub Sender<Vec<u8>>);

impl DatagramSink for ChannelSink {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.0
            .try_send(payload.to_vec())
            .map_err(|e| PlatformError::transport(format!("datagram channel: {e}")))
    }
}

pub struct TelemetryEmitter<S: DatagramSink> {
    sink: S,
    sent: u64,
    failed: u64,
}

impl<S: DatagramSink> TelemetryEmitter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, sent: 0, failed: 0 }
    }

    /// Serialize and send. Returns whether the datagram left the device.
    pub fn emit(&mut self, sample: &TelemetrySample) -> bool {
        let record = sample.to_record();
        match self.sink.send(record.as_bytes()) {
            Ok(()) => {
                self.sent += 1;
                true
            }
            Err(e) => {
                self.failed += 1;
                debug!("telemetry send failed ({} so far): {}", self.failed, e);
                false
            }
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
