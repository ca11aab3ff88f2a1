//! receiver.rs
//! Telemetry receiver of one instance: a background thread on the instance's
//! exclusive UDP port.
//!
//! - Blocking receive with a 1 s timeout so `stop` returns within one interval.
//! - Each datagram is parsed with the confirmed active mode as hint and handed
//!   to the router without blocking.
//! - Malformed records are counted and dropped; every 100th is logged.

use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{PlatformError, Result};
use crate::host::instance::SharedInstance;
use crate::host::router::DataRouter;
use crate::telemetry::TelemetrySample;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_BUFFER: usize = 1024;
const TIMEOUT_LOG_EVERY: u64 = 30;
const MALFORMED_LOG_EVERY: u64 = 100;

/// Bind the instance's datagram socket.
pub fn bind_socket(ip: IpAddr, port: u16, timeout: Duration) -> Result<UdpSocket> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_read_timeout(Some(timeout))?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| PlatformError::transport(format!("bind {addr}: {e}")))?;
    Ok(socket.into())
}

/// Parse one record and route it. Returns whether a sample was routed.
pub fn ingest(instance: &str, record: &str, state: &SharedInstance, router: &DataRouter) -> bool {
    let hint = state.lock().mode_hint();
    match TelemetrySample::parse(record, hint) {
        Ok(Some(sample)) => {
            state.lock().stats.record_packet(&sample, Instant::now());
            // overflow is counted and logged by the router
            router.push(sample).is_ok()
        }
        Ok(None) => false,
        Err(e) => {
            let malformed = {
                let mut st = state.lock();
                st.stats.malformed += 1;
                st.stats.malformed
            };
            if malformed % MALFORMED_LOG_EVERY == 1 {
                warn!("[{}] {} ({} malformed so far)", instance, e, malformed);
            }
            false
        }
    }
}

pub struct TelemetryReceiver {
    instance: String,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    datagrams: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryReceiver {
    pub fn start(
        instance: &str,
        socket: UdpSocket,
        state: SharedInstance,
        router: Arc<DataRouter>,
    ) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let datagrams = Arc::new(AtomicU64::new(0));

        let name = instance.to_string();
        let flag = running.clone();
        let count = datagrams.clone();
        let handle = thread::Builder::new()
            .name(format!("rx-{instance}"))
            .spawn(move || receive_loop(&name, socket, flag, count, &state, &router))?;

        info!("[{}] receiving telemetry on {}", instance, local_addr);
        Ok(Self {
            instance: instance.to_string(),
            local_addr,
            running,
            datagrams,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it; bounded by one receive timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
            debug!("[{}] receiver stopped", self.instance);
        }
    }
}

impl Drop for TelemetryReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    instance: &str,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    datagrams: Arc<AtomicU64>,
    state: &SharedInstance,
    router: &DataRouter,
) {
    let mut buf = [0u8; RECV_BUFFER];
    let mut timeouts: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, _from)) => {
                timeouts = 0;
                datagrams.fetch_add(1, Ordering::Relaxed);
                let text = String::from_utf8_lossy(&buf[..n]);
                for record in text.lines() {
                    ingest(instance, record, state, router);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                timeouts += 1;
                if timeouts % TIMEOUT_LOG_EVERY == 0 {
                    debug!("[{}] no telemetry for {} s", instance, timeouts * RECV_TIMEOUT.as_secs());
                }
            }
            Err(e) => {
                warn!("[{}] receive error: {}", instance, e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::params::ExperimentMode;
    use crate::host::instance::InstanceState;
    use std::net::Ipv4Addr;

    #[test]
    fn ingest_counts_malformed_and_skips_headers() {
        let state = InstanceState::shared();
        let router = DataRouter::start("a", state.clone(), 16).unwrap();
        assert!(!ingest("a", "time2sinc,a,b", &state, &router));
        assert!(!ingest("a", "garbage", &state, &router));
        assert!(ingest("a", "0.1,10,20.0,20.0,0", &state, &router));
        let st = state.lock();
        assert_eq!(st.stats.malformed, 1);
        assert_eq!(st.stats.packets, 1);
    }

    #[test]
    fn ingest_uses_confirmed_mode_as_hint() {
        let state = InstanceState::shared();
        state.lock().active_mode = Some(ExperimentMode::Step);
        let router = DataRouter::start("a", state.clone(), 16).unwrap();
        // pid-shaped numbers, but the device confirmed STEP
        assert!(ingest("a", "0.4,25.1,10,15.1,2,0.1,0,30.2", &state, &router));
        assert_eq!(state.lock().stats.step_samples, 1);
    }

    #[test]
    fn udp_datagrams_are_received_and_stop_is_prompt() {
        let state = InstanceState::shared();
        let router = Arc::new(DataRouter::start("a", state.clone(), 16).unwrap());
        let socket = bind_socket(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, Duration::from_millis(100)).unwrap();
        let rx = TelemetryReceiver::start("a", socket, state.clone(), router).unwrap();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..5 {
            tx.send_to(format!("{i}.0,10,20.0,20.0,0").as_bytes(), rx.local_addr()).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while state.lock().stats.packets < 5 {
            assert!(Instant::now() < deadline, "datagrams not received");
            thread::sleep(Duration::from_millis(5));
        }

        let t = Instant::now();
        rx.stop();
        assert!(t.elapsed() < Duration::from_secs(1));
    }
}
