//! TCP port availability checks and allocation.
//!
//! The port namespace is shared with every other process on the machine and
//! there is no lock around it: a port is probed by binding it, the bound
//! sockets are held as a [`PortLease`] until just before the consumer starts,
//! and a lost race surfaces as a busy port on the next check.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use mtest_core::{emit_port_reassigned, PortConfig, RunConfig};
use rand::Rng;
use tracing::debug;

/// Sockets bound to a port, kept open until the consumer is about to bind
/// the same port itself.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    sockets: Vec<TcpListener>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the held sockets. Must happen before the child binds the port.
    pub fn release(self) {
        debug!(port = self.port, sockets = self.sockets.len(), "releasing port lease");
    }
}

/// Outcome of one probe.
#[derive(Debug)]
pub struct ProbeResult {
    pub busy: bool,
    /// Host the successful bind used, or the first host tried.
    pub host: String,
    /// Error of the last failed bind.
    pub error: Option<io::Error>,
    /// Present when not busy.
    pub lease: Option<PortLease>,
}

impl ProbeResult {
    pub fn errno(&self) -> i32 {
        self.error
            .as_ref()
            .and_then(io::Error::raw_os_error)
            .unwrap_or(0)
    }

    pub fn errstr(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

/// Something that can test a port for availability.
pub trait PortCheck {
    fn try_bind(&self, port: u16) -> ProbeResult;
}

/// Binds the machine's host name and `localhost`.
#[derive(Debug, Clone)]
pub struct SocketProbe {
    hostname: String,
}

impl SocketProbe {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config
                .hostname
                .clone()
                .unwrap_or_else(mtest_core::local_hostname),
        )
    }

    /// Bind the first IPv4 address `host` resolves to.
    fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
        let mut last = io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}"));
        for addr in (host, port).to_socket_addrs()?.filter(SocketAddr::is_ipv4) {
            // std sets SO_REUSEADDR on unix listeners
            match TcpListener::bind(addr) {
                Ok(l) => return Ok(l),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

impl PortCheck for SocketProbe {
    /// Not busy when at least one of the two binds succeeds; the host name
    /// is reported in preference to `localhost`.
    fn try_bind(&self, port: u16) -> ProbeResult {
        let mut sockets = Vec::new();
        let mut error = None;
        let mut host = None;
        for candidate in [self.hostname.as_str(), "localhost"] {
            match Self::bind(candidate, port) {
                Ok(sock) => {
                    host.get_or_insert_with(|| candidate.to_string());
                    sockets.push(sock);
                }
                Err(e) => error = Some(e),
            }
        }
        let busy = sockets.is_empty();
        let host = host.unwrap_or_else(|| self.hostname.clone());
        ProbeResult {
            busy,
            host,
            error,
            lease: (!busy).then(|| PortLease { port, sockets }),
        }
    }
}

/// Result of checking a service's configured port before a test.
#[derive(Debug)]
pub enum PortAssignment {
    /// The configured port is free and leased.
    Available(PortLease),
    /// The configured port was busy; command templates now use `lease.port()`.
    Reassigned {
        old: u16,
        lease: PortLease,
        message: String,
    },
    /// Neither the configured port nor a replacement was available.
    Unavailable { message: String },
}

/// Picks working ports from a range.
#[derive(Debug, Clone)]
pub struct PortAllocator<P: PortCheck = SocketProbe> {
    probe: P,
    low: u16,
    high: u16,
    attempts: u32,
}

impl PortAllocator<SocketProbe> {
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(SocketProbe::from_config(config), &config.ports)
    }
}

impl<P: PortCheck> PortAllocator<P> {
    pub fn new(probe: P, ports: &PortConfig) -> Self {
        Self {
            probe,
            low: ports.low,
            high: ports.high,
            attempts: ports.attempts,
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Draw random ports from `[low, high)` until one is free.
    ///
    /// The lease is released immediately; this only discovers a port.
    /// Returns port 0 after `attempts` busy draws.
    pub fn allocate(&self) -> (u16, String) {
        let mut rng = rand::thread_rng();
        let mut host = String::new();
        for attempt in 1..=self.attempts {
            let port = rng.gen_range(self.low..self.high);
            let probe = self.probe.try_bind(port);
            host = probe.host.clone();
            if let Some(lease) = probe.lease {
                lease.release();
                return (port, host);
            }
            debug!(port, attempt, errno = probe.errno(), "port busy");
        }
        (0, host)
    }

    /// Check the port `service` is configured for and lease it.
    ///
    /// When it is busy one replacement is drawn with [`Self::allocate`] and
    /// every `port=<old>` in the server and client templates is rewritten.
    /// There is no second reassignment.
    pub fn check_and_maybe_reassign(
        &self,
        service: &str,
        current: u16,
        config: &mut RunConfig,
    ) -> PortAssignment {
        let probe = self.probe.try_bind(current);
        if let Some(lease) = probe.lease {
            return PortAssignment::Available(lease);
        }

        let mut message = format!(
            "\n! Socket-Check failed for {service}server on <{}:{current}> with #{}; '{}' !\n",
            probe.host,
            probe.errno(),
            probe.errstr()
        );

        let (new, host) = self.allocate();
        if new == 0 {
            message.push_str(&format!(
                "\n! Socket-Check failed for {service}server on <{host}> !\n! Giving up after {} attempts !\n",
                self.attempts
            ));
            return PortAssignment::Unavailable { message };
        }

        // The replacement was free a moment ago; lease it for the hand-off.
        let probe = self.probe.try_bind(new);
        let Some(lease) = probe.lease else {
            message.push_str(&format!(
                "\n! Socket-Check failed for {service}server on <{}:{new}> !\n",
                probe.host
            ));
            return PortAssignment::Unavailable { message };
        };

        config.rewrite_port(current, new);
        emit_port_reassigned(service, current, new);
        message.push_str(&format!("\n! Using new {service}PORT={new} !\n"));
        PortAssignment::Reassigned {
            old: current,
            lease,
            message,
        }
    }

    /// Post-run check that a server released `port`.
    ///
    /// Returns the message to append to the test's error output when the
    /// port is still held.
    pub fn check_released(&self, service: &str, port: u16) -> Option<String> {
        let probe = self.probe.try_bind(port);
        if let Some(lease) = probe.lease {
            lease.release();
            return None;
        }
        Some(format!(
            "\n! Socket-Check failed for {service}server on <{}:{port}> with #{}; '{}' !\n! {service}PORT was not properly released by the server !\n",
            probe.host,
            probe.errno(),
            probe.errstr()
        ))
    }
}
