//! Guest reachability predicate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default bound on one connection attempt.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Address the host uses to reach the guest.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct GuestEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for GuestEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Future returned by [`GuestProbe::is_reachable`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Answers "can the guest be reached yet?" for one attempt.
pub trait GuestProbe: Send + Sync {
    /// Makes one reachability attempt against `endpoint`.
    fn is_reachable<'a>(&'a self, endpoint: &'a GuestEndpoint) -> ProbeFuture<'a>;
}

/// Probe that succeeds once a TCP connection can be opened.
#[derive(Clone, Copy, Debug)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    /// Creates a probe with the given per-attempt timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(PROBE_CONNECT_TIMEOUT)
    }
}

impl GuestProbe for TcpProbe {
    fn is_reachable<'a>(&'a self, endpoint: &'a GuestEndpoint) -> ProbeFuture<'a> {
        Box::pin(async move {
            let connect = timeout(
                self.connect_timeout,
                TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
            )
            .await;
            matches!(connect, Ok(Ok(_)))
        })
    }
}
