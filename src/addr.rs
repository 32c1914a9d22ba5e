use serde::{Deserialize, Serialize};

/// Delivery address of a process endpoint.
///
/// `Untyped` names an endpoint of an in-memory network, used by simulation
/// and the integration tests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Addr {
    Socket(std::net::SocketAddr),
    Untyped(String),
}

impl From<std::net::SocketAddr> for Addr {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{addr}"),
            Self::Untyped(name) => write!(f, "{name}"),
        }
    }
}
