//! The datapath seam: socket creation, canonical local addresses, and sends.
//!
//! The OS receive loops live outside the library. What the core owns is
//! socket setup, the canonical local address a bind resolves to, and the
//! handler pair that routes received datagrams and unreachable notifications
//! back into the binding layer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
#[cfg(any(test, feature = "internal-testing"))]
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{error, trace};

use crate::binding::Binding;
use crate::Error;

/// A received UDP datagram, as handed up by an external receive loop.
pub struct Datagram {
    pub data: Bytes,
    pub remote: SocketAddr,
    /// Partition the producer assigned from receive-side steering.
    pub partition_index: u16,
}

/// Routes a received datagram into the binding layer. Must not block.
pub type ReceiveHandler = fn(&Binding, Datagram);

/// Reports an ICMP-unreachable peer. Must not block.
pub type UnreachableHandler = fn(&Binding, SocketAddr);

/// Replaces OS socket creation, for harnesses that need address assignment
/// without the network stack.
pub trait DatapathHooks: Send + Sync {
    /// Called once when the datapath comes up; an error fails library
    /// initialization.
    fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Produces the canonical local address (and connected remote) a bind
    /// request resolves to.
    fn create(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<(SocketAddr, Option<SocketAddr>), Error>;

    fn send(&self, _local: SocketAddr, _remote: SocketAddr, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(any(test, feature = "internal-testing"))]
static TEST_HOOKS: Mutex<Option<Arc<dyn DatapathHooks>>> = Mutex::new(None);

/// Installs (or clears) the socket-creation hooks picked up by the next
/// datapath initialization.
#[cfg(any(test, feature = "internal-testing"))]
pub fn set_test_hooks(hooks: Option<Arc<dyn DatapathHooks>>) {
    *TEST_HOOKS.lock().unwrap() = hooks;
}

fn installed_hooks() -> Option<Arc<dyn DatapathHooks>> {
    #[cfg(any(test, feature = "internal-testing"))]
    {
        TEST_HOOKS.lock().unwrap().clone()
    }
    #[cfg(not(any(test, feature = "internal-testing")))]
    {
        None
    }
}

/// The shared datapath, created on the library's first reference and torn
/// down first on its last.
pub struct Datapath {
    receive_handler: ReceiveHandler,
    unreachable_handler: UnreachableHandler,
    hooks: Option<Arc<dyn DatapathHooks>>,
}

impl Datapath {
    pub(crate) fn new(
        receive_handler: ReceiveHandler,
        unreachable_handler: UnreachableHandler,
    ) -> Result<Datapath, Error> {
        let hooks = installed_hooks();
        if let Some(hooks) = &hooks {
            hooks.init()?;
        }
        Ok(Datapath {
            receive_handler,
            unreachable_handler,
            hooks,
        })
    }

    pub(crate) fn receive_handler(&self) -> ReceiveHandler {
        self.receive_handler
    }

    pub(crate) fn unreachable_handler(&self) -> UnreachableHandler {
        self.unreachable_handler
    }

    /// Creates a socket, connecting it when `remote` is given, and resolves
    /// the canonical local address. Blocking; passive level only.
    pub(crate) fn bind(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<DatapathSocket, Error> {
        if let Some(hooks) = &self.hooks {
            let (local_addr, remote_addr) = hooks.create(local, remote)?;
            return Ok(DatapathSocket {
                socket: None,
                hooks: Some(hooks.clone()),
                local_addr,
                remote_addr,
            });
        }

        let bind_addr = local.unwrap_or_else(|| match remote {
            Some(SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        });
        let socket = UdpSocket::bind(bind_addr).map_err(map_io_error)?;
        if let Some(remote) = remote {
            socket.connect(remote).map_err(map_io_error)?;
        }
        let local_addr = socket.local_addr().map_err(map_io_error)?;
        trace!("socket bound to {}", local_addr);
        Ok(DatapathSocket {
            socket: Some(socket),
            hooks: None,
            local_addr,
            remote_addr: remote,
        })
    }
}

fn map_io_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::AddrInUse => Error::AddressInUse,
        io::ErrorKind::InvalidInput | io::ErrorKind::AddrNotAvailable => Error::InvalidParameter,
        _ => {
            error!("datapath socket operation failed: {}", err);
            Error::Internal
        }
    }
}

/// A bound (possibly connected) UDP socket plus its canonical addresses.
pub struct DatapathSocket {
    socket: Option<UdpSocket>,
    hooks: Option<Arc<dyn DatapathHooks>>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
}

impl DatapathSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn send(&self, remote: SocketAddr, data: &[u8]) -> Result<(), Error> {
        if let Some(hooks) = &self.hooks {
            return hooks.send(self.local_addr, remote, data);
        }
        let socket = self.socket.as_ref().ok_or(Error::InvalidState)?;
        match self.remote_addr {
            Some(connected) if connected == remote => socket.send(data),
            _ => socket.send_to(data, remote),
        }
        .map_err(map_io_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_receive(_binding: &Binding, _datagram: Datagram) {}
    fn noop_unreachable(_binding: &Binding, _remote: SocketAddr) {}

    #[test]
    fn bind_resolves_canonical_port() {
        let datapath = Datapath::new(noop_receive, noop_unreachable).unwrap();
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = datapath.bind(Some(local), None).unwrap();
        assert_eq!(socket.local_addr().ip(), local.ip());
        assert_ne!(socket.local_addr().port(), 0);
    }

    #[test]
    fn unspecified_bind_follows_remote_family() {
        let datapath = Datapath::new(noop_receive, noop_unreachable).unwrap();
        let remote: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let socket = datapath.bind(None, Some(remote)).unwrap();
        assert!(socket.local_addr().is_ipv4());
        assert_eq!(socket.remote_addr(), Some(remote));
    }

    #[test]
    fn connected_sockets_exchange_datagrams() {
        let datapath = Datapath::new(noop_receive, noop_unreachable).unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = receiver.local_addr().unwrap();
        let socket = datapath.bind(None, Some(remote)).unwrap();
        socket.send(remote, b"ping").unwrap();

        let mut buf = [0; 16];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let (len, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, socket.local_addr());
    }

    #[test]
    fn duplicate_bind_reports_address_in_use() {
        let datapath = Datapath::new(noop_receive, noop_unreachable).unwrap();
        let first = datapath
            .bind(Some("127.0.0.1:0".parse().unwrap()), None)
            .unwrap();
        let taken = first.local_addr();
        match datapath.bind(Some(taken), None) {
            Err(Error::AddressInUse) => {}
            other => panic!("expected AddressInUse, got {:?}", other.map(|s| s.local_addr())),
        }
    }
}
