//! The shared UDP binding registry.
//!
//! A [`Binding`] is one socket plus its canonical local address and optional
//! connected remote. Server listeners share bindings; client connections
//! usually claim them exclusively. The registry enforces one binding per
//! (compartment, local address) and resolves concurrent-create races after
//! the OS has assigned the canonical address.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::datapath::{Datagram, DatapathSocket};
use crate::library::Library;
use crate::partition::PerfCounter;
use crate::Error;

/// A reference-counted datapath binding.
///
/// The count is explicit rather than `Arc`-derived: it is mutated only under
/// the library's binding-table lock, together with the table membership and
/// the `in_use` flag it drives.
pub struct Binding {
    library: &'static Library,
    socket: DatapathSocket,
    compartment_id: Option<u32>,
    server_owned: bool,
    exclusive: bool,
    ref_count: AtomicU32,
}

impl Binding {
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.remote_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.remote_addr().is_some()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_server_owned(&self) -> bool {
        self.server_owned
    }

    pub fn compartment_id(&self) -> Option<u32> {
        self.compartment_id
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Transmits one datagram through this binding's socket.
    pub fn send(&self, remote: SocketAddr, data: &[u8]) -> Result<(), Error> {
        self.socket.send(remote, data)?;
        if let Some(partitions) = self.library.partitions() {
            partitions.counter_add(PerfCounter::UdpSend, 1);
            partitions.counter_add(PerfCounter::UdpSendBytes, data.len() as i64);
        }
        Ok(())
    }

    /// Feeds a received datagram through the datapath's installed receive
    /// handler, as an external receive loop would.
    pub fn deliver(&self, datagram: Datagram) {
        if let Some(datapath) = self.library.datapath() {
            (datapath.receive_handler())(self, datagram);
        }
    }

    /// Feeds an unreachable notification through the installed handler.
    pub fn notify_unreachable(&self, remote: SocketAddr) {
        if let Some(datapath) = self.library.datapath() {
            (datapath.unreachable_handler())(self, remote);
        }
    }
}

/// Receive handler installed at datapath initialization. Runs at dispatch
/// level: counters and steering only, no blocking work.
pub(crate) fn receive(binding: &Binding, datagram: Datagram) {
    let library = binding.library;
    if let Some(partitions) = library.partitions() {
        partitions.counter_add(PerfCounter::UdpRecv, 1);
        partitions.counter_add(PerfCounter::UdpRecvBytes, datagram.data.len() as i64);
    }
    if binding.server_owned {
        if let Some(worker) = library.stateless_worker_index(datagram.partition_index) {
            trace!(
                "datagram from {} steered to stateless worker {}",
                datagram.remote,
                worker
            );
        }
    }
}

/// Unreachable handler installed at datapath initialization.
pub(crate) fn unreachable(binding: &Binding, remote: SocketAddr) {
    debug!(
        "peer {} unreachable via local {}",
        remote,
        binding.local_addr()
    );
}

/// Finds a binding for the compartment and local address. A connected binding
/// matches only the same remote; an unconnected one matches only callers that
/// gave no remote.
fn lookup(
    table: &[Arc<Binding>],
    compartment_id: Option<u32>,
    local: &SocketAddr,
    remote: Option<&SocketAddr>,
) -> Option<Arc<Binding>> {
    for binding in table {
        if binding.compartment_id != compartment_id {
            continue;
        }
        if binding.local_addr() != *local {
            continue;
        }
        match (binding.remote_addr(), remote) {
            (Some(bound_remote), Some(wanted)) if bound_remote == *wanted => {}
            (Some(_), _) => continue,
            (None, None) => {}
            (None, Some(_)) => continue,
        }
        return Some(binding.clone());
    }
    None
}

impl Library {
    /// Returns a binding for the requested addresses, sharing a compatible
    /// existing one or creating anew. Passive level; socket creation blocks.
    ///
    /// Sharing requires `share` from both sides and agreement on
    /// `server_owned`; an exclusive binding never shares.
    pub fn get_or_create_binding(
        &'static self,
        share: bool,
        server_owned: bool,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        compartment_id: Option<u32>,
    ) -> Result<Arc<Binding>, Error> {
        if let Some(local_addr) = local {
            let table = self.bindings_lock();
            if let Some(existing) = lookup(&table, compartment_id, &local_addr, remote.as_ref()) {
                if !share || existing.exclusive || server_owned != existing.server_owned {
                    return Err(Error::InvalidState);
                }
                debug_assert!(existing.ref_count() > 0);
                existing.ref_count.fetch_add(1, Ordering::Relaxed);
                return Ok(existing);
            }
        }

        let datapath = self.datapath().ok_or(Error::InvalidState)?;
        let socket = datapath.bind(local, remote)?;
        let new_binding = Arc::new(Binding {
            library: self,
            socket,
            compartment_id,
            server_owned,
            exclusive: !share,
            ref_count: AtomicU32::new(1),
        });
        let canonical = new_binding.local_addr();

        // A concurrent creator may have raced us while the socket was being
        // set up. Collision detection is by local tuple only; two sockets on
        // the same local address are not allowed even toward different
        // remotes.
        let collision = {
            let mut table = self.bindings_lock();
            match lookup(&table, compartment_id, &canonical, None) {
                Some(existing) => {
                    if !existing.exclusive {
                        debug_assert!(existing.ref_count() > 0);
                        existing.ref_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(existing)
                }
                None => {
                    if table.is_empty() {
                        info!("library now in use");
                        self.set_in_use(true);
                    }
                    table.push(new_binding.clone());
                    None
                }
            }
        };

        match collision {
            Some(existing) if existing.exclusive => Err(Error::InvalidState),
            // The freshly created socket is discarded outside the lock.
            Some(existing) => Ok(existing),
            None => Ok(new_binding),
        }
    }

    /// Takes a reference on a binding that may be tearing down concurrently.
    /// Fails once the count has reached zero.
    pub fn try_add_ref_binding(&self, binding: &Binding) -> bool {
        let _table = self.bindings_lock();
        if binding.ref_count() > 0 {
            binding.ref_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Drops a reference; the last one removes the binding from the registry
    /// and lets the socket close outside the lock.
    pub fn release_binding(&self, binding: &Arc<Binding>) {
        let teardown = {
            let mut table = self.bindings_lock();
            debug_assert!(binding.ref_count() > 0);
            let teardown = binding.ref_count.fetch_sub(1, Ordering::Relaxed) == 1;
            if teardown {
                table.retain(|entry| !Arc::ptr_eq(entry, binding));
                if table.is_empty() {
                    info!("library no longer in use");
                    self.set_in_use(false);
                }
            }
            teardown
        };
        if teardown {
            trace!("binding {} torn down", binding.local_addr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::tests::{leaked_library, serial_guard};

    #[test]
    fn shared_binding_is_reused() {
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = lib
            .get_or_create_binding(true, true, Some(local), None, None)
            .unwrap();
        assert!(lib.is_in_use());
        let canonical = first.local_addr();

        let second = lib
            .get_or_create_binding(true, true, Some(canonical), None, None)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);

        lib.release_binding(&second);
        assert!(lib.is_in_use());
        lib.release_binding(&first);
        assert!(!lib.is_in_use());
        lib.release();
    }

    #[test]
    fn exclusive_binding_rejects_sharers_both_ways() {
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let exclusive = lib
            .get_or_create_binding(false, true, Some(local), None, None)
            .unwrap();
        let addr = exclusive.local_addr();

        assert_eq!(
            lib.get_or_create_binding(true, true, Some(addr), None, None)
                .err(),
            Some(Error::InvalidState)
        );

        // And a shared binding rejects an exclusive claim.
        lib.release_binding(&exclusive);
        drop(exclusive); // the socket closes with the last reference
        let shared = lib
            .get_or_create_binding(true, true, Some(addr), None, None)
            .unwrap();
        assert_eq!(
            lib.get_or_create_binding(false, true, Some(addr), None, None)
                .err(),
            Some(Error::InvalidState)
        );
        lib.release_binding(&shared);
        lib.release();
    }

    #[test]
    fn ownership_mismatch_is_rejected() {
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = lib
            .get_or_create_binding(true, true, Some(local), None, None)
            .unwrap();
        let addr = server.local_addr();
        assert_eq!(
            lib.get_or_create_binding(true, false, Some(addr), None, None)
                .err(),
            Some(Error::InvalidState)
        );
        lib.release_binding(&server);
        lib.release();
    }

    #[test]
    fn try_add_ref_fails_after_teardown() {
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let binding = lib
            .get_or_create_binding(true, true, Some("127.0.0.1:0".parse().unwrap()), None, None)
            .unwrap();
        assert!(lib.try_add_ref_binding(&binding));
        lib.release_binding(&binding);
        lib.release_binding(&binding);
        // The registry no longer owns it; raw holders must fail to revive it.
        assert!(!lib.try_add_ref_binding(&binding));
        lib.release();
    }

    #[test]
    fn concurrent_creators_converge_on_one_binding() {
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        // Pin the port first so every thread races on the same local tuple.
        let seed = lib
            .get_or_create_binding(true, true, Some("127.0.0.1:0".parse().unwrap()), None, None)
            .unwrap();
        let addr = seed.local_addr();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(move || {
                    let binding = lib
                        .get_or_create_binding(true, true, Some(addr), None, None)
                        .unwrap();
                    Arc::as_ptr(&binding) as usize
                })
            })
            .collect();
        let mut pointers: Vec<usize> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        pointers.dedup();
        assert_eq!(pointers, vec![Arc::as_ptr(&seed) as usize]);
        assert_eq!(seed.ref_count(), 9);

        for _ in 0..9 {
            lib.release_binding(&seed);
        }
        assert!(!lib.is_in_use());
        lib.release();
    }

    #[test]
    fn delivery_routes_through_the_receive_handler() {
        use crate::partition::PerfCounter;
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let binding = lib
            .get_or_create_binding(true, true, Some("127.0.0.1:0".parse().unwrap()), None, None)
            .unwrap();
        lib.on_listener_registered().unwrap();
        binding.deliver(Datagram {
            data: bytes::Bytes::from_static(b"initial packet"),
            remote: "127.0.0.1:9999".parse().unwrap(),
            partition_index: 3,
        });
        binding.notify_unreachable("127.0.0.1:9999".parse().unwrap());

        let mut counters = [0; PerfCounter::COUNT];
        lib.sum_perf_counters(&mut counters);
        assert_eq!(counters[PerfCounter::UdpRecv as usize], 1);
        assert_eq!(counters[PerfCounter::UdpRecvBytes as usize], 14);

        lib.release_binding(&binding);
        lib.release();
    }

    #[test]
    fn sends_count_against_the_udp_counters() {
        use crate::partition::PerfCounter;
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = receiver.local_addr().unwrap();
        let binding = lib
            .get_or_create_binding(true, false, None, Some(remote), None)
            .unwrap();
        binding.send(remote, b"out").unwrap();

        let mut counters = [0; PerfCounter::COUNT];
        lib.sum_perf_counters(&mut counters);
        assert_eq!(counters[PerfCounter::UdpSend as usize], 1);
        assert_eq!(counters[PerfCounter::UdpSendBytes as usize], 3);

        lib.release_binding(&binding);
        lib.release();
    }

    #[test]
    fn connected_and_unconnected_bindings_do_not_alias() {
        let _serial = serial_guard();
        let lib = leaked_library();
        lib.add_ref().unwrap();

        let remote: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let connected = lib
            .get_or_create_binding(true, false, None, Some(remote), None)
            .unwrap();
        assert!(connected.is_connected());
        let local = connected.local_addr();

        // Same local tuple, no remote: the lookup must not return the
        // connected binding, and creating a second socket there collides.
        assert_eq!(
            lib.get_or_create_binding(true, false, Some(local), None, None)
                .err(),
            Some(Error::AddressInUse)
        );

        lib.release_binding(&connected);
        lib.release();
    }
}
