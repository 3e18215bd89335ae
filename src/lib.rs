//! Process-global core of a QUIC protocol stack.
//!
//! This crate hosts the state that no single connection can own: the
//! reference-counted library lifecycle, the per-processor partition fabric
//! (object pools and perf counters), the shared UDP [`Binding`] registry, the
//! rotating stateless-retry keyring, and the handshake-memory governor that
//! drives the global send-retry backpressure signal.
//!
//! The TLS engine, per-connection state machines, packet codec, and the OS
//! receive loops are external collaborators; this crate defines the seams they
//! plug into ([`Storage`], [`DatapathHooks`], the receive/unreachable handlers)
//! and the outward [`ApiTable`] through which applications drive everything.
//!
//! A process uses exactly one [`Library`], reachable through [`library()`]
//! once [`load()`] has run. The first [`open()`] initializes the interior
//! (datapath, partitions, keyring); the last [`close()`] tears it down.

mod api;
mod binding;
mod datapath;
mod handle;
mod library;
mod params;
mod partition;
mod platform;
mod retry;
mod settings;
mod storage;
mod toeplitz;

use thiserror::Error;

pub use api::{close, open, ApiTable};
#[cfg(feature = "internal-testing")]
pub use datapath::set_test_hooks;
#[cfg(feature = "internal-testing")]
pub use platform::set_total_memory;
pub use binding::Binding;
pub use datapath::{Datagram, DatapathHooks};
pub use handle::{
    CallbackHandler, Configuration, Connection, ConnectionEvent, ConnectionHandler, Context,
    CredentialConfig, ExecutionProfile, Handle, Listener, ListenerEvent, ListenerHandler,
    PacketSpace, Registration, RegistrationConfig, Stream, StreamEvent, StreamHandler,
    TransportParameters,
};
pub use library::{library, load, unload, Library};
pub use params::{
    ParamLevel, PARAM_CONFIGURATION_SETTINGS, PARAM_CONN_QUIC_VERSION, PARAM_CONN_REMOTE_ADDRESS,
    PARAM_CONN_SETTINGS, PARAM_GLOBAL_LOAD_BALANCING_MODE, PARAM_GLOBAL_PERF_COUNTERS,
    PARAM_GLOBAL_RETRY_MEMORY_PERCENT, PARAM_GLOBAL_SETTINGS, PARAM_GLOBAL_SUPPORTED_VERSIONS,
    PARAM_LISTENER_LOCAL_ADDRESS, PARAM_STREAM_ID, PARAM_STREAM_PRIORITY,
};
pub use partition::{partition_mask, Partitions, PerProcessor, PerfCounter, Pool};
pub use retry::{RetryKey, RetryKeyring, AEAD_AES_256_GCM_KEY_SIZE, RETRY_KEY_LIFETIME_MS};
pub use settings::{IsSet, LoadBalancingMode, Settings};
pub use storage::{MemoryStorage, Storage};
pub use toeplitz::{ToeplitzHash, TOEPLITZ_KEY_SIZE};

/// QUIC versions this stack speaks, most preferred first.
pub const SUPPORTED_VERSIONS: [u32; 2] = [0x0000_0001, 0xff00_001d];

/// Hard cap on the partition count; storage can only lower the effective value.
pub const MAX_PARTITION_COUNT: u16 = 64;

/// Memory charged against the retry limit for every connection still in its
/// handshake.
pub const CONN_HANDSHAKE_MEMORY_USAGE: i64 = 10 * 1024;

/// Bytes of a locally issued connection ID holding the partition index.
pub const CID_PID_LENGTH: u8 = 2;
/// Random payload bytes of a locally issued connection ID.
pub const CID_PAYLOAD_LENGTH: u8 = 7;
/// Longest server ID prefix any load-balancing mode produces.
pub const MAX_CID_SID_LENGTH: u8 = 5;
/// RFC lower bound for initial connection IDs.
pub const MIN_INITIAL_CID_LENGTH: u8 = 8;
/// RFC upper bound for connection IDs.
pub const MAX_CID_LENGTH: u8 = 20;

/// Failures surfaced across the library boundary.
///
/// Every entry point reports problems through this one enum; nothing panics
/// across the boundary. Length, alignment, and enum-range violations on the
/// parameter surface map to `InvalidParameter`; lifecycle and sharing
/// violations map to `InvalidState`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was malformed or out of range.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The operation is not legal in the library's current state.
    #[error("invalid state")]
    InvalidState,
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The output buffer cannot hold the result; the required length has been
    /// written back through the length argument.
    #[error("buffer too small")]
    BufferTooSmall,
    /// The requested local address is already bound by another socket.
    #[error("address in use")]
    AddressInUse,
    /// The platform reported an unexpected failure.
    #[error("internal error")]
    Internal,
}
