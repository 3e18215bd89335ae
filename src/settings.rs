//! Library-wide settings: defaults, storage overrides, and the byte encoding
//! used by the parameter surface.

use std::convert::TryFrom;

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::storage::Storage;
use crate::Error;

/// How locally issued connection IDs encode a server identifier for external
/// load balancers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum LoadBalancingMode {
    /// No server ID; connection IDs carry only partition and payload bytes.
    Disabled = 0,
    /// Five-byte server ID: one tag byte plus the server's IPv4 address.
    ServerIdIp = 1,
}

impl TryFrom<u16> for LoadBalancingMode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        match value {
            0 => Ok(LoadBalancingMode::Disabled),
            1 => Ok(LoadBalancingMode::ServerIdIp),
            _ => Err(Error::InvalidParameter),
        }
    }
}

/// Tracks which fields were pinned explicitly, so defaults and storage
/// overrides never clobber an application's choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsSet(u32);

impl IsSet {
    pub const MAX_BYTES_PER_KEY: u32 = 1 << 0;
    pub const HANDSHAKE_IDLE_TIMEOUT_MS: u32 = 1 << 1;
    pub const IDLE_TIMEOUT_MS: u32 = 1 << 2;
    pub const STREAM_RECV_WINDOW_DEFAULT: u32 = 1 << 3;
    pub const STREAM_RECV_BUFFER_DEFAULT: u32 = 1 << 4;
    pub const CONN_FLOW_CONTROL_WINDOW: u32 = 1 << 5;
    pub const MAX_STATELESS_OPERATIONS: u32 = 1 << 6;
    pub const INITIAL_WINDOW_PACKETS: u32 = 1 << 7;
    pub const SEND_IDLE_TIMEOUT_MS: u32 = 1 << 8;
    pub const INITIAL_RTT_MS: u32 = 1 << 9;
    pub const MAX_ACK_DELAY_MS: u32 = 1 << 10;
    pub const DISCONNECT_TIMEOUT_MS: u32 = 1 << 11;
    pub const KEEP_ALIVE_INTERVAL_MS: u32 = 1 << 12;
    pub const PEER_BIDI_STREAM_COUNT: u32 = 1 << 13;
    pub const PEER_UNIDI_STREAM_COUNT: u32 = 1 << 14;
    pub const RETRY_MEMORY_LIMIT: u32 = 1 << 15;
    pub const LOAD_BALANCING_MODE: u32 = 1 << 16;

    pub const fn none() -> Self {
        IsSet(0)
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    fn bits(self) -> u32 {
        self.0
    }
}

/// The library's tunable knobs.
///
/// Construction yields the defaults; [`Settings::apply`] merges an external
/// struct field by field, honoring its is-set flags, and [`Settings::load`]
/// folds in persisted overrides for anything the application has not pinned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub max_bytes_per_key: u64,
    pub handshake_idle_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub stream_recv_window_default: u32,
    pub stream_recv_buffer_default: u32,
    pub conn_flow_control_window: u32,
    pub max_stateless_operations: u32,
    pub initial_window_packets: u32,
    pub send_idle_timeout_ms: u32,
    pub initial_rtt_ms: u32,
    pub max_ack_delay_ms: u32,
    pub disconnect_timeout_ms: u32,
    pub keep_alive_interval_ms: u32,
    pub peer_bidi_stream_count: u16,
    pub peer_unidi_stream_count: u16,
    /// Fraction of physical memory (scale `u16::MAX`) that active handshakes
    /// may consume before retries are forced.
    pub retry_memory_limit: u16,
    pub load_balancing_mode: LoadBalancingMode,
    pub is_set: IsSet,
}

const DEFAULT_MAX_BYTES_PER_KEY: u64 = 274_877_906_944;
const DEFAULT_HANDSHAKE_IDLE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STREAM_RECV_WINDOW: u32 = 0x10000;
const DEFAULT_STREAM_RECV_BUFFER: u32 = 0x1000;
const DEFAULT_CONN_FLOW_CONTROL_WINDOW: u32 = 0x1000000;
const DEFAULT_MAX_STATELESS_OPERATIONS: u32 = 16;
const DEFAULT_INITIAL_WINDOW_PACKETS: u32 = 10;
const DEFAULT_SEND_IDLE_TIMEOUT_MS: u32 = 1_000;
const DEFAULT_INITIAL_RTT_MS: u32 = 333;
const DEFAULT_MAX_ACK_DELAY_MS: u32 = 25;
const DEFAULT_DISCONNECT_TIMEOUT_MS: u32 = 16_000;
const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u32 = 0;
const DEFAULT_PEER_BIDI_STREAM_COUNT: u16 = 0;
const DEFAULT_PEER_UNIDI_STREAM_COUNT: u16 = 0;
const DEFAULT_RETRY_MEMORY_LIMIT: u16 = 65; // ~0.1% of physical memory

const MAX_DISCONNECT_TIMEOUT_MS: u32 = 600_000;

impl Settings {
    /// Size of the wire encoding accepted and produced by the parameter
    /// surface. Partial structs are rejected.
    pub const ENCODED_SIZE: usize = 4 + 3 * 8 + 10 * 4 + 4 * 2;

    pub const fn new() -> Self {
        Settings {
            max_bytes_per_key: DEFAULT_MAX_BYTES_PER_KEY,
            handshake_idle_timeout_ms: DEFAULT_HANDSHAKE_IDLE_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            stream_recv_window_default: DEFAULT_STREAM_RECV_WINDOW,
            stream_recv_buffer_default: DEFAULT_STREAM_RECV_BUFFER,
            conn_flow_control_window: DEFAULT_CONN_FLOW_CONTROL_WINDOW,
            max_stateless_operations: DEFAULT_MAX_STATELESS_OPERATIONS,
            initial_window_packets: DEFAULT_INITIAL_WINDOW_PACKETS,
            send_idle_timeout_ms: DEFAULT_SEND_IDLE_TIMEOUT_MS,
            initial_rtt_ms: DEFAULT_INITIAL_RTT_MS,
            max_ack_delay_ms: DEFAULT_MAX_ACK_DELAY_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            peer_bidi_stream_count: DEFAULT_PEER_BIDI_STREAM_COUNT,
            peer_unidi_stream_count: DEFAULT_PEER_UNIDI_STREAM_COUNT,
            retry_memory_limit: DEFAULT_RETRY_MEMORY_LIMIT,
            load_balancing_mode: LoadBalancingMode::Disabled,
            is_set: IsSet::none(),
        }
    }

    /// Resets every field the application has not pinned back to its default.
    pub fn set_default(&mut self) {
        let defaults = Settings::new();
        macro_rules! default_unless_set {
            ($field:ident, $flag:expr) => {
                if !self.is_set.contains($flag) {
                    self.$field = defaults.$field;
                }
            };
        }
        default_unless_set!(max_bytes_per_key, IsSet::MAX_BYTES_PER_KEY);
        default_unless_set!(handshake_idle_timeout_ms, IsSet::HANDSHAKE_IDLE_TIMEOUT_MS);
        default_unless_set!(idle_timeout_ms, IsSet::IDLE_TIMEOUT_MS);
        default_unless_set!(stream_recv_window_default, IsSet::STREAM_RECV_WINDOW_DEFAULT);
        default_unless_set!(stream_recv_buffer_default, IsSet::STREAM_RECV_BUFFER_DEFAULT);
        default_unless_set!(conn_flow_control_window, IsSet::CONN_FLOW_CONTROL_WINDOW);
        default_unless_set!(max_stateless_operations, IsSet::MAX_STATELESS_OPERATIONS);
        default_unless_set!(initial_window_packets, IsSet::INITIAL_WINDOW_PACKETS);
        default_unless_set!(send_idle_timeout_ms, IsSet::SEND_IDLE_TIMEOUT_MS);
        default_unless_set!(initial_rtt_ms, IsSet::INITIAL_RTT_MS);
        default_unless_set!(max_ack_delay_ms, IsSet::MAX_ACK_DELAY_MS);
        default_unless_set!(disconnect_timeout_ms, IsSet::DISCONNECT_TIMEOUT_MS);
        default_unless_set!(keep_alive_interval_ms, IsSet::KEEP_ALIVE_INTERVAL_MS);
        default_unless_set!(peer_bidi_stream_count, IsSet::PEER_BIDI_STREAM_COUNT);
        default_unless_set!(peer_unidi_stream_count, IsSet::PEER_UNIDI_STREAM_COUNT);
        default_unless_set!(retry_memory_limit, IsSet::RETRY_MEMORY_LIMIT);
        default_unless_set!(load_balancing_mode, IsSet::LOAD_BALANCING_MODE);
    }

    /// Folds persisted overrides into every field the application has not
    /// pinned.
    pub fn load(&mut self, storage: &dyn Storage) {
        macro_rules! load_unless_set {
            ($field:ident, $flag:expr, $key:expr, $convert:expr) => {
                if !self.is_set.contains($flag) {
                    if let Some(value) = storage.read_u32($key) {
                        #[allow(clippy::redundant_closure_call)]
                        if let Some(value) = ($convert)(value) {
                            self.$field = value;
                        }
                    }
                }
            };
        }
        load_unless_set!(
            handshake_idle_timeout_ms,
            IsSet::HANDSHAKE_IDLE_TIMEOUT_MS,
            "HandshakeIdleTimeoutMs",
            |v: u32| Some(v as u64)
        );
        load_unless_set!(idle_timeout_ms, IsSet::IDLE_TIMEOUT_MS, "IdleTimeoutMs", |v: u32| {
            Some(v as u64)
        });
        load_unless_set!(
            initial_window_packets,
            IsSet::INITIAL_WINDOW_PACKETS,
            "InitialWindowPackets",
            Some
        );
        load_unless_set!(initial_rtt_ms, IsSet::INITIAL_RTT_MS, "InitialRttMs", |v: u32| {
            if v > 0 {
                Some(v)
            } else {
                None
            }
        });
        load_unless_set!(
            keep_alive_interval_ms,
            IsSet::KEEP_ALIVE_INTERVAL_MS,
            "KeepAliveIntervalMs",
            Some
        );
        load_unless_set!(
            disconnect_timeout_ms,
            IsSet::DISCONNECT_TIMEOUT_MS,
            "DisconnectTimeoutMs",
            |v: u32| {
                if v > 0 && v <= MAX_DISCONNECT_TIMEOUT_MS {
                    Some(v)
                } else {
                    None
                }
            }
        );
        load_unless_set!(
            retry_memory_limit,
            IsSet::RETRY_MEMORY_LIMIT,
            "RetryMemoryLimit",
            |v: u32| u16::try_from(v).ok()
        );
        load_unless_set!(
            load_balancing_mode,
            IsSet::LOAD_BALANCING_MODE,
            "LoadBalancingMode",
            |v: u32| u16::try_from(v).ok().and_then(|m| LoadBalancingMode::try_from(m).ok())
        );
    }

    /// Merges `other` into `self`, taking every field `other` marks as set.
    /// Returns false when a value fails validation, leaving `self` untouched.
    pub fn apply(&mut self, other: &Settings) -> bool {
        if other.is_set.contains(IsSet::INITIAL_RTT_MS) && other.initial_rtt_ms == 0 {
            return false;
        }
        if other.is_set.contains(IsSet::DISCONNECT_TIMEOUT_MS)
            && (other.disconnect_timeout_ms == 0
                || other.disconnect_timeout_ms > MAX_DISCONNECT_TIMEOUT_MS)
        {
            return false;
        }
        macro_rules! apply_if_set {
            ($field:ident, $flag:expr) => {
                if other.is_set.contains($flag) {
                    self.$field = other.$field;
                    self.is_set.insert($flag);
                }
            };
        }
        apply_if_set!(max_bytes_per_key, IsSet::MAX_BYTES_PER_KEY);
        apply_if_set!(handshake_idle_timeout_ms, IsSet::HANDSHAKE_IDLE_TIMEOUT_MS);
        apply_if_set!(idle_timeout_ms, IsSet::IDLE_TIMEOUT_MS);
        apply_if_set!(stream_recv_window_default, IsSet::STREAM_RECV_WINDOW_DEFAULT);
        apply_if_set!(stream_recv_buffer_default, IsSet::STREAM_RECV_BUFFER_DEFAULT);
        apply_if_set!(conn_flow_control_window, IsSet::CONN_FLOW_CONTROL_WINDOW);
        apply_if_set!(max_stateless_operations, IsSet::MAX_STATELESS_OPERATIONS);
        apply_if_set!(initial_window_packets, IsSet::INITIAL_WINDOW_PACKETS);
        apply_if_set!(send_idle_timeout_ms, IsSet::SEND_IDLE_TIMEOUT_MS);
        apply_if_set!(initial_rtt_ms, IsSet::INITIAL_RTT_MS);
        apply_if_set!(max_ack_delay_ms, IsSet::MAX_ACK_DELAY_MS);
        apply_if_set!(disconnect_timeout_ms, IsSet::DISCONNECT_TIMEOUT_MS);
        apply_if_set!(keep_alive_interval_ms, IsSet::KEEP_ALIVE_INTERVAL_MS);
        apply_if_set!(peer_bidi_stream_count, IsSet::PEER_BIDI_STREAM_COUNT);
        apply_if_set!(peer_unidi_stream_count, IsSet::PEER_UNIDI_STREAM_COUNT);
        apply_if_set!(retry_memory_limit, IsSet::RETRY_MEMORY_LIMIT);
        apply_if_set!(load_balancing_mode, IsSet::LOAD_BALANCING_MODE);
        true
    }

    /// Writes the fixed-layout little-endian encoding. `buf` must be exactly
    /// [`Settings::ENCODED_SIZE`] bytes.
    pub fn encode(&self, mut buf: &mut [u8]) {
        assert_eq!(buf.len(), Self::ENCODED_SIZE);
        buf.put_u32_le(self.is_set.bits());
        buf.put_u64_le(self.max_bytes_per_key);
        buf.put_u64_le(self.handshake_idle_timeout_ms);
        buf.put_u64_le(self.idle_timeout_ms);
        buf.put_u32_le(self.stream_recv_window_default);
        buf.put_u32_le(self.stream_recv_buffer_default);
        buf.put_u32_le(self.conn_flow_control_window);
        buf.put_u32_le(self.max_stateless_operations);
        buf.put_u32_le(self.initial_window_packets);
        buf.put_u32_le(self.send_idle_timeout_ms);
        buf.put_u32_le(self.initial_rtt_ms);
        buf.put_u32_le(self.max_ack_delay_ms);
        buf.put_u32_le(self.disconnect_timeout_ms);
        buf.put_u32_le(self.keep_alive_interval_ms);
        buf.put_u16_le(self.peer_bidi_stream_count);
        buf.put_u16_le(self.peer_unidi_stream_count);
        buf.put_u16_le(self.retry_memory_limit);
        buf.put_u16_le(self.load_balancing_mode as u16);
    }

    /// Parses the encoding produced by [`Settings::encode`].
    pub fn decode(data: &[u8]) -> Result<Settings, Error> {
        if data.len() != Self::ENCODED_SIZE {
            return Err(Error::InvalidParameter);
        }
        let mut buf = data;
        let is_set = IsSet(buf.get_u32_le());
        let settings = Settings {
            max_bytes_per_key: buf.get_u64_le(),
            handshake_idle_timeout_ms: buf.get_u64_le(),
            idle_timeout_ms: buf.get_u64_le(),
            stream_recv_window_default: buf.get_u32_le(),
            stream_recv_buffer_default: buf.get_u32_le(),
            conn_flow_control_window: buf.get_u32_le(),
            max_stateless_operations: buf.get_u32_le(),
            initial_window_packets: buf.get_u32_le(),
            send_idle_timeout_ms: buf.get_u32_le(),
            initial_rtt_ms: buf.get_u32_le(),
            max_ack_delay_ms: buf.get_u32_le(),
            disconnect_timeout_ms: buf.get_u32_le(),
            keep_alive_interval_ms: buf.get_u32_le(),
            peer_bidi_stream_count: buf.get_u16_le(),
            peer_unidi_stream_count: buf.get_u16_le(),
            retry_memory_limit: buf.get_u16_le(),
            load_balancing_mode: LoadBalancingMode::try_from(buf.get_u16_le())?,
            is_set,
        };
        Ok(settings)
    }

    /// Trace the interesting knobs after a reload.
    pub(crate) fn dump(&self) {
        debug!(
            "settings: idle={}ms handshake_idle={}ms initial_rtt={}ms retry_memory={}/65535 lb_mode={:?}",
            self.idle_timeout_ms,
            self.handshake_idle_timeout_ms,
            self.initial_rtt_ms,
            self.retry_memory_limit,
            self.load_balancing_mode,
        );
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::new();
        assert_eq!(s.retry_memory_limit, 65);
        assert_eq!(s.load_balancing_mode, LoadBalancingMode::Disabled);
        assert!(!s.is_set.contains(IsSet::RETRY_MEMORY_LIMIT));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut s = Settings::new();
        s.initial_rtt_ms = 120;
        s.is_set.insert(IsSet::INITIAL_RTT_MS);
        s.load_balancing_mode = LoadBalancingMode::ServerIdIp;
        s.is_set.insert(IsSet::LOAD_BALANCING_MODE);
        let mut buf = vec![0; Settings::ENCODED_SIZE];
        s.encode(&mut buf);
        assert_eq!(Settings::decode(&buf).unwrap(), s);
    }

    #[test]
    fn decode_rejects_bad_length_and_mode() {
        assert_eq!(
            Settings::decode(&[0; Settings::ENCODED_SIZE - 1]),
            Err(Error::InvalidParameter)
        );
        let mut buf = vec![0; Settings::ENCODED_SIZE];
        Settings::new().encode(&mut buf);
        let mode_offset = Settings::ENCODED_SIZE - 2;
        buf[mode_offset] = 7;
        assert_eq!(Settings::decode(&buf), Err(Error::InvalidParameter));
    }

    #[test]
    fn set_default_preserves_pinned_fields() {
        let mut s = Settings::new();
        s.initial_rtt_ms = 99;
        s.is_set.insert(IsSet::INITIAL_RTT_MS);
        s.idle_timeout_ms = 5; // not pinned, reverts
        s.set_default();
        assert_eq!(s.initial_rtt_ms, 99);
        assert_eq!(s.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
    }

    #[test]
    fn storage_overrides_only_unpinned_fields() {
        let storage = MemoryStorage::new();
        storage.write_u32("InitialRttMs", 200);
        storage.write_u32("RetryMemoryLimit", 1000);
        let mut s = Settings::new();
        s.retry_memory_limit = 42;
        s.is_set.insert(IsSet::RETRY_MEMORY_LIMIT);
        s.load(&*storage);
        assert_eq!(s.initial_rtt_ms, 200);
        assert_eq!(s.retry_memory_limit, 42);
    }

    #[test]
    fn storage_rejects_out_of_range_values() {
        let storage = MemoryStorage::new();
        storage.write_u32("InitialRttMs", 0);
        storage.write_u32("DisconnectTimeoutMs", MAX_DISCONNECT_TIMEOUT_MS + 1);
        storage.write_u32("LoadBalancingMode", 9);
        let mut s = Settings::new();
        s.load(&*storage);
        assert_eq!(s.initial_rtt_ms, DEFAULT_INITIAL_RTT_MS);
        assert_eq!(s.disconnect_timeout_ms, DEFAULT_DISCONNECT_TIMEOUT_MS);
        assert_eq!(s.load_balancing_mode, LoadBalancingMode::Disabled);
    }

    #[test]
    fn apply_merges_set_fields_and_validates() {
        let mut base = Settings::new();
        let mut update = Settings::new();
        update.peer_bidi_stream_count = 32;
        update.is_set.insert(IsSet::PEER_BIDI_STREAM_COUNT);
        assert!(base.apply(&update));
        assert_eq!(base.peer_bidi_stream_count, 32);
        assert!(base.is_set.contains(IsSet::PEER_BIDI_STREAM_COUNT));

        let mut bad = Settings::new();
        bad.initial_rtt_ms = 0;
        bad.is_set.insert(IsSet::INITIAL_RTT_MS);
        let before = base.clone();
        assert!(!base.apply(&bad));
        assert_eq!(base, before);
    }
}
