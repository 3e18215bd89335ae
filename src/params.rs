//! The get/set-parameter surface: global parameters on the library, and the
//! level dispatcher that routes per-handle calls to the owning subsystem.
//!
//! Get calls follow one contract everywhere: a too-short buffer reports
//! `BufferTooSmall` with the required length written back and the buffer
//! untouched; a missing buffer of sufficient claimed length is
//! `InvalidParameter`; otherwise the value is written and the length set to
//! the bytes produced.

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::handle::{Configuration, Connection, Handle, Listener, Registration, Stream};
use crate::library::Library;
use crate::partition::PerfCounter;
use crate::settings::{LoadBalancingMode, Settings};
use crate::{Error, SUPPORTED_VERSIONS};

pub const PARAM_GLOBAL_RETRY_MEMORY_PERCENT: u32 = 0;
pub const PARAM_GLOBAL_SUPPORTED_VERSIONS: u32 = 1;
pub const PARAM_GLOBAL_LOAD_BALANCING_MODE: u32 = 2;
pub const PARAM_GLOBAL_PERF_COUNTERS: u32 = 3;
pub const PARAM_GLOBAL_SETTINGS: u32 = 4;

pub const PARAM_CONFIGURATION_SETTINGS: u32 = 0;
pub const PARAM_LISTENER_LOCAL_ADDRESS: u32 = 0;
pub const PARAM_CONN_QUIC_VERSION: u32 = 0;
pub const PARAM_CONN_REMOTE_ADDRESS: u32 = 1;
pub const PARAM_CONN_SETTINGS: u32 = 2;
pub const PARAM_STREAM_ID: u32 = 0;
pub const PARAM_STREAM_PRIORITY: u32 = 1;

/// Which object a per-handle parameter call addresses. Validated against the
/// handle's ancestry before dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamLevel {
    Registration,
    Configuration,
    Listener,
    Connection,
    Tls,
    Stream,
}

/// Writes a fully formed value under the shared get contract.
fn fill(value: &[u8], buffer: Option<&mut [u8]>, buffer_length: &mut u32) -> Result<(), Error> {
    let required = value.len() as u32;
    if *buffer_length < required {
        *buffer_length = required;
        return Err(Error::BufferTooSmall);
    }
    let buffer = buffer.ok_or(Error::InvalidParameter)?;
    if (buffer.len() as u32) < required {
        return Err(Error::InvalidParameter);
    }
    buffer[..value.len()].copy_from_slice(value);
    *buffer_length = required;
    Ok(())
}

/// Fixed 20-byte address encoding: family, port, then address bytes.
fn encode_socket_addr(addr: &SocketAddr) -> [u8; 20] {
    let mut out = [0; 20];
    match addr {
        SocketAddr::V4(v4) => {
            out[..2].copy_from_slice(&4u16.to_le_bytes());
            out[2..4].copy_from_slice(&v4.port().to_le_bytes());
            out[4..8].copy_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            out[..2].copy_from_slice(&6u16.to_le_bytes());
            out[2..4].copy_from_slice(&v6.port().to_le_bytes());
            out[4..20].copy_from_slice(&v6.ip().octets());
        }
    }
    out
}

impl Library {
    /// Sets a global parameter.
    pub fn set_global_param(&'static self, param: u32, buffer: &[u8]) -> Result<(), Error> {
        match param {
            PARAM_GLOBAL_RETRY_MEMORY_PERCENT => {
                if buffer.len() != 2 {
                    return Err(Error::InvalidParameter);
                }
                self.set_retry_memory_percent(u16::from_le_bytes([buffer[0], buffer[1]]));
                Ok(())
            }
            PARAM_GLOBAL_LOAD_BALANCING_MODE => {
                if buffer.len() != 2 {
                    return Err(Error::InvalidParameter);
                }
                let mode = LoadBalancingMode::try_from(u16::from_le_bytes([buffer[0], buffer[1]]))?;
                self.set_load_balancing_mode(mode)
            }
            PARAM_GLOBAL_SETTINGS => {
                // Partial structs are not supported.
                if buffer.len() != Settings::ENCODED_SIZE {
                    return Err(Error::InvalidParameter);
                }
                let update = Settings::decode(buffer)?;
                self.apply_global_settings(&update)
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Gets a global parameter under the shared buffer contract.
    pub fn get_global_param(
        &self,
        param: u32,
        buffer: Option<&mut [u8]>,
        buffer_length: &mut u32,
    ) -> Result<(), Error> {
        match param {
            PARAM_GLOBAL_RETRY_MEMORY_PERCENT => fill(
                &self.settings().retry_memory_limit.to_le_bytes(),
                buffer,
                buffer_length,
            ),
            PARAM_GLOBAL_SUPPORTED_VERSIONS => {
                let mut versions = [0; SUPPORTED_VERSIONS.len() * 4];
                for (chunk, version) in versions.chunks_exact_mut(4).zip(&SUPPORTED_VERSIONS) {
                    chunk.copy_from_slice(&version.to_le_bytes());
                }
                fill(&versions, buffer, buffer_length)
            }
            PARAM_GLOBAL_LOAD_BALANCING_MODE => fill(
                &(self.settings().load_balancing_mode as u16).to_le_bytes(),
                buffer,
                buffer_length,
            ),
            PARAM_GLOBAL_PERF_COUNTERS => {
                let required = (PerfCounter::COUNT * 8) as u32;
                if *buffer_length < 8 {
                    *buffer_length = required;
                    return Err(Error::BufferTooSmall);
                }
                let buffer = buffer.ok_or(Error::InvalidParameter)?;
                // A short buffer receives as many whole counters as fit.
                let produced = if *buffer_length < required {
                    (*buffer_length / 8) * 8
                } else {
                    required
                };
                if (buffer.len() as u32) < produced {
                    return Err(Error::InvalidParameter);
                }
                let mut counters = [0; PerfCounter::COUNT];
                let wanted = (produced / 8) as usize;
                self.sum_perf_counters(&mut counters[..wanted]);
                for (chunk, counter) in buffer[..produced as usize]
                    .chunks_exact_mut(8)
                    .zip(&counters)
                {
                    chunk.copy_from_slice(&counter.to_le_bytes());
                }
                *buffer_length = produced;
                Ok(())
            }
            PARAM_GLOBAL_SETTINGS => {
                let required = Settings::ENCODED_SIZE as u32;
                if *buffer_length < required {
                    *buffer_length = required;
                    return Err(Error::BufferTooSmall);
                }
                let buffer = buffer.ok_or(Error::InvalidParameter)?;
                if (buffer.len() as u32) < required {
                    return Err(Error::InvalidParameter);
                }
                self.settings().encode(&mut buffer[..Settings::ENCODED_SIZE]);
                *buffer_length = required;
                Ok(())
            }
            _ => Err(Error::InvalidParameter),
        }
    }
}

/// The handle's reachable ancestors, resolved once per call.
struct HandleView {
    registration: Option<Arc<Registration>>,
    configuration: Option<Arc<Configuration>>,
    listener: Option<Arc<Listener>>,
    connection: Option<Arc<Connection>>,
    stream: Option<Arc<Stream>>,
}

impl HandleView {
    fn resolve(handle: &Handle) -> HandleView {
        let mut view = HandleView {
            registration: None,
            configuration: None,
            listener: None,
            connection: None,
            stream: None,
        };
        match handle {
            Handle::Registration(registration) => {
                view.registration = Some(registration.clone());
            }
            Handle::Configuration(configuration) => {
                view.registration = Some(configuration.registration().clone());
                view.configuration = Some(configuration.clone());
            }
            Handle::Listener(listener) => {
                view.registration = Some(listener.registration().clone());
                view.listener = Some(listener.clone());
            }
            Handle::Connection(connection) => {
                view.registration = Some(connection.registration().clone());
                view.configuration = connection.configuration();
                view.connection = Some(connection.clone());
            }
            Handle::Stream(stream) => {
                let connection = stream.connection();
                view.registration = Some(connection.registration().clone());
                view.configuration = connection.configuration();
                view.connection = Some(connection.clone());
                view.stream = Some(stream.clone());
            }
        }
        view
    }
}

/// Routes a set-parameter call to the subsystem owning the requested level.
/// A level whose object is absent from this handle's ancestry reports
/// `InvalidParameter`.
pub fn set_param(
    handle: &Handle,
    level: ParamLevel,
    param: u32,
    buffer: &[u8],
) -> Result<(), Error> {
    let view = HandleView::resolve(handle);
    match level {
        ParamLevel::Registration => view
            .registration
            .ok_or(Error::InvalidParameter)?
            .param_set(param, buffer),
        ParamLevel::Configuration => view
            .configuration
            .ok_or(Error::InvalidParameter)?
            .param_set(param, buffer),
        ParamLevel::Listener => view
            .listener
            .ok_or(Error::InvalidParameter)?
            .param_set(param, buffer),
        ParamLevel::Connection => view
            .connection
            .ok_or(Error::InvalidParameter)?
            .param_set(param, buffer),
        ParamLevel::Tls => view
            .connection
            .ok_or(Error::InvalidParameter)?
            .tls_param_set(param, buffer),
        ParamLevel::Stream => view
            .stream
            .ok_or(Error::InvalidParameter)?
            .param_set(param, buffer),
    }
}

/// Routes a get-parameter call; same ancestry rules as [`set_param`].
pub fn get_param(
    handle: &Handle,
    level: ParamLevel,
    param: u32,
    buffer: Option<&mut [u8]>,
    buffer_length: &mut u32,
) -> Result<(), Error> {
    let view = HandleView::resolve(handle);
    match level {
        ParamLevel::Registration => view
            .registration
            .ok_or(Error::InvalidParameter)?
            .param_get(param, buffer, buffer_length),
        ParamLevel::Configuration => view
            .configuration
            .ok_or(Error::InvalidParameter)?
            .param_get(param, buffer, buffer_length),
        ParamLevel::Listener => view
            .listener
            .ok_or(Error::InvalidParameter)?
            .param_get(param, buffer, buffer_length),
        ParamLevel::Connection => view
            .connection
            .ok_or(Error::InvalidParameter)?
            .param_get(param, buffer, buffer_length),
        ParamLevel::Tls => view
            .connection
            .ok_or(Error::InvalidParameter)?
            .tls_param_get(param, buffer, buffer_length),
        ParamLevel::Stream => view
            .stream
            .ok_or(Error::InvalidParameter)?
            .param_get(param, buffer, buffer_length),
    }
}

impl Registration {
    // No registration-level parameters are currently defined.
    pub(crate) fn param_set(&self, _param: u32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::InvalidParameter)
    }

    pub(crate) fn param_get(
        &self,
        _param: u32,
        _buffer: Option<&mut [u8]>,
        _buffer_length: &mut u32,
    ) -> Result<(), Error> {
        Err(Error::InvalidParameter)
    }
}

impl Configuration {
    pub(crate) fn param_set(&self, param: u32, buffer: &[u8]) -> Result<(), Error> {
        match param {
            PARAM_CONFIGURATION_SETTINGS => {
                if buffer.len() != Settings::ENCODED_SIZE {
                    return Err(Error::InvalidParameter);
                }
                self.apply_settings(&Settings::decode(buffer)?)
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    pub(crate) fn param_get(
        &self,
        param: u32,
        buffer: Option<&mut [u8]>,
        buffer_length: &mut u32,
    ) -> Result<(), Error> {
        match param {
            PARAM_CONFIGURATION_SETTINGS => {
                let mut encoded = [0; Settings::ENCODED_SIZE];
                self.settings().encode(&mut encoded);
                fill(&encoded, buffer, buffer_length)
            }
            _ => Err(Error::InvalidParameter),
        }
    }
}

impl Listener {
    pub(crate) fn param_set(&self, _param: u32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::InvalidParameter)
    }

    pub(crate) fn param_get(
        &self,
        param: u32,
        buffer: Option<&mut [u8]>,
        buffer_length: &mut u32,
    ) -> Result<(), Error> {
        match param {
            PARAM_LISTENER_LOCAL_ADDRESS => {
                let addr = self.local_addr().ok_or(Error::InvalidState)?;
                fill(&encode_socket_addr(&addr), buffer, buffer_length)
            }
            _ => Err(Error::InvalidParameter),
        }
    }
}

impl Connection {
    pub(crate) fn param_set(&self, param: u32, buffer: &[u8]) -> Result<(), Error> {
        match param {
            PARAM_CONN_SETTINGS => {
                if buffer.len() != Settings::ENCODED_SIZE {
                    return Err(Error::InvalidParameter);
                }
                self.apply_settings(&Settings::decode(buffer)?)
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    pub(crate) fn param_get(
        &self,
        param: u32,
        buffer: Option<&mut [u8]>,
        buffer_length: &mut u32,
    ) -> Result<(), Error> {
        match param {
            PARAM_CONN_QUIC_VERSION => fill(&self.version()?.to_le_bytes(), buffer, buffer_length),
            PARAM_CONN_REMOTE_ADDRESS => {
                let addr = self.remote_addr().ok_or(Error::InvalidState)?;
                fill(&encode_socket_addr(&addr), buffer, buffer_length)
            }
            _ => Err(Error::InvalidParameter),
        }
    }
}

impl Stream {
    pub(crate) fn param_set(&self, param: u32, buffer: &[u8]) -> Result<(), Error> {
        match param {
            PARAM_STREAM_PRIORITY => {
                if buffer.len() != 2 {
                    return Err(Error::InvalidParameter);
                }
                self.set_priority(u16::from_le_bytes([buffer[0], buffer[1]]));
                Ok(())
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    pub(crate) fn param_get(
        &self,
        param: u32,
        buffer: Option<&mut [u8]>,
        buffer_length: &mut u32,
    ) -> Result<(), Error> {
        match param {
            PARAM_STREAM_ID => fill(&self.id().to_le_bytes(), buffer, buffer_length),
            PARAM_STREAM_PRIORITY => fill(&self.priority().to_le_bytes(), buffer, buffer_length),
            _ => Err(Error::InvalidParameter),
        }
    }
}
