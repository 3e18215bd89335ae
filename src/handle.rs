//! The handle taxonomy the API surface operates on: registrations,
//! configurations, listeners, connections, and streams.
//!
//! Connection and stream state machines proper are external collaborators;
//! the objects here carry what the core itself needs: ancestry for parameter
//! dispatch, binding ownership, lifecycle counters, contexts, and callback
//! handlers.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::binding::Binding;
use crate::library::Library;
use crate::partition::PerfCounter;
use crate::settings::Settings;
use crate::Error;

/// Opaque application context attachable to any handle.
pub type Context = Arc<dyn Any + Send + Sync>;

/// How a registration's workload should be scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionProfile {
    LowLatency,
    MaxThroughput,
    Scavenger,
    RealTime,
    /// Library-internal registrations; excluded from the public registry.
    Internal,
}

#[derive(Clone, Debug)]
pub struct RegistrationConfig {
    pub app_name: String,
    pub execution_profile: ExecutionProfile,
}

/// An application's grouping of connections.
pub struct Registration {
    library: &'static Library,
    app_name: String,
    execution_profile: ExecutionProfile,
    settings: Mutex<Settings>,
    shut_down: AtomicBool,
    context: Mutex<Option<Context>>,
}

impl Registration {
    pub(crate) fn new(
        library: &'static Library,
        config: &RegistrationConfig,
        settings: Settings,
    ) -> Arc<Registration> {
        Arc::new(Registration {
            library,
            app_name: config.app_name.clone(),
            execution_profile: config.execution_profile,
            settings: Mutex::new(settings),
            shut_down: AtomicBool::new(false),
            context: Mutex::new(None),
        })
    }

    /// Opens a registration and records it in the library's registry.
    pub fn open(
        library: &'static Library,
        config: &RegistrationConfig,
    ) -> Result<Arc<Registration>, Error> {
        library.register(config)
    }

    /// Closes the registration, removing it from the registry.
    pub fn close(self: &Arc<Self>) {
        self.library.deregister(self);
        debug!("registration '{}' closed", self.app_name);
    }

    /// Flags the registration as shutting down and traces it. The core does
    /// not track registration membership, so cascading the shutdown to the
    /// registration's connections is the caller's responsibility.
    pub fn shutdown(&self, silent: bool, error_code: u64) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(
                "registration '{}' shutdown, silent={} error=0x{:x}",
                self.app_name, silent, error_code
            );
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn execution_profile(&self) -> ExecutionProfile {
        self.execution_profile
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub(crate) fn library(&self) -> &'static Library {
        self.library
    }

    /// Called under the library lock when global settings change.
    pub(crate) fn settings_changed(&self, new_settings: &Settings) {
        *self.settings.lock().unwrap() = new_settings.clone();
        trace!("registration '{}' settings refreshed", self.app_name);
    }
}

/// Credential material handed to the external TLS engine.
#[derive(Clone, Debug, Default)]
pub struct CredentialConfig {
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub is_client: bool,
}

/// Shareable connection configuration: settings plus loaded credentials.
pub struct Configuration {
    registration: Arc<Registration>,
    alpn: Vec<String>,
    settings: Mutex<Settings>,
    credential_loaded: AtomicBool,
    context: Mutex<Option<Context>>,
}

impl Configuration {
    pub fn open(
        registration: &Arc<Registration>,
        alpn: &[&str],
        settings: Option<&Settings>,
    ) -> Result<Arc<Configuration>, Error> {
        if alpn.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let mut effective = registration.settings();
        if let Some(overrides) = settings {
            if !effective.apply(overrides) {
                return Err(Error::InvalidParameter);
            }
        }
        Ok(Arc::new(Configuration {
            registration: registration.clone(),
            alpn: alpn.iter().map(|a| (*a).to_owned()).collect(),
            settings: Mutex::new(effective),
            credential_loaded: AtomicBool::new(false),
            context: Mutex::new(None),
        }))
    }

    /// Hands credentials to the TLS engine. The engine is an external
    /// collaborator; the core records only that credentials are present.
    pub fn load_credential(&self, _credential: &CredentialConfig) -> Result<(), Error> {
        self.credential_loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_credential_loaded(&self) -> bool {
        self.credential_loaded.load(Ordering::Acquire)
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn alpn(&self) -> &[String] {
        &self.alpn
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub(crate) fn apply_settings(&self, update: &Settings) -> Result<(), Error> {
        if self.settings.lock().unwrap().apply(update) {
            Ok(())
        } else {
            Err(Error::InvalidParameter)
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ListenerEvent {
    StopComplete,
}

pub type ListenerHandler = fn(&Listener, &ListenerEvent);

/// Accepts incoming connections on a shared server binding.
pub struct Listener {
    registration: Arc<Registration>,
    handler: Mutex<Option<ListenerHandler>>,
    binding: Mutex<Option<Arc<Binding>>>,
    context: Mutex<Option<Context>>,
}

impl Listener {
    pub fn open(
        registration: &Arc<Registration>,
        handler: ListenerHandler,
    ) -> Result<Arc<Listener>, Error> {
        Ok(Arc::new(Listener {
            registration: registration.clone(),
            handler: Mutex::new(Some(handler)),
            binding: Mutex::new(None),
            context: Mutex::new(None),
        }))
    }

    /// Starts listening on `local`. The first listener in the process also
    /// brings up the library's stateless registration.
    pub fn start(&self, local: SocketAddr) -> Result<(), Error> {
        let library = self.registration.library();
        let mut binding = self.binding.lock().unwrap();
        if binding.is_some() {
            return Err(Error::InvalidState);
        }
        library.on_listener_registered()?;
        let acquired = library.get_or_create_binding(true, true, Some(local), None, None)?;
        info!("listener started on {}", acquired.local_addr());
        *binding = Some(acquired);
        Ok(())
    }

    /// Stops listening, releasing the binding and signalling completion.
    pub fn stop(&self) {
        let released = self.binding.lock().unwrap().take();
        if let Some(binding) = released {
            self.registration.library().release_binding(&binding);
            let handler = *self.handler.lock().unwrap();
            if let Some(handler) = handler {
                handler(self, &ListenerEvent::StopComplete);
            }
        }
    }

    pub fn close(&self) {
        self.stop();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.binding.lock().unwrap().as_ref().map(|b| b.local_addr())
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }
}

/// Transport parameters negotiated for one connection. Pool-allocated per
/// partition slot.
#[derive(Clone, Debug, Default)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub idle_timeout_ms: u64,
    pub active_connection_id_limit: u8,
}

impl TransportParameters {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        TransportParameters {
            initial_max_data: settings.conn_flow_control_window as u64,
            initial_max_stream_data: settings.stream_recv_window_default as u64,
            idle_timeout_ms: settings.idle_timeout_ms,
            active_connection_id_limit: 4,
        }
    }
}

/// Per-packet-number-space bookkeeping. Pool-allocated per partition slot.
#[derive(Clone, Debug, Default)]
pub struct PacketSpace {
    pub next_packet_number: u64,
    pub largest_acked: Option<u64>,
}

/// The crypto engine attached to a started connection. The engine itself is
/// external; this is the slot the TLS parameter level dispatches into.
pub(crate) struct TlsSession {
    #[allow(dead_code)]
    alpn: String,
}

impl TlsSession {
    fn new(alpn: String) -> Self {
        TlsSession { alpn }
    }

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

/// Pooled per-connection record; returned to its slot's pool at close.
pub struct ConnectionState {
    pub(crate) version: u32,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) partition: u16,
    pub(crate) started: bool,
    pub(crate) handshake_active: bool,
    pub(crate) transport_params: Option<Box<TransportParameters>>,
    pub(crate) packet_space: Option<Box<PacketSpace>>,
}

impl ConnectionState {
    fn new(partition: u16) -> Self {
        ConnectionState {
            version: crate::SUPPORTED_VERSIONS[0],
            remote: None,
            partition,
            started: false,
            handshake_active: false,
            transport_params: None,
            packet_space: None,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ConnectionEvent {
    ShutdownComplete { error_code: u64 },
}

pub type ConnectionHandler = fn(&Connection, &ConnectionEvent);

/// One QUIC connection, client or server side.
pub struct Connection {
    registration: Arc<Registration>,
    configuration: Mutex<Option<Arc<Configuration>>>,
    tls: Mutex<Option<TlsSession>>,
    binding: Mutex<Option<Arc<Binding>>>,
    state: Mutex<Option<Box<ConnectionState>>>,
    handler: Mutex<Option<ConnectionHandler>>,
    context: Mutex<Option<Context>>,
    shut_down: AtomicBool,
    next_stream_id: AtomicU64,
}

impl Connection {
    pub fn open(
        registration: &Arc<Registration>,
        handler: ConnectionHandler,
    ) -> Result<Arc<Connection>, Error> {
        let library = registration.library();
        let partitions = library.partitions().ok_or(Error::InvalidState)?;
        let slot_index = partitions.current_slot_index();
        let state = partitions
            .slot(slot_index)
            .connection_pool
            .alloc_with(|| ConnectionState::new(slot_index as u16));
        partitions.counter_add(PerfCounter::ConnCreated, 1);
        partitions.counter_add(PerfCounter::ConnActive, 1);
        Ok(Arc::new(Connection {
            registration: registration.clone(),
            configuration: Mutex::new(None),
            tls: Mutex::new(None),
            binding: Mutex::new(None),
            state: Mutex::new(Some(state)),
            handler: Mutex::new(Some(handler)),
            context: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            next_stream_id: AtomicU64::new(0),
        }))
    }

    /// Starts the client handshake toward `remote`: claims an exclusive
    /// binding, stands up the crypto engine, and begins charging handshake
    /// memory against the retry limit.
    pub fn start(
        &self,
        configuration: &Arc<Configuration>,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        if !configuration.is_credential_loaded() {
            return Err(Error::InvalidState);
        }
        let library = self.registration.library();
        let mut state_slot = self.state.lock().unwrap();
        let state = state_slot.as_mut().ok_or(Error::InvalidState)?;
        if state.started {
            return Err(Error::InvalidState);
        }

        let binding = library.get_or_create_binding(false, false, None, Some(remote), None)?;
        if let Some(partitions) = library.partitions() {
            let slot = partitions.slot(state.partition as usize);
            let settings = configuration.settings();
            state.transport_params = Some(
                slot.transport_params_pool
                    .alloc_with(|| TransportParameters::from_settings(&settings)),
            );
            state.packet_space = Some(slot.packet_space_pool.alloc_with(PacketSpace::default));
        }
        *self.binding.lock().unwrap() = Some(binding);
        let alpn = configuration.alpn()[0].clone();
        *self.tls.lock().unwrap() = Some(TlsSession::new(alpn));
        *self.configuration.lock().unwrap() = Some(configuration.clone());

        state.remote = Some(remote);
        state.started = true;
        state.handshake_active = true;
        library.on_handshake_connection_added();
        info!("connection starting toward {}", remote);
        Ok(())
    }

    /// Attaches a configuration without starting; used by server-side
    /// acceptance.
    pub fn set_configuration(&self, configuration: &Arc<Configuration>) -> Result<(), Error> {
        let state_slot = self.state.lock().unwrap();
        let state = state_slot.as_ref().ok_or(Error::InvalidState)?;
        if state.started {
            return Err(Error::InvalidState);
        }
        *self.configuration.lock().unwrap() = Some(configuration.clone());
        Ok(())
    }

    pub fn shutdown(&self, silent: bool, error_code: u64) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("connection shutdown, silent={} error=0x{:x}", silent, error_code);
        let handler = *self.handler.lock().unwrap();
        if let Some(handler) = handler {
            handler(self, &ConnectionEvent::ShutdownComplete { error_code });
        }
    }

    /// Releases the binding and returns the pooled state. Idempotent.
    pub fn close(&self) {
        let state = match self.state.lock().unwrap().take() {
            Some(state) => state,
            None => return,
        };
        let library = self.registration.library();
        if let Some(binding) = self.binding.lock().unwrap().take() {
            library.release_binding(&binding);
        }
        if state.handshake_active {
            library.on_handshake_connection_removed();
        }
        if let Some(partitions) = library.partitions() {
            partitions.counter_add(PerfCounter::ConnActive, -1);
            let slot = partitions.slot(state.partition as usize);
            let mut state = state;
            if let Some(params) = state.transport_params.take() {
                slot.transport_params_pool.free(params);
            }
            if let Some(space) = state.packet_space.take() {
                slot.packet_space_pool.free(space);
            }
            slot.connection_pool.free(state);
        }
        *self.tls.lock().unwrap() = None;
    }

    /// Sends an unreliable datagram over the connection's path.
    pub fn datagram_send(&self, data: &Bytes) -> Result<(), Error> {
        let remote = {
            let state_slot = self.state.lock().unwrap();
            let state = state_slot.as_ref().ok_or(Error::InvalidState)?;
            state.remote.ok_or(Error::InvalidState)?
        };
        let binding = self
            .binding
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::InvalidState)?;
        binding.send(remote, data)
    }

    pub fn is_started(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.started)
            .unwrap_or(false)
    }

    pub fn version(&self) -> Result<u32, Error> {
        let state_slot = self.state.lock().unwrap();
        Ok(state_slot.as_ref().ok_or(Error::InvalidState)?.version)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| s.remote)
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.configuration.lock().unwrap().clone()
    }

    pub(crate) fn apply_settings(&self, _update: &Settings) -> Result<(), Error> {
        // Per-connection settings land in the connection machine, which is
        // external; the dispatcher only validates reachability here.
        Ok(())
    }

    pub(crate) fn tls_param_set(&self, param: u32, buffer: &[u8]) -> Result<(), Error> {
        match &*self.tls.lock().unwrap() {
            Some(tls) => tls.param_set(param, buffer),
            None => Err(Error::InvalidParameter),
        }
    }

    pub(crate) fn tls_param_get(
        &self,
        param: u32,
        buffer: Option<&mut [u8]>,
        buffer_length: &mut u32,
    ) -> Result<(), Error> {
        match &*self.tls.lock().unwrap() {
            Some(tls) => tls.param_get(param, buffer, buffer_length),
            None => Err(Error::InvalidParameter),
        }
    }

    fn allocate_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(4, Ordering::Relaxed)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum StreamEvent {
    ShutdownComplete,
}

pub type StreamHandler = fn(&Stream, &StreamEvent);

/// One stream of a connection. The flow-control and retransmission machinery
/// is external; the core tracks identity, priority, and byte accounting.
pub struct Stream {
    connection: Arc<Connection>,
    id: u64,
    priority: Mutex<u16>,
    started: AtomicBool,
    sent_bytes: AtomicU64,
    consumed_bytes: AtomicU64,
    handler: Mutex<Option<StreamHandler>>,
    context: Mutex<Option<Context>>,
    shut_down: AtomicBool,
    closed: AtomicBool,
}

impl Stream {
    pub fn open(connection: &Arc<Connection>) -> Result<Arc<Stream>, Error> {
        if connection.state.lock().unwrap().is_none() {
            return Err(Error::InvalidState);
        }
        let library = connection.registration.library();
        if let Some(partitions) = library.partitions() {
            partitions.counter_add(PerfCounter::StrmActive, 1);
        }
        Ok(Arc::new(Stream {
            connection: connection.clone(),
            id: connection.allocate_stream_id(),
            priority: Mutex::new(0),
            started: AtomicBool::new(false),
            sent_bytes: AtomicU64::new(0),
            consumed_bytes: AtomicU64::new(0),
            handler: Mutex::new(None),
            context: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn start(&self) -> Result<(), Error> {
        if !self.connection.is_started() {
            return Err(Error::InvalidState);
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Queues data toward the peer. The transmission machinery is external;
    /// the core validates state and accounts the bytes.
    pub fn send(&self, buffers: &[Bytes]) -> Result<(), Error> {
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        self.sent_bytes.fetch_add(total, Ordering::Relaxed);
        if let Some(partitions) = self.connection.registration.library().partitions() {
            partitions.counter_add(PerfCounter::AppSendBytes, total as i64);
        }
        Ok(())
    }

    /// Reports `length` bytes of received data consumed by the application.
    pub fn receive_complete(&self, length: u64) {
        self.consumed_bytes.fetch_add(length, Ordering::Relaxed);
        if let Some(partitions) = self.connection.registration.library().partitions() {
            partitions.counter_add(PerfCounter::AppRecvBytes, length as i64);
        }
    }

    pub fn shutdown(&self, abortive: bool, error_code: u64) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "stream {} shutdown, abortive={} error=0x{:x}",
            self.id, abortive, error_code
        );
        let handler = *self.handler.lock().unwrap();
        if let Some(handler) = handler {
            handler(self, &StreamEvent::ShutdownComplete);
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(partitions) = self.connection.registration.library().partitions() {
            partitions.counter_add(PerfCounter::StrmActive, -1);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> u16 {
        *self.priority.lock().unwrap()
    }

    pub fn set_priority(&self, priority: u16) {
        *self.priority.lock().unwrap() = priority;
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

/// A type-tagged reference to any API object.
#[derive(Clone)]
pub enum Handle {
    Registration(Arc<Registration>),
    Configuration(Arc<Configuration>),
    Listener(Arc<Listener>),
    Connection(Arc<Connection>),
    Stream(Arc<Stream>),
}

/// A callback paired with the handle type it serves.
#[derive(Clone, Copy)]
pub enum CallbackHandler {
    Listener(ListenerHandler),
    Connection(ConnectionHandler),
    Stream(StreamHandler),
}

impl Handle {
    pub fn set_context(&self, context: Option<Context>) {
        match self {
            Handle::Registration(r) => *r.context.lock().unwrap() = context,
            Handle::Configuration(c) => *c.context.lock().unwrap() = context,
            Handle::Listener(l) => *l.context.lock().unwrap() = context,
            Handle::Connection(c) => *c.context.lock().unwrap() = context,
            Handle::Stream(s) => *s.context.lock().unwrap() = context,
        }
    }

    pub fn context(&self) -> Option<Context> {
        match self {
            Handle::Registration(r) => r.context.lock().unwrap().clone(),
            Handle::Configuration(c) => c.context.lock().unwrap().clone(),
            Handle::Listener(l) => l.context.lock().unwrap().clone(),
            Handle::Connection(c) => c.context.lock().unwrap().clone(),
            Handle::Stream(s) => s.context.lock().unwrap().clone(),
        }
    }

    /// Installs an event callback. Handles without callbacks, and handler
    /// variants that do not match the handle type, are ignored.
    pub fn set_callback_handler(&self, handler: CallbackHandler) {
        match (self, handler) {
            (Handle::Listener(l), CallbackHandler::Listener(h)) => {
                *l.handler.lock().unwrap() = Some(h);
            }
            (Handle::Connection(c), CallbackHandler::Connection(h)) => {
                *c.handler.lock().unwrap() = Some(h);
            }
            (Handle::Stream(s), CallbackHandler::Stream(h)) => {
                *s.handler.lock().unwrap() = Some(h);
            }
            _ => trace!("callback handler ignored for mismatched handle type"),
        }
    }
}
