//! The outward API: a function-pointer table handed to applications.
//!
//! [`open`] pairs the table's allocation with a library reference; [`close`]
//! releases both. The table is immutable for the caller's lifetime, so the
//! entry points can be stored and invoked from any thread.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::trace;

use crate::handle::{
    CallbackHandler, Configuration, Connection, ConnectionHandler, Context, CredentialConfig,
    Handle, Listener, ListenerHandler, Registration, RegistrationConfig, Stream,
};
use crate::library::library;
use crate::params::{self, ParamLevel};
use crate::settings::Settings;
use crate::Error;

/// Every externally callable entry point, as plain function pointers.
pub struct ApiTable {
    pub set_context: fn(&Handle, Option<Context>),
    pub get_context: fn(&Handle) -> Option<Context>,
    pub set_callback_handler: fn(&Handle, CallbackHandler),

    pub set_param: fn(&Handle, ParamLevel, u32, &[u8]) -> Result<(), Error>,
    pub get_param: fn(&Handle, ParamLevel, u32, Option<&mut [u8]>, &mut u32) -> Result<(), Error>,
    pub set_global_param: fn(u32, &[u8]) -> Result<(), Error>,
    pub get_global_param: fn(u32, Option<&mut [u8]>, &mut u32) -> Result<(), Error>,

    pub registration_open: fn(&RegistrationConfig) -> Result<Handle, Error>,
    pub registration_close: fn(&Handle),
    pub registration_shutdown: fn(&Handle, bool, u64),

    pub configuration_open: fn(&Handle, &[&str], Option<&Settings>) -> Result<Handle, Error>,
    pub configuration_close: fn(&Handle),
    pub configuration_load_credential: fn(&Handle, &CredentialConfig) -> Result<(), Error>,

    pub listener_open: fn(&Handle, ListenerHandler) -> Result<Handle, Error>,
    pub listener_close: fn(&Handle),
    pub listener_start: fn(&Handle, SocketAddr) -> Result<(), Error>,
    pub listener_stop: fn(&Handle),

    pub connection_open: fn(&Handle, ConnectionHandler) -> Result<Handle, Error>,
    pub connection_close: fn(&Handle),
    pub connection_shutdown: fn(&Handle, bool, u64),
    pub connection_start: fn(&Handle, &Handle, SocketAddr) -> Result<(), Error>,
    pub connection_set_configuration: fn(&Handle, &Handle) -> Result<(), Error>,

    pub stream_open: fn(&Handle) -> Result<Handle, Error>,
    pub stream_close: fn(&Handle),
    pub stream_shutdown: fn(&Handle, bool, u64),
    pub stream_start: fn(&Handle) -> Result<(), Error>,
    pub stream_send: fn(&Handle, &[Bytes]) -> Result<(), Error>,
    pub stream_receive_complete: fn(&Handle, u64),

    pub datagram_send: fn(&Handle, &Bytes) -> Result<(), Error>,
}

/// Opens the library, returning the API table. Takes a library reference;
/// the first open initializes the interior.
pub fn open() -> Result<Box<ApiTable>, Error> {
    trace!("api open");
    library().add_ref()?;
    Ok(Box::new(ApiTable {
        set_context: api_set_context,
        get_context: api_get_context,
        set_callback_handler: api_set_callback_handler,

        set_param: params::set_param,
        get_param: params::get_param,
        set_global_param: api_set_global_param,
        get_global_param: api_get_global_param,

        registration_open: api_registration_open,
        registration_close: api_registration_close,
        registration_shutdown: api_registration_shutdown,

        configuration_open: api_configuration_open,
        configuration_close: api_configuration_close,
        configuration_load_credential: api_configuration_load_credential,

        listener_open: api_listener_open,
        listener_close: api_listener_close,
        listener_start: api_listener_start,
        listener_stop: api_listener_stop,

        connection_open: api_connection_open,
        connection_close: api_connection_close,
        connection_shutdown: api_connection_shutdown,
        connection_start: api_connection_start,
        connection_set_configuration: api_connection_set_configuration,

        stream_open: api_stream_open,
        stream_close: api_stream_close,
        stream_shutdown: api_stream_shutdown,
        stream_start: api_stream_start,
        stream_send: api_stream_send,
        stream_receive_complete: api_stream_receive_complete,

        datagram_send: api_datagram_send,
    }))
}

/// Closes an API table obtained from [`open`], releasing its library
/// reference. The last close tears the library's interior down.
pub fn close(api: Box<ApiTable>) {
    trace!("api close");
    drop(api);
    library().release();
}

fn api_set_context(handle: &Handle, context: Option<Context>) {
    handle.set_context(context);
}

fn api_get_context(handle: &Handle) -> Option<Context> {
    handle.context()
}

fn api_set_callback_handler(handle: &Handle, handler: CallbackHandler) {
    handle.set_callback_handler(handler);
}

fn api_set_global_param(param: u32, buffer: &[u8]) -> Result<(), Error> {
    library().set_global_param(param, buffer)
}

fn api_get_global_param(
    param: u32,
    buffer: Option<&mut [u8]>,
    buffer_length: &mut u32,
) -> Result<(), Error> {
    library().get_global_param(param, buffer, buffer_length)
}

fn api_registration_open(config: &RegistrationConfig) -> Result<Handle, Error> {
    Registration::open(library(), config).map(Handle::Registration)
}

fn api_registration_close(handle: &Handle) {
    if let Handle::Registration(registration) = handle {
        registration.close();
    }
}

fn api_registration_shutdown(handle: &Handle, silent: bool, error_code: u64) {
    if let Handle::Registration(registration) = handle {
        registration.shutdown(silent, error_code);
    }
}

fn api_configuration_open(
    handle: &Handle,
    alpn: &[&str],
    settings: Option<&Settings>,
) -> Result<Handle, Error> {
    match handle {
        Handle::Registration(registration) => {
            Configuration::open(registration, alpn, settings).map(Handle::Configuration)
        }
        _ => Err(Error::InvalidParameter),
    }
}

fn api_configuration_close(handle: &Handle) {
    // Configurations hold no registry state; dropping the handle suffices.
    if let Handle::Configuration(_) = handle {
        trace!("configuration closed");
    }
}

fn api_configuration_load_credential(
    handle: &Handle,
    credential: &CredentialConfig,
) -> Result<(), Error> {
    match handle {
        Handle::Configuration(configuration) => configuration.load_credential(credential),
        _ => Err(Error::InvalidParameter),
    }
}

fn api_listener_open(handle: &Handle, handler: ListenerHandler) -> Result<Handle, Error> {
    match handle {
        Handle::Registration(registration) => {
            Listener::open(registration, handler).map(Handle::Listener)
        }
        _ => Err(Error::InvalidParameter),
    }
}

fn api_listener_close(handle: &Handle) {
    if let Handle::Listener(listener) = handle {
        listener.close();
    }
}

fn api_listener_start(handle: &Handle, local: SocketAddr) -> Result<(), Error> {
    match handle {
        Handle::Listener(listener) => listener.start(local),
        _ => Err(Error::InvalidParameter),
    }
}

fn api_listener_stop(handle: &Handle) {
    if let Handle::Listener(listener) = handle {
        listener.stop();
    }
}

fn api_connection_open(handle: &Handle, handler: ConnectionHandler) -> Result<Handle, Error> {
    match handle {
        Handle::Registration(registration) => {
            Connection::open(registration, handler).map(Handle::Connection)
        }
        _ => Err(Error::InvalidParameter),
    }
}

fn api_connection_close(handle: &Handle) {
    if let Handle::Connection(connection) = handle {
        connection.close();
    }
}

fn api_connection_shutdown(handle: &Handle, silent: bool, error_code: u64) {
    if let Handle::Connection(connection) = handle {
        connection.shutdown(silent, error_code);
    }
}

fn api_connection_start(
    handle: &Handle,
    configuration: &Handle,
    remote: SocketAddr,
) -> Result<(), Error> {
    match (handle, configuration) {
        (Handle::Connection(connection), Handle::Configuration(configuration)) => {
            connection.start(configuration, remote)
        }
        _ => Err(Error::InvalidParameter),
    }
}

fn api_connection_set_configuration(handle: &Handle, configuration: &Handle) -> Result<(), Error> {
    match (handle, configuration) {
        (Handle::Connection(connection), Handle::Configuration(configuration)) => {
            connection.set_configuration(configuration)
        }
        _ => Err(Error::InvalidParameter),
    }
}

fn api_stream_open(handle: &Handle) -> Result<Handle, Error> {
    match handle {
        Handle::Connection(connection) => Stream::open(connection).map(Handle::Stream),
        _ => Err(Error::InvalidParameter),
    }
}

fn api_stream_close(handle: &Handle) {
    if let Handle::Stream(stream) = handle {
        stream.close();
    }
}

fn api_stream_shutdown(handle: &Handle, abortive: bool, error_code: u64) {
    if let Handle::Stream(stream) = handle {
        stream.shutdown(abortive, error_code);
    }
}

fn api_stream_start(handle: &Handle) -> Result<(), Error> {
    match handle {
        Handle::Stream(stream) => stream.start(),
        _ => Err(Error::InvalidParameter),
    }
}

fn api_stream_send(handle: &Handle, buffers: &[Bytes]) -> Result<(), Error> {
    match handle {
        Handle::Stream(stream) => stream.send(buffers),
        _ => Err(Error::InvalidParameter),
    }
}

fn api_stream_receive_complete(handle: &Handle, length: u64) {
    if let Handle::Stream(stream) = handle {
        stream.receive_complete(length);
    }
}

fn api_datagram_send(handle: &Handle, data: &Bytes) -> Result<(), Error> {
    match handle {
        Handle::Connection(connection) => connection.datagram_send(data),
        _ => Err(Error::InvalidParameter),
    }
}
