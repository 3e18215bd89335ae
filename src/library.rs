//! The process-global library: lifecycle, partitions, the binding table, the
//! retry keyring, and the handshake-memory governor.
//!
//! Three locks split the state by execution level. `state` is the passive
//! lock: reference counting, the registration list, settings, and storage;
//! holders may block. `bindings` and `retry_keys` are dispatch locks: held
//! only for list edits and pointer swaps, never across blocking calls.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, error, info, trace, warn};

use crate::binding::Binding;
use crate::datapath::Datapath;
use crate::handle::{ExecutionProfile, Registration, RegistrationConfig};
use crate::partition::{Partitions, PerfCounter};
use crate::retry::{RetryKey, RetryKeyring};
use crate::settings::{IsSet, LoadBalancingMode, Settings};
use crate::storage::{self, Storage};
use crate::{binding, platform, Error};
use crate::{
    CID_PAYLOAD_LENGTH, CID_PID_LENGTH, CONN_HANDSHAKE_MEMORY_USAGE, MAX_CID_LENGTH,
    MAX_CID_SID_LENGTH, MAX_PARTITION_COUNT, MIN_INITIAL_CID_LENGTH,
};

/// State under the passive lock.
struct State {
    ref_count: u32,
    registrations: Vec<Arc<Registration>>,
    stateless_registration: Option<Arc<Registration>>,
    settings: Settings,
    storage: Option<Arc<dyn Storage>>,
    timer_resolution_ms: u8,
}

impl State {
    const fn new() -> Self {
        State {
            ref_count: 0,
            registrations: Vec::new(),
            stateless_registration: None,
            settings: Settings::new(),
            storage: None,
            timer_resolution_ms: 0,
        }
    }
}

/// The library singleton. One instance exists per process, reachable through
/// [`library()`]; its interior comes up on the first reference and goes down
/// on the last.
pub struct Library {
    loaded: AtomicBool,
    in_use: AtomicBool,
    state: Mutex<State>,
    bindings: Mutex<Vec<Arc<Binding>>>,
    retry_keys: Mutex<RetryKeyring>,
    partitions: RwLock<Option<Arc<Partitions>>>,
    datapath: RwLock<Option<Arc<Datapath>>>,
    cid_server_id_length: AtomicU8,
    cid_total_length: AtomicU8,
    handshake_memory: AtomicI64,
    handshake_memory_limit: AtomicI64,
    send_retry_enabled: AtomicBool,
}

static INSTANCE: Library = Library::new();

/// The process-wide library instance.
pub fn library() -> &'static Library {
    &INSTANCE
}

/// Process-load hook; must run before any other call into the library.
pub fn load() {
    INSTANCE.load();
}

/// Process-unload hook; every reference must have been released.
pub fn unload() {
    INSTANCE.unload();
}

impl Library {
    pub(crate) const fn new() -> Self {
        Library {
            loaded: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            state: Mutex::new(State::new()),
            bindings: Mutex::new(Vec::new()),
            retry_keys: Mutex::new(RetryKeyring::new()),
            partitions: RwLock::new(None),
            datapath: RwLock::new(None),
            cid_server_id_length: AtomicU8::new(0),
            cid_total_length: AtomicU8::new(0),
            handshake_memory: AtomicI64::new(0),
            handshake_memory_limit: AtomicI64::new(0),
            send_retry_enabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn load(&self) {
        if !self.loaded.swap(true, Ordering::AcqRel) {
            debug!("library loaded");
        }
    }

    pub(crate) fn unload(&self) {
        let state = self.state.lock().unwrap();
        if state.ref_count != 0 || self.in_use.load(Ordering::Acquire) {
            error!(
                "library unloaded with {} outstanding reference(s), in_use={}",
                state.ref_count,
                self.in_use.load(Ordering::Acquire)
            );
            debug_assert!(false);
        }
        self.loaded.store(false, Ordering::Release);
        debug!("library unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Takes a reference on the library, initializing the interior when this
    /// is the first. Passive level; initialization blocks.
    pub fn add_ref(&'static self) -> Result<(), Error> {
        if !self.is_loaded() {
            return Err(Error::InvalidState);
        }

        let mut state = self.state.lock().unwrap();
        state.ref_count += 1;
        if state.ref_count == 1 {
            if let Err(status) = self.initialize(&mut state) {
                state.ref_count -= 1;
                return Err(status);
            }
        }
        trace!("library add ref, count={}", state.ref_count);
        Ok(())
    }

    /// Drops a reference, tearing the interior down on the last. Must be
    /// called from a context that may block.
    pub fn release(&'static self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.ref_count > 0, "library released more than referenced");
        trace!("library release, count={}", state.ref_count);
        state.ref_count -= 1;
        if state.ref_count == 0 {
            self.uninitialize(&mut state);
        }
    }

    fn initialize(&'static self, state: &mut State) -> Result<(), Error> {
        platform::init()?;
        state.timer_resolution_ms = platform::timer_resolution_ms();

        state.settings = Settings::new();
        match storage::open() {
            Ok(opened) => {
                opened.set_change_callback(Box::new(move || self.read_settings(true)));
                state.storage = Some(opened);
            }
            Err(status) => {
                // The process may simply lack access; run on defaults.
                warn!("failed to open global settings storage: {}", status);
            }
        }
        self.read_settings_locked(state, false);

        self.retry_keys.lock().unwrap().clear();

        let mut max_partition_count = u32::from(MAX_PARTITION_COUNT);
        if let Some(storage) = &state.storage {
            if let Some(configured) = storage.read_u32(storage::SETTING_MAX_PARTITION_COUNT) {
                max_partition_count = configured.min(u32::from(MAX_PARTITION_COUNT));
            }
        }
        let processor_count = platform::processor_count();
        assert!(processor_count > 0);
        let partition_count = processor_count.min(max_partition_count.max(1) as u16);
        *self.partitions.write().unwrap() =
            Some(Arc::new(Partitions::new(processor_count, partition_count)));

        match Datapath::new(binding::receive, binding::unreachable) {
            Ok(datapath) => {
                *self.datapath.write().unwrap() = Some(Arc::new(datapath));
            }
            Err(status) => {
                error!("datapath initialization failed: {}", status);
                *self.partitions.write().unwrap() = None;
                state.storage = None;
                platform::uninit();
                return Err(status);
            }
        }

        info!("library initialized, {} partition(s)", partition_count);
        Ok(())
    }

    fn uninitialize(&'static self, state: &mut State) {
        // The datapath goes first; it is what can still be feeding new work
        // into the library.
        *self.datapath.write().unwrap() = None;

        // The stateless registration holds the last half-open connections.
        if let Some(stateless) = state.stateless_registration.take() {
            stateless.shutdown(true, 0);
        }

        // Every application registration must be closed before the last
        // release.
        debug_assert!(state.registrations.is_empty());
        if !state.registrations.is_empty() {
            error!(
                "library uninitializing with {} open registration(s)",
                state.registrations.len()
            );
            state.registrations.clear();
        }

        state.storage = None;

        {
            let bindings = self.bindings.lock().unwrap();
            debug_assert!(bindings.is_empty());
            if !bindings.is_empty() {
                error!(
                    "library uninitializing with {} live binding(s)",
                    bindings.len()
                );
            }
        }

        #[cfg(debug_assertions)]
        if let Some(partitions) = self.partitions.read().unwrap().as_ref() {
            let mut counters = [0; PerfCounter::COUNT];
            partitions.sum_counters(&mut counters);
            for counter in [
                PerfCounter::ConnActive,
                PerfCounter::ConnConnected,
                PerfCounter::StrmActive,
                PerfCounter::ConnQueueDepth,
                PerfCounter::ConnOperQueueDepth,
                PerfCounter::WorkOperQueueDepth,
            ] {
                debug_assert_eq!(
                    counters[counter as usize], 0,
                    "counter {:?} nonzero at teardown",
                    counter
                );
            }
        }

        *self.partitions.write().unwrap() = None;
        self.retry_keys.lock().unwrap().clear();

        info!("library uninitialized");
        platform::uninit();
    }

    /// Reloads settings from defaults plus storage, then propagates.
    pub(crate) fn read_settings(&'static self, update_registrations: bool) {
        let mut state = self.state.lock().unwrap();
        self.read_settings_locked(&mut state, update_registrations);
    }

    fn read_settings_locked(&self, state: &mut State, update_registrations: bool) {
        state.settings.set_default();
        if let Some(storage) = state.storage.clone() {
            state.settings.load(storage.as_ref());
        }
        info!("settings updated");
        state.settings.dump();
        self.on_settings_changed_locked(state, update_registrations);
    }

    /// Re-derives everything downstream of the settings: CID layout (only
    /// while the library is not yet in use), the handshake memory limit, and
    /// the send-retry flag. Optionally fans out to open registrations.
    fn on_settings_changed_locked(&self, state: &mut State, update_registrations: bool) {
        if !self.in_use.load(Ordering::Acquire) {
            // Changing the CID layout under existing connections would
            // destroy them.
            self.apply_load_balancing_setting(&state.settings);
        }

        let limit = (state.settings.retry_memory_limit as i64)
            .saturating_mul(platform::total_memory())
            / i64::from(u16::MAX);
        self.handshake_memory_limit.store(limit, Ordering::Release);
        self.evaluate_send_retry_state();

        if update_registrations {
            for registration in &state.registrations {
                registration.settings_changed(&state.settings);
            }
        }
    }

    fn apply_load_balancing_setting(&self, settings: &Settings) {
        let server_id_length = match settings.load_balancing_mode {
            LoadBalancingMode::Disabled => 0,
            // One tag byte plus the server's IPv4 address.
            LoadBalancingMode::ServerIdIp => 5,
        };
        let total_length = server_id_length + CID_PID_LENGTH + CID_PAYLOAD_LENGTH;
        assert!(server_id_length <= MAX_CID_SID_LENGTH);
        assert!(total_length >= MIN_INITIAL_CID_LENGTH);
        assert!(total_length <= MAX_CID_LENGTH);
        self.cid_server_id_length
            .store(server_id_length, Ordering::Release);
        self.cid_total_length.store(total_length, Ordering::Release);
        info!("connection id length = {}", total_length);
    }

    pub(crate) fn set_retry_memory_percent(&'static self, value: u16) {
        let mut state = self.state.lock().unwrap();
        state.settings.retry_memory_limit = value;
        state.settings.is_set.insert(IsSet::RETRY_MEMORY_LIMIT);
        info!("updated retry memory limit = {}", value);
        self.on_settings_changed_locked(&mut state, false);
    }

    /// Changes the load-balancing mode. Rejected once any binding exists;
    /// the `in_use` observation is made under the binding-table lock so it is
    /// linearized against binding creation.
    pub(crate) fn set_load_balancing_mode(
        &'static self,
        mode: LoadBalancingMode,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        {
            let _bindings = self.bindings.lock().unwrap();
            if self.in_use.load(Ordering::Acquire) && state.settings.load_balancing_mode != mode {
                error!("tried to change load balancing mode after library in use");
                return Err(Error::InvalidState);
            }
            state.settings.load_balancing_mode = mode;
            state.settings.is_set.insert(IsSet::LOAD_BALANCING_MODE);
        }
        info!("updated load balancing mode = {:?}", mode);
        self.on_settings_changed_locked(&mut state, false);
        Ok(())
    }

    pub(crate) fn apply_global_settings(&'static self, update: &Settings) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.settings.apply(update) {
            return Err(Error::InvalidParameter);
        }
        info!("applying new settings");
        state.settings.dump();
        self.on_settings_changed_locked(&mut state, true);
        Ok(())
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.state.lock().unwrap().settings.clone()
    }

    pub fn cid_server_id_length(&self) -> u8 {
        self.cid_server_id_length.load(Ordering::Acquire)
    }

    pub fn cid_total_length(&self) -> u8 {
        self.cid_total_length.load(Ordering::Acquire)
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn partitions(&self) -> Option<Arc<Partitions>> {
        self.partitions.read().unwrap().clone()
    }

    pub(crate) fn datapath(&self) -> Option<Arc<Datapath>> {
        self.datapath.read().unwrap().clone()
    }

    pub(crate) fn bindings_lock(&self) -> MutexGuard<'_, Vec<Arc<Binding>>> {
        self.bindings.lock().unwrap()
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    /// Sums the perf counters for external consumption. With no outstanding
    /// reference the buffer is zero-filled.
    pub fn sum_perf_counters(&self, counters: &mut [i64]) {
        let state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            for counter in counters.iter_mut() {
                *counter = 0;
            }
            return;
        }
        match self.partitions.read().unwrap().as_ref() {
            Some(partitions) => partitions.sum_counters(counters),
            None => {
                for counter in counters.iter_mut() {
                    *counter = 0;
                }
            }
        }
    }

    /// Registers an application registration; internal-profile registrations
    /// stay out of the public registry.
    pub(crate) fn register(
        &'static self,
        config: &RegistrationConfig,
    ) -> Result<Arc<Registration>, Error> {
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            return Err(Error::InvalidState);
        }
        let registration = Registration::new(self, config, state.settings.clone());
        if config.execution_profile != ExecutionProfile::Internal {
            state.registrations.push(registration.clone());
        }
        Ok(registration)
    }

    pub(crate) fn deregister(&self, registration: &Arc<Registration>) {
        let mut state = self.state.lock().unwrap();
        state
            .registrations
            .retain(|entry| !Arc::ptr_eq(entry, registration));
    }

    /// Lazily brings up the stateless registration hosting half-open server
    /// connections; called when the first listener starts.
    pub(crate) fn on_listener_registered(&'static self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.stateless_registration.is_none() {
            info!("shared server state initializing");
            let config = RegistrationConfig {
                app_name: "Stateless".to_owned(),
                execution_profile: ExecutionProfile::Internal,
            };
            let settings = state.settings.clone();
            state.stateless_registration = Some(Registration::new(self, &config, settings));
        }
        Ok(())
    }

    /// Folds a receive-side partition index onto the stateless worker set.
    pub fn stateless_worker_index(&self, partition_index: u16) -> Option<u16> {
        let partitions = self.partitions()?;
        Some(partition_index % partitions.partition_count())
    }

    /// The key minting retry tokens right now, rotating epochs as needed.
    pub fn stateless_retry_key(&self) -> Option<Arc<RetryKey>> {
        self.retry_keys
            .lock()
            .unwrap()
            .current(platform::epoch_millis())
    }

    /// The key that protected a token minted at `timestamp_ms`, if it is
    /// still within its window.
    pub fn stateless_retry_key_for_timestamp(&self, timestamp_ms: i64) -> Option<Arc<RetryKey>> {
        self.retry_keys.lock().unwrap().for_timestamp(timestamp_ms)
    }

    /// Charges one handshake against the retry limit.
    pub fn on_handshake_connection_added(&self) {
        self.handshake_memory
            .fetch_add(CONN_HANDSHAKE_MEMORY_USAGE, Ordering::Relaxed);
        self.evaluate_send_retry_state();
    }

    /// Releases one handshake's charge.
    pub fn on_handshake_connection_removed(&self) {
        self.handshake_memory
            .fetch_sub(CONN_HANDSHAKE_MEMORY_USAGE, Ordering::Relaxed);
        self.evaluate_send_retry_state();
    }

    /// Read lock-free by packet handlers deciding whether to force a retry
    /// round-trip on new handshakes.
    pub fn is_send_retry_enabled(&self) -> bool {
        self.send_retry_enabled.load(Ordering::Relaxed)
    }

    pub fn handshake_memory_limit(&self) -> i64 {
        self.handshake_memory_limit.load(Ordering::Acquire)
    }

    fn evaluate_send_retry_state(&self) {
        let enabled = self.handshake_memory.load(Ordering::Relaxed)
            >= self.handshake_memory_limit.load(Ordering::Relaxed);
        if self.send_retry_enabled.swap(enabled, Ordering::Relaxed) != enabled {
            info!("send retry enabled = {}", enabled);
        }
    }

    /// Logs the library's current shape: partitions, registrations, bindings,
    /// and counter totals.
    pub fn trace_rundown(&self) {
        if !self.is_loaded() {
            return;
        }
        let state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            return;
        }
        if let Some(partitions) = self.partitions.read().unwrap().as_ref() {
            info!(
                "rundown: {} partition(s), timer_resolution={}ms, send_retry_enabled={}",
                partitions.partition_count(),
                state.timer_resolution_ms,
                self.is_send_retry_enabled()
            );
        }
        if let Some(stateless) = &state.stateless_registration {
            info!("rundown registration '{}'", stateless.app_name());
        }
        for registration in &state.registrations {
            info!("rundown registration '{}'", registration.app_name());
        }
        {
            let bindings = self.bindings.lock().unwrap();
            for binding in bindings.iter() {
                info!(
                    "rundown binding {} refs={}",
                    binding.local_addr(),
                    binding.ref_count()
                );
            }
        }
        if let Some(partitions) = self.partitions.read().unwrap().as_ref() {
            let mut counters = [0; PerfCounter::COUNT];
            partitions.sum_counters(&mut counters);
            debug!("rundown counters: {:?}", counters);
        }
    }

    /// Swaps in a storage backend and rewires the change callback, for
    /// harnesses exercising the reload path.
    #[cfg(any(test, feature = "internal-testing"))]
    pub fn install_storage(&'static self, storage: Arc<dyn Storage>) {
        storage.set_change_callback(Box::new(move || self.read_settings(true)));
        let mut state = self.state.lock().unwrap();
        state.storage = Some(storage);
        self.read_settings_locked(&mut state, true);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    /// Serializes tests that initialize a library; several process-global
    /// seams (datapath hooks, memory overrides) would otherwise cross-talk.
    pub(crate) fn serial_guard() -> MutexGuard<'static, ()> {
        static GUARD: Mutex<()> = Mutex::new(());
        GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A fresh, loaded library with static lifetime. Leaked deliberately;
    /// tests model the process singleton.
    pub(crate) fn leaked_library() -> &'static Library {
        let library: &'static Library = Box::leak(Box::new(Library::new()));
        library.load();
        library
    }

    #[test]
    fn add_ref_requires_load() {
        let _serial = serial_guard();
        let library: &'static Library = Box::leak(Box::new(Library::new()));
        assert_eq!(library.add_ref(), Err(Error::InvalidState));
        library.load();
        library.add_ref().unwrap();
        library.release();
        library.unload();
    }

    #[test]
    fn balanced_ref_cycle_restores_observable_state() {
        let _serial = serial_guard();
        let library = leaked_library();

        library.add_ref().unwrap();
        assert!(library.partitions().is_some());
        assert!(!library.is_in_use());
        let mut counters = [0; PerfCounter::COUNT];
        library.sum_perf_counters(&mut counters);
        assert_eq!(counters[PerfCounter::ConnActive as usize], 0);

        library.add_ref().unwrap();
        library.release();
        assert!(library.partitions().is_some());

        library.release();
        assert!(library.partitions().is_none());
        library.sum_perf_counters(&mut counters);
        assert!(counters.iter().all(|&c| c == 0));
        library.unload();
    }

    #[test]
    fn partition_count_honors_storage_cap() {
        let storage = MemoryStorage::new();
        storage.write_u32(storage::SETTING_MAX_PARTITION_COUNT, 2);
        let capped = storage
            .read_u32(storage::SETTING_MAX_PARTITION_COUNT)
            .unwrap()
            .min(u32::from(MAX_PARTITION_COUNT));
        assert_eq!(capped, 2);

        // Values past the hard cap clamp down to it.
        storage.write_u32(storage::SETTING_MAX_PARTITION_COUNT, 10_000);
        let clamped = storage
            .read_u32(storage::SETTING_MAX_PARTITION_COUNT)
            .unwrap()
            .min(u32::from(MAX_PARTITION_COUNT));
        assert_eq!(clamped, u32::from(MAX_PARTITION_COUNT));
    }

    #[test]
    fn governor_flips_send_retry_at_the_limit() {
        let _serial = serial_guard();
        let library = leaked_library();
        platform::set_total_memory(Some(1_073_741_824));
        library.add_ref().unwrap();

        library.set_retry_memory_percent(u16::MAX / 2);
        let limit = library.handshake_memory_limit();
        let expected = (i64::from(u16::MAX / 2) * 1_073_741_824) / i64::from(u16::MAX);
        assert_eq!(limit, expected);
        assert!(!library.is_send_retry_enabled());

        let handshakes = limit / CONN_HANDSHAKE_MEMORY_USAGE + 1;
        for _ in 0..handshakes {
            library.on_handshake_connection_added();
        }
        assert!(library.is_send_retry_enabled());

        for _ in 0..handshakes {
            library.on_handshake_connection_removed();
        }
        assert!(!library.is_send_retry_enabled());

        platform::set_total_memory(None);
        library.release();
        library.unload();
    }

    #[test]
    fn load_balancing_mode_locks_once_in_use() {
        let _serial = serial_guard();
        let library = leaked_library();
        library.add_ref().unwrap();

        library
            .set_load_balancing_mode(LoadBalancingMode::ServerIdIp)
            .unwrap();
        assert_eq!(library.cid_server_id_length(), 5);
        assert_eq!(
            library.cid_total_length(),
            5 + CID_PID_LENGTH + CID_PAYLOAD_LENGTH
        );

        let binding = library
            .get_or_create_binding(true, true, Some("127.0.0.1:0".parse().unwrap()), None, None)
            .unwrap();
        assert_eq!(
            library.set_load_balancing_mode(LoadBalancingMode::Disabled),
            Err(Error::InvalidState)
        );
        // Unchanged mode is tolerated even while in use.
        library
            .set_load_balancing_mode(LoadBalancingMode::ServerIdIp)
            .unwrap();
        assert_eq!(library.cid_server_id_length(), 5);

        library.release_binding(&binding);
        library
            .set_load_balancing_mode(LoadBalancingMode::Disabled)
            .unwrap();
        assert_eq!(library.cid_server_id_length(), 0);
        library.release();
        library.unload();
    }

    #[test]
    fn storage_change_reloads_settings_and_notifies_registrations() {
        let _serial = serial_guard();
        let library = leaked_library();
        library.add_ref().unwrap();

        let registration = library
            .register(&RegistrationConfig {
                app_name: "app".to_owned(),
                execution_profile: ExecutionProfile::LowLatency,
            })
            .unwrap();

        let storage = MemoryStorage::new();
        library.install_storage(storage.clone());
        storage.write_u32("InitialRttMs", 222);

        assert_eq!(library.settings().initial_rtt_ms, 222);
        assert_eq!(registration.settings().initial_rtt_ms, 222);

        registration.close();
        library.release();
        library.unload();
    }

    #[test]
    fn datapath_failure_unwinds_initialization() {
        struct FailingHooks;
        impl crate::datapath::DatapathHooks for FailingHooks {
            fn init(&self) -> Result<(), Error> {
                Err(Error::Internal)
            }
            fn create(
                &self,
                _local: Option<std::net::SocketAddr>,
                _remote: Option<std::net::SocketAddr>,
            ) -> Result<(std::net::SocketAddr, Option<std::net::SocketAddr>), Error> {
                Err(Error::Internal)
            }
        }

        let _serial = serial_guard();
        crate::datapath::set_test_hooks(Some(Arc::new(FailingHooks)));
        let library = leaked_library();
        assert_eq!(library.add_ref(), Err(Error::Internal));
        assert!(library.partitions().is_none());

        crate::datapath::set_test_hooks(None);
        library.add_ref().unwrap();
        assert!(library.partitions().is_some());
        library.release();
        library.unload();
    }

    #[test]
    fn stateless_registration_comes_up_once() {
        let _serial = serial_guard();
        let library = leaked_library();
        library.add_ref().unwrap();

        library.on_listener_registered().unwrap();
        library.on_listener_registered().unwrap();
        let partitions = library.partitions().unwrap();
        assert!(library.stateless_worker_index(1000).unwrap() < partitions.partition_count());

        library.trace_rundown();
        library.release();
        library.unload();
    }
}
