//! Discovery engine implementation
//!
//! A run consists of three tasks:
//! - the receive loop, which parses beacons and feeds the registry
//! - the sweep loop, which evicts silent devices on a fixed period
//! - the dispatcher, which fans events out to subscribers
//!
//! Events are queued inside the same registry critical section that produced
//! them, so the queue order matches the order of registry mutations. Delivery
//! to subscribers happens later, in the dispatcher, with no lock held.

use crate::beacon::parse_beacon;
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::registry::PresenceRegistry;
use crate::transport::{BeaconTransport, MulticastSocket};
use crate::types::{DeviceSnapshot, DiscoveryEvent, EngineState, FaultCause, RunHandle};
use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Maximum number of events buffered per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Receiving end of a subscription
pub type EventReceiver = Receiver<DiscoveryEvent>;

/// State shared between the service and its background tasks
struct Shared {
    state: RwLock<EngineState>,
    registry: Mutex<PresenceRegistry>,
    subscribers: Mutex<Vec<Sender<DiscoveryEvent>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::Idle),
            registry: Mutex::new(PresenceRegistry::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write() = state;
    }

    /// Feeds one parsed beacon to the registry. Returns false once the run is cancelled.
    fn record_beacon(
        &self,
        datagram: &[u8],
        cancel: &CancellationToken,
        events: &UnboundedSender<DiscoveryEvent>,
    ) -> bool {
        let Some(identity) = parse_beacon(datagram) else {
            trace!(len = datagram.len(), "Dropping datagram that is not a device beacon");
            return true;
        };

        let mut registry = self.registry.lock();
        if cancel.is_cancelled() {
            return false;
        }

        if let Some(event) = registry.observe(identity, Instant::now()).into_event() {
            if let Some(identity) = event.identity() {
                debug!(
                    name = %identity.name,
                    network_address = %identity.network_address,
                    hardware_address = %identity.hardware_address,
                    "{}",
                    event.description()
                );
            }
            let _ = events.send(event);
        }

        true
    }

    /// Evicts silent devices. Returns false once the run is cancelled.
    fn sweep(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        events: &UnboundedSender<DiscoveryEvent>,
    ) -> bool {
        let mut registry = self.registry.lock();
        if cancel.is_cancelled() {
            return false;
        }

        for identity in registry.sweep(Instant::now(), timeout) {
            debug!(
                name = %identity.name,
                hardware_address = %identity.hardware_address,
                "Device went silent, removing"
            );
            let _ = events.send(DiscoveryEvent::Removed(identity));
        }

        true
    }

    /// Ends the run after a receive failure and queues the single fault event
    fn fail(
        &self,
        error: &io::Error,
        cancel: &CancellationToken,
        events: &UnboundedSender<DiscoveryEvent>,
    ) {
        let mut registry = self.registry.lock();
        if cancel.is_cancelled() {
            // A stop was already requested; the failure is just the socket going away
            debug!(error = %error, "Receive failed during shutdown");
            return;
        }

        warn!(error = %error, "Beacon receive failed, stopping discovery");

        cancel.cancel();
        registry.clear();
        self.set_state(EngineState::Idle);
        let _ = events.send(DiscoveryEvent::Fault(FaultCause::from(error)));
    }
}

/// Background tasks of one run
struct ActiveRun {
    handle: RunHandle,
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Passive device discovery over multicast beacons
pub struct DiscoveryService {
    /// Configuration
    config: DiscoveryConfig,

    /// Registry, subscribers and state, shared with the run's tasks
    shared: Arc<Shared>,

    /// Current run; the async lock serializes start and stop
    run: tokio::sync::Mutex<Option<ActiveRun>>,

    /// Source of run ids
    next_run_id: AtomicU64,
}

impl DiscoveryService {
    /// Creates a new discovery service
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        config.validate().map_err(DiscoveryError::InvalidConfig)?;

        info!(
            port = config.port,
            group = %config.multicast_group,
            liveness_timeout_secs = config.liveness_timeout_secs,
            sweep_interval_secs = config.sweep_interval_secs,
            "Discovery service created"
        );

        Ok(Self {
            config,
            shared: Arc::new(Shared::new()),
            run: tokio::sync::Mutex::new(None),
            next_run_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    /// Returns whether the service is running
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Registers a new subscriber.
    ///
    /// Subscribing before `start` guarantees every event of the run is seen,
    /// as long as the receiver keeps up: once it holds
    /// `EVENT_CHANNEL_CAPACITY` unread events, further events are dropped for
    /// that subscriber only. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Devices currently present
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.shared.registry.lock().snapshot(Instant::now())
    }

    /// A present device by hardware address (case-insensitive)
    pub fn device(&self, hardware_address: &str) -> Option<DeviceSnapshot> {
        let registry = self.shared.registry.lock();
        let entry = registry.get(hardware_address)?;
        Some(DeviceSnapshot {
            identity: entry.identity().clone(),
            silent_for: entry.silent_for(Instant::now()),
            beacon_count: entry.beacon_count(),
        })
    }

    /// Binds the multicast socket and starts listening.
    ///
    /// Returns the existing handle if a run is already active. Bind or join
    /// failures are returned here and leave the service idle.
    pub async fn start(&self) -> Result<RunHandle> {
        self.start_with(|config| {
            let socket = MulticastSocket::bind(config)?;
            Ok(Arc::new(socket) as Arc<dyn BeaconTransport>)
        })
        .await
    }

    /// Starts listening on a caller-supplied transport.
    ///
    /// If a run is already active the transport is dropped and the existing
    /// handle returned.
    pub async fn start_with_transport(
        &self,
        transport: Arc<dyn BeaconTransport>,
    ) -> Result<RunHandle> {
        self.start_with(move |_| Ok(transport)).await
    }

    async fn start_with<F>(&self, open: F) -> Result<RunHandle>
    where
        F: FnOnce(&DiscoveryConfig) -> Result<Arc<dyn BeaconTransport>>,
    {
        let mut run = self.run.lock().await;

        if let Some(active) = run.as_ref() {
            if !active.cancel.is_cancelled() {
                debug!(run_id = active.handle.run_id(), "Discovery already running");
                return Ok(active.handle.clone());
            }
        }

        // A faulted run has cancelled itself but its tasks still need reaping
        if let Some(finished) = run.take() {
            self.shutdown_run(finished).await;
        }

        self.shared.set_state(EngineState::Starting);

        let transport = match open(&self.config) {
            Ok(transport) => transport,
            Err(e) => {
                self.shared.set_state(EngineState::Idle);
                warn!(error = %e, "Failed to start discovery");
                return Err(e);
            }
        };

        let active = self.launch(transport);
        let handle = active.handle.clone();
        *run = Some(active);

        info!(
            run_id = handle.run_id(),
            local_addr = ?handle.local_addr(),
            "Discovery started"
        );
        Ok(handle)
    }

    fn launch(&self, transport: Arc<dyn BeaconTransport>) -> ActiveRun {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = RunHandle::new(run_id, transport.local_addr().ok(), cancel.clone());

        self.shared.registry.lock().clear();
        // Running before the tasks exist, so a fault in the first receive can't be overwritten
        self.shared.set_state(EngineState::Running);

        let dispatcher = tokio::spawn(dispatch_loop(self.shared.clone(), event_rx));

        let sweeper = tokio::spawn(sweep_loop(
            self.shared.clone(),
            self.config.sweep_interval(),
            self.config.liveness_timeout(),
            cancel.clone(),
            event_tx.clone(),
        ));

        let receiver = tokio::spawn(receive_loop(
            self.shared.clone(),
            transport,
            self.config.recv_buffer_size,
            cancel.clone(),
            event_tx,
        ));

        ActiveRun {
            handle,
            cancel,
            receiver,
            sweeper,
            dispatcher,
        }
    }

    /// Stops the current run and waits until it is fully quiesced.
    ///
    /// No events are emitted after this returns. A no-op when idle.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;

        let Some(active) = run.take() else {
            return;
        };

        info!(run_id = active.handle.run_id(), "Stopping discovery");
        self.shared.set_state(EngineState::Stopping);

        self.shutdown_run(active).await;

        self.shared.registry.lock().clear();
        self.shared.set_state(EngineState::Idle);

        info!("Discovery stopped");
    }

    async fn shutdown_run(&self, run: ActiveRun) {
        run.cancel.cancel();

        // One grace period for the whole run, not per task
        let deadline = Instant::now() + self.config.shutdown_grace();
        join_within(run.receiver, deadline, "receiver").await;
        join_within(run.sweeper, deadline, "sweeper").await;
        // Producers are gone, so the dispatcher drains what they queued and exits
        join_within(run.dispatcher, deadline, "dispatcher").await;
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(active) = self.run.get_mut().take() {
            if active.handle.is_active() {
                warn!("Discovery service dropped while still running");
            }
            active.cancel.cancel();
            active.receiver.abort();
            active.sweeper.abort();
            active.dispatcher.abort();
        }
    }
}

/// Waits for a task, aborting it if it is still running at `deadline`
async fn join_within(mut task: JoinHandle<()>, deadline: Instant, name: &str) {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = name, error = %e, "Discovery task ended abnormally"),
        Err(_) => {
            warn!(task = name, "Discovery task did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn BeaconTransport>,
    buffer_size: usize,
    cancel: CancellationToken,
    events: UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = transport.recv_beacon(&mut buf) => result,
        };

        match received {
            Ok((len, source)) => {
                trace!(%source, len, "Datagram received");
                if !shared.record_beacon(&buf[..len], &cancel, &events) {
                    break;
                }
            }
            Err(e) => {
                shared.fail(&e, &cancel, &events);
                break;
            }
        }
    }

    debug!("Receive loop stopped");
}

async fn sweep_loop(
    shared: Arc<Shared>,
    period: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    events: UnboundedSender<DiscoveryEvent>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !shared.sweep(timeout, &cancel, &events) {
            break;
        }
    }

    debug!("Sweep loop stopped");
}

/// Fans queued events out to subscribers.
///
/// Delivery never waits on a subscriber, so the only await point is the
/// queue itself and the queue is drained as fast as the producers fill it.
/// A subscriber with a full channel loses the event; the others are unaffected.
async fn dispatch_loop(shared: Arc<Shared>, mut queue: UnboundedReceiver<DiscoveryEvent>) {
    while let Some(event) = queue.recv().await {
        let subscribers = shared.subscribers.lock().clone();
        let mut closed = false;

        for subscriber in &subscribers {
            match subscriber.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        capacity = EVENT_CHANNEL_CAPACITY,
                        event = dropped.description(),
                        "Subscriber is not keeping up, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed = true,
            }
        }

        if closed {
            shared.subscribers.lock().retain(|s| !s.is_closed());
        }
    }

    debug!("Event dispatcher stopped");
}
