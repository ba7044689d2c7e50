//! Ordered event delivery
//!
//! Each `Listener` owns one unbounded FIFO channel and one dedicated worker thread.
//! Producers on any thread enqueue events carrying strong references to their
//! subjects; the worker delivers them one at a time, in queue order, to the
//! application's `ListenerCallbacks`.
//!
//! Lifecycle: new -> start -> stop. Events signalled before `start` are buffered.
//! `stop` closes the channel, lets the worker drain what is queued and joins it.
//! A stopped listener cannot be restarted and rejects further events.

pub mod event;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::entity::EntityId;
use crate::error::{Error, Result};
use crate::manager::WalletManager;
use crate::network::Network;
use crate::wallet::transfer::Transfer;
use crate::wallet::Wallet;

pub use event::{
    EventPayload, FeeEstimateResult, ListenerEvent, ManagerEvent, NetworkEvent, TransferEvent,
    WalletEvent,
};

/// Application callbacks, one per subject kind
///
/// All methods run on the listener's worker thread. `handle_event` sees the whole
/// envelope (sequence stamp included) and by default routes to the per-kind method.
pub trait ListenerCallbacks: Send + Sync {
    fn handle_event(&self, event: &ListenerEvent) {
        dispatch(self, event);
    }

    fn handle_network_event(&self, _network: &Arc<Network>, _event: &NetworkEvent) {}

    fn handle_manager_event(&self, _manager: &Arc<WalletManager>, _event: &ManagerEvent) {}

    fn handle_wallet_event(
        &self,
        _manager: &Arc<WalletManager>,
        _wallet: &Arc<Wallet>,
        _event: &WalletEvent,
    ) {
    }

    fn handle_transfer_event(
        &self,
        _manager: &Arc<WalletManager>,
        _wallet: &Arc<Wallet>,
        _transfer: &Arc<Transfer>,
        _event: &TransferEvent,
    ) {
    }
}

/// Invoke the callback registered for the event's subject kind
pub fn dispatch<C: ListenerCallbacks + ?Sized>(callbacks: &C, event: &ListenerEvent) {
    match &event.payload {
        EventPayload::Network { network, event } => callbacks.handle_network_event(network, event),
        EventPayload::Manager { manager, event } => callbacks.handle_manager_event(manager, event),
        EventPayload::Wallet {
            manager,
            wallet,
            event,
        } => callbacks.handle_wallet_event(manager, wallet, event),
        EventPayload::Transfer {
            manager,
            wallet,
            transfer,
            event,
        } => callbacks.handle_transfer_event(manager, wallet, transfer, event),
    }
}

enum Worker {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

pub struct Listener {
    id: EntityId,
    name: String,
    thread_name: String,
    callbacks: Arc<dyn ListenerCallbacks>,
    /// Next sequence stamp; held across the send so stamp order is queue order
    enqueue: Mutex<u64>,
    sender: Sender<ListenerEvent>,
    receiver: Receiver<ListenerEvent>,
    worker: Mutex<Worker>,
}

impl Listener {
    pub fn new(name: impl Into<String>, callbacks: Arc<dyn ListenerCallbacks>) -> Arc<Self> {
        let name = name.into();
        let thread_name = format!("wkcore-listener-{}", name);
        Self::with_thread_name(name, thread_name, callbacks)
    }

    pub fn with_thread_name(
        name: impl Into<String>,
        thread_name: impl Into<String>,
        callbacks: Arc<dyn ListenerCallbacks>,
    ) -> Arc<Self> {
        let (sender, receiver) = async_channel::unbounded();
        Arc::new(Self {
            id: EntityId::new(),
            name: name.into(),
            thread_name: thread_name.into(),
            callbacks,
            enqueue: Mutex::new(0),
            sender,
            receiver,
            worker: Mutex::new(Worker::Idle),
        })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Events waiting for delivery
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_worker(), Worker::Running(_))
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the worker thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        match *worker {
            Worker::Running(_) => return Err(Error::ListenerAlreadyStarted(self.name.clone())),
            Worker::Stopped => return Err(Error::ListenerStopped(self.name.clone())),
            Worker::Idle => {}
        }

        let receiver = self.receiver.clone();
        let callbacks = self.callbacks.clone();
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                debug!(listener = %name, "Listener worker started");
                while let Ok(event) = receiver.recv_blocking() {
                    deliver(&name, callbacks.as_ref(), event);
                }
                debug!(listener = %name, "Listener worker drained");
            })
            .map_err(|e| Error::Io(format!("spawn listener worker: {}", e)))?;

        *worker = Worker::Running(handle);
        info!(listener = %self.name, "Listener started");
        Ok(())
    }

    /// Close the queue, deliver what is left and halt the worker
    ///
    /// Idempotent. A listener stopped before it was started delivers its buffered
    /// events on the calling thread.
    pub fn stop(&self) {
        {
            let _guard = self.enqueue.lock().unwrap_or_else(|e| e.into_inner());
            self.sender.close();
        }

        let previous = std::mem::replace(&mut *self.lock_worker(), Worker::Stopped);
        match previous {
            Worker::Running(handle) => {
                if handle.thread().id() == thread::current().id() {
                    // Released from inside a callback; the worker exits once drained
                    debug!(listener = %self.name, "Listener stopped from its own worker");
                } else if handle.join().is_err() {
                    error!(listener = %self.name, "Listener worker terminated abnormally");
                }
            }
            Worker::Idle => {
                while let Ok(event) = self.receiver.try_recv() {
                    deliver(&self.name, self.callbacks.as_ref(), event);
                }
            }
            Worker::Stopped => return,
        }
        info!(listener = %self.name, "Listener stopped");
    }

    fn signal(&self, payload: EventPayload) -> Result<u64> {
        let mut next = self.enqueue.lock().unwrap_or_else(|e| e.into_inner());
        let sequence = *next;
        let event = ListenerEvent {
            sequence,
            signalled_at: Utc::now(),
            payload,
        };
        // Unbounded: the only failure is a closed channel. The rejected event is
        // dropped here, releasing its references.
        if self.sender.try_send(event).is_err() {
            warn!(listener = %self.name, "Event signalled after listener stop");
            return Err(Error::ListenerStopped(self.name.clone()));
        }
        *next += 1;
        Ok(sequence)
    }

    pub fn signal_network_event(&self, network: Arc<Network>, event: NetworkEvent) -> Result<u64> {
        self.signal(EventPayload::Network { network, event })
    }

    pub fn signal_manager_event(
        &self,
        manager: Arc<WalletManager>,
        event: ManagerEvent,
    ) -> Result<u64> {
        self.signal(EventPayload::Manager { manager, event })
    }

    pub fn signal_wallet_event(
        &self,
        manager: Arc<WalletManager>,
        wallet: Arc<Wallet>,
        event: WalletEvent,
    ) -> Result<u64> {
        self.signal(EventPayload::Wallet {
            manager,
            wallet,
            event,
        })
    }

    pub fn signal_transfer_event(
        &self,
        manager: Arc<WalletManager>,
        wallet: Arc<Wallet>,
        transfer: Arc<Transfer>,
        event: TransferEvent,
    ) -> Result<u64> {
        self.signal(EventPayload::Transfer {
            manager,
            wallet,
            transfer,
            event,
        })
    }
}

/// Run the callback for one event, then release the event's references
fn deliver(name: &str, callbacks: &dyn ListenerCallbacks, event: ListenerEvent) {
    let sequence = event.sequence;
    let kind = event.payload.kind();
    if panic::catch_unwind(AssertUnwindSafe(|| callbacks.handle_event(&event))).is_err() {
        error!(listener = %name, sequence, %kind, "Listener callback panicked");
    }
    // For a deleted subject this may be the last reference
    drop(event);
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, RecordingCallbacks};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_events_delivered_in_order() {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new("order", recorder.clone());
        let network = test_support::btc_testnet(None);

        listener.start().unwrap();
        for _ in 0..10 {
            listener
                .signal_network_event(network.clone(), NetworkEvent::FeesUpdated)
                .unwrap();
        }
        listener.stop();

        assert_eq!(recorder.sequences(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_producers_keep_stamp_order() {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new("producers", recorder.clone());
        let network = test_support::btc_testnet(None);
        listener.start().unwrap();

        let producers: Vec<_> = (0..8)
            .map(|_| {
                let listener = listener.clone();
                let network = network.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        listener
                            .signal_network_event(network.clone(), NetworkEvent::FeesUpdated)
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        listener.stop();

        let sequences = recorder.sequences();
        assert_eq!(sequences.len(), 2000);
        assert!(sequences.windows(2).all(|w| w[0] + 1 == w[1]));
        // Every carried reference has been released
        assert_eq!(Arc::strong_count(&network), 1);
    }

    #[test]
    fn test_events_before_start_are_buffered() {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new("buffered", recorder.clone());
        let network = test_support::btc_testnet(None);

        listener
            .signal_network_event(network.clone(), NetworkEvent::CurrenciesUpdated)
            .unwrap();
        assert_eq!(listener.pending(), 1);
        assert!(recorder.sequences().is_empty());

        listener.start().unwrap();
        listener.stop();
        assert_eq!(recorder.sequences(), vec![0]);
    }

    #[test]
    fn test_stop_before_start_drains_on_caller() {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new("never-started", recorder.clone());
        let network = test_support::btc_testnet(None);

        listener
            .signal_network_event(network, NetworkEvent::FeesUpdated)
            .unwrap();
        listener.stop();
        assert_eq!(recorder.sequences(), vec![0]);
    }

    #[test]
    fn test_no_restart_and_no_signal_after_stop() {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new("stopped", recorder.clone());
        let network = test_support::btc_testnet(None);

        listener.start().unwrap();
        assert!(matches!(
            listener.start(),
            Err(Error::ListenerAlreadyStarted(_))
        ));
        listener.stop();
        listener.stop();

        assert!(matches!(listener.start(), Err(Error::ListenerStopped(_))));
        let result = listener.signal_network_event(network.clone(), NetworkEvent::FeesUpdated);
        assert!(matches!(result, Err(Error::ListenerStopped(_))));
        assert_eq!(Arc::strong_count(&network), 1);
    }

    struct Panicky {
        delivered: AtomicUsize,
    }

    impl ListenerCallbacks for Panicky {
        fn handle_network_event(&self, _network: &Arc<Network>, event: &NetworkEvent) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if *event == NetworkEvent::FeesUpdated {
                panic!("callback failure");
            }
        }
    }

    #[test]
    fn test_callback_panic_does_not_stop_delivery() {
        let callbacks = Arc::new(Panicky {
            delivered: AtomicUsize::new(0),
        });
        let listener = Listener::new("panicky", callbacks.clone());
        let network = test_support::btc_testnet(None);

        listener.start().unwrap();
        listener
            .signal_network_event(network.clone(), NetworkEvent::FeesUpdated)
            .unwrap();
        listener
            .signal_network_event(network.clone(), NetworkEvent::CurrenciesUpdated)
            .unwrap();
        listener.stop();

        assert_eq!(callbacks.delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deleted_event_releases_last_reference() {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new("deleted", recorder.clone());
        let network = test_support::btc_testnet(Some(listener.clone()));
        let weak = Arc::downgrade(&network);

        network.release();
        listener.start().unwrap();
        listener.stop();

        assert!(weak.upgrade().is_none());
        let kinds = recorder.network_events();
        assert_eq!(kinds, vec![NetworkEvent::Created, NetworkEvent::Deleted]);
    }
}
