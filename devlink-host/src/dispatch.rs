//! Dispatcher boundary: drains discovery events on whichever context owns the devices.
//!
//! `CreateDevice` is finished here: the host instantiates the device, the
//! registry is told, and only then is the info header applied. A creation the
//! registry rejects is abandoned so the peer can retry with a new header.

use devlink_core::{DeviceId, Discovery, DispatchEvent, PeerAddress};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::SharedDiscovery;

/// Application-side device created for a discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub address: PeerAddress,
}

/// What the application layer provides to receive device traffic.
pub trait DeviceHost {
    fn instantiate_device(&mut self, id: DeviceId, address: &PeerAddress) -> DeviceHandle;
    fn apply_info(&mut self, device: DeviceId, info_message: &str);
    fn deliver(&mut self, device: DeviceId, payload: &str);
}

/// Owns the receiving end of the event queue.
pub struct Dispatcher {
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    discovery: SharedDiscovery,
}

impl Dispatcher {
    pub fn new(events: mpsc::UnboundedReceiver<DispatchEvent>, discovery: SharedDiscovery) -> Self {
        Self { events, discovery }
    }

    /// Handle events until every sender is gone.
    pub async fn run<H: DeviceHost>(mut self, mut host: H) {
        while let Some(event) = self.events.recv().await {
            if let Some(created) = route(&mut host, event) {
                let acked = settle(&mut *self.discovery.lock().await, &created);
                if acked {
                    host.apply_info(created.handle.id, &created.info_message);
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Handle every queued event without waiting, from a thread outside the
    /// async runtime (e.g. an application's own frame loop). Returns the count.
    pub fn drain_pending<H: DeviceHost>(&mut self, host: &mut H) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            handled += 1;
            if let Some(created) = route(host, event) {
                let acked = settle(&mut self.discovery.blocking_lock(), &created);
                if acked {
                    host.apply_info(created.handle.id, &created.info_message);
                }
            }
        }
        handled
    }
}

/// A device the host instantiated that discovery has not yet acknowledged.
struct Created {
    requested: DeviceId,
    address: PeerAddress,
    handle: DeviceHandle,
    info_message: String,
}

/// Returns the created device when an acknowledgement is owed.
fn route<H: DeviceHost>(host: &mut H, event: DispatchEvent) -> Option<Created> {
    match event {
        DispatchEvent::CreateDevice {
            id,
            address,
            info_message,
        } => {
            let handle = host.instantiate_device(id, &address);
            Some(Created {
                requested: id,
                address,
                handle,
                info_message,
            })
        }
        DispatchEvent::ApplyInfo {
            device,
            info_message,
            ..
        } => {
            host.apply_info(device, &info_message);
            None
        }
        DispatchEvent::Deliver {
            device, payload, ..
        } => {
            host.deliver(device, &payload);
            None
        }
    }
}

/// Acknowledge `created`, or abandon the request if the registry refuses the
/// handle. Returns true when the device is registered.
fn settle(discovery: &mut Discovery, created: &Created) -> bool {
    let handle = &created.handle;
    match discovery.acknowledge_created(handle.id, &handle.address) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                device = %handle.id,
                address = %handle.address,
                error = %e,
                "device creation not acknowledged"
            );
            discovery.abandon_creation(created.requested, &created.address);
            false
        }
    }
}

/// Default host for the daemon: logs device lifecycle and traffic.
#[derive(Debug, Default)]
pub struct LoggingDeviceHost {
    created: usize,
}

impl DeviceHost for LoggingDeviceHost {
    fn instantiate_device(&mut self, id: DeviceId, address: &PeerAddress) -> DeviceHandle {
        self.created += 1;
        info!(%id, %address, total = self.created, "instantiated device");
        DeviceHandle {
            id,
            address: address.clone(),
        }
    }

    fn apply_info(&mut self, device: DeviceId, info_message: &str) {
        info!(%device, info = info_message, "device info");
    }

    fn deliver(&mut self, device: DeviceId, payload: &str) {
        debug!(%device, payload, "device message");
    }
}
