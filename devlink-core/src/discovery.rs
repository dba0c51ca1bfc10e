//! Discovery handshake: host passes each framed message in, gets back at most
//! one action (a control reply on the same connection, or a dispatcher event).

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::envelope::{self, parse_envelope};
use crate::registry::{DeviceId, DeviceRegistry, PeerAddress, RecordKey, RegistryConflict};
use crate::FramedMessage;

/// Where an address is in the discovery handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Never seen, or forgotten after its last connection ended.
    Unknown,
    /// Seen but not registered: a `WHOAREYOU` was sent, or a device creation is in flight.
    PendingInfo,
    /// Handshake complete; all traffic is forwarded.
    Registered,
}

/// Events for the application layer that owns the devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Instantiate a device for `address`, then acknowledge through
    /// [`Discovery::acknowledge_created`].
    CreateDevice {
        id: DeviceId,
        address: PeerAddress,
        info_message: String,
    },
    /// An existing record completed the handshake; apply its info header.
    ApplyInfo {
        device: DeviceId,
        address: PeerAddress,
        info_message: String,
    },
    /// Payload from a registered device, unaltered.
    Deliver {
        device: DeviceId,
        address: PeerAddress,
        payload: String,
    },
}

/// What the host should do with one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this control token back on the connection the message came from.
    Reply(&'static str),
    /// Hand this event to the dispatcher.
    Dispatch(DispatchEvent),
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub messages: u64,
    pub forwarded: u64,
    pub whoareyou_sent: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub created: u64,
}

/// Discovery state machine. Owns the registry, so every lookup → decide →
/// claim sequence runs inside one `&mut self` call. Share it behind one lock.
#[derive(Debug, Default)]
pub struct Discovery {
    registry: DeviceRegistry,
    /// Unregistered addresses with traffic so far. Entries leave on
    /// registration or through [`forget`](Self::forget), so the set tracks
    /// peers mid-handshake rather than every address ever seen.
    seen: HashSet<PeerAddress>,
    stats: DiscoveryStats,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.stats
    }

    pub fn state(&self, address: &PeerAddress) -> DiscoveryState {
        if self.registry.is_registered(address) {
            DiscoveryState::Registered
        } else if self.seen.contains(address) || self.registry.is_pending(address) {
            DiscoveryState::PendingInfo
        } else {
            DiscoveryState::Unknown
        }
    }

    /// Allocate a device id outside the handshake (e.g. for an application-created record).
    pub fn allocate_id(&mut self) -> DeviceId {
        self.registry.allocate_id()
    }

    /// Handle one complete frame that arrived from `address`.
    pub fn on_message(&mut self, address: &PeerAddress, message: &str) -> Option<Action> {
        self.stats.messages += 1;

        if self.registry.is_registered(address) {
            return self.deliver(address, message);
        }
        self.seen.insert(address.clone());

        let envelope = match parse_envelope(message) {
            Ok(e) => e,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(%address, error = %e, "dropping malformed message");
                return None;
            }
        };

        if !envelope.is_device_info() {
            self.stats.whoareyou_sent += 1;
            debug!(%address, kind = envelope.kind, "unregistered sender, requesting info");
            return Some(Action::Reply(envelope::WHOAREYOU));
        }

        info!(%address, "received DEVICE_INFO");
        match self.register(address, message) {
            Ok(event) => event.map(Action::Dispatch),
            Err(e) => {
                self.stats.conflicts += 1;
                warn!(%address, error = %e, "registration rejected");
                None
            }
        }
    }

    /// Same as [`on_message`](Self::on_message) for an already tagged frame.
    pub fn handle(&mut self, message: &FramedMessage) -> Option<Action> {
        self.on_message(&message.address, &message.payload)
    }

    /// Finish a [`DispatchEvent::CreateDevice`] once the application has
    /// instantiated the device. Until then the address stays unregistered
    /// and repeated `DEVICE_INFO` from it is discarded.
    pub fn acknowledge_created(
        &mut self,
        id: DeviceId,
        address: &PeerAddress,
    ) -> Result<(), RegistryConflict> {
        self.registry.finish_creation(id, address)?;
        self.seen.remove(address);
        self.stats.created += 1;
        info!(%address, %id, "added device");
        Ok(())
    }

    /// Release a [`DispatchEvent::CreateDevice`] that could not be
    /// acknowledged. The next `DEVICE_INFO` from `address` starts over.
    pub fn abandon_creation(&mut self, id: DeviceId, address: &PeerAddress) -> bool {
        let abandoned = self.registry.abandon_creation(id, address);
        if abandoned {
            warn!(%address, %id, "device creation abandoned, awaiting new DEVICE_INFO");
        }
        abandoned
    }

    /// Drop handshake progress for an unregistered `address` whose last
    /// connection ended. Registered records and in-flight creations are kept.
    pub fn forget(&mut self, address: &PeerAddress) {
        self.seen.remove(address);
    }

    fn deliver(&mut self, address: &PeerAddress, message: &str) -> Option<Action> {
        let device = self.registry.lookup_by_address(address)?.id()?;
        self.stats.forwarded += 1;
        Some(Action::Dispatch(DispatchEvent::Deliver {
            device,
            address: address.clone(),
            payload: message.to_owned(),
        }))
    }

    fn register(
        &mut self,
        address: &PeerAddress,
        message: &str,
    ) -> Result<Option<DispatchEvent>, RegistryConflict> {
        if self.registry.is_pending(address) {
            self.stats.duplicates += 1;
            debug!(%address, "device creation already in flight, ignoring DEVICE_INFO");
            return Ok(None);
        }

        // Declared with this address: register it, assigning an id if needed.
        if let Some(key) = self.registry.key_by_address(address) {
            if self.registry.get(key).and_then(|r| r.id()).is_none() {
                let id = self.registry.allocate_id();
                self.registry.claim(key, Some(id), None)?;
            }
            return self.complete(key, address, message);
        }

        // Declared with an id only: give it this address.
        if let Some(key) = self.registry.find_unaddressed_with_id() {
            self.registry.claim(key, None, Some(address.clone()))?;
            return self.complete(key, address, message);
        }

        // Declared with neither: give it both.
        if let Some(key) = self.registry.find_blank() {
            let id = self.registry.allocate_id();
            self.registry.claim(key, Some(id), Some(address.clone()))?;
            return self.complete(key, address, message);
        }

        match self.registry.begin_creation(address) {
            Some(id) => {
                info!(%address, %id, "requesting new device");
                Ok(Some(DispatchEvent::CreateDevice {
                    id,
                    address: address.clone(),
                    info_message: message.to_owned(),
                }))
            }
            None => {
                self.stats.duplicates += 1;
                Ok(None)
            }
        }
    }

    fn complete(
        &mut self,
        key: RecordKey,
        address: &PeerAddress,
        message: &str,
    ) -> Result<Option<DispatchEvent>, RegistryConflict> {
        self.registry.mark_registered(address)?;
        self.seen.remove(address);
        let device = self
            .registry
            .get(key)
            .and_then(|r| r.id())
            .ok_or(RegistryConflict::UnknownRecord(key))?;
        info!(%address, %device, "added device");
        Ok(Some(DispatchEvent::ApplyInfo {
            device,
            address: address.clone(),
            info_message: message.to_owned(),
        }))
    }
}
