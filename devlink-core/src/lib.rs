//! Device link core: framing, discovery handshake, device registry.
//! Host-driven: no I/O; host passes framed messages and receives actions.

pub mod discovery;
pub mod envelope;
pub mod frame;
pub mod registry;

pub use discovery::{Action, Discovery, DiscoveryState, DiscoveryStats, DispatchEvent};
pub use envelope::{parse_envelope, Envelope, EnvelopeError, DEVICE_INFO, HEARTBEAT, WHOAREYOU};
pub use frame::{FrameSplitter, Frames, DEFAULT_DELIMITER};
pub use registry::{
    DeviceId, DeviceRecord, DeviceRegistry, PeerAddress, RecordKey, RegistryConflict,
};

/// A complete frame tagged with the peer address it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub address: PeerAddress,
    pub payload: String,
}
