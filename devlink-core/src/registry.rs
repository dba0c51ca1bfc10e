//! Device registry: the single owner of device records and their address/id indices.
//!
//! Every mutation goes through a validated entry point, so a record's id and
//! address are never visible in one index and missing from the other.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Stable identifier of a transport endpoint (e.g. a hardware address string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        PeerAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        PeerAddress(s)
    }
}

/// Numeric device identity, unique among assigned ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle to a record inside one [`DeviceRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey(usize);

/// One logical remote device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    id: Option<DeviceId>,
    address: Option<PeerAddress>,
    name: Option<String>,
    registered: bool,
}

impl DeviceRecord {
    /// Pre-declared record. An empty address is treated as no address.
    pub fn declared(id: Option<DeviceId>, address: Option<PeerAddress>) -> Self {
        Self {
            id,
            address: address.filter(|a| !a.is_empty()),
            name: None,
            registered: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> Option<DeviceId> {
        self.id
    }

    pub fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True once the discovery handshake completed for this record.
    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

/// A registry operation that would break id/address uniqueness, or refers to
/// something the registry does not hold. The registry is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryConflict {
    #[error("device id {0} already belongs to another record")]
    IdTaken(DeviceId),
    #[error("address {0} already belongs to another record")]
    AddressTaken(PeerAddress),
    #[error("record already holds id {current}, refusing {requested}")]
    IdAlreadyAssigned { current: DeviceId, requested: DeviceId },
    #[error("record already holds address {current}, refusing {requested}")]
    AddressAlreadyAssigned {
        current: PeerAddress,
        requested: PeerAddress,
    },
    #[error("no record holds address {0}")]
    UnknownAddress(PeerAddress),
    #[error("unknown record {0:?}")]
    UnknownRecord(RecordKey),
    #[error("no device creation in flight for {address} with id {id}")]
    NotPending { id: DeviceId, address: PeerAddress },
}

/// Records plus the by-address, by-id and registered-address indices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: Vec<DeviceRecord>,
    by_address: HashMap<PeerAddress, RecordKey>,
    by_id: HashMap<DeviceId, RecordKey>,
    registered: HashSet<PeerAddress>,
    /// Device creations handed to the dispatcher and not yet acknowledged.
    pending: HashMap<PeerAddress, DeviceId>,
    next_id: u32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from pre-declared records. A record repeating an
    /// earlier record's address or id has that field cleared.
    pub fn from_declared(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let mut registry = Self::new();
        for mut record in records {
            if let Some(address) = &record.address {
                if registry.by_address.contains_key(address) {
                    warn!(%address, "duplicate declared device address, clearing it");
                    record.address = None;
                }
            }
            if let Some(id) = record.id {
                if registry.by_id.contains_key(&id) {
                    warn!(%id, "duplicate declared device id, clearing it");
                    record.id = None;
                }
            }
            record.registered = false;
            if let Err(e) = registry.insert(record) {
                warn!(error = %e, "skipping declared device");
            }
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: RecordKey) -> Option<&DeviceRecord> {
        self.records.get(key.0)
    }

    pub fn key_by_address(&self, address: &PeerAddress) -> Option<RecordKey> {
        self.by_address.get(address).copied()
    }

    pub fn key_by_id(&self, id: DeviceId) -> Option<RecordKey> {
        self.by_id.get(&id).copied()
    }

    pub fn lookup_by_address(&self, address: &PeerAddress) -> Option<&DeviceRecord> {
        self.key_by_address(address).and_then(|k| self.get(k))
    }

    pub fn lookup_by_id(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.key_by_id(id).and_then(|k| self.get(k))
    }

    pub fn is_registered(&self, address: &PeerAddress) -> bool {
        self.registered.contains(address)
    }

    /// True while a device creation for `address` awaits acknowledgement.
    pub fn is_pending(&self, address: &PeerAddress) -> bool {
        self.pending.contains_key(address)
    }

    /// All records, in insertion order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    /// Smallest unassigned id at or above the cursor. The cursor only moves
    /// forward, so an id is handed out at most once per registry.
    pub fn allocate_id(&mut self) -> DeviceId {
        while self.by_id.contains_key(&DeviceId(self.next_id)) {
            self.next_id += 1;
        }
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Add a record. Fails without change if its id or address is already held.
    pub fn insert(&mut self, mut record: DeviceRecord) -> Result<RecordKey, RegistryConflict> {
        record.address = record.address.filter(|a| !a.is_empty());
        if let Some(id) = record.id {
            if self.by_id.contains_key(&id) {
                return Err(RegistryConflict::IdTaken(id));
            }
        }
        if let Some(address) = &record.address {
            if self.by_address.contains_key(address) || self.pending.contains_key(address) {
                return Err(RegistryConflict::AddressTaken(address.clone()));
            }
        }

        let key = RecordKey(self.records.len());
        if let Some(id) = record.id {
            self.by_id.insert(id, key);
        }
        if let Some(address) = &record.address {
            self.by_address.insert(address.clone(), key);
            if record.registered {
                self.registered.insert(address.clone());
            }
        }
        self.records.push(record);
        Ok(key)
    }

    /// Assign `id` and/or `address` to a record. Either both assignments
    /// happen or neither does.
    pub fn claim(
        &mut self,
        key: RecordKey,
        id: Option<DeviceId>,
        address: Option<PeerAddress>,
    ) -> Result<(), RegistryConflict> {
        let address = address.filter(|a| !a.is_empty());
        let record = self
            .records
            .get(key.0)
            .ok_or(RegistryConflict::UnknownRecord(key))?;

        if let Some(id) = id {
            match self.by_id.get(&id) {
                Some(owner) if *owner != key => return Err(RegistryConflict::IdTaken(id)),
                _ => {}
            }
            match record.id {
                Some(current) if current != id => {
                    return Err(RegistryConflict::IdAlreadyAssigned {
                        current,
                        requested: id,
                    })
                }
                _ => {}
            }
        }
        if let Some(address) = &address {
            match self.by_address.get(address) {
                Some(owner) if *owner != key => {
                    return Err(RegistryConflict::AddressTaken(address.clone()))
                }
                _ => {}
            }
            if self.pending.contains_key(address) {
                return Err(RegistryConflict::AddressTaken(address.clone()));
            }
            match &record.address {
                Some(current) if current != address => {
                    return Err(RegistryConflict::AddressAlreadyAssigned {
                        current: current.clone(),
                        requested: address.clone(),
                    })
                }
                _ => {}
            }
        }

        let record = &mut self.records[key.0];
        if let Some(id) = id {
            record.id = Some(id);
            self.by_id.insert(id, key);
        }
        if let Some(address) = address {
            record.address = Some(address.clone());
            self.by_address.insert(address, key);
        }
        Ok(())
    }

    /// Add `address` to the registered set. Returns false if it already was.
    pub fn mark_registered(&mut self, address: &PeerAddress) -> Result<bool, RegistryConflict> {
        let key = self
            .key_by_address(address)
            .ok_or_else(|| RegistryConflict::UnknownAddress(address.clone()))?;
        self.records[key.0].registered = true;
        Ok(self.registered.insert(address.clone()))
    }

    /// Reserve a fresh id for a device the dispatcher will create for
    /// `address`. Returns `None` if the address is already held or in flight.
    pub fn begin_creation(&mut self, address: &PeerAddress) -> Option<DeviceId> {
        if self.pending.contains_key(address) || self.by_address.contains_key(address) {
            return None;
        }
        let id = self.allocate_id();
        self.pending.insert(address.clone(), id);
        debug!(%address, %id, "device creation in flight");
        Some(id)
    }

    /// Finish a creation started by [`begin_creation`](Self::begin_creation):
    /// insert the record with its id and address and mark it registered.
    pub fn finish_creation(
        &mut self,
        id: DeviceId,
        address: &PeerAddress,
    ) -> Result<RecordKey, RegistryConflict> {
        if self.pending.get(address) != Some(&id) {
            return Err(RegistryConflict::NotPending {
                id,
                address: address.clone(),
            });
        }
        self.pending.remove(address);
        let record = DeviceRecord {
            id: Some(id),
            address: Some(address.clone()),
            name: None,
            registered: true,
        };
        self.insert(record)
    }

    /// Drop the in-flight creation of `id` for `address`, freeing the address
    /// for a new attempt. Returns false if no such creation is pending.
    pub fn abandon_creation(&mut self, id: DeviceId, address: &PeerAddress) -> bool {
        if self.pending.get(address) != Some(&id) {
            return false;
        }
        self.pending.remove(address);
        debug!(%address, %id, "device creation abandoned");
        true
    }

    /// First record with an id and no address, not yet registered.
    pub fn find_unaddressed_with_id(&self) -> Option<RecordKey> {
        self.records
            .iter()
            .position(|r| r.id.is_some() && r.address.is_none() && !r.registered)
            .map(RecordKey)
    }

    /// First record with neither id nor address.
    pub fn find_blank(&self) -> Option<RecordKey> {
        self.records
            .iter()
            .position(|r| r.id.is_none() && r.address.is_none() && !r.registered)
            .map(RecordKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn allocate_skips_declared_ids() {
        let mut reg = DeviceRegistry::from_declared([
            DeviceRecord::declared(Some(DeviceId(0)), None),
            DeviceRecord::declared(Some(DeviceId(2)), None),
        ]);
        assert_eq!(reg.allocate_id(), DeviceId(1));
        assert_eq!(reg.allocate_id(), DeviceId(3));
        assert_eq!(reg.allocate_id(), DeviceId(4));
    }

    #[test]
    fn allocate_never_reuses_unassigned_ids() {
        let mut reg = DeviceRegistry::new();
        let a = reg.allocate_id();
        let b = reg.allocate_id();
        assert_ne!(a, b);
        // Neither was assigned to a record; still not handed out again.
        assert_eq!(reg.allocate_id(), DeviceId(2));
    }

    #[test]
    fn declared_duplicates_are_cleared() {
        let reg = DeviceRegistry::from_declared([
            DeviceRecord::declared(Some(DeviceId(1)), Some(addr("AA"))),
            DeviceRecord::declared(Some(DeviceId(1)), Some(addr("AA"))).with_name("copy"),
            DeviceRecord::declared(None, Some(addr(""))),
        ]);
        assert_eq!(reg.len(), 3);
        let copy = reg.devices().nth(1).unwrap();
        assert_eq!(copy.id(), None);
        assert_eq!(copy.address(), None);
        assert_eq!(copy.name(), Some("copy"));
        assert_eq!(reg.devices().nth(2).unwrap().address(), None);
        assert_eq!(reg.lookup_by_id(DeviceId(1)).unwrap().name(), None);
    }

    #[test]
    fn claim_is_all_or_nothing() {
        let mut reg = DeviceRegistry::from_declared([
            DeviceRecord::declared(Some(DeviceId(7)), Some(addr("AA"))),
            DeviceRecord::declared(None, None),
        ]);
        let blank = reg.find_blank().unwrap();

        // Fresh id is fine but address belongs to another record.
        let err = reg.claim(blank, Some(DeviceId(9)), Some(addr("AA")));
        assert_eq!(err, Err(RegistryConflict::AddressTaken(addr("AA"))));
        assert_eq!(reg.get(blank).unwrap().id(), None);
        assert!(reg.lookup_by_id(DeviceId(9)).is_none());

        let err = reg.claim(blank, Some(DeviceId(7)), Some(addr("BB")));
        assert_eq!(err, Err(RegistryConflict::IdTaken(DeviceId(7))));
        assert!(reg.lookup_by_address(&addr("BB")).is_none());

        reg.claim(blank, Some(DeviceId(9)), Some(addr("BB"))).unwrap();
        assert_eq!(reg.key_by_id(DeviceId(9)), Some(blank));
        assert_eq!(reg.key_by_address(&addr("BB")), Some(blank));
    }

    #[test]
    fn claim_refuses_reassignment() {
        let mut reg =
            DeviceRegistry::from_declared([DeviceRecord::declared(Some(DeviceId(1)), None)]);
        let key = reg.key_by_id(DeviceId(1)).unwrap();
        assert_eq!(
            reg.claim(key, Some(DeviceId(2)), None),
            Err(RegistryConflict::IdAlreadyAssigned {
                current: DeviceId(1),
                requested: DeviceId(2)
            })
        );
        // Re-claiming the same values is allowed.
        reg.claim(key, Some(DeviceId(1)), Some(addr("AA"))).unwrap();
        reg.claim(key, None, Some(addr("AA"))).unwrap();
        assert!(matches!(
            reg.claim(key, None, Some(addr("BB"))),
            Err(RegistryConflict::AddressAlreadyAssigned { .. })
        ));
    }

    #[test]
    fn mark_registered_requires_record() {
        let mut reg =
            DeviceRegistry::from_declared([DeviceRecord::declared(None, Some(addr("AA")))]);
        assert_eq!(
            reg.mark_registered(&addr("BB")),
            Err(RegistryConflict::UnknownAddress(addr("BB")))
        );
        assert_eq!(reg.mark_registered(&addr("AA")), Ok(true));
        assert_eq!(reg.mark_registered(&addr("AA")), Ok(false));
        assert!(reg.is_registered(&addr("AA")));
        assert!(reg.lookup_by_address(&addr("AA")).unwrap().is_registered());
    }

    #[test]
    fn creation_round_trip() {
        let mut reg = DeviceRegistry::new();
        let id = reg.begin_creation(&addr("AA")).unwrap();
        assert!(reg.is_pending(&addr("AA")));
        assert!(!reg.is_registered(&addr("AA")));
        assert_eq!(reg.begin_creation(&addr("AA")), None);

        assert_eq!(
            reg.finish_creation(DeviceId(id.0 + 1), &addr("AA")),
            Err(RegistryConflict::NotPending {
                id: DeviceId(id.0 + 1),
                address: addr("AA")
            })
        );
        let key = reg.finish_creation(id, &addr("AA")).unwrap();
        assert!(!reg.is_pending(&addr("AA")));
        assert!(reg.is_registered(&addr("AA")));
        assert_eq!(reg.key_by_id(id), Some(key));
        assert_eq!(reg.begin_creation(&addr("AA")), None);
    }

    #[test]
    fn abandoned_creation_frees_address() {
        let mut reg = DeviceRegistry::new();
        let id = reg.begin_creation(&addr("AA")).unwrap();
        assert!(!reg.abandon_creation(DeviceId(id.0 + 1), &addr("AA")));
        assert!(reg.is_pending(&addr("AA")));

        assert!(reg.abandon_creation(id, &addr("AA")));
        assert!(!reg.is_pending(&addr("AA")));
        assert!(reg.is_empty());
        let retry = reg.begin_creation(&addr("AA")).unwrap();
        assert_ne!(retry, id);
        assert!(matches!(
            reg.finish_creation(id, &addr("AA")),
            Err(RegistryConflict::NotPending { .. })
        ));
        reg.finish_creation(retry, &addr("AA")).unwrap();
        assert!(reg.is_registered(&addr("AA")));
    }

    #[test]
    fn pending_address_cannot_be_claimed() {
        let mut reg = DeviceRegistry::from_declared([DeviceRecord::declared(None, None)]);
        reg.begin_creation(&addr("AA")).unwrap();
        let blank = reg.find_blank().unwrap();
        assert_eq!(
            reg.claim(blank, None, Some(addr("AA"))),
            Err(RegistryConflict::AddressTaken(addr("AA")))
        );
    }

    #[test]
    fn concurrent_allocation_is_distinct() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 250;
        let reg = Arc::new(Mutex::new(DeviceRegistry::new()));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD)
                        .map(|_| reg.lock().unwrap().allocate_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<DeviceId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), THREADS * PER_THREAD);
    }
}
