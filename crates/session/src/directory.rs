//! Device directory snapshots.
//!
//! A directory is an ordered, read-only capture of every device the
//! supported backends can see at one moment. It is rebuilt wholesale on
//! every refresh trigger and atomically replaces the previous snapshot;
//! nothing ever patches one in place. Callers that track a selection
//! reconcile it against the new snapshot by [`DeviceKey`], never by
//! position.

use crate::backend::PlatformBackend;
use crate::error::PlatformError;
use crate::types::{DeviceDescriptor, DeviceKey};
use std::collections::HashSet;
use tracing::warn;

/// Ordered snapshot of enumerated devices. Insertion order is the
/// platform's enumeration order at capture time.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    entries: Vec<DeviceDescriptor>,
}

impl DeviceDirectory {
    /// Capture a fresh snapshot from the backend.
    ///
    /// Safe to call at any time, including while a session is open; it
    /// never touches an open handle. Duplicate keys are dropped keeping
    /// the first occurrence, preserving the unique-key invariant.
    pub fn capture<B: PlatformBackend>(backend: &B) -> Result<Self, PlatformError> {
        let mut entries = backend.enumerate()?;

        let mut seen = HashSet::new();
        entries.retain(|descriptor| {
            let fresh = seen.insert(descriptor.key.clone());
            if !fresh {
                warn!(key = %descriptor.key, "duplicate device key in enumeration, dropped");
            }
            fresh
        });

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DeviceDescriptor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a device with this key is present in the snapshot.
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.find(key).is_some()
    }

    /// Locate an entry by key; this is the selection-reconciliation
    /// primitive the shell uses after a refresh.
    pub fn find(&self, key: &DeviceKey) -> Option<&DeviceDescriptor> {
        self.entries.iter().find(|d| &d.key == key)
    }

    /// First entry matching the id pair, in enumeration order.
    pub fn find_ids(&self, vendor_id: u16, product_id: u16) -> Option<&DeviceDescriptor> {
        self.entries
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn capture_preserves_enumeration_order() {
        let mut backend = FakeBackend::new();
        let first = backend.add_device(0x1234, 0x5678, 0x0100);
        let second = backend.add_device(0xabcd, 0x0001, 0x0200);

        let directory = DeviceDirectory::capture(&backend).unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.entries()[0].key, first);
        assert_eq!(directory.entries()[1].key, second);
    }

    #[test]
    fn capture_drops_duplicate_keys() {
        let mut backend = FakeBackend::new();
        let key = backend.add_device(0x1234, 0x5678, 0x0100);
        backend.add_duplicate_of(&key);

        let directory = DeviceDirectory::capture(&backend).unwrap();
        assert_eq!(directory.len(), 1);
        assert!(directory.contains(&key));
    }

    #[test]
    fn find_by_key_and_ids() {
        let mut backend = FakeBackend::new();
        let key = backend.add_device(0x1234, 0x5678, 0x0100);

        let directory = DeviceDirectory::capture(&backend).unwrap();
        assert!(directory.find(&key).is_some());
        assert!(directory.find_ids(0x1234, 0x5678).is_some());
        assert!(directory.find_ids(0x1234, 0x9999).is_none());
        assert!(!directory.contains(&DeviceKey::from("no-such-key")));
    }

    #[test]
    fn snapshots_are_replaced_not_patched() {
        let mut backend = FakeBackend::new();
        let key = backend.add_device(0x1234, 0x5678, 0x0100);

        let before = DeviceDirectory::capture(&backend).unwrap();
        backend.remove_device(&key);
        let after = DeviceDirectory::capture(&backend).unwrap();

        // The old snapshot is untouched by the new capture.
        assert!(before.contains(&key));
        assert!(!after.contains(&key));
    }
}
