//! Byte-addressable memory that additionally carries one tag bit per 8-byte (capability-sized)
//! granule.
//!
//! A tag bit survives only as long as its granule is written exclusively through
//! [`TaggedMemory::write_capability`]; any byte-granularity write that touches part of a granule
//! clears that granule's tag, so an integer can never be reinterpreted as a live capability by
//! accident.

use cheriot_spacetime::allocator::{Allocator, ArrayAccessor, ArrayAccessorMut};

use crate::capability::Capability;
use crate::simulator::Simulatable;
use crate::AddressRange;

/// Size in bytes of one taggable granule.
pub const GRANULE_SIZE: u32 = 8;

#[derive(Debug)]
pub struct TaggedMemory<A: Allocator> {
    data: A::ArrayId<u8>,
    tags: A::ArrayId<bool>,
    max_address: u32,
}

impl<A: Allocator> Clone for TaggedMemory<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Allocator> Copy for TaggedMemory<A> {}

impl<A: Allocator> TaggedMemory<A> {
    /// Creates a new zero-initialized, untagged memory of `size` bytes. `size` must be a
    /// multiple of [`GRANULE_SIZE`] and fit in a `u32` address space.
    pub fn new(allocator: &mut A, size: usize) -> Option<Self> {
        if size == 0 || size % GRANULE_SIZE as usize != 0 || (usize::BITS > 32 && size > (1 << 32))
        {
            return None;
        }
        Some(Self {
            data: allocator.insert_array(0u8, size),
            tags: allocator.insert_array(false, size / GRANULE_SIZE as usize),
            max_address: (size - 1) as u32,
        })
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::new(0, self.max_address).unwrap()
    }

    fn granule_index(&self, address: u32) -> usize {
        (address / GRANULE_SIZE) as usize
    }

    /// Reads `buf.len()` plain bytes starting at `address`. Never touches tags; reading through
    /// this path does not imply anything about whether the bytes formed a capability.
    pub fn read_bytes(&self, buf: &mut [u8], allocator: &A, address: u32) {
        if address > self.max_address || buf.is_empty() {
            return;
        }
        let size = buf.len().min((self.max_address - address) as usize + 1);
        let data = allocator.get_array(self.data).unwrap();
        data.read(&mut buf[..size], address as usize);
    }

    /// Writes `buf` as plain bytes starting at `address`, clearing the tag of every granule the
    /// write touches even partially.
    pub fn write_bytes(&self, allocator: &mut A, address: u32, buf: &[u8]) {
        if address > self.max_address || buf.is_empty() {
            return;
        }
        let size = buf.len().min((self.max_address - address) as usize + 1);
        let first_granule = self.granule_index(address);
        let last_granule = self.granule_index(address + size as u32 - 1);
        {
            let mut tags = allocator.get_array_mut(self.tags).unwrap();
            for granule in first_granule..=last_granule {
                tags.set(granule, false);
            }
        }
        let mut data = allocator.get_array_mut(self.data).unwrap();
        data.write(address as usize, &buf[..size]);
    }

    /// Loads the capability stored at `address`, which must be [`GRANULE_SIZE`]-aligned.
    /// Returns `None` if `address` is misaligned or out of range.
    pub fn read_capability(&self, allocator: &A, address: u32) -> Option<Capability> {
        if address % GRANULE_SIZE != 0 || address.checked_add(GRANULE_SIZE - 1)? > self.max_address
        {
            return None;
        }
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf, allocator, address);
        let data_word = u32::from_le_bytes(buf);
        let mut compressed_buf = [0u8; 4];
        self.read_bytes(&mut compressed_buf, allocator, address + 4);
        let compressed = u32::from_le_bytes(compressed_buf);
        let tag = *allocator
            .get_array(self.tags)
            .unwrap()
            .get_ref(self.granule_index(address))
            .unwrap();
        Some(Capability::expand(data_word, compressed, tag))
    }

    /// Stores `capability` at `address`, which must be [`GRANULE_SIZE`]-aligned. Sets the
    /// granule's tag atomically with the data bytes. Returns `false` if `address` is misaligned
    /// or out of range, in which case nothing is written.
    pub fn write_capability(&self, allocator: &mut A, address: u32, capability: Capability) -> bool {
        if address % GRANULE_SIZE != 0 {
            return false;
        }
        let Some(last) = address.checked_add(GRANULE_SIZE - 1) else {
            return false;
        };
        if last > self.max_address {
            return false;
        }
        let data = capability.address().to_le_bytes();
        let meta = capability.compress().to_le_bytes();
        {
            let mut store = allocator.get_array_mut(self.data).unwrap();
            store.write(address as usize, &data);
            store.write(address as usize + 4, &meta);
        }
        let mut tags = allocator.get_array_mut(self.tags).unwrap();
        tags.set(self.granule_index(address), capability.tag());
        true
    }

    /// Returns the tag bit of the granule containing `address`, without side effects.
    pub fn tag_at(&self, allocator: &A, address: u32) -> bool {
        if address > self.max_address {
            return false;
        }
        *allocator
            .get_array(self.tags)
            .unwrap()
            .get_ref(self.granule_index(address))
            .unwrap()
    }
}

impl<A: Allocator> Simulatable<A> for TaggedMemory<A> {
    fn tick(&self, allocator: &mut A) {
        let _ = allocator;
    }

    fn drop(self, allocator: &mut A) {
        allocator.remove_array(self.data).unwrap();
        allocator.remove_array(self.tags).unwrap();
    }
}

// NOTE: unlike `capability.rs`, this module's behavior is only exercised through a live
// `Allocator` backend, so it is covered by the integration tests in `cheriot-test` rather than
// an inline `#[cfg(test)]` module here, matching how `resources::{Ram, Rom, Plic}` are tested
// elsewhere in this tree.
