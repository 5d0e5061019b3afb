//! Revocation machinery: the memory-mapped Ibex hardware revoker, and the independent periodic
//! load-filter, both of which sweep [`TaggedMemory`] invalidating capabilities whose base lies
//! in a quarantine region recorded in the revocation bitmap.

use cheriot_spacetime::allocator::Allocator;
use log::{debug, trace};

use crate::bus::{Bus, PureAccessError, PureAccessResult};
use crate::interrupt::DynIrqCallback;
use crate::simulator::Simulatable;
use crate::tagged_memory::TaggedMemory;
use crate::Allocated;

/// `revocation_offset = (addr − heap_base) >> 6`; `bit = ((addr − heap_base) >> 3) & 7`.
///
/// One byte of the bitmap therefore covers 64 bytes (8 granules) of heap.
pub fn must_revoke<A: Allocator>(memory: &TaggedMemory<A>, allocator: &A, revocation_base: u32, heap_base: u32, address: u32) -> bool {
    let Some(delta) = address.checked_sub(heap_base) else {
        return false;
    };
    let byte_offset = delta >> 6;
    let bit = (delta >> 3) & 0x7;
    let mut buf = [0u8; 1];
    memory.read_bytes(&mut buf, allocator, revocation_base.wrapping_add(byte_offset));
    buf[0] & (1 << bit) != 0
}

/// Invalidates the capability at `address` if its base is marked for revocation. Mirrors the
/// shared last step of `CLc`'s revocation consultation (§4.4) and `CheriotLoadFilter::FilterCapability`.
fn process_slot<A: Allocator>(memory: &TaggedMemory<A>, allocator: &mut A, revocation_base: u32, heap_base: u32, address: u32) {
    let Some(mut cap) = memory.read_capability(allocator, address) else {
        return;
    };
    if !cap.tag() {
        return;
    }
    // A sealing-format capability authorizes Seal/Unseal rather than pointing into the heap;
    // its address is an arbitrary otype/sealer-identity value, not a heap location to check.
    let is_sealing_authority = cap.permissions().has(crate::capability::Permission::Seal)
        || cap.permissions().has(crate::capability::Permission::Unseal);
    if is_sealing_authority {
        return;
    }
    if must_revoke(memory, allocator, revocation_base, heap_base, cap.base()) {
        trace!(target: "cheriot_core::revocation", "revoking capability"; address = address, base = cap.base());
        cap.clear_tag();
        memory.write_capability(allocator, address, cap);
    }
}

const REG_START_ADDRESS: u32 = 0x00;
const REG_END_ADDRESS: u32 = 0x04;
const REG_GO: u32 = 0x08;
const REG_EPOCH: u32 = 0x0C;
const REG_STATUS: u32 = 0x10;
const REG_INTERRUPT_ENABLE: u32 = 0x14;

const GO_READ_TAG: u32 = 0x5500_0000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct State {
    start_address: u32,
    end_address: u32,
    current_address: u32,
    in_progress: bool,
    epoch: u32,
    status: bool,
    interrupt_enable: bool,
    ticks_until_step: u32,
}

impl State {
    fn new() -> Self {
        Self {
            start_address: 0,
            end_address: 0,
            current_address: 0,
            in_progress: false,
            epoch: 0,
            status: false,
            interrupt_enable: false,
            ticks_until_step: 0,
        }
    }
}

/// The memory-mapped Ibex hardware revoker: a 32-byte register block, ticking off the cycle
/// counter, sweeping one capability slot every `period` ticks while a sweep is in progress.
#[derive(Debug)]
pub struct IbexRevoker<A: Allocator> {
    state: Allocated<A, State>,
    memory: Allocated<A, TaggedMemory<A>>,
    period: u32,
    heap_base: u32,
    revocation_base: u32,
    interrupt_callback: DynIrqCallback<A>,
}

impl<A: Allocator> IbexRevoker<A> {
    pub fn new(
        allocator: &mut A,
        memory: Allocated<A, TaggedMemory<A>>,
        period: u32,
        heap_base: u32,
        revocation_base: u32,
        interrupt_callback: DynIrqCallback<A>,
    ) -> Self {
        Self {
            state: Allocated::new(allocator, State::new()),
            memory,
            period: period.max(1),
            heap_base,
            revocation_base,
            interrupt_callback,
        }
    }

    pub fn drop(self, allocator: &mut A) {
        self.state.drop(allocator);
    }

    fn start_sweep(&self, allocator: &mut A) {
        let state = self.state.get_mut(allocator);
        if state.in_progress {
            return;
        }
        state.in_progress = true;
        state.current_address = state.start_address;
        state.ticks_until_step = self.period;
        debug!(target: "cheriot_core::revocation", "sweep started"; start = state.start_address, end = state.end_address);
    }

    fn step(&self, allocator: &mut A) {
        let address = {
            let state = self.state.get(allocator);
            state.current_address
        };
        process_slot(self.memory.get(allocator), allocator, self.revocation_base, self.heap_base, address);

        let state = self.state.get_mut(allocator);
        state.epoch = state.epoch.wrapping_add(1);
        state.current_address = state.current_address.wrapping_add(crate::tagged_memory::GRANULE_SIZE);
        if state.current_address >= state.end_address {
            state.in_progress = false;
            state.status = true;
            let should_raise = state.interrupt_enable;
            if should_raise {
                self.interrupt_callback.raise(allocator);
            }
            debug!(target: "cheriot_core::revocation", "sweep complete"; epoch = state.epoch);
        } else {
            state.ticks_until_step = self.period;
        }
    }
}

impl<A: Allocator> Simulatable<A> for IbexRevoker<A> {
    fn tick(&self, allocator: &mut A) {
        let in_progress = self.state.get(allocator).in_progress;
        if !in_progress {
            return;
        }
        let remaining = self.state.get(allocator).ticks_until_step;
        if remaining <= 1 {
            self.step(allocator);
        } else {
            self.state.get_mut(allocator).ticks_until_step = remaining - 1;
        }
    }

    fn drop(self, allocator: &mut A) {
        IbexRevoker::drop(self, allocator);
    }
}

impl<A: Allocator> Bus<A> for IbexRevoker<A> {
    fn read(&self, buf: &mut [u8], allocator: &mut A, address: u32) {
        if buf.len() != 4 || address % 4 != 0 {
            return;
        }
        let state = self.state.get(allocator);
        let value = match address {
            REG_START_ADDRESS => state.start_address,
            REG_END_ADDRESS => state.end_address,
            REG_GO => GO_READ_TAG | (state.current_address & 0x00FF_FFFF),
            REG_EPOCH => (state.epoch << 1) | (state.in_progress as u32),
            REG_STATUS => state.status as u32,
            REG_INTERRUPT_ENABLE => state.interrupt_enable as u32,
            _ => 0,
        };
        buf.copy_from_slice(&value.to_le_bytes());
    }

    fn read_pure(&self, buf: &mut [u8], allocator: &A, address: u32) -> PureAccessResult {
        if address == REG_GO {
            return Err(PureAccessError);
        }
        if buf.len() != 4 || address % 4 != 0 {
            return Ok(());
        }
        let state = self.state.get(allocator);
        let value = match address {
            REG_START_ADDRESS => state.start_address,
            REG_END_ADDRESS => state.end_address,
            REG_EPOCH => (state.epoch << 1) | (state.in_progress as u32),
            REG_STATUS => state.status as u32,
            REG_INTERRUPT_ENABLE => state.interrupt_enable as u32,
            _ => 0,
        };
        buf.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write(&self, allocator: &mut A, address: u32, buf: &[u8]) {
        if buf.len() != 4 || address % 4 != 0 {
            return;
        }
        let value = u32::from_le_bytes(buf.try_into().unwrap());
        match address {
            REG_START_ADDRESS => self.state.get_mut(allocator).start_address = value,
            REG_END_ADDRESS => self.state.get_mut(allocator).end_address = value,
            REG_GO => self.start_sweep(allocator),
            REG_STATUS => {
                self.state.get_mut(allocator).status = false;
                self.interrupt_callback.lower(allocator);
            }
            REG_INTERRUPT_ENABLE => self.state.get_mut(allocator).interrupt_enable = value & 1 != 0,
            _ => {}
        }
    }
}

/// The periodic load-filter: a background sweeper over a fixed address window `[base, top)`,
/// independent of the Ibex revoker's single-sweep-to-completion model. Every `period` ticks it
/// filters `count` consecutive capability slots starting from an internal cursor that wraps
/// from `top` back to `base`.
#[derive(Debug)]
pub struct LoadFilter<A: Allocator> {
    cursor: Allocated<A, u32>,
    ticks: Allocated<A, u32>,
    memory: Allocated<A, TaggedMemory<A>>,
    period: u32,
    count: u32,
    base: u32,
    top: u32,
    heap_base: u32,
    revocation_base: u32,
}

impl<A: Allocator> LoadFilter<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        allocator: &mut A,
        memory: Allocated<A, TaggedMemory<A>>,
        period: u32,
        count: u32,
        base: u32,
        top: u32,
        heap_base: u32,
        revocation_base: u32,
    ) -> Self {
        Self {
            cursor: Allocated::new(allocator, base),
            ticks: Allocated::new(allocator, period.max(1)),
            memory,
            period: period.max(1),
            count: count.max(1),
            base,
            top,
            heap_base,
            revocation_base,
        }
    }

    pub fn drop(self, allocator: &mut A) {
        self.cursor.drop(allocator);
        self.ticks.drop(allocator);
    }

    fn filter_batch(&self, allocator: &mut A) {
        let mut cursor = *self.cursor.get(allocator);
        for _ in 0..self.count {
            process_slot(self.memory.get(allocator), allocator, self.revocation_base, self.heap_base, cursor);
            cursor = cursor.wrapping_add(crate::tagged_memory::GRANULE_SIZE);
            if cursor >= self.top {
                cursor = self.base;
            }
        }
        *self.cursor.get_mut(allocator) = cursor;
    }
}

impl<A: Allocator> Simulatable<A> for LoadFilter<A> {
    fn tick(&self, allocator: &mut A) {
        let remaining = *self.ticks.get(allocator);
        if remaining <= 1 {
            *self.ticks.get_mut(allocator) = self.period;
            self.filter_batch(allocator);
        } else {
            *self.ticks.get_mut(allocator) = remaining - 1;
        }
    }

    fn drop(self, allocator: &mut A) {
        LoadFilter::drop(self, allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_revoke_bit_formula_matches_heap_layout() {
        // Granule 4 past heap_base (address heap_base + 0x20) maps to bit 4 of byte 0.
        let heap_base = 0x8000_0000u32;
        let address = heap_base + 4 * 8;
        let delta = address - heap_base;
        assert_eq!(0, delta >> 6);
        assert_eq!(4, (delta >> 3) & 0x7);
    }

    #[test]
    fn go_register_read_tag_is_fixed() {
        assert_eq!(0x5500_0000, GO_READ_TAG & 0xFF00_0000);
    }
}
