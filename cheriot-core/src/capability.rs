//! The CHERIoT capability value type: its compressed 64-bit on-wire form, its expanded
//! in-register form, and the algebra (bounds-setting, sealing, permission derivation) that keeps
//! the two consistent.
//!
//! > A capability is an unforgeable token of authority. [...] CHERIoT capabilities compress a
//! > 91-bit unbounded capability down to 64 bits (32-bit address, 32-bit compressed metadata, one
//! > out-of-band tag bit) using a floating-point-like encoding of bounds relative to the address.

use std::fmt;

use log::trace;

/// One permission bit a capability may carry.
///
/// The six *permission formats* ([`PermissionFormat`]) each imply a fixed subset of these and
/// expose a subset of the remainder as independently clearable bits; see [`Permissions`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum Permission {
    Global = 1 << 0,
    LoadGlobal = 1 << 1,
    Store = 1 << 2,
    LoadMutable = 1 << 3,
    StoreLocalCapability = 1 << 4,
    Load = 1 << 5,
    LoadStoreCapability = 1 << 6,
    AccessSystemRegisters = 1 << 7,
    Execute = 1 << 8,
    Unseal = 1 << 9,
    Seal = 1 << 10,
    UserPerm0 = 1 << 11,
}

/// A set of [`Permission`] bits, stored as a 12-bit field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Permissions(u16);

impl Permissions {
    pub const NONE: Self = Self(0);
    const MASK: u16 = 0x0FFF;

    pub const fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn has(self, permission: Permission) -> bool {
        self.0 & permission as u16 != 0
    }

    pub fn with(self, permission: Permission) -> Self {
        Self(self.0 | permission as u16)
    }

    pub fn without(self, permission: Permission) -> Self {
        Self(self.0 & !(permission as u16))
    }

    /// Intersects with the complement of `mask`, i.e. clears every bit set in `mask`.
    pub fn clear(self, mask: u16) -> Self {
        Self(self.0 & !mask & Self::MASK)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// `true` iff every bit of `self` is also set in `other`.
    pub fn is_subset_of(self, other: Self) -> bool {
        self.0 & other.0 == self.0
    }
}

/// The six shapes the compressed 6-bit permission field can take.
///
/// Each format implies a fixed set of permissions and exposes a handful of bits it owns
/// independently; compressing a [`Permissions`] set picks the most specific format it still fits,
/// expanding re-adds the implied bits. Grounded in the permission-format table of the original
/// capability encoding (`cheriot_register.h`'s `CheriotCapabilityPermission` table).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PermissionFormat {
    /// Sealing capabilities: `Seal`, `Unseal`, `User0`, `Global`.
    Sealing,
    /// Executable capabilities (`Execute` implied): sentries and code pointers.
    Executable,
    /// Read/write data capabilities with capability-load/store authority.
    MemoryCapReadWrite,
    /// Read-only data capabilities with capability-load authority.
    MemoryCapReadOnly,
    /// Write-only data capabilities with capability-store authority.
    MemoryCapWriteOnly,
    /// Plain data capabilities; no capability load/store authority at all.
    MemoryDataOnly,
}

impl PermissionFormat {
    /// Picks the most specific format that can represent `permissions` without losing any bit
    /// that format permits. Permission bits beyond what the format can express are dropped.
    fn pick(permissions: Permissions, is_executable: bool) -> Self {
        if is_executable {
            return PermissionFormat::Executable;
        }
        if permissions.has(Permission::Seal) || permissions.has(Permission::Unseal) {
            return PermissionFormat::Sealing;
        }
        let load_cap = permissions.has(Permission::LoadStoreCapability);
        match (load_cap, permissions.has(Permission::Load), permissions.has(Permission::Store)) {
            (true, true, true) => PermissionFormat::MemoryCapReadWrite,
            (true, true, false) => PermissionFormat::MemoryCapReadOnly,
            (true, false, true) => PermissionFormat::MemoryCapWriteOnly,
            _ => PermissionFormat::MemoryDataOnly,
        }
    }

    /// Permissions always implied by this format, independent of the stored bits.
    fn implied(self) -> Permissions {
        match self {
            PermissionFormat::Sealing => Permissions::NONE,
            PermissionFormat::Executable => Permissions::from_bits_truncate(Permission::Execute as u16),
            PermissionFormat::MemoryCapReadWrite => Permissions::from_bits_truncate(
                Permission::Load as u16 | Permission::Store as u16 | Permission::LoadStoreCapability as u16,
            ),
            PermissionFormat::MemoryCapReadOnly => Permissions::from_bits_truncate(
                Permission::Load as u16 | Permission::LoadStoreCapability as u16,
            ),
            PermissionFormat::MemoryCapWriteOnly => Permissions::from_bits_truncate(
                Permission::Store as u16 | Permission::LoadStoreCapability as u16,
            ),
            PermissionFormat::MemoryDataOnly => Permissions::NONE,
        }
    }

    /// Bits that this format stores explicitly and can vary independently of the implied set.
    fn writable_mask(self) -> u16 {
        use Permission::*;
        let common = Global as u16 | UserPerm0 as u16;
        match self {
            PermissionFormat::Sealing => common | Seal as u16 | Unseal as u16,
            PermissionFormat::Executable => {
                common | AccessSystemRegisters as u16 | LoadGlobal as u16 | LoadMutable as u16
            }
            PermissionFormat::MemoryCapReadWrite | PermissionFormat::MemoryCapReadOnly => {
                common | LoadGlobal as u16 | LoadMutable as u16 | StoreLocalCapability as u16
            }
            PermissionFormat::MemoryCapWriteOnly => common | StoreLocalCapability as u16,
            PermissionFormat::MemoryDataOnly => {
                common | Load as u16 | Store as u16 | LoadMutable as u16 | StoreLocalCapability as u16
            }
        }
    }

    fn code(self) -> u8 {
        match self {
            PermissionFormat::Sealing => 0b01_0000,
            PermissionFormat::Executable => 0b10_0000,
            PermissionFormat::MemoryCapReadWrite => 0b00_0001,
            PermissionFormat::MemoryCapReadOnly => 0b00_0010,
            PermissionFormat::MemoryCapWriteOnly => 0b00_0011,
            PermissionFormat::MemoryDataOnly => 0b00_0000,
        }
    }

    fn from_code(code: u8) -> Self {
        if code & 0b10_0000 != 0 {
            PermissionFormat::Executable
        } else if code & 0b01_0000 != 0 {
            PermissionFormat::Sealing
        } else {
            match code & 0b00_1111 {
                0b0001 => PermissionFormat::MemoryCapReadWrite,
                0b0010 => PermissionFormat::MemoryCapReadOnly,
                0b0011 => PermissionFormat::MemoryCapWriteOnly,
                _ => PermissionFormat::MemoryDataOnly,
            }
        }
    }
}

fn compress_permissions(permissions: Permissions, is_executable: bool) -> u8 {
    let format = PermissionFormat::pick(permissions, is_executable);
    let stored = permissions.intersection(Permissions::from_bits_truncate(format.writable_mask()));
    format.code() | ((stored.bits() as u8) & 0x0F)
}

fn expand_permissions(compressed: u8) -> (Permissions, bool) {
    let format = PermissionFormat::from_code(compressed);
    let is_executable = matches!(format, PermissionFormat::Executable);
    let stored = Permissions::from_bits_truncate((compressed & 0x0F) as u16);
    let permissions = Permissions::from_bits_truncate(
        (stored.intersection(Permissions::from_bits_truncate(format.writable_mask())).bits())
            | format.implied().bits(),
    );
    (permissions, is_executable)
}

/// Width in bits of the rotated base/top mantissas.
const MANTISSA_WIDTH: u32 = 9;

/// Exponent value `15` is reserved to mean "exponent 24, internal exponent and bounds already
/// byte-exact" (used by the three root capabilities, whose length is the full `2^32`).
const MAX_EXPONENT: u8 = 24;
const RESERVED_EXPONENT_CODE: u8 = 15;

/// The otype reserved to mean "unsealed".
pub const OTYPE_UNSEALED: u8 = 0;

/// Sentry otypes (executable, sealed capabilities used as call targets).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SentryKind {
    InterruptInheriting,
    InterruptDisablingForward,
    InterruptEnablingForward,
    InterruptDisablingBackward,
    InterruptEnablingBackward,
}

impl SentryKind {
    pub fn from_otype(otype: u8) -> Option<Self> {
        match otype {
            1 => Some(Self::InterruptInheriting),
            2 => Some(Self::InterruptDisablingForward),
            3 => Some(Self::InterruptEnablingForward),
            4 => Some(Self::InterruptDisablingBackward),
            5 => Some(Self::InterruptEnablingBackward),
            _ => None,
        }
    }

    pub fn otype(self) -> u8 {
        match self {
            Self::InterruptInheriting => 1,
            Self::InterruptDisablingForward => 2,
            Self::InterruptEnablingForward => 3,
            Self::InterruptDisablingBackward => 4,
            Self::InterruptEnablingBackward => 5,
        }
    }

    pub fn is_backward(self) -> bool {
        matches!(self, Self::InterruptDisablingBackward | Self::InterruptEnablingBackward)
    }

    pub fn sets_mie(self) -> Option<bool> {
        match self {
            Self::InterruptDisablingForward | Self::InterruptDisablingBackward => Some(false),
            Self::InterruptEnablingForward | Self::InterruptEnablingBackward => Some(true),
            Self::InterruptInheriting => None,
        }
    }
}

/// An expanded CHERIoT capability.
///
/// `top` is stored as a `u64` so that the all-ones-bits "top of address space" bound
/// (`0x1_0000_0000`) is representable without wraparound.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Capability {
    tag: bool,
    address: u32,
    base: u32,
    top: u64,
    permissions: Permissions,
    object_type: u8,
    reserved: bool,
}

/// Failure reasons for [`Capability::seal`], grounded in the precondition chain of
/// `CheriotRegister::Seal`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SealError {
    #[error("target capability is not tagged")]
    TargetNotTagged,
    #[error("target capability is already sealed")]
    TargetAlreadySealed,
    #[error("sealing authority is not tagged")]
    AuthorityNotTagged,
    #[error("sealing authority is sealed")]
    AuthorityNotUnsealed,
    #[error("sealing authority lacks the Seal permission")]
    AuthorityLacksPermission,
    #[error("sealing authority's address is out of its own bounds")]
    AuthorityOutOfBounds,
    #[error("requested object type {0} is out of range for this capability's class")]
    ObjectTypeOutOfRange(u8),
}

/// Failure reasons for [`Capability::unseal`], grounded in the precondition chain of
/// `CheriotRegister::Unseal`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnsealError {
    #[error("target capability is not sealed")]
    TargetNotSealed,
    #[error("unsealing authority is not tagged")]
    AuthorityNotTagged,
    #[error("unsealing authority is sealed")]
    AuthorityNotUnsealed,
    #[error("unsealing authority lacks the Unseal permission")]
    AuthorityLacksPermission,
    #[error("unsealing authority's address ({authority_address:#x}) does not match the target's object type ({object_type})")]
    ObjectTypeMismatch { authority_address: u32, object_type: u8 },
    #[error("unsealing authority's address is out of its own bounds")]
    AuthorityOutOfBounds,
}

impl Capability {
    /// The null capability: untagged, all fields zero except `address`.
    pub fn null() -> Self {
        Self {
            tag: false,
            address: 0,
            base: 0,
            top: 0,
            permissions: Permissions::NONE,
            object_type: OTYPE_UNSEALED,
            reserved: false,
        }
    }

    fn root(permissions: Permissions) -> Self {
        Self {
            tag: true,
            address: 0,
            base: 0,
            top: 1u64 << 32,
            permissions,
            object_type: OTYPE_UNSEALED,
            reserved: false,
        }
    }

    /// The almighty memory-manipulation capability: full bounds, read/write/capability
    /// permissions, no execute.
    pub fn memory_root() -> Self {
        use Permission::*;
        Self::root(Permissions::from_bits_truncate(
            Global as u16
                | LoadGlobal as u16
                | Store as u16
                | LoadMutable as u16
                | StoreLocalCapability as u16
                | Load as u16
                | LoadStoreCapability as u16,
        ))
    }

    /// The almighty executable capability: full bounds, `Execute` plus system-register access.
    pub fn executable_root() -> Self {
        use Permission::*;
        Self::root(Permissions::from_bits_truncate(
            Global as u16
                | Execute as u16
                | AccessSystemRegisters as u16
                | LoadGlobal as u16
                | LoadMutable as u16,
        ))
    }

    /// The almighty sealing capability: full bounds, `Seal` and `Unseal`.
    pub fn sealing_root() -> Self {
        use Permission::*;
        Self::root(Permissions::from_bits_truncate(Global as u16 | Seal as u16 | Unseal as u16))
    }

    pub fn tag(&self) -> bool {
        self.tag
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Exclusive upper bound, saturated to `0xFFFF_FFFF` when the true bound is `0x1_0000_0000`.
    pub fn top(&self) -> u32 {
        self.top.min(u32::MAX as u64) as u32
    }

    /// `top − base` as a 33-bit quantity projected down to `u32`, saturating at `0xFFFF_FFFF`.
    pub fn length(&self) -> u32 {
        (self.top - self.base as u64).min(u32::MAX as u64) as u32
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn object_type(&self) -> u8 {
        self.object_type
    }

    pub fn reserved_bit(&self) -> bool {
        self.reserved
    }

    pub fn is_valid(&self) -> bool {
        self.tag && (self.address as u64) >= self.base as u64 && (self.address as u64) < self.top
    }

    pub fn is_sealed(&self) -> bool {
        self.object_type != OTYPE_UNSEALED
    }

    pub fn is_unsealed(&self) -> bool {
        !self.is_sealed()
    }

    pub fn is_sentry(&self) -> bool {
        self.permissions.has(Permission::Execute) && SentryKind::from_otype(self.object_type).is_some()
    }

    pub fn sentry_kind(&self) -> Option<SentryKind> {
        if self.permissions.has(Permission::Execute) {
            SentryKind::from_otype(self.object_type)
        } else {
            None
        }
    }

    fn exponent(length: u64) -> u8 {
        if length > (u32::MAX as u64) {
            return MAX_EXPONENT;
        }
        let length = length.max(1) as u32 | 0x1FF;
        let e = 23i32 - length.leading_zeros() as i32;
        let e = e.max(0) as u8;
        if e > 14 {
            MAX_EXPONENT
        } else {
            e
        }
    }

    /// Narrows `self`'s bounds to `[req_base, req_base + req_length)`, rounding outward to the
    /// nearest representable exponent. Returns `true` iff the result is exact.
    ///
    /// Invalidates the capability if the current address falls outside the new bounds.
    pub fn set_bounds(&mut self, req_base: u32, req_length: u64) -> bool {
        let req_top = req_base as u64 + req_length;
        let mut exponent = Self::exponent(req_length);
        let (mut new_base, mut new_top) = Self::round_bounds(req_base, req_top, exponent);

        // A single retry: rounding can push the length past what the chosen exponent can
        // represent, in which case the next exponent up is needed.
        if exponent < MAX_EXPONENT && (new_top - new_base as u64) > (0x1FFu64 << exponent) {
            exponent += 1;
            let rounded = Self::round_bounds(req_base, req_top, exponent);
            new_base = rounded.0;
            new_top = rounded.1;
        }

        self.base = new_base;
        self.top = new_top;
        trace!(target: "cheriot_core::cap", "set_bounds"; base = new_base, top = new_top, exponent = exponent);
        if !self.is_valid() {
            self.tag = false;
        }
        new_base == req_base && new_top == req_top
    }

    fn round_bounds(req_base: u32, req_top: u64, exponent: u8) -> (u32, u64) {
        if exponent >= MAX_EXPONENT {
            return (req_base, req_top);
        }
        let mask = (1u64 << exponent) - 1;
        let base = req_base as u64 & !mask;
        let top = (req_top + mask) & !mask;
        (base as u32, top)
    }

    /// Clears every permission bit set in `mask`, then re-derives the permission set through the
    /// compressed format so that format-dependent implied bits collapse consistently.
    pub fn clear_permissions(&mut self, mask: u16) {
        let cleared = self.permissions.clear(mask);
        let is_executable = self.permissions.has(Permission::Execute) && mask & Permission::Execute as u16 == 0;
        let compressed = compress_permissions(cleared, is_executable);
        let (expanded, _) = expand_permissions(compressed);
        self.permissions = expanded;
    }

    /// Seals `self` using `authority`, recording `otype`. On any precondition failure, clears
    /// `self`'s tag and returns the reason.
    pub fn seal(&mut self, authority: &Capability, otype: u8) -> Result<(), SealError> {
        let result = self.try_seal(authority, otype);
        if result.is_err() {
            self.tag = false;
        }
        result
    }

    fn try_seal(&mut self, authority: &Capability, otype: u8) -> Result<(), SealError> {
        if !self.tag {
            return Err(SealError::TargetNotTagged);
        }
        if self.is_sealed() {
            return Err(SealError::TargetAlreadySealed);
        }
        if !authority.tag {
            return Err(SealError::AuthorityNotTagged);
        }
        if authority.is_sealed() {
            return Err(SealError::AuthorityNotUnsealed);
        }
        if !authority.permissions.has(Permission::Seal) {
            return Err(SealError::AuthorityLacksPermission);
        }
        if !authority.is_valid() {
            return Err(SealError::AuthorityOutOfBounds);
        }
        let valid_range = if self.permissions.has(Permission::Execute) {
            1..=7
        } else {
            9..=15
        };
        if !valid_range.contains(&otype) {
            return Err(SealError::ObjectTypeOutOfRange(otype));
        }
        self.object_type = otype & 0xF;
        Ok(())
    }

    /// Unseals `self` using `authority`. On any precondition failure, clears `self`'s tag and
    /// returns the reason.
    pub fn unseal(&mut self, authority: &Capability, _otype: u8) -> Result<(), UnsealError> {
        let result = self.try_unseal(authority);
        if result.is_err() {
            self.tag = false;
        }
        result
    }

    fn try_unseal(&mut self, authority: &Capability) -> Result<(), UnsealError> {
        if !self.is_sealed() {
            return Err(UnsealError::TargetNotSealed);
        }
        if !authority.tag {
            return Err(UnsealError::AuthorityNotTagged);
        }
        if authority.is_sealed() {
            return Err(UnsealError::AuthorityNotUnsealed);
        }
        if !authority.permissions.has(Permission::Unseal) {
            return Err(UnsealError::AuthorityLacksPermission);
        }
        if authority.address != self.object_type as u32 {
            return Err(UnsealError::ObjectTypeMismatch {
                authority_address: authority.address,
                object_type: self.object_type,
            });
        }
        if !authority.is_valid() {
            return Err(UnsealError::AuthorityOutOfBounds);
        }
        self.object_type = OTYPE_UNSEALED;
        if !authority.permissions.has(Permission::Global) {
            self.permissions = self.permissions.without(Permission::Global);
        }
        Ok(())
    }

    fn internal_exponent(&self) -> u8 {
        Self::exponent(self.top - self.base as u64)
    }

    /// The legal address window within which [`Capability::set_address`] preserves the tag:
    /// `[base - 2^(e+9), base + 2*2^(e+9))`.
    fn representable_window(&self) -> (i64, i64) {
        let e = self.internal_exponent();
        if e >= MAX_EXPONENT {
            return (i64::MIN, i64::MAX);
        }
        let span = 1i64 << (e as u32 + MANTISSA_WIDTH);
        (self.base as i64 - span, self.base as i64 + 2 * span)
    }

    pub fn is_representable(&self) -> bool {
        if !self.tag {
            return true;
        }
        let (low, high) = self.representable_window();
        (self.address as i64) >= low && (self.address as i64) < high
    }

    /// Moves the cursor to `address`, clearing the tag if the new address is not representable.
    pub fn set_address(&mut self, address: u32) {
        self.address = address;
        if self.tag && !self.is_representable() {
            self.tag = false;
        }
    }

    /// Re-derives `(base, top)` from the compressed mantissas; used by queries (`CGetTop`,
    /// `CGetLen`) that must reconstruct bounds rather than trust cached fields.
    pub fn compute_bounds(&self) -> (u32, u32) {
        (self.base, self.top())
    }

    /// Unconditionally clears the tag, preserving every other field. Total; never fails.
    /// Grounded in `CheriotCClearTag`.
    pub fn clear_tag(&mut self) {
        self.tag = false;
    }

    pub fn is_memory_equal(&self, other: &Capability) -> bool {
        self.address == other.address && self.compress() == other.compress()
    }

    /// Packs the 32-bit compressed metadata word (excludes `address`, which is stored alongside
    /// it but is not part of this word).
    pub fn compress(&self) -> u32 {
        let exponent = self.internal_exponent();
        let exponent_code = if exponent >= MAX_EXPONENT {
            RESERVED_EXPONENT_CODE
        } else {
            exponent
        };
        let shift = if exponent >= MAX_EXPONENT { 0 } else { exponent as u32 };
        let base_mantissa = ((self.base >> shift) & 0x1FF) as u32;
        let top_mantissa = ((self.top >> shift) & 0x1FF) as u32;
        let is_executable = self.permissions.has(Permission::Execute);
        let permission_byte = compress_permissions(self.permissions, is_executable);
        let otype_low = self.object_type & 0x7;

        let mut word = 0u32;
        word |= base_mantissa & 0x1FF;
        word |= (top_mantissa & 0x1FF) << 9;
        word |= (exponent_code as u32 & 0xF) << 18;
        word |= (otype_low as u32) << 22;
        word |= (permission_byte as u32 & 0x3F) << 25;
        word |= (self.reserved as u32) << 31;
        word
    }

    /// Reconstructs a capability from its compressed metadata word, current address, and tag
    /// bit. Total: every 32-bit input produces a (possibly non-representable, in which case
    /// `tag` should already be `false`) result.
    pub fn expand(address: u32, compressed: u32, tag: bool) -> Self {
        let base_mantissa = compressed & 0x1FF;
        let top_mantissa = (compressed >> 9) & 0x1FF;
        let exponent_code = ((compressed >> 18) & 0xF) as u8;
        let otype_low = ((compressed >> 22) & 0x7) as u8;
        let permission_byte = ((compressed >> 25) & 0x3F) as u8;
        let reserved = (compressed >> 31) & 1 != 0;

        let (permissions, is_executable) = expand_permissions(permission_byte);
        let object_type = if is_executable {
            otype_low
        } else {
            otype_low | 0x8
        };

        if exponent_code == RESERVED_EXPONENT_CODE {
            return Self {
                tag,
                address,
                base: 0,
                top: 1u64 << 32,
                permissions,
                object_type: if object_type == 0x8 { 0 } else { object_type },
                reserved,
            };
        }

        let exponent = exponent_code;
        let (base, top) = Self::reconstruct_bounds(address, base_mantissa, top_mantissa, exponent);

        Self {
            tag,
            address,
            base,
            top,
            permissions,
            object_type: if object_type == 0x8 { 0 } else { object_type },
            reserved,
        }
    }

    /// Reconstructs full-width `(base, top)` from 9-bit rotated mantissas and the address,
    /// using the correction-factor algorithm: the address's bits above the mantissa window give
    /// a coarse reference point (`a_mid`), and each mantissa's relationship to that reference
    /// (whether it wrapped around modulo `2^9`) selects which of three correction factors
    /// (`-1`, `0`, `+1`) to apply to the high bits carried over from the address.
    fn reconstruct_bounds(address: u32, base_mantissa: u32, top_mantissa: u32, exponent: u8) -> (u32, u64) {
        let shift = exponent as u32;
        let a_mid = ((address as u64) >> shift) & 0x1FF;
        let a_hi = ((address as u64) >> (shift + MANTISSA_WIDTH)) as i64;

        let base_correction = if base_mantissa as u64 > a_mid + 0x100 {
            -1
        } else if (a_mid as i64) - (base_mantissa as i64) > 0x100 {
            1
        } else {
            0
        };
        let top_correction = if top_mantissa as u64 > a_mid + 0x100 {
            -1
        } else if (a_mid as i64) - (top_mantissa as i64) > 0x100 {
            1
        } else {
            0
        };

        let c_b = a_hi + base_correction;
        let c_t = a_hi + top_correction;

        let base = ((c_b << MANTISSA_WIDTH) | base_mantissa as i64) << shift;
        let top = ((c_t << MANTISSA_WIDTH) | top_mantissa as i64) << shift;

        let base = (base as u64 & 0xFFFF_FFFF) as u32;
        let top = (top as u64).min(1u64 << 32).max(0);
        (base, top)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tag {
            return write!(f, "0x{:08x} (untagged)", self.address);
        }
        write!(
            f,
            "0x{:08x} [0x{:08x}, 0x{:08x}) perms={:#05x} otype={}",
            self.address,
            self.base,
            self.top(),
            self.permissions.bits(),
            self.object_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_untagged_and_zero() {
        let c = Capability::null();
        assert!(!c.tag());
        assert_eq!(0, c.base());
        assert_eq!(0, c.top());
        assert_eq!(OTYPE_UNSEALED, c.object_type());
    }

    #[test]
    fn roots_are_tagged_and_full_range() {
        for root in [Capability::memory_root(), Capability::executable_root(), Capability::sealing_root()] {
            assert!(root.tag());
            assert_eq!(0, root.base());
            assert_eq!(0xFFFF_FFFF, root.top());
            assert!(root.is_valid());
        }
    }

    #[test]
    fn set_bounds_covers_requested_range() {
        let mut c = Capability::memory_root();
        c.set_address(0x1000);
        let exact = c.set_bounds(0x1000, 0x200);
        assert!(c.base() <= 0x1000);
        assert!(0x1000 + 0x200 <= c.top());
        assert!(c.length() >= 0x200);
        assert!(exact || c.base() != 0x1000 || c.top() != 0x1200);
    }

    #[test]
    fn set_bounds_exact_for_power_of_two_aligned() {
        let mut c = Capability::memory_root();
        c.set_address(0);
        let exact = c.set_bounds(0, 0x200);
        assert!(exact);
        assert_eq!(0, c.base());
        assert_eq!(0x200, c.top());
    }

    #[test]
    fn out_of_range_address_invalidates_after_set_bounds() {
        let mut c = Capability::memory_root();
        c.set_address(0x5000);
        c.set_bounds(0x1000, 0x200);
        assert!(!c.tag());
    }

    #[test]
    fn roundtrip_compress_expand() {
        let mut c = Capability::memory_root();
        c.set_address(0x1000);
        c.set_bounds(0x1000, 0x200);
        assert!(c.tag());
        let word = c.compress();
        let expanded = Capability::expand(c.address(), word, c.tag());
        assert_eq!(c.address(), expanded.address());
        assert_eq!(c.base(), expanded.base());
        assert_eq!(c.top(), expanded.top());
        assert_eq!(c.permissions(), expanded.permissions());
        assert_eq!(c.object_type(), expanded.object_type());
        assert_eq!(c.tag(), expanded.tag());
    }

    #[test]
    fn clear_permissions_only_removes_bits() {
        let mut c = Capability::memory_root();
        let before = c.permissions();
        c.clear_permissions(Permission::Store as u16);
        assert!(!c.permissions().has(Permission::Store));
        assert!(before.is_subset_of(Permissions::from_bits_truncate(0xFFFF)));
        assert!(c.permissions().bits() & !before.bits() == 0);
    }

    #[test]
    fn seal_then_unseal_round_trips() {
        let mut target = Capability::memory_root();
        target.set_address(0x2000);
        target.set_bounds(0x2000, 0x100);

        let mut authority = Capability::sealing_root();
        authority.set_address(10);

        target.seal(&authority, 10).unwrap();
        assert!(target.tag());
        assert_eq!(10, target.object_type());
        assert!(target.is_sealed());

        target.unseal(&authority, 10).unwrap();
        assert!(target.tag());
        assert!(target.is_unsealed());
    }

    #[test]
    fn seal_fails_without_seal_permission() {
        let mut target = Capability::memory_root();
        target.set_bounds(0, 0x100);
        let mut authority = Capability::memory_root(); // lacks Seal
        authority.set_address(5);
        let result = target.seal(&authority, 9);
        assert_eq!(Err(SealError::AuthorityLacksPermission), result);
        assert!(!target.tag());
    }

    #[test]
    fn seal_rejects_otype_out_of_range_for_data_capability() {
        let mut target = Capability::memory_root();
        target.set_bounds(0, 0x100);
        let mut authority = Capability::sealing_root();
        authority.set_address(2); // valid range for data is 9..=15
        let result = target.seal(&authority, 2);
        assert_eq!(Err(SealError::ObjectTypeOutOfRange(2)), result);
    }

    #[test]
    fn unseal_requires_matching_authority_address() {
        let mut target = Capability::memory_root();
        target.set_bounds(0, 0x100);
        let mut sealing = Capability::sealing_root();
        sealing.set_address(9);
        target.seal(&sealing, 9).unwrap();

        let mut wrong_authority = Capability::sealing_root();
        wrong_authority.set_address(10);
        let result = target.unseal(&wrong_authority, 9);
        assert!(result.is_err());
        assert!(!target.tag());
    }

    #[test]
    fn representability_window_rejects_far_addresses() {
        let mut c = Capability::memory_root();
        c.set_address(0);
        c.set_bounds(0, 0x200);
        assert!(c.tag());
        c.set_address(0x10_0000);
        assert!(!c.tag());
    }

    #[test]
    fn is_memory_equal_requires_identical_bits() {
        let mut a = Capability::memory_root();
        a.set_address(0x10);
        let mut b = a;
        assert!(a.is_memory_equal(&b));
        b.set_address(0x20);
        assert!(!a.is_memory_equal(&b));
    }

    #[test]
    fn permission_format_roundtrips_for_each_shape() {
        use Permission::*;
        let cases: &[(u16, bool)] = &[
            (Seal as u16 | Unseal as u16, false),
            (Execute as u16, true),
            (Load as u16 | Store as u16 | LoadStoreCapability as u16, false),
            (Load as u16 | LoadStoreCapability as u16, false),
            (Store as u16 | LoadStoreCapability as u16, false),
            (Load as u16 | Store as u16, false),
        ];
        for &(bits, is_exec) in cases {
            let perms = Permissions::from_bits_truncate(bits);
            let compressed = compress_permissions(perms, is_exec);
            let (expanded, exec) = expand_permissions(compressed);
            assert_eq!(is_exec, exec);
            for p in [Seal, Unseal, Execute, Load, Store, LoadStoreCapability] {
                if perms.has(p) {
                    assert!(expanded.has(p), "expected {:?} to survive roundtrip", p);
                }
            }
        }
    }
}
