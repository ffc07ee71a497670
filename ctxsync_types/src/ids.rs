//! Identifiers for communicators, devices and NIC ports
//!
//! Ports are individually addressable in the command format through a
//! 64-bit membership mask, so a device may expose at most
//! [`PortMask::MAX_PORTS`] ports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical communicator identifier.
///
/// Communicator ids are dense small integers handed out by the collective
/// layer; the LRU table indexes its entry arena by them directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommId(pub u32);

impl CommId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

/// Remote device (peer) identifier within a scale-up or scale-out domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Physical NIC port on the local device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(pub u8);

impl PortId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Singleton mask containing only this port
    #[inline]
    pub const fn mask(self) -> PortMask {
        if (self.0 as u32) < PortMask::MAX_PORTS {
            PortMask(1u64 << self.0)
        } else {
            PortMask::EMPTY
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// Bitset of ports. Bit `n` set means port `n` is a member.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PortMask(pub u64);

impl PortMask {
    /// Number of ports a mask can address
    pub const MAX_PORTS: u32 = 64;

    pub const EMPTY: PortMask = PortMask(0);

    /// Mask with ports `0..count` set
    pub const fn first(count: u32) -> Self {
        if count >= Self::MAX_PORTS {
            PortMask(u64::MAX)
        } else {
            PortMask((1u64 << count) - 1)
        }
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, port: PortId) -> bool {
        self.0 & port.mask().0 != 0
    }

    #[inline]
    pub fn insert(&mut self, port: PortId) {
        self.0 |= port.mask().0;
    }

    #[inline]
    pub fn remove(&mut self, port: PortId) {
        self.0 &= !port.mask().0;
    }

    #[inline]
    pub const fn union(self, other: PortMask) -> PortMask {
        PortMask(self.0 | other.0)
    }

    #[inline]
    pub const fn intersection(self, other: PortMask) -> PortMask {
        PortMask(self.0 & other.0)
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest-numbered member, if any
    #[inline]
    pub fn first_port(self) -> Option<PortId> {
        if self.0 == 0 {
            None
        } else {
            Some(PortId(self.0.trailing_zeros() as u8))
        }
    }

    /// Iterate member ports in ascending order
    pub fn iter(self) -> PortMaskIter {
        PortMaskIter(self.0)
    }
}

impl FromIterator<PortId> for PortMask {
    fn from_iter<I: IntoIterator<Item = PortId>>(iter: I) -> Self {
        let mut mask = PortMask::EMPTY;
        for port in iter {
            mask.insert(port);
        }
        mask
    }
}

impl fmt::Display for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Iterator over the ports of a [`PortMask`]
pub struct PortMaskIter(u64);

impl Iterator for PortMaskIter {
    type Item = PortId;

    fn next(&mut self) -> Option<PortId> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(PortId(bit as u8))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for PortMaskIter {}
