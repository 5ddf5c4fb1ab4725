//! Global pointers: the 128-bit metadata word plus 64-bit offset that
//! identifies one byte anywhere in the PGAS (spec §3, §6).
//!
//! The wire format is hand-packed with `byteorder` rather than relied upon
//! to fall out of `#[repr(C)]` struct layout, the way the teacher hand-packs
//! the active-message header (spec §6) instead of trusting a C struct's
//! layout across compilers.

use byteorder::{ByteOrder, LittleEndian};

use crate::team::TeamId;

/// Sentinel unit id meaning "no such unit" (spec §6).
pub const UNDEFINED_UNIT_ID: i32 = -1;

/// The process-local implicit segment, always present (spec §3 invariant b).
pub const SEGID_LOCAL: i16 = 0;

/// A 128-bit metadata word + 64-bit offset identifying one byte in the PGAS.
///
/// Copied freely; ownership of the backing memory belongs to the segment
/// table entry, never to the pointer itself (spec §9 "Design Notes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPtr {
    pub unit_id: i32,
    pub flags: u8,
    pub segid: i16,
    pub teamid: u16,
    pub offset_or_addr: u64,
}

/// Wire size in bytes: 16-byte metadata word + 8-byte offset (spec §6).
pub const WIRE_SIZE: usize = 24;

impl GlobalPtr {
    pub const NULL: GlobalPtr = GlobalPtr {
        unit_id: 0,
        flags: 0,
        segid: 0,
        teamid: 0,
        offset_or_addr: 0,
    };

    /// A null global pointer has every field zero and is distinguishable
    /// from any pointer obtained from `allocate`/`register` (spec §3 inv. e).
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn team(&self) -> TeamId {
        TeamId(self.teamid)
    }

    /// `segid == 0` denotes the process-local implicit segment (spec §3 inv. b).
    pub fn is_local_segment(&self) -> bool {
        self.segid == SEGID_LOCAL
    }

    /// Serialize to the little-endian wire layout described in spec §6.
    pub fn to_wire(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.unit_id);
        buf[4] = self.flags;
        LittleEndian::write_i16(&mut buf[6..8], self.segid);
        LittleEndian::write_u16(&mut buf[8..10], self.teamid);
        // buf[10..16] is the 56-bit reserved gap that pads the metadata word
        // out to 16 bytes before the offset field.
        LittleEndian::write_u64(&mut buf[16..24], self.offset_or_addr);
        buf
    }

    pub fn from_wire(buf: &[u8; WIRE_SIZE]) -> Self {
        GlobalPtr {
            unit_id: LittleEndian::read_i32(&buf[0..4]),
            flags: buf[4],
            segid: LittleEndian::read_i16(&buf[6..8]),
            teamid: LittleEndian::read_u16(&buf[8..10]),
            offset_or_addr: LittleEndian::read_u64(&buf[16..24]),
        }
    }
}

impl Default for GlobalPtr {
    fn default() -> Self {
        Self::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointer_is_all_zero() {
        assert!(GlobalPtr::default().is_null());
        assert_eq!(GlobalPtr::NULL.to_wire(), [0u8; WIRE_SIZE]);
    }

    #[test]
    fn wire_round_trips() {
        let gptr = GlobalPtr {
            unit_id: 7,
            flags: 0xAB,
            segid: -3,
            teamid: 42,
            offset_or_addr: 0xdead_beef_1234_5678,
        };
        let wire = gptr.to_wire();
        assert_eq!(GlobalPtr::from_wire(&wire), gptr);
        assert!(!gptr.is_null());
    }

    #[test]
    fn local_segment_is_segid_zero() {
        let gptr = GlobalPtr {
            segid: SEGID_LOCAL,
            ..GlobalPtr::NULL
        };
        assert!(gptr.is_local_segment());
    }
}
