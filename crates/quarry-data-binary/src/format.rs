use byteorder::{ByteOrder, LittleEndian};
use quarry_data_model::ValueFlags;

/// Size of a value header; the file header is the root's value header.
pub const VALUE_HEADER_SIZE: usize = 16;

/// Total container size is padded to this alignment.
pub const FILE_ALIGN: u32 = 32;

/// Type kind discriminants as stored in the low bits of a type word.
pub mod kind {
    pub const UNKNOWN: u16 = 0;
    pub const INT: u16 = 1;
    pub const FLOAT: u16 = 2;
    pub const STRING: u16 = 3;
    pub const COMPOSITE: u16 = 4;
    pub const ARRAY: u16 = 5;
    pub const OPEN_ARRAY: u16 = 6;
    pub const REFERENCE: u16 = 7;
    pub const VIRTUAL: u16 = 8;
    pub const USER: u16 = 9;
}

/// Bit layout of the 2-byte type word preceding each type-table entry.
pub mod type_word {
    /// Kind mask (low four bits).
    pub const KIND_MASK: u16 = 0x000f;
    /// 8-byte slots/offsets instead of 4.
    pub const WIDE: u16 = 1 << 4;
    /// Int: two's complement.
    pub const SIGNED: u16 = 1 << 8;
    /// Int: an enum table follows the word.
    pub const ENUM: u16 = 1 << 10;
    /// Int: enum value ids are CRC32s, not name offsets.
    pub const ENUM_CRC_IDS: u16 = 1 << 13;
    /// String: low bit of the log2 code-unit size.
    pub const CHAR_SIZE_SHIFT: u16 = 8;
    /// String: mask of the log2 code-unit size field.
    pub const CHAR_SIZE_MASK: u16 = 0x3 << 8;
    /// Composite / enum int: member ids are CRC32s, not name offsets.
    pub const CRC_IDS: u16 = 1 << 8;
    /// User: the id is a CRC32, not a name offset.
    pub const USER_CRC_ID: u16 = 1 << 10;
    /// User: change-on-load.
    pub const USER_CHANGE: u16 = 1 << 11;
    /// User: defined by a loaded file.
    pub const USER_FROM_FILE: u16 = 1 << 9;
    /// User: eligible for writing into containers.
    pub const USER_WRITE: u16 = 1 << 13;
}

bitflags::bitflags! {
    /// Policy flags accepted by the writer and the loader, shared the way
    /// the two halves of the container code share one flag set.
    pub struct BinFlags: u32 {
        /// Emit data scalars big-endian.
        const BIG_ENDIAN = 1 << 0;
        /// Spell out identifiers as strings instead of CRC32s.
        const STRING_IDS = 1 << 1;
        /// Expand every user type inline in the type table.
        const WRITE_ALL_TYPES = 1 << 2;
        /// Expand user types flagged as writable; compact the rest to CRCs.
        const WRITE_READ_TYPES = 1 << 3;
        /// Emit enum value tables for enum-capable ints.
        const ENUMS = 1 << 4;
        /// Do not run the conversion engine over pointees.
        const DONT_CONVERT = 1 << 5;
        /// Eagerly load external references instead of keeping placeholders.
        const EXPAND_EXTERNALS = 1 << 6;
        /// Store external paths relative to the container's own path.
        const RELATIVE_PATHS = 1 << 7;
    }
}

/// A parsed value header.
#[derive(Clone, Copy, Debug)]
pub struct RawValue {
    /// Name offset or CRC32, per the `CRC_ID` flag; 0 means unnamed.
    pub id: u32,
    /// Type-table offset or CRC32, per the `CRC_TYPE` flag.
    pub ty: u32,
    /// Free word; the file header stores the total aligned size here.
    pub user: u32,
    /// Object flag bits.
    pub flags: ValueFlags,
    /// On-disk reference count; informational only.
    pub refs: u16,
}

impl RawValue {
    /// Decodes a header from `bytes` at `offset`.
    pub fn read(bytes: &[u8], offset: usize) -> Option<Self> {
        if bytes.len() < offset + VALUE_HEADER_SIZE {
            return None;
        }
        let at = &bytes[offset..];
        Some(Self {
            id: LittleEndian::read_u32(&at[0..4]),
            ty: LittleEndian::read_u32(&at[4..8]),
            user: LittleEndian::read_u32(&at[8..12]),
            flags: ValueFlags::from_bits_truncate(LittleEndian::read_u16(&at[12..14])),
            refs: LittleEndian::read_u16(&at[14..16]),
        })
    }

    /// Encodes this header into `bytes` at `offset`.
    pub fn write(&self, bytes: &mut [u8], offset: usize) {
        let at = &mut bytes[offset..offset + VALUE_HEADER_SIZE];
        LittleEndian::write_u32(&mut at[0..4], self.id);
        LittleEndian::write_u32(&mut at[4..8], self.ty);
        LittleEndian::write_u32(&mut at[8..12], self.user);
        LittleEndian::write_u16(&mut at[12..14], self.flags.bits());
        LittleEndian::write_u16(&mut at[14..16], self.refs);
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = RawValue {
            id: 0xdead_beef,
            ty: 48,
            user: 1024,
            flags: ValueFlags::CRC_ID | ValueFlags::BIG_ENDIAN,
            refs: 0,
        };
        let mut bytes = vec![0u8; VALUE_HEADER_SIZE];
        header.write(&mut bytes, 0);
        let back = RawValue::read(&bytes, 0).unwrap();
        assert_eq!(back.id, header.id);
        assert_eq!(back.ty, header.ty);
        assert_eq!(back.user, header.user);
        assert_eq!(back.flags, header.flags);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(RawValue::read(&[0u8; 8], 0).is_none());
        assert!(RawValue::read(&[0u8; 24], 16).is_none());
    }
}
