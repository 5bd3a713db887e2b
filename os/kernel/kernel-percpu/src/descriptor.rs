//! # Flat 64-bit segment descriptor table
//!
//! Every core installs the same five code/data descriptors during early
//! bring-up. Base and limit are ignored in long mode for code and data, but
//! the table keeps the conventional flat encoding (limit `0xFFFFF`, 4 KiB
//! granularity) so the raw values match what bootloaders and debuggers expect.
//!
//! The per-core task state segment is not part of this table; the
//! architecture backend appends it when it loads the table.

use bitfield_struct::bitfield;

/// Bit layout shared by long-mode code and data descriptors.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct SegmentDescriptor {
    pub limit_lo: u16, // [15:0]
    pub base_lo: u16,  // [31:16]
    pub base_mid: u8,  // [39:32]
    #[bits(4)]
    pub typ: u8, // [43:40]
    pub s: bool, // [44] code/data (not system)
    #[bits(2)]
    pub dpl: u8, // [46:45]
    pub p: bool, // [47]
    #[bits(4)]
    pub limit_hi: u8, // [51:48]
    pub avl: bool,    // [52]
    pub l: bool,      // [53] 64-bit code
    pub db: bool,     // [54]
    pub g: bool,      // [55] 4 KiB granularity
    pub base_hi: u8,  // [63:56]
}

/// Execute + read.
const TYPE_CODE: u8 = 0b1010;
/// Read + write.
const TYPE_DATA: u8 = 0b0010;

impl SegmentDescriptor {
    const fn flat() -> Self {
        Self::new()
            .with_limit_lo(0xFFFF)
            .with_limit_hi(0xF)
            .with_s(true)
            .with_p(true)
            .with_g(true)
    }

    /// 64-bit code segment (`L=1`, `DB=0`) at privilege `dpl`.
    #[must_use]
    pub const fn code(dpl: u8) -> Self {
        Self::flat()
            .with_typ(TYPE_CODE)
            .with_dpl(dpl & 0b11)
            .with_l(true)
    }

    /// Data/stack segment at privilege `dpl`.
    ///
    /// The kernel data segment carries `DB=1`; the user one does not. Long
    /// mode ignores the bit for data, the encodings are kept as-is.
    #[must_use]
    pub const fn data(dpl: u8) -> Self {
        Self::flat()
            .with_typ(TYPE_DATA)
            .with_dpl(dpl & 0b11)
            .with_db(dpl == 0)
    }

    #[must_use]
    pub const fn is_code(&self) -> bool {
        self.typ() & 0b1000 != 0
    }
}

/// Offset of an entry in the table, with the requested privilege in the low bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Selector(pub u16);

impl Selector {
    #[must_use]
    pub const fn new(index: u16, rpl: u8) -> Self {
        Self((index << 3) | u16::from_le_bytes([rpl & 0b11, 0]))
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0 >> 3)
    }

    #[must_use]
    pub const fn rpl(self) -> u8 {
        self.0.to_le_bytes()[0] & 0b11
    }
}

pub const KERNEL_CS: Selector = Selector::new(1, 0);
pub const KERNEL_DS: Selector = Selector::new(2, 0);
pub const USER_CS: Selector = Selector::new(3, 3);
pub const USER_DS: Selector = Selector::new(4, 3);

pub const DESCRIPTOR_COUNT: usize = 5;

/// Null, kernel code, kernel data, user code, user data; in that order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C, align(8))]
pub struct DescriptorTable {
    entries: [SegmentDescriptor; DESCRIPTOR_COUNT],
}

impl DescriptorTable {
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            entries: [
                SegmentDescriptor::new(),
                SegmentDescriptor::code(0),
                SegmentDescriptor::data(0),
                SegmentDescriptor::code(3),
                SegmentDescriptor::data(3),
            ],
        }
    }

    #[must_use]
    pub const fn entries(&self) -> &[SegmentDescriptor; DESCRIPTOR_COUNT] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, selector: Selector) -> Option<SegmentDescriptor> {
        self.entries.get(selector.index()).copied()
    }

    /// Raw encodings, in table order.
    pub fn raw(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|d| d.into_bits())
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::standard()
    }
}

const _: () = {
    assert!(size_of::<SegmentDescriptor>() == 8);
    assert!(size_of::<DescriptorTable>() == 8 * DESCRIPTOR_COUNT);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_encodings() {
        let raw: Vec<u64> = DescriptorTable::standard().raw().collect();
        assert_eq!(
            raw,
            [
                0,
                0x00AF_9A00_0000_FFFF,
                0x00CF_9200_0000_FFFF,
                0x00AF_FA00_0000_FFFF,
                0x008F_F200_0000_FFFF,
            ]
        );
    }

    #[test]
    fn selectors_point_at_matching_privilege() {
        let table = DescriptorTable::standard();
        for (sel, dpl, code) in [
            (KERNEL_CS, 0, true),
            (KERNEL_DS, 0, false),
            (USER_CS, 3, true),
            (USER_DS, 3, false),
        ] {
            let desc = table.get(sel).unwrap();
            assert_eq!(desc.dpl(), dpl);
            assert_eq!(sel.rpl(), dpl);
            assert_eq!(desc.is_code(), code);
        }
        assert_eq!(USER_CS.0, 0x1B);
        assert_eq!(USER_DS.0, 0x23);
    }

    #[test]
    fn code_segments_are_long_mode() {
        let code = SegmentDescriptor::code(3);
        assert!(code.l());
        assert!(!code.db());
        assert!(code.p());
    }
}
