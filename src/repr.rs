use std::{fmt, mem::size_of};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Ref, Unaligned,
};

use crate::error::{error_corruption, Error};

/// 1-based, dense, monotonically increasing identifier of a logical record.
pub type Recno = u64;
/// Physical page address, as understood by the page cache.
pub type PageId = u32;
/// Position of an index entry within its page.
pub type SlotId = u32;
/// Per-page counter incremented on every structural change of the page.
pub type WriteGen = u64;

/// On-disk page type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Internal page: child references annotated with record counts.
    Internal = 1,
    /// Leaf with fixed-width cells, one per record.
    FixLeaf = 2,
    /// Leaf with variable-width items, one per record.
    VarLeaf = 3,
    /// Run-length-compressed leaf: one cell covers a run of identical records.
    RleLeaf = 4,
}

impl PageType {
    pub(crate) fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            1 => Ok(Self::Internal),
            2 => Ok(Self::FixLeaf),
            3 => Ok(Self::VarLeaf),
            4 => Ok(Self::RleLeaf),
            _ => Err(error_corruption!("unknown page type tag {tag}")),
        }
    }

    /// Whether the page holds record data rather than child references.
    #[inline]
    pub fn is_leaf(self) -> bool {
        !matches!(self, Self::Internal)
    }
}

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C)]
#[debug("{}", u32::from(*self))]
pub struct U24([u8; 3]);

impl From<u16> for U24 {
    fn from(value: u16) -> Self {
        let a = value.to_le_bytes();
        Self([a[0], a[1], 0])
    }
}

impl TryFrom<u32> for U24 {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let a = value.to_le_bytes();
        if a[3] == 0 {
            Ok(Self([a[0], a[1], a[2]]))
        } else {
            Err(())
        }
    }
}

impl From<U24> for u32 {
    fn from(v: U24) -> Self {
        u32::from_le_bytes([v.0[0], v.0[1], v.0[2], 0])
    }
}

impl From<U24> for usize {
    fn from(v: U24) -> Self {
        u32::from(v) as usize
    }
}

/// Flag bits carried by fixed-width and run-length cells.
#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C)]
pub struct CellFlags(u8);

bitflags::bitflags! {
    impl CellFlags: u8 {
        /// The on-page value is a tombstone.
        const DELETED = 0b1;
    }
}

/// Item type code of a variable-width cell holding live data.
pub(crate) const VAR_ITEM_DATA: u8 = 1;
/// Item type code of a variable-width cell deleted in place.
pub(crate) const VAR_ITEM_DEL: u8 = 2;

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C)]
pub struct PageHeader {
    pub checksum: U32,
    pub id: U32,
    pub span: U24,
    pub page_type: u8,
}

/// Header present on every page of a column-organized tree.
#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ColumnHeader {
    pub page_header: PageHeader,
    pub num_entries: U32,
    /// Record number of the first logical entry covered by this page.
    pub start_recno: U64,
    /// Total records covered by the subtree rooted here (the page itself,
    /// for leaves).
    pub record_count: U64,
    /// Width of fixed and run-length cell values. Zero elsewhere.
    pub fixed_data_len: U16,
}

/// Internal-page entry: a child subtree and the records it covers.
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C)]
pub struct ChildRef {
    pub records: U64,
    pub pid: U32,
    pub span: U24,
}

impl fmt::Debug for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChildRef")
            .field(&self.records.get())
            .field(&self.pid.get())
            .finish()
    }
}

/// Slot-array entry of variable-width and run-length leaves.
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CellOffset {
    /// Cell offset from the beginning of the page
    pub offset: U32,
}

impl fmt::Debug for CellOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CellOffset").field(&self.offset.get()).finish()
    }
}

/// Cell header of a variable-width leaf item.
#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct VarItem {
    pub kind: u8,
    pub len: U32,
}

/// Cell header of a run-length-compressed leaf entry.
#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RleCell {
    /// Number of consecutive records sharing this cell's value.
    pub repeat: U64,
    pub flags: CellFlags,
}

/// Assert that the start of the slice can be cast to a header
#[inline(always)]
pub(crate) fn header_cast<T, P: HeaderProvider + ?Sized>(slice: &P) -> &T
where
    T: FromBytes + KnownLayout + Immutable + Unaligned,
{
    slice.cast()
}

#[inline(always)]
pub(crate) fn header_cast_mut<T, P: HeaderProvider + ?Sized>(slice: &mut P) -> &mut T
where
    T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned,
{
    slice.cast_mut()
}

pub(crate) trait HeaderProvider {
    fn cast<T: FromBytes + KnownLayout + Immutable + Unaligned>(&self) -> &T;
    fn cast_mut<T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned>(&mut self) -> &mut T;
    fn split_off<T: FromBytes + KnownLayout>(&self) -> &[u8];
}

impl HeaderProvider for [u8] {
    #[inline]
    fn cast<T: FromBytes + KnownLayout + Immutable + Unaligned>(&self) -> &T {
        Ref::into_ref(Ref::<_, T>::from_prefix(self).unwrap().0)
    }

    #[inline]
    fn cast_mut<T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned>(&mut self) -> &mut T {
        Ref::into_mut(Ref::<_, T>::from_prefix(self).unwrap().0)
    }

    #[inline]
    fn split_off<T: FromBytes + KnownLayout>(&self) -> &[u8] {
        &self[size_of::<T>()..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u24_conversions() {
        assert_eq!(u32::from(U24::from(0x1234u16)), 0x1234);
        assert_eq!(u32::from(U24::try_from(0xABCDEFu32).unwrap()), 0xABCDEF);
        assert!(U24::try_from(0x01000000u32).is_err());
    }

    #[test]
    fn test_repr_sizes() {
        assert_eq!(size_of::<PageHeader>(), 12);
        assert_eq!(size_of::<ColumnHeader>(), 34);
        assert_eq!(size_of::<ChildRef>(), 15);
        assert_eq!(size_of::<VarItem>(), 5);
        assert_eq!(size_of::<RleCell>(), 9);
    }

    #[test]
    fn test_header_cast() {
        let mut buf = vec![0u8; 64];
        header_cast_mut::<ColumnHeader, _>(&mut buf[..]).start_recno = 42u64.into();
        assert_eq!(header_cast::<ColumnHeader, _>(&buf[..]).start_recno.get(), 42);
    }
}
