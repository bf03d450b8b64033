use std::mem::size_of;

use zerocopy::{IntoBytes, Ref};

use crate::{
    bytes::Bytes,
    error::{error_corruption, error_validation, Error},
    page::{checksum_of, Page},
    repr::{
        header_cast, header_cast_mut, CellFlags, CellOffset, ChildRef, ColumnHeader,
        HeaderProvider, PageId, PageType, Recno, RleCell, SlotId, VarItem, VAR_ITEM_DATA,
        VAR_ITEM_DEL,
    },
    PAGE_SIZE,
};

const HEADER_SIZE: usize = size_of::<ColumnHeader>();

/// Typed read-only view over a page image, selected by the page type tag.
///
/// Pages are fully validated when loaded ([Page::from_bytes]), so the view
/// accessors index the image directly.
pub(crate) enum TypedNode<'p> {
    Internal(InternalNode<'p>),
    Fix(FixLeaf<'p>),
    Var(VarLeaf<'p>),
    Rle(RleLeaf<'p>),
}

impl<'p> TypedNode<'p> {
    pub fn new(page_type: PageType, data: &'p [u8]) -> Self {
        match page_type {
            PageType::Internal => Self::Internal(InternalNode::new(data)),
            PageType::FixLeaf => Self::Fix(FixLeaf::new(data)),
            PageType::VarLeaf => Self::Var(VarLeaf::new(data)),
            PageType::RleLeaf => Self::Rle(RleLeaf::new(data)),
        }
    }
}

pub(crate) struct InternalNode<'p> {
    children: &'p [ChildRef],
}

impl<'p> InternalNode<'p> {
    fn new(data: &'p [u8]) -> Self {
        let header = header_cast::<ColumnHeader, _>(data);
        let num = header.num_entries.get() as usize;
        let region = &data[HEADER_SIZE..HEADER_SIZE + num * size_of::<ChildRef>()];
        Self {
            children: Ref::into_ref(Ref::<_, [ChildRef]>::from_bytes(region).unwrap()),
        }
    }

    /// Picks the child subtree containing the record `record_cnt` records
    /// past this page's starting record.
    ///
    /// Subtracts per entry instead of summing so counts near `u64::MAX`
    /// can't overflow. `None` means the children don't cover the target,
    /// which violates the count invariant.
    pub fn search_records(&self, mut record_cnt: u64) -> Option<(SlotId, &'p ChildRef)> {
        for (i, child) in self.children.iter().enumerate() {
            let records = child.records.get();
            if record_cnt < records {
                return Some((i as SlotId, child));
            }
            record_cnt -= records;
        }
        None
    }
}

pub(crate) struct FixLeaf<'p> {
    data_len: usize,
    cells: &'p [u8],
}

impl<'p> FixLeaf<'p> {
    fn new(data: &'p [u8]) -> Self {
        let header = header_cast::<ColumnHeader, _>(data);
        Self {
            data_len: header.fixed_data_len.get() as usize,
            cells: data.split_off::<ColumnHeader>(),
        }
    }

    /// The cell at `slot`: flags byte plus the fixed-width value.
    pub fn cell(&self, slot: SlotId) -> (CellFlags, &'p [u8]) {
        let unit = 1 + self.data_len;
        let cell = &self.cells[slot as usize * unit..][..unit];
        (CellFlags::from_bits_retain(cell[0]), &cell[1..])
    }
}

pub(crate) struct VarLeaf<'p> {
    offsets: &'p [CellOffset],
    page: &'p [u8],
}

impl<'p> VarLeaf<'p> {
    fn new(data: &'p [u8]) -> Self {
        Self {
            offsets: cell_offsets(data),
            page: data,
        }
    }

    /// The item at `slot`: type code plus the inline value bytes.
    pub fn item(&self, slot: SlotId) -> (u8, &'p [u8]) {
        let off = self.offsets[slot as usize].offset.get() as usize;
        let item = header_cast::<VarItem, _>(&self.page[off..]);
        let start = off + size_of::<VarItem>();
        (item.kind, &self.page[start..start + item.len.get() as usize])
    }
}

pub(crate) struct RleLeaf<'p> {
    data_len: usize,
    offsets: &'p [CellOffset],
    page: &'p [u8],
}

impl<'p> RleLeaf<'p> {
    fn new(data: &'p [u8]) -> Self {
        let header = header_cast::<ColumnHeader, _>(data);
        Self {
            data_len: header.fixed_data_len.get() as usize,
            offsets: cell_offsets(data),
            page: data,
        }
    }

    /// The run cell at `slot`: repeat count, flags and the shared value.
    pub fn run(&self, slot: SlotId) -> (u64, CellFlags, &'p [u8]) {
        let off = self.offsets[slot as usize].offset.get() as usize;
        let cell = header_cast::<RleCell, _>(&self.page[off..]);
        let start = off + size_of::<RleCell>();
        (
            cell.repeat.get(),
            cell.flags,
            &self.page[start..start + self.data_len],
        )
    }

    /// Locates the run covering the record `record_cnt` records past this
    /// page's starting record, returning the slot and the within-run offset.
    ///
    /// Same per-entry subtraction as [InternalNode::search_records].
    pub fn search_runs(&self, mut record_cnt: u64) -> Option<(SlotId, u64)> {
        for slot in 0..self.offsets.len() {
            let (repeat, _, _) = self.run(slot as SlotId);
            if record_cnt < repeat {
                return Some((slot as SlotId, record_cnt));
            }
            record_cnt -= repeat;
        }
        None
    }
}

fn cell_offsets(data: &[u8]) -> &[CellOffset] {
    let header = header_cast::<ColumnHeader, _>(data);
    let num = header.num_entries.get() as usize;
    let region = &data[HEADER_SIZE..HEADER_SIZE + num * size_of::<CellOffset>()];
    Ref::into_ref(Ref::<_, [CellOffset]>::from_bytes(region).unwrap())
}

/// Structural validation of a page image, run once at load.
pub(crate) fn validate_page(data: &[u8], page_type: PageType) -> Result<(), Error> {
    let header = header_cast::<ColumnHeader, _>(data);
    let id = header.page_header.id.get();
    let num = header.num_entries.get() as usize;
    let record_count = header.record_count.get();
    let fixed_len = header.fixed_data_len.get() as usize;
    let len = data.len();

    let check_region = |entry_size: usize| {
        if HEADER_SIZE + num.checked_mul(entry_size).unwrap_or(usize::MAX) > len {
            Err(error_corruption!("Page {id} entries exceed the page image"))
        } else {
            Ok(())
        }
    };

    match page_type {
        PageType::Internal => {
            check_region(size_of::<ChildRef>())?;
            if num == 0 {
                return Err(error_corruption!("Internal page {id} has no children"));
            }
            let mut total = 0u64;
            for child in InternalNode::new(data).children {
                if child.pid.get() == 0 || u32::from(child.span) == 0 {
                    return Err(error_corruption!("Page {id} has a null child reference"));
                }
                total = total
                    .checked_add(child.records.get())
                    .ok_or_else(|| error_corruption!("Page {id} child record counts overflow"))?;
            }
            if total != record_count {
                return Err(error_corruption!(
                    "Page {id} child record counts sum to {total}, header says {record_count}"
                ));
            }
        }
        PageType::FixLeaf => {
            check_region(1 + fixed_len)?;
            if record_count != num as u64 {
                return Err(error_corruption!(
                    "Fixed leaf {id} has {num} cells for {record_count} records"
                ));
            }
        }
        PageType::VarLeaf => {
            check_region(size_of::<CellOffset>())?;
            if record_count != num as u64 {
                return Err(error_corruption!(
                    "Variable leaf {id} has {num} items for {record_count} records"
                ));
            }
            for (slot, cell) in cell_offsets(data).iter().enumerate() {
                let off = cell.offset.get() as usize;
                if off + size_of::<VarItem>() > len {
                    return Err(error_corruption!("Leaf {id} item {slot} exceeds the page"));
                }
                let item = header_cast::<VarItem, _>(&data[off..]);
                if !matches!(item.kind, VAR_ITEM_DATA | VAR_ITEM_DEL) {
                    return Err(error_corruption!(
                        "Leaf {id} item {slot} has unknown type {}",
                        item.kind
                    ));
                }
                if off + size_of::<VarItem>() + item.len.get() as usize > len {
                    return Err(error_corruption!("Leaf {id} item {slot} exceeds the page"));
                }
            }
        }
        PageType::RleLeaf => {
            check_region(size_of::<CellOffset>())?;
            let mut total = 0u64;
            for (slot, cell) in cell_offsets(data).iter().enumerate() {
                let off = cell.offset.get() as usize;
                if off + size_of::<RleCell>() + fixed_len > len {
                    return Err(error_corruption!("Leaf {id} run {slot} exceeds the page"));
                }
                let run = header_cast::<RleCell, _>(&data[off..]);
                if run.repeat.get() == 0 {
                    return Err(error_corruption!("Leaf {id} run {slot} repeats zero times"));
                }
                total = total
                    .checked_add(run.repeat.get())
                    .ok_or_else(|| error_corruption!("Leaf {id} repeat counts overflow"))?;
            }
            if total != record_count {
                return Err(error_corruption!(
                    "Leaf {id} repeat counts sum to {total}, header says {record_count}"
                ));
            }
        }
    }
    Ok(())
}

/// Builder for internal pages.
///
/// Page builders belong to the reconciliation path that writes tree pages
/// out; the search core only reads the images they produce.
#[derive(Debug)]
pub struct InternalBuilder {
    id: PageId,
    start_recno: Recno,
    children: Vec<(u64, PageId, PageId)>,
}

impl InternalBuilder {
    /// New internal page with the given address and starting record number.
    pub fn new(id: PageId, start_recno: Recno) -> Self {
        Self {
            id,
            start_recno,
            children: Vec::new(),
        }
    }

    /// Appends a child subtree covering `records` records.
    pub fn child(&mut self, records: u64, pid: PageId, span: PageId) -> &mut Self {
        self.children.push((records, pid, span));
        self
    }

    /// Assembles and validates the page.
    pub fn build(&self) -> Result<Page, Error> {
        let mut record_count = 0u64;
        let mut buf = vec![0u8; HEADER_SIZE];
        for &(records, pid, span) in &self.children {
            record_count = record_count
                .checked_add(records)
                .ok_or_else(|| error_validation!("Child record counts overflow"))?;
            let child = ChildRef {
                records: records.into(),
                pid: pid.into(),
                span: span
                    .try_into()
                    .map_err(|_| error_validation!("Child span {span} exceeds 24 bits"))?,
            };
            buf.extend_from_slice(child.as_bytes());
        }
        finish_page(
            buf,
            self.id,
            PageType::Internal,
            self.start_recno,
            record_count,
            self.children.len() as u32,
            0,
        )
    }
}

/// Builder for fixed-width leaves.
#[derive(Debug)]
pub struct FixLeafBuilder {
    id: PageId,
    start_recno: Recno,
    data_len: u16,
    cells: Vec<(bool, Vec<u8>)>,
}

impl FixLeafBuilder {
    /// New fixed-width leaf holding values of exactly `data_len` bytes.
    pub fn new(id: PageId, start_recno: Recno, data_len: u16) -> Self {
        Self {
            id,
            start_recno,
            data_len,
            cells: Vec::new(),
        }
    }

    /// Appends a live cell.
    pub fn cell(&mut self, value: &[u8]) -> &mut Self {
        self.cells.push((false, value.to_vec()));
        self
    }

    /// Appends a cell deleted in place.
    pub fn deleted_cell(&mut self, value: &[u8]) -> &mut Self {
        self.cells.push((true, value.to_vec()));
        self
    }

    /// Assembles and validates the page.
    pub fn build(&self) -> Result<Page, Error> {
        let mut buf = vec![0u8; HEADER_SIZE];
        for (deleted, value) in &self.cells {
            if value.len() != self.data_len as usize {
                return Err(error_validation!(
                    "Cell value length {} doesn't match the fixed width {}",
                    value.len(),
                    self.data_len
                ));
            }
            let flags = if *deleted {
                CellFlags::DELETED
            } else {
                CellFlags::empty()
            };
            buf.push(flags.bits());
            buf.extend_from_slice(value);
        }
        finish_page(
            buf,
            self.id,
            PageType::FixLeaf,
            self.start_recno,
            self.cells.len() as u64,
            self.cells.len() as u32,
            self.data_len,
        )
    }
}

/// Builder for variable-width leaves.
#[derive(Debug)]
pub struct VarLeafBuilder {
    id: PageId,
    start_recno: Recno,
    items: Vec<Option<Vec<u8>>>,
}

impl VarLeafBuilder {
    /// New variable-width leaf.
    pub fn new(id: PageId, start_recno: Recno) -> Self {
        Self {
            id,
            start_recno,
            items: Vec::new(),
        }
    }

    /// Appends a live item.
    pub fn item(&mut self, value: &[u8]) -> &mut Self {
        self.items.push(Some(value.to_vec()));
        self
    }

    /// Appends an item deleted in place.
    pub fn deleted_item(&mut self) -> &mut Self {
        self.items.push(None);
        self
    }

    /// Assembles and validates the page.
    pub fn build(&self) -> Result<Page, Error> {
        let num = self.items.len();
        let mut buf = vec![0u8; HEADER_SIZE + num * size_of::<CellOffset>()];
        for (slot, item) in self.items.iter().enumerate() {
            let off = buf.len() as u32;
            let slot_region = &mut buf[HEADER_SIZE + slot * size_of::<CellOffset>()..];
            header_cast_mut::<CellOffset, _>(slot_region).offset = off.into();
            let (kind, value) = match item {
                Some(value) => (VAR_ITEM_DATA, value.as_slice()),
                None => (VAR_ITEM_DEL, &[][..]),
            };
            let header = VarItem {
                kind,
                len: (value.len() as u32).into(),
            };
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(value);
        }
        finish_page(
            buf,
            self.id,
            PageType::VarLeaf,
            self.start_recno,
            num as u64,
            num as u32,
            0,
        )
    }
}

/// Builder for run-length-compressed leaves.
#[derive(Debug)]
pub struct RleLeafBuilder {
    id: PageId,
    start_recno: Recno,
    data_len: u16,
    runs: Vec<(u64, bool, Vec<u8>)>,
}

impl RleLeafBuilder {
    /// New run-length leaf holding values of exactly `data_len` bytes.
    pub fn new(id: PageId, start_recno: Recno, data_len: u16) -> Self {
        Self {
            id,
            start_recno,
            data_len,
            runs: Vec::new(),
        }
    }

    /// Appends a run of `repeat` consecutive identical records.
    pub fn run(&mut self, repeat: u64, value: &[u8]) -> &mut Self {
        self.runs.push((repeat, false, value.to_vec()));
        self
    }

    /// Appends a run deleted in place.
    pub fn deleted_run(&mut self, repeat: u64, value: &[u8]) -> &mut Self {
        self.runs.push((repeat, true, value.to_vec()));
        self
    }

    /// Assembles and validates the page.
    pub fn build(&self) -> Result<Page, Error> {
        let num = self.runs.len();
        let mut record_count = 0u64;
        let mut buf = vec![0u8; HEADER_SIZE + num * size_of::<CellOffset>()];
        for (slot, (repeat, deleted, value)) in self.runs.iter().enumerate() {
            if value.len() != self.data_len as usize {
                return Err(error_validation!(
                    "Run value length {} doesn't match the fixed width {}",
                    value.len(),
                    self.data_len
                ));
            }
            record_count = record_count
                .checked_add(*repeat)
                .ok_or_else(|| error_validation!("Run repeat counts overflow"))?;
            let off = buf.len() as u32;
            let slot_region = &mut buf[HEADER_SIZE + slot * size_of::<CellOffset>()..];
            header_cast_mut::<CellOffset, _>(slot_region).offset = off.into();
            let flags = if *deleted {
                CellFlags::DELETED
            } else {
                CellFlags::empty()
            };
            let cell = RleCell {
                repeat: (*repeat).into(),
                flags,
            };
            buf.extend_from_slice(cell.as_bytes());
            buf.extend_from_slice(value);
        }
        finish_page(
            buf,
            self.id,
            PageType::RleLeaf,
            self.start_recno,
            record_count,
            num as u32,
            self.data_len,
        )
    }
}

fn finish_page(
    mut buf: Vec<u8>,
    id: PageId,
    page_type: PageType,
    start_recno: Recno,
    record_count: u64,
    num_entries: u32,
    fixed_data_len: u16,
) -> Result<Page, Error> {
    let span = buf.len().div_ceil(PAGE_SIZE as usize).max(1);
    buf.resize(span * PAGE_SIZE as usize, 0);
    {
        let header = header_cast_mut::<ColumnHeader, _>(&mut buf[..]);
        header.page_header.id = id.into();
        header.page_header.span = (span as u32)
            .try_into()
            .map_err(|_| error_validation!("Page span {span} exceeds 24 bits"))?;
        header.page_header.page_type = page_type as u8;
        header.num_entries = num_entries.into();
        header.start_recno = start_recno.into();
        header.record_count = record_count.into();
        header.fixed_data_len = fixed_data_len.into();
    }
    let checksum = checksum_of(&buf);
    header_cast_mut::<ColumnHeader, _>(&mut buf[..])
        .page_header
        .checksum = checksum.into();
    Page::from_bytes(Bytes::from_vec(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repr::U24;

    #[test]
    fn test_fix_leaf_decode() {
        let mut b = FixLeafBuilder::new(7, 100, 4);
        b.cell(b"aaaa").deleted_cell(b"bbbb").cell(b"cccc");
        let page = b.build().unwrap();
        assert_eq!(page.id(), 7);
        assert_eq!(page.start_recno(), 100);
        assert_eq!(page.record_count(), 3);
        let TypedNode::Fix(leaf) = page.typed() else {
            panic!()
        };
        assert_eq!(leaf.cell(0), (CellFlags::empty(), &b"aaaa"[..]));
        assert_eq!(leaf.cell(1), (CellFlags::DELETED, &b"bbbb"[..]));
        assert_eq!(leaf.cell(2).1, b"cccc");
    }

    #[test]
    fn test_var_leaf_decode() {
        let mut b = VarLeafBuilder::new(8, 1);
        b.item(b"first").deleted_item().item(b"");
        let page = b.build().unwrap();
        let TypedNode::Var(leaf) = page.typed() else {
            panic!()
        };
        assert_eq!(leaf.item(0), (VAR_ITEM_DATA, &b"first"[..]));
        assert_eq!(leaf.item(1), (VAR_ITEM_DEL, &b""[..]));
        assert_eq!(leaf.item(2), (VAR_ITEM_DATA, &b""[..]));
    }

    #[test]
    fn test_rle_search_runs() {
        let mut b = RleLeafBuilder::new(9, 1, 2);
        b.run(3, b"ab").deleted_run(1, b"cd").run(5, b"ef");
        let page = b.build().unwrap();
        assert_eq!(page.record_count(), 9);
        let TypedNode::Rle(leaf) = page.typed() else {
            panic!()
        };
        assert_eq!(leaf.search_runs(0), Some((0, 0)));
        assert_eq!(leaf.search_runs(2), Some((0, 2)));
        assert_eq!(leaf.search_runs(3), Some((1, 0)));
        assert_eq!(leaf.search_runs(4), Some((2, 0)));
        assert_eq!(leaf.search_runs(8), Some((2, 4)));
        assert_eq!(leaf.search_runs(9), None);
        let (repeat, flags, value) = leaf.run(1);
        assert_eq!((repeat, flags, value), (1, CellFlags::DELETED, &b"cd"[..]));
    }

    #[test]
    fn test_internal_search_records() {
        let mut b = InternalBuilder::new(1, 1);
        b.child(10, 2, 1).child(5, 3, 1).child(u64::MAX - 20, 4, 1);
        let page = b.build().unwrap();
        assert_eq!(page.record_count(), u64::MAX - 5);
        let TypedNode::Internal(node) = page.typed() else {
            panic!()
        };
        let (slot, child) = node.search_records(9).unwrap();
        assert_eq!((slot, child.pid.get()), (0, 2));
        let (slot, child) = node.search_records(10).unwrap();
        assert_eq!((slot, child.pid.get()), (1, 3));
        let (slot, child) = node.search_records(u64::MAX - 6).unwrap();
        assert_eq!((slot, child.pid.get()), (2, 4));
        assert!(node.search_records(u64::MAX - 5).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_pages() {
        // unknown page type tag
        let mut b = FixLeafBuilder::new(1, 1, 1);
        b.cell(b"x");
        let page = b.build().unwrap();
        let mut data = page.data().to_vec();
        header_cast_mut::<ColumnHeader, _>(&mut data[..])
            .page_header
            .page_type = 99;
        assert!(matches!(
            Page::from_bytes(Bytes::from_vec(data)),
            Err(Error::Corruption(_))
        ));

        // internal child counts not summing to the header count
        let mut b = InternalBuilder::new(1, 1);
        b.child(10, 2, 1);
        let page = b.build().unwrap();
        let mut data = page.data().to_vec();
        header_cast_mut::<ColumnHeader, _>(&mut data[..]).record_count = 11u64.into();
        assert!(matches!(
            Page::from_bytes(Bytes::from_vec(data)),
            Err(Error::Corruption(_))
        ));

        // bad span
        let mut data = page.data().to_vec();
        header_cast_mut::<ColumnHeader, _>(&mut data[..])
            .page_header
            .span = U24::from(9u16);
        assert!(Page::from_bytes(Bytes::from_vec(data)).is_err());
    }
}
