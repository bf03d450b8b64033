use std::{
    mem::size_of,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use triomphe::Arc;

use crate::{
    bytes::Bytes,
    error::{error_validation, io_invalid_data, Error},
    node::{self, TypedNode},
    overlay::{Expansion, OverlayTable, ReplValue, Replacement},
    repr::{header_cast, ColumnHeader, PageId, PageType, Recno, SlotId, WriteGen},
    PAGE_SIZE,
};

/// A page of a column-organized tree: the immutable on-disk image plus the
/// in-memory state layered over it (write generation, overlay table).
///
/// Pages are owned by the [crate::PageCache]; searches borrow pinned
/// references. The image is never rewritten in place; updates land in the
/// overlay table and bump the write generation.
pub struct Page {
    raw_data: Bytes,
    page_type: PageType,
    write_gen: AtomicU64,
    overlays: RwLock<OverlayTable>,
}

impl Page {
    /// Builds a `Page` from a raw page image, validating the header and the
    /// per-type structure of the index entries.
    pub fn from_bytes(raw_data: Bytes) -> Result<Self, Error> {
        if raw_data.is_empty() || !raw_data.len().is_multiple_of(PAGE_SIZE as usize) {
            return Err(io_invalid_data!("Bad page len {}", raw_data.len()));
        }
        let header = header_cast::<ColumnHeader, _>(&raw_data[..]);
        let span = raw_data.len() / PAGE_SIZE as usize;
        if usize::from(header.page_header.span) != span {
            return Err(io_invalid_data!(
                "Page {} header span {:?} doesn't match image size {span}",
                header.page_header.id.get(),
                header.page_header.span,
            ));
        }
        let page_type = PageType::from_tag(header.page_header.page_type)?;
        node::validate_page(&raw_data, page_type)?;
        Ok(Self {
            raw_data,
            page_type,
            write_gen: AtomicU64::new(1),
            overlays: RwLock::default(),
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> &ColumnHeader {
        header_cast(&self.raw_data[..])
    }

    /// Physical page address.
    #[inline]
    pub fn id(&self) -> PageId {
        self.header().page_header.id.get()
    }

    /// Page image size in [PAGE_SIZE] units.
    #[inline]
    pub fn span(&self) -> PageId {
        (self.raw_data.len() / PAGE_SIZE as usize) as PageId
    }

    /// The page's type tag.
    #[inline]
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Record number of the page's first logical entry.
    #[inline]
    pub fn start_recno(&self) -> Recno {
        self.header().start_recno.get()
    }

    /// Records covered by the subtree rooted at this page.
    #[inline]
    pub fn record_count(&self) -> u64 {
        self.header().record_count.get()
    }

    /// Current write generation. Sampled by searches before any
    /// interpretation of the page contents and returned to the caller as an
    /// optimistic-concurrency stamp.
    #[inline]
    pub fn write_gen(&self) -> WriteGen {
        self.write_gen.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn data(&self) -> &[u8] {
        self.raw_data.as_ref()
    }

    #[inline]
    pub(crate) fn raw(&self) -> &Bytes {
        &self.raw_data
    }

    #[inline]
    pub(crate) fn typed(&self) -> TypedNode<'_> {
        TypedNode::new(self.page_type, self.data())
    }

    fn calc_checksum(&self) -> u32 {
        checksum_of(self.data())
    }

    /// Verifies the stored page checksum. `None` if the page was written
    /// without one.
    pub fn check_checksum(&self) -> Option<bool> {
        let stored = self.header().page_header.checksum.get();
        if stored == u32::default() {
            None
        } else {
            Some(stored == self.calc_checksum())
        }
    }

    /// Current replacement chain head for a fixed/variable leaf slot.
    pub fn replacement(&self, slot: SlotId) -> Option<Arc<Replacement>> {
        self.overlays.read().replacement(slot).cloned()
    }

    /// Current expansion chain head for a run-length leaf slot.
    pub fn expansion(&self, slot: SlotId) -> Option<Arc<Expansion>> {
        self.overlays.read().expansion(slot).cloned()
    }

    /// Installs a replacement over a fixed/variable leaf slot.
    ///
    /// `expected_write_gen` is the stamp sampled by the search that located
    /// the slot; if the page changed since, the install fails with
    /// [Error::WriteConflict] and the caller is expected to re-search.
    pub fn install_replacement(
        &self,
        slot: SlotId,
        value: ReplValue,
        expected_write_gen: WriteGen,
    ) -> Result<(), Error> {
        if !matches!(self.page_type, PageType::FixLeaf | PageType::VarLeaf) {
            return Err(error_validation!(
                "Page {} is not a fixed or variable leaf",
                self.id()
            ));
        }
        self.check_slot(slot)?;
        let mut overlays = self.overlays.write();
        self.stamp_write_gen(expected_write_gen)?;
        trace!("install replacement page {} slot {slot}", self.id());
        overlays.push_replacement(slot, value);
        Ok(())
    }

    /// Installs an expansion for one record number of a run-length leaf slot.
    ///
    /// Same write-generation discipline as [Page::install_replacement].
    pub fn install_expansion(
        &self,
        slot: SlotId,
        recno: Recno,
        value: ReplValue,
        expected_write_gen: WriteGen,
    ) -> Result<(), Error> {
        if self.page_type != PageType::RleLeaf {
            return Err(error_validation!(
                "Page {} is not a run-length leaf",
                self.id()
            ));
        }
        self.check_slot(slot)?;
        if recno < self.start_recno() || recno - self.start_recno() >= self.record_count() {
            return Err(error_validation!(
                "Record {recno} is outside page {}",
                self.id()
            ));
        }
        let mut overlays = self.overlays.write();
        self.stamp_write_gen(expected_write_gen)?;
        trace!("install expansion page {} slot {slot} recno {recno}", self.id());
        overlays.push_expansion(slot, recno, value);
        Ok(())
    }

    fn check_slot(&self, slot: SlotId) -> Result<(), Error> {
        if slot < self.header().num_entries.get() {
            Ok(())
        } else {
            Err(error_validation!(
                "Slot {slot} is outside page {}",
                self.id()
            ))
        }
    }

    /// Caller must hold the overlay write lock.
    fn stamp_write_gen(&self, expected: WriteGen) -> Result<(), Error> {
        if self.write_gen.load(Ordering::Relaxed) != expected {
            return Err(Error::WriteConflict);
        }
        self.write_gen.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("type", &self.page_type)
            .field("start_recno", &self.start_recno())
            .field("record_count", &self.record_count())
            .field("write_gen", &self.write_gen())
            .finish()
    }
}

pub(crate) fn checksum_of(data: &[u8]) -> u32 {
    let checksum = xxhash_rust::xxh3::xxh3_64(&data[size_of::<u32>()..]) as u32;
    if checksum == u32::default() {
        !u32::default()
    } else {
        checksum
    }
}
