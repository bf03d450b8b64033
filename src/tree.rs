use triomphe::Arc;

use crate::{
    bytes::Bytes,
    cache::{PageCache, PageIn, PinnedPage},
    error::{error_corruption, error_validation, Error},
    node::TypedNode,
    options::TreeOptions,
    overlay::{Expansion, ReplValue, Replacement},
    page::Page,
    repr::{CellFlags, PageId, PageType, Recno, SlotId, WriteGen, VAR_ITEM_DEL},
};

/// Visibility mode of a column search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Resolved tombstones yield NotFound.
    Plain,
    /// Tombstone checks are skipped entirely: the caller is targeting the
    /// slot to overwrite it, so a deleted record is still a valid target.
    ForInsert,
}

/// A column-organized tree: records addressed by dense 1-based record
/// numbers, stored in leaves reached by cumulative record-count navigation.
///
/// The tree holds a permanent pin on its root page for its whole lifetime;
/// every search pins the root plus at most one descended-to page at a time.
pub struct Tree {
    cache: Arc<PageCache>,
    root: PinnedPage,
    opts: TreeOptions,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root.id())
            .field("len", &self.root.record_count())
            .finish()
    }
}

impl Tree {
    /// Opens the tree rooted at `root`, pinning the root page.
    pub fn open(cache: Arc<PageCache>, root: PageId) -> Result<Self, Error> {
        Self::open_with(cache, root, TreeOptions::default())
    }

    /// Opens the tree rooted at `root` with the given options.
    pub fn open_with(
        cache: Arc<PageCache>,
        root: PageId,
        opts: TreeOptions,
    ) -> Result<Self, Error> {
        let root = PageCache::pin(&cache, root)?;
        Ok(Self { cache, root, opts })
    }

    /// Returns whether the tree is empty (0 records).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Returns the number of records the tree covers.
    #[inline]
    pub fn record_count(&self) -> u64 {
        self.root.record_count()
    }

    /// Resolves `recno` to its current location in the tree.
    ///
    /// Returns `Ok(None)` when the record number is past the end of the
    /// table or resolves to a tombstone under [LookupMode::Plain]. Restarts
    /// caused by concurrent structural changes are retried internally and
    /// never surfaced; any other page-cache failure aborts the search.
    pub fn search_column(
        &self,
        recno: Recno,
        mode: LookupMode,
    ) -> Result<Option<ColumnSearch>, Error> {
        if recno == 0 {
            return Err(error_validation!("Record numbers are 1-based"));
        }
        // Check for a record past the end of the table; no page beyond the
        // (already pinned) root is touched.
        let root_start = self.root.start_recno();
        if recno < root_start || recno - root_start >= self.root.record_count() {
            return Ok(None);
        }
        let plain = matches!(mode, LookupMode::Plain);
        let mut restarts = 0u32;
        'restart: loop {
            let mut page = self.root.repin();
            let (slot, write_gen) = loop {
                // Sampled before any interpretation of the page contents so
                // a later write against this location can detect changes.
                let write_gen = page.write_gen();
                let Some(record_cnt) = recno.checked_sub(page.start_recno()) else {
                    return Err(error_corruption!(
                        "Page {} starts past record {recno}",
                        page.id()
                    ));
                };
                let (pid, span) = match page.typed() {
                    TypedNode::Fix(_) | TypedNode::Var(_) => {
                        if record_cnt >= page.record_count() {
                            return Err(error_corruption!(
                                "Leaf {} doesn't cover record {recno}",
                                page.id()
                            ));
                        }
                        break (record_cnt as SlotId, write_gen);
                    }
                    TypedNode::Rle(leaf) => {
                        let Some((slot, _)) = leaf.search_runs(record_cnt) else {
                            return Err(error_corruption!(
                                "Leaf {} doesn't cover record {recno}",
                                page.id()
                            ));
                        };
                        break (slot, write_gen);
                    }
                    TypedNode::Internal(node) => {
                        let Some((_, child)) = node.search_records(record_cnt) else {
                            return Err(error_corruption!(
                                "Page {} children don't cover record {recno}",
                                page.id()
                            ));
                        };
                        (child.pid.get(), u32::from(child.span))
                    }
                };
                // Walk down to the child, releasing the current page first.
                trace!("descend from page {} to page {pid}", page.id());
                drop(page);
                match PageCache::page_in(&self.cache, pid, span)? {
                    PageIn::Page(child) => page = child,
                    PageIn::Restart => {
                        restarts += 1;
                        if self
                            .opts
                            .max_restart_attempts
                            .is_some_and(|max| restarts > max)
                        {
                            return Err(Error::SearchRestartLimit);
                        }
                        trace!("search for record {recno} restarting ({restarts})");
                        continue 'restart;
                    }
                }
            };
            // The located entry is only the first step; the record may have
            // been updated since the page was read into the cache, in which
            // case the overlay is authoritative over the page image.
            let mut repl = None;
            let mut exp = None;
            match page.typed() {
                TypedNode::Fix(leaf) => {
                    repl = page.replacement(slot);
                    if let Some(repl) = &repl {
                        if plain && repl.is_deleted() {
                            return Ok(None);
                        }
                    } else if plain && leaf.cell(slot).0.contains(CellFlags::DELETED) {
                        return Ok(None);
                    }
                }
                TypedNode::Var(leaf) => {
                    repl = page.replacement(slot);
                    if let Some(repl) = &repl {
                        if plain && repl.is_deleted() {
                            return Ok(None);
                        }
                    } else if plain && leaf.item(slot).0 == VAR_ITEM_DEL {
                        return Ok(None);
                    }
                }
                TypedNode::Rle(leaf) => {
                    // An expansion diverges a single record from its run; a
                    // record with no expansion inherits the run's state.
                    let found = page
                        .expansion(slot)
                        .and_then(|head| Expansion::find(&head, recno));
                    if let Some(found) = found {
                        if plain && found.replacement().is_deleted() {
                            return Ok(None);
                        }
                        repl = Some(found.replacement().clone());
                        exp = Some(found);
                    } else if plain && leaf.run(slot).1.contains(CellFlags::DELETED) {
                        return Ok(None);
                    }
                }
                TypedNode::Internal(_) => unreachable!(),
            }
            return Ok(Some(ColumnSearch {
                page,
                slot,
                recno,
                repl,
                exp,
                write_gen,
            }));
        }
    }
}

/// The result slot of a successful [Tree::search_column].
///
/// Holds the located leaf page (still pinned; released when the
/// `ColumnSearch` is dropped), the matched index entry, the resolved overlay
/// references and the write-generation stamp sampled before the leaf was
/// interpreted. Write paths use the stamp to install new overlays at this
/// location without repeating the descent.
pub struct ColumnSearch {
    page: PinnedPage,
    slot: SlotId,
    recno: Recno,
    repl: Option<Arc<Replacement>>,
    exp: Option<Arc<Expansion>>,
    write_gen: WriteGen,
}

impl std::fmt::Debug for ColumnSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnSearch")
            .field("page", &self.page.id())
            .field("slot", &self.slot)
            .field("recno", &self.recno)
            .field("repl", &self.repl.is_some())
            .field("exp", &self.exp.is_some())
            .field("write_gen", &self.write_gen)
            .finish()
    }
}

impl ColumnSearch {
    /// The leaf page containing the record.
    #[inline]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The matched index entry's position in the leaf.
    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The record number this search resolved.
    #[inline]
    pub fn recno(&self) -> Recno {
        self.recno
    }

    /// The replacement shadowing the record, if any. For run-length leaves
    /// this is the matched expansion's replacement.
    #[inline]
    pub fn replacement(&self) -> Option<&Arc<Replacement>> {
        self.repl.as_ref()
    }

    /// The expansion matching the record exactly, if any.
    #[inline]
    pub fn expansion(&self) -> Option<&Arc<Expansion>> {
        self.exp.as_ref()
    }

    /// Write generation of the leaf, sampled before the search interpreted
    /// it. A versioning token, not a lock: an install against a page that
    /// changed since fails with [Error::WriteConflict].
    #[inline]
    pub fn write_gen(&self) -> WriteGen {
        self.write_gen
    }

    /// The record's currently-visible value, or `None` for a tombstone.
    ///
    /// The returned bytes alias the page buffer when the on-page value is
    /// current.
    pub fn value(&self) -> Option<Bytes> {
        if let Some(repl) = &self.repl {
            return match repl.value() {
                ReplValue::Bytes(b) => Some(b.clone()),
                ReplValue::Delete => None,
            };
        }
        match self.page.typed() {
            TypedNode::Fix(leaf) => {
                let (flags, value) = leaf.cell(self.slot);
                (!flags.contains(CellFlags::DELETED)).then(|| self.page.raw().restrict(value))
            }
            TypedNode::Var(leaf) => {
                let (kind, value) = leaf.item(self.slot);
                (kind != VAR_ITEM_DEL).then(|| self.page.raw().restrict(value))
            }
            TypedNode::Rle(leaf) => {
                let (_, flags, value) = leaf.run(self.slot);
                (!flags.contains(CellFlags::DELETED)).then(|| self.page.raw().restrict(value))
            }
            TypedNode::Internal(_) => unreachable!(),
        }
    }

    /// Installs `value` over the located record, dispatching to a
    /// replacement or (for run-length leaves) an expansion.
    ///
    /// Fails with [Error::WriteConflict] if the page changed since this
    /// search sampled its write generation; the caller re-searches and
    /// retries. A successful install makes the stored stamp stale, so a
    /// second install through the same `ColumnSearch` also conflicts.
    pub fn install(&self, value: ReplValue) -> Result<(), Error> {
        match self.page.page_type() {
            PageType::FixLeaf | PageType::VarLeaf => {
                self.page
                    .install_replacement(self.slot, value, self.write_gen)
            }
            PageType::RleLeaf => {
                self.page
                    .install_expansion(self.slot, self.recno, value, self.write_gen)
            }
            PageType::Internal => unreachable!(),
        }
    }
}
