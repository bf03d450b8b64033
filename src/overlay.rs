use triomphe::Arc;

use crate::{
    bytes::Bytes,
    repr::{Recno, SlotId},
    utils::EscapedBytes,
};

/// Value carried by a [Replacement]: new bytes or a tombstone.
#[derive(Clone)]
pub enum ReplValue {
    /// The record's new value.
    Bytes(Bytes),
    /// The record was deleted without rewriting the page.
    Delete,
}

impl std::fmt::Debug for ReplValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(arg0) => f
                .debug_tuple("Bytes")
                .field(&EscapedBytes(arg0.as_ref()))
                .finish(),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

impl ReplValue {
    /// Whether this value is a tombstone.
    #[inline]
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

/// In-memory overlay shadowing one fixed or variable leaf entry.
///
/// Replacements chain most-recent-first; only the head is consulted by
/// lookups. Chain node lifetime is owned by the write path, the leaf entry
/// references the chain head through its page's overlay table.
#[derive(Debug)]
pub struct Replacement {
    value: ReplValue,
    next: Option<Arc<Replacement>>,
}

impl Replacement {
    pub(crate) fn new_head(value: ReplValue, next: Option<Arc<Replacement>>) -> Arc<Self> {
        Arc::new(Self { value, next })
    }

    /// The value this replacement installs.
    #[inline]
    pub fn value(&self) -> &ReplValue {
        &self.value
    }

    /// Whether this replacement is a tombstone.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.value.is_delete()
    }

    /// The superseded replacement, if any was retained.
    #[inline]
    pub fn superseded(&self) -> Option<&Arc<Replacement>> {
        self.next.as_ref()
    }
}

/// In-memory overlay for one specific record number within a run-length run.
///
/// A run cell covers many record numbers that may diverge individually; each
/// diverged record gets an expansion carrying its own [Replacement].
/// Expansions for a cell form a chain searched by exact record-number match.
#[derive(Debug)]
pub struct Expansion {
    recno: Recno,
    repl: Arc<Replacement>,
    next: Option<Arc<Expansion>>,
}

impl Expansion {
    pub(crate) fn new_head(
        recno: Recno,
        repl: Arc<Replacement>,
        next: Option<Arc<Expansion>>,
    ) -> Arc<Self> {
        Arc::new(Self { recno, repl, next })
    }

    /// The record number this expansion diverges.
    #[inline]
    pub fn recno(&self) -> Recno {
        self.recno
    }

    /// The replacement holding the diverged value or tombstone.
    #[inline]
    pub fn replacement(&self) -> &Arc<Replacement> {
        &self.repl
    }

    /// Walk the chain starting at `head` for an exact record-number match.
    pub(crate) fn find(head: &Arc<Expansion>, recno: Recno) -> Option<Arc<Expansion>> {
        let mut exp = Some(head);
        while let Some(e) = exp {
            if e.recno == recno {
                return Some(e.clone());
            }
            exp = e.next.as_ref();
        }
        None
    }
}

/// Per-page overlay storage, keyed by slot.
#[derive(Debug, Default)]
pub(crate) struct OverlayTable {
    repls: hashbrown::HashMap<SlotId, Arc<Replacement>>,
    exps: hashbrown::HashMap<SlotId, Arc<Expansion>>,
}

impl OverlayTable {
    #[inline]
    pub fn replacement(&self, slot: SlotId) -> Option<&Arc<Replacement>> {
        self.repls.get(&slot)
    }

    #[inline]
    pub fn expansion(&self, slot: SlotId) -> Option<&Arc<Expansion>> {
        self.exps.get(&slot)
    }

    pub fn push_replacement(&mut self, slot: SlotId, value: ReplValue) {
        let next = self.repls.get(&slot).cloned();
        self.repls.insert(slot, Replacement::new_head(value, next));
    }

    pub fn push_expansion(&mut self, slot: SlotId, recno: Recno, value: ReplValue) {
        let head = self.exps.get(&slot).cloned();
        // A diverged record diverging again extends its replacement chain
        // inside a fresh expansion head; lookups only see the new head first.
        let superseded = head
            .as_ref()
            .and_then(|h| Expansion::find(h, recno))
            .map(|e| e.repl.clone());
        let repl = Replacement::new_head(value, superseded);
        self.exps.insert(slot, Expansion::new_head(recno, repl, head));
    }
}
