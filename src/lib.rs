//! # Colstore
//!
//! The record-number search core of a column-organized storage tree.
//!
//! Records in a column-organized table are addressed by a dense, 1-based,
//! 64-bit record number instead of a comparable key. [`Tree::search_column`]
//! resolves a record number to its currently-visible value by walking the
//! internal pages with cumulative record-count arithmetic, decoding the
//! matched leaf (fixed-width, variable-width, or run-length-compressed) and
//! applying any in-memory overlay (replacement or expansion record) that
//! shadows the on-page value.
//!
//! Pages are owned and arbitrated by a [`PageCache`]; a search pins at most
//! the root plus one descended-to page at a time and retries from the root
//! when the cache reports a concurrent structural change.

#![warn(missing_docs)]

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod bytes;
mod cache;
mod error;
mod node;
mod options;
mod overlay;
mod page;
mod repr;
mod tree;
mod utils;


pub use crate::{
    bytes::Bytes,
    cache::{PageCache, PageIn, PinnedPage},
    error::Error,
    node::{FixLeafBuilder, InternalBuilder, RleLeafBuilder, VarLeafBuilder},
    options::{CacheOptions, TreeOptions},
    overlay::{Expansion, ReplValue, Replacement},
    page::Page,
    repr::{PageId, PageType, Recno, SlotId, WriteGen},
    tree::{ColumnSearch, LookupMode, Tree},
};

/// Unit of page allocation. Page images are always a multiple of this size.
pub const PAGE_SIZE: u32 = 4096;
