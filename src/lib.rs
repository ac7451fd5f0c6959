//! kvblock provides the block format at the base of a sorted-string table.
//!
//! A block is an immutable byte buffer holding a sorted run of key-value entries.  Keys are
//! prefix-compressed against their predecessor, with the compression resetting at restart
//! points so that a sparse index of full keys supports binary search.  This crate implements
//! the read side: a [Block] handle over owned or borrowed bytes and a bidirectional
//! [BlockCursor] over its entries.  Block construction belongs to the writer a layer up.

extern crate prototk;
#[macro_use]
extern crate prototk_derive;

use std::cmp::Ordering;

use biometrics::Counter;
use keyvalint::compare_bytes;
use tatl::{HeyListen, Stationary};
use zerror_core::ErrorCore;

pub mod block;

pub use block::{Block, BlockContents, BlockCursor};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CORRUPTION: Counter = Counter::new("kvblock.corruption");
static CORRUPTION_MONITOR: Stationary = Stationary::new("kvblock.corruption", &CORRUPTION);

static BLOCK_NEW: Counter = Counter::new("kvblock.block.new");
static CURSOR_NEW: Counter = Counter::new("kvblock.cursor.new");
static CURSOR_EMPTY: Counter = Counter::new("kvblock.cursor.empty");
static CURSOR_ERROR: Counter = Counter::new("kvblock.cursor.error");
static CURSOR_SEEK_TO_FIRST: Counter = Counter::new("kvblock.cursor.seek_to_first");
static CURSOR_SEEK_TO_LAST: Counter = Counter::new("kvblock.cursor.seek_to_last");
static CURSOR_SEEK: Counter = Counter::new("kvblock.cursor.seek");
static CURSOR_NEXT: Counter = Counter::new("kvblock.cursor.next");
static CURSOR_PREV: Counter = Counter::new("kvblock.cursor.prev");

/// Register this crate's biometrics.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&CORRUPTION);
    collector.register_counter(&BLOCK_NEW);
    collector.register_counter(&CURSOR_NEW);
    collector.register_counter(&CURSOR_EMPTY);
    collector.register_counter(&CURSOR_ERROR);
    collector.register_counter(&CURSOR_SEEK_TO_FIRST);
    collector.register_counter(&CURSOR_SEEK_TO_LAST);
    collector.register_counter(&CURSOR_SEEK);
    collector.register_counter(&CURSOR_NEXT);
    collector.register_counter(&CURSOR_PREV);
}

/// Register this crate's monitors.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&CORRUPTION_MONITOR);
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The kvblock Error type.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// Success.  Used for Message default.  Should not be constructed otherwise.
    #[prototk(507904, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// Corruption was observed in the block's bytes.
    #[prototk(507905, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A description of what was corrupt.
        #[prototk(2, string)]
        context: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

//////////////////////////////////////////// Comparator ////////////////////////////////////////////

/// A total order over byte strings.  A comparator handed to [Block::cursor] must order keys the
/// same way the block's writer did; the cursor's behavior under an inconsistent comparator is
/// unspecified.
pub trait Comparator {
    /// Compare `lhs` and `rhs`.
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;
}

impl<C: Comparator + ?Sized> Comparator for &C {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        (**self).compare(lhs, rhs)
    }
}

/// Orders keys as unsigned bytes, shorter strings first.  This matches the order every block
/// writer in this ecosystem uses by default.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        compare_bytes(lhs, rhs)
    }
}
