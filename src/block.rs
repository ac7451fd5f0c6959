//! A block is the smallest unit of a sorted table.  This module provides the handle over a
//! block's bytes and the bidirectional cursor that decodes them.
//!
//! The layout, left to right:  a run of prefix-compressed entries, an array of fixed-width
//! offsets naming the entries at which prefix compression restarts, and a fixed-width count of
//! those offsets.  Every entry holds three varint lengths (shared, non-shared, value), the
//! non-shared key bytes, and the value bytes.  Restart entries store their key in full.

use std::cmp::Ordering;

use buffertk::{v64, Unpackable};
use zerror::Z;
use zerror_core::ErrorCore;

use super::{
    Comparator, Error, BLOCK_NEW, CORRUPTION, CURSOR_EMPTY, CURSOR_ERROR, CURSOR_NEW, CURSOR_NEXT,
    CURSOR_PREV, CURSOR_SEEK, CURSOR_SEEK_TO_FIRST, CURSOR_SEEK_TO_LAST,
};

////////////////////////////////////////// BlockContents ///////////////////////////////////////////

/// The raw bytes of one block, either owned by the handle or borrowed from the caller.  The
/// borrowed form is for engines that map or cache block storage themselves.
#[derive(Clone, Debug)]
pub enum BlockContents<'a> {
    /// The handle owns the buffer and frees it on drop.
    Owned(Vec<u8>),
    /// The caller guarantees the buffer outlives the handle.
    Borrowed(&'a [u8]),
}

impl<'a> AsRef<[u8]> for BlockContents<'a> {
    fn as_ref(&self) -> &[u8] {
        match self {
            BlockContents::Owned(bytes) => bytes,
            BlockContents::Borrowed(bytes) => bytes,
        }
    }
}

impl<'a> From<Vec<u8>> for BlockContents<'a> {
    fn from(bytes: Vec<u8>) -> Self {
        BlockContents::Owned(bytes)
    }
}

impl<'a> From<&'a [u8]> for BlockContents<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        BlockContents::Borrowed(bytes)
    }
}

/////////////////////////////////////////////// Block //////////////////////////////////////////////

/// A Block captures an immutable, sorted sequence of key-value entries.
///
/// Construction never fails.  A buffer whose trailer does not describe a plausible restart
/// array leaves the handle in the empty/corrupt state, observable as `size() == 0`; cursors
/// over such a handle report corruption and yield no entries.
#[derive(Clone, Debug)]
pub struct Block<'a> {
    // The raw bytes built by a builder or loaded off disk.
    contents: BlockContents<'a>,
    // Length of the buffer, or zero when the trailer was implausible.
    size: usize,
    // Offset of the restart array.  Entries occupy [0, restart_offset).
    restart_offset: usize,
    num_restarts: usize,
}

impl<'a> Block<'a> {
    /// Create a new block over the provided contents.
    pub fn new<T: Into<BlockContents<'a>>>(contents: T) -> Self {
        BLOCK_NEW.click();
        let contents = contents.into();
        let mut size = contents.as_ref().len();
        let mut restart_offset = 0;
        let mut num_restarts = 0;
        if size < 4 {
            size = 0;
        } else {
            num_restarts = read_fixed32(contents.as_ref(), size - 4) as usize;
            let max_restarts_allowed = (size - 4) / 4;
            if num_restarts > max_restarts_allowed {
                // The trailer asks for more restarts than the buffer could hold.
                CORRUPTION.click();
                size = 0;
                num_restarts = 0;
            } else {
                restart_offset = size - 4 * (num_restarts + 1);
            }
        }
        Block {
            contents,
            size,
            restart_offset,
            num_restarts,
        }
    }

    /// The size of the underlying buffer, or zero when the handle is empty/corrupt.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of restart points in the block.
    pub fn num_restarts(&self) -> usize {
        self.num_restarts
    }

    /// Return a reference to the block's bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.contents.as_ref()
    }

    /// Return a cursor over the block.  `comparator` must order keys the way the block's writer
    /// did.
    pub fn cursor<C: Comparator>(&self, comparator: C) -> BlockCursor<'_, C> {
        if self.size < 4 {
            BlockCursor::error(self, comparator, "bad block contents")
        } else if self.num_restarts == 0 {
            BlockCursor::empty(self, comparator)
        } else {
            BlockCursor::new(self, comparator)
        }
    }

    fn data(&self) -> &[u8] {
        self.contents.as_ref()
    }

    fn restart_point(&self, restart_index: usize) -> usize {
        assert!(restart_index < self.num_restarts);
        read_fixed32(self.data(), self.restart_offset + restart_index * 4) as usize
    }
}

/////////////////////////////////////////// entry decode ///////////////////////////////////////////

// The decoded header of one entry:  the three lengths plus the offset of the key delta.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Entry {
    shared: usize,
    non_shared: usize,
    value_len: usize,
    key_delta: usize,
}

// Decode the entry header at `offset`, reading no byte at or past `limit`.  Returns None when
// the header, or the key/value bytes it declares, would cross `limit`.
fn decode_entry(data: &[u8], offset: usize, limit: usize) -> Option<Entry> {
    let remain = limit.checked_sub(offset)?;
    if remain < 3 {
        return None;
    }
    let shared;
    let non_shared;
    let value_len;
    let key_delta;
    if (data[offset] | data[offset + 1] | data[offset + 2]) < 128 {
        // Fast path: all three lengths are one byte each.
        shared = data[offset] as usize;
        non_shared = data[offset + 1] as usize;
        value_len = data[offset + 2] as usize;
        key_delta = offset + 3;
    } else {
        let (x, p) = decode_varint32(data, offset, limit)?;
        shared = x as usize;
        let (x, p) = decode_varint32(data, p, limit)?;
        non_shared = x as usize;
        let (x, p) = decode_varint32(data, p, limit)?;
        value_len = x as usize;
        key_delta = p;
    }
    let trailing = non_shared.checked_add(value_len)?;
    if trailing > limit - key_delta {
        return None;
    }
    Some(Entry {
        shared,
        non_shared,
        value_len,
        key_delta,
    })
}

// One LEB128 unsigned 32-bit value, bounded by `limit`:  at most five bytes, and the value must
// fit thirty-two bits.
fn decode_varint32(data: &[u8], offset: usize, limit: usize) -> Option<(u32, usize)> {
    let (x, remain) = v64::unpack(&data[offset..limit]).ok()?;
    let consumed = (limit - offset) - remain.len();
    if consumed > 5 {
        return None;
    }
    let x = u32::try_from(Into::<u64>::into(x)).ok()?;
    Some((x, offset + consumed))
}

fn read_fixed32(data: &[u8], offset: usize) -> u32 {
    let mut fixed: [u8; 4] = <[u8; 4]>::default();
    fixed.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(fixed)
}

//////////////////////////////////////////// BlockCursor ///////////////////////////////////////////

/// A cursor over one block.  Exactly one thread drives a cursor; the block behind it may be
/// shared freely.
///
/// Malformed bytes never panic the cursor.  It transitions to not-valid with a sticky
/// Corruption [status](BlockCursor::status) and ignores further navigation.
#[derive(Clone, Debug)]
pub struct BlockCursor<'a, C: Comparator> {
    block: &'a Block<'a>,
    comparator: C,
    // Offset of the current entry.  Equals restart_offset iff the cursor is not valid.
    current: usize,
    // Index of the restart range containing current.  Equals num_restarts iff not valid.
    restart_index: usize,
    // The current entry's key, reconstructed from the deltas walked to reach it.
    key: Vec<u8>,
    // The current entry's value, as a view into the block's bytes.
    value_offset: usize,
    value_len: usize,
    status: Result<(), Error>,
}

impl<'a, C: Comparator> BlockCursor<'a, C> {
    fn new(block: &'a Block<'a>, comparator: C) -> Self {
        CURSOR_NEW.click();
        Self {
            block,
            comparator,
            current: block.restart_offset,
            restart_index: block.num_restarts,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: Ok(()),
        }
    }

    // A cursor over a block that holds no entries.  Never valid, status Ok.
    fn empty(block: &'a Block<'a>, comparator: C) -> Self {
        CURSOR_EMPTY.click();
        Self {
            block,
            comparator,
            current: block.restart_offset,
            restart_index: block.num_restarts,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: Ok(()),
        }
    }

    // A cursor that was corrupt from birth.  Never valid, and navigation never parses.
    fn error(block: &'a Block<'a>, comparator: C, context: &str) -> Self {
        CURSOR_ERROR.click();
        CORRUPTION.click();
        Self {
            block,
            comparator,
            current: block.restart_offset,
            restart_index: block.num_restarts,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: Err(Error::Corruption {
                core: ErrorCore::default(),
                context: context.to_string(),
            }),
        }
    }

    /// True iff the cursor is positioned on an entry.
    pub fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    /// The sticky status.  Ok until the first corruption; Corruption ever after.
    pub fn status(&self) -> Result<(), Error> {
        self.status.clone()
    }

    /// The current entry's key, or None when the cursor is not valid.
    pub fn key(&self) -> Option<&[u8]> {
        if self.valid() {
            Some(&self.key)
        } else {
            None
        }
    }

    /// The current entry's value, or None when the cursor is not valid.  The view borrows the
    /// block and stays put until the next navigation.
    pub fn value(&self) -> Option<&[u8]> {
        if self.valid() {
            Some(&self.block.data()[self.value_offset..self.value_offset + self.value_len])
        } else {
            None
        }
    }

    /// Position on the first entry, or become not valid if the block holds none.
    pub fn seek_to_first(&mut self) {
        CURSOR_SEEK_TO_FIRST.click();
        if self.status.is_err() || self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    /// Position on the last entry, or become not valid if the block holds none.
    pub fn seek_to_last(&mut self) {
        CURSOR_SEEK_TO_LAST.click();
        if self.status.is_err() || self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
            // Keep skipping.
        }
    }

    /// Position on the first entry whose key is greater than or equal to `target`, or become
    /// not valid when every key is less.
    pub fn seek(&mut self, target: &[u8]) {
        CURSOR_SEEK.click();
        if self.status.is_err() || self.block.num_restarts == 0 {
            return;
        }
        // Binary search the restart array for the last restart whose full key is < target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            // Upper mid, so adjacent left and right probe right.
            let mid = (left + right + 1) / 2;
            let region_offset = self.block.restart_point(mid);
            let entry =
                match decode_entry(self.block.data(), region_offset, self.block.restart_offset) {
                    // Restart entries carry their key in full.
                    Some(entry) if entry.shared == 0 => entry,
                    _ => {
                        let err = Error::Corruption {
                            core: ErrorCore::default(),
                            context: "bad entry in block".to_string(),
                        }
                        .with_info("restart_point", mid);
                        self.corrupt(err);
                        return;
                    }
                };
            let mid_key = &self.block.data()[entry.key_delta..entry.key_delta + entry.non_shared];
            if self.comparator.compare(mid_key, target) == Ordering::Less {
                // All restarts before mid are uninteresting.
                left = mid;
            } else {
                // All restarts at or after mid are uninteresting.
                right = mid - 1;
            }
        }
        // Linear scan within the chosen restart range.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Advance by one entry.  Past the last entry the cursor becomes not valid.
    pub fn next(&mut self) {
        CURSOR_NEXT.click();
        if !self.valid() {
            return;
        }
        self.parse_next_key();
    }

    /// Retreat by one entry.  Before the first entry the cursor becomes not valid.
    ///
    /// The encoding only decodes forward, so this re-parses from the nearest restart point that
    /// begins before the current entry.
    pub fn prev(&mut self) {
        CURSOR_PREV.click();
        if !self.valid() {
            return;
        }
        let original = self.current;
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No entry precedes the first one.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        // Scan forward to the entry that ends where the original began.
        while self.parse_next_key() && self.next_entry_offset() < original {
            // Keep skipping.
        }
    }

    // Offset just past the end of the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    // Anchor a zero-length value at the restart's offset so that the next parse_next_key lands
    // on the entry stored there.
    fn seek_to_restart_point(&mut self, restart_index: usize) {
        self.key.clear();
        self.restart_index = restart_index;
        self.value_offset = self.block.restart_point(restart_index);
        self.value_len = 0;
    }

    // Decode the entry that begins where the previous one ended.  Returns true when the cursor
    // lands on an entry; false on a clean end or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            // No more entries.
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts;
            return false;
        }
        let entry = match decode_entry(self.block.data(), self.current, self.block.restart_offset)
        {
            Some(entry) => entry,
            None => {
                let err = Error::Corruption {
                    core: ErrorCore::default(),
                    context: "bad entry in block".to_string(),
                }
                .with_info("offset", self.current);
                self.corrupt(err);
                return false;
            }
        };
        if entry.shared > self.key.len() {
            // The previous key is shorter than the claimed shared prefix.
            self.corrupt(Error::Corruption {
                core: ErrorCore::default(),
                context: "bad entry in block".to_string(),
            });
            return false;
        }
        self.key.truncate(entry.shared);
        self.key
            .extend_from_slice(&self.block.data()[entry.key_delta..entry.key_delta + entry.non_shared]);
        self.value_offset = entry.key_delta + entry.non_shared;
        self.value_len = entry.value_len;
        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    // Become not valid and record the error.  The first corruption wins; it never clears.
    fn corrupt(&mut self, err: Error) {
        CORRUPTION.click();
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_offset = self.block.restart_offset;
        self.value_len = 0;
        if self.status.is_ok() {
            self.status = Err(err);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
