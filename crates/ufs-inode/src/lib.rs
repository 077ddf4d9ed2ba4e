#![forbid(unsafe_code)]
//! Inodes and their block-pointer trees.
//!
//! [`table`] reads and writes packed inodes, [`pointers`] walks direct and
//! indirect pointers, [`bmap`] maps and allocates file blocks, and
//! [`truncate`] cuts a file back and returns its blocks.

pub mod bmap;
pub mod pointers;
pub mod table;
pub mod truncate;

pub use bmap::{FileIo, balloc, bmap};
pub use pointers::{
    BlockPath, BlockPointers, DeviceIndirect, IndirectBlock, IndirectIo, Slot, SlotKind, Visit,
    block_path, ensure_path, free_subtree, leaf_of, lookup, root_first_lbn, set_slot, span, walk,
};
pub use table::{InodeTable, clear_slot, decode_slot, encode_slot};
pub use truncate::{TruncateOutcome, truncate};
