// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A compact, single-volume filesystem layered on a host-file "disk".
//!
//! An ordinary file plays the part of the storage device: it is
//! treated as a flat array of 256-byte blocks, and the filesystem
//! imposes a superblock with a free-block bitmap, a single flat root
//! directory, and per-file inode/extent chains on top of it.  The
//! result is small enough to read in a sitting yet exercises the
//! machinery a real filesystem needs: block allocation, chain
//! maintenance, directory bookkeeping, and a mount-time consistency
//! check, all of which must stay mutually coherent across partial
//! failures.
//!
//! The crate is used in two ways.  [`Volume`] is the engine proper:
//! [`mkfs`] formats an image, [`Volume::mount`] opens it, and the
//! per-file operations (open, write, read, seek, delete, close) are
//! methods on the mounted value.  For the common single-program case
//! the crate-level functions ([`mount`], [`open_file`], ...) manage
//! one process-wide volume instead, with [`Error::Busy`] guarding
//! against double mounts.
//!
//! Deliberately absent: hierarchical directories, permissions beyond
//! the directory/read/write flag bits, timestamps, hard or symbolic
//! links, sparse files, and any caching beyond the one block of
//! buffer each open file owns.  A volume serves one program at a
//! time; there is no locking against other processes.

mod bitset;
mod disk;
mod fs;
mod global;
mod result;
mod table;

pub use disk::{BLOCK_SIZE, Disk};
pub use fs::{Fd, MAX_NAME_LEN, Volume, mkfs};
pub use global::{
    close_file, delete_file, mount, open_file, read_byte, seek, unmount,
    write_file,
};
pub use result::{Error, Result, is_fs_error};
