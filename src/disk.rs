// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block I/O over a host backing file.
//!
//! A "disk" is nothing but an ordinary file treated as a flat array
//! of [`BLOCK_SIZE`]-byte blocks.  This adapter owns the file handle
//! and exposes exactly two transfer operations, whole-block reads and
//! whole-block writes by logical block number.  All addressing is
//! bounds-checked against the file's length, so a block number past
//! the end of the image is rejected before any host I/O happens.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::result::{Error, Result};

/// The size of a disk block, in bytes.
pub const BLOCK_SIZE: usize = 256;

/// A disk image backed by a host file.
#[derive(Debug)]
pub struct Disk {
    file: File,
    nbytes: u64,
}

impl Disk {
    /// Creates (or truncates) the backing file at `path` sized to
    /// `nbytes` rounded down to a whole number of blocks.
    pub fn create<P: AsRef<Path>>(path: P, nbytes: u64) -> Result<Disk> {
        if nbytes < BLOCK_SIZE as u64 {
            return Err(Error::Invalid);
        }
        let nbytes = (nbytes / BLOCK_SIZE as u64) * BLOCK_SIZE as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(nbytes)?;
        Ok(Disk { file, nbytes })
    }

    /// Opens an existing backing file read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Disk> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let nbytes = file.metadata()?.len();
        Ok(Disk { file, nbytes })
    }

    /// Returns the number of whole blocks in the image.
    pub fn nblocks(&self) -> u64 {
        self.nbytes / BLOCK_SIZE as u64
    }

    /// Maps a logical block number to its byte offset, rejecting
    /// addresses whose transfer would run past the end of the image.
    fn offset_of(&self, bnum: usize) -> Result<u64> {
        let off = bnum as u64 * BLOCK_SIZE as u64;
        if off + BLOCK_SIZE as u64 > self.nbytes {
            return Err(Error::Invalid);
        }
        Ok(off)
    }

    pub fn read_block(
        &self,
        bnum: usize,
        block: &mut [u8; BLOCK_SIZE],
    ) -> Result<()> {
        let off = self.offset_of(bnum)?;
        self.file.read_exact_at(block, off)?;
        Ok(())
    }

    pub fn write_block(
        &mut self,
        bnum: usize,
        block: &[u8; BLOCK_SIZE],
    ) -> Result<()> {
        let off = self.offset_of(bnum)?;
        self.file.write_all_at(block, off)?;
        Ok(())
    }

    /// Flushes and closes the backing file.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        (dir, path)
    }

    #[test]
    fn create_rounds_down_to_blocks() {
        let (_dir, path) = scratch();
        let disk = Disk::create(&path, 1000).unwrap();
        assert_eq!(disk.nblocks(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 768);
    }

    #[test]
    fn create_rejects_sub_block_size() {
        let (_dir, path) = scratch();
        assert_eq!(Disk::create(&path, 255).unwrap_err(), Error::Invalid);
        assert_eq!(Disk::create(&path, 0).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn blocks_round_trip() {
        let (_dir, path) = scratch();
        let mut disk = Disk::create(&path, 4 * BLOCK_SIZE as u64).unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xab;
        block[BLOCK_SIZE - 1] = 0xcd;
        disk.write_block(2, &block).unwrap();

        let mut readback = [0u8; BLOCK_SIZE];
        disk.read_block(2, &mut readback).unwrap();
        assert_eq!(block, readback);
        disk.read_block(3, &mut readback).unwrap();
        assert_eq!(readback, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let (_dir, path) = scratch();
        let mut disk = Disk::create(&path, 4 * BLOCK_SIZE as u64).unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(
            disk.read_block(4, &mut block).unwrap_err(),
            Error::Invalid
        );
        assert_eq!(disk.write_block(4, &block).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn reopen_preserves_contents() {
        let (_dir, path) = scratch();
        let mut disk = Disk::create(&path, 2 * BLOCK_SIZE as u64).unwrap();
        let block = [0x5a; BLOCK_SIZE];
        disk.write_block(1, &block).unwrap();
        disk.close().unwrap();

        let disk = Disk::open(&path).unwrap();
        assert_eq!(disk.nblocks(), 2);
        let mut readback = [0u8; BLOCK_SIZE];
        disk.read_block(1, &mut readback).unwrap();
        assert_eq!(readback, block);
    }
}
