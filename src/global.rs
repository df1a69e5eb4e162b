// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide mounted volume.
//!
//! The engine itself lives on [`Volume`]; this module adds the
//! single-program convenience surface on top of it.  One slot holds
//! the mounted volume, [`mount`] fills it and fails with
//! [`Error::Busy`] while it is occupied, and the per-file wrappers
//! forward to the volume in the slot.  A program that wants more than
//! one volume at a time works with [`Volume`] values directly and
//! skips this module entirely.

use std::path::Path;
use std::sync::Mutex;

use crate::fs::{Fd, Volume};
use crate::result::{Error, Result};

static MOUNTED: Mutex<Option<Volume>> = Mutex::new(None);

fn with<R>(f: impl FnOnce(&mut Volume) -> Result<R>) -> Result<R> {
    let mut slot = MOUNTED.lock().unwrap_or_else(|e| e.into_inner());
    let vol = slot.as_mut().ok_or(Error::BadFd)?;
    f(vol)
}

/// Mounts the volume at `path` into the process-wide slot.  Fails
/// with [`Error::Busy`] if a volume is already mounted.
pub fn mount<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut slot = MOUNTED.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(Error::Busy);
    }
    *slot = Some(Volume::mount(path)?);
    Ok(())
}

/// Unmounts the process-wide volume, flushing its state to disk.
pub fn unmount() -> Result<()> {
    let vol = {
        let mut slot = MOUNTED.lock().unwrap_or_else(|e| e.into_inner());
        slot.take().ok_or(Error::BadFd)?
    };
    vol.unmount()
}

pub fn open_file(name: &str) -> Result<Fd> {
    with(|vol| vol.open_file(name))
}

pub fn close_file(fd: Fd) -> Result<()> {
    with(|vol| vol.close_file(fd))
}

pub fn write_file(fd: Fd, buf: &[u8]) -> Result<()> {
    with(|vol| vol.write_file(fd, buf))
}

pub fn delete_file(fd: Fd) -> Result<()> {
    with(|vol| vol.delete_file(fd))
}

pub fn read_byte(fd: Fd) -> Result<u8> {
    with(|vol| vol.read_byte(fd))
}

pub fn seek(fd: Fd, offset: u32) -> Result<()> {
    with(|vol| vol.seek(fd, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::BLOCK_SIZE;
    use crate::fs::mkfs;

    // The slot is process-wide, so everything touching it lives in
    // one test.
    #[test]
    fn slot_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        mkfs(&path, 10 * BLOCK_SIZE as u64).unwrap();

        assert_eq!(open_file("a").unwrap_err(), Error::BadFd);
        mount(&path).unwrap();
        assert_eq!(mount(&path).unwrap_err(), Error::Busy);

        let fd = open_file("a").unwrap();
        write_file(fd, b"hi").unwrap();
        seek(fd, 0).unwrap();
        assert_eq!(read_byte(fd).unwrap(), b'h');
        assert_eq!(read_byte(fd).unwrap(), b'i');
        assert_eq!(read_byte(fd).unwrap_err(), Error::Fault);
        close_file(fd).unwrap();

        let fd = open_file("a").unwrap();
        delete_file(fd).unwrap();
        unmount().unwrap();
        assert_eq!(unmount().unwrap_err(), Error::BadFd);
    }
}
