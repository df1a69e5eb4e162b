// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem engine and its on-disk format.
//!
//! A volume is a host file treated as an array of 256-byte blocks.
//! Block 0 is the superblock, block 1 the root directory, and every
//! other block is free, an inode, or an extent.  Every block begins
//! with the same 4-byte header: a kind tag, the magic byte 0x44, the
//! block number of the next block in a chain (0 terminates the
//! chain), and a reserved byte that must be 0.  In the superblock the
//! next field instead points at the root directory, which doubles as
//! a cheap identity check at mount time.
//!
//! A file is a singly linked chain of blocks: an inode block holding
//! the metadata (parent, name, size, flags) plus the first stretch of
//! data, followed by extent blocks that are pure payload.  The
//! superblock carries the free-block bitmap, one bit per block, bit
//! set meaning free.  The root directory's data region holds packed
//! 9-byte records naming each file's inode block (see [`dir`]).
//!
//! Allocation is deliberately conservative about failure: a block's
//! free bit is cleared only after the disk write that consumes the
//! block has succeeded, and freed blocks are marked free only after
//! being rewritten as FREE on disk.  An I/O error mid-operation can
//! therefore leak blocks, but never hands the same block to two
//! chains.
//!
//! The engine itself is the set of methods on [`Volume`]: a volume is
//! constructed by [`Volume::mount`], consumed by [`Volume::unmount`],
//! and in between carries the superblock mirror, the root-directory
//! mirror, the open-file table, and the free-block hint.  Each open
//! file owns a single block of buffer; there is no other caching.

pub(crate) mod dir;

use std::path::Path;

use bitflags::bitflags;
use log::{debug, trace};
use static_assertions::const_assert;

use crate::bitset;
use crate::disk::{BLOCK_SIZE, Disk};
use crate::result::{Error, Result};
use crate::table::FdTable;

use dir::{DIR_ENTRY_SIZE, Entry, Scan, Slot};

/// Maximum length of a file name, in bytes.
pub const MAX_NAME_LEN: usize = 8;

/// A file descriptor: an index into the mounted volume's open-file
/// table.
pub type Fd = usize;

/// Magic byte carried by every well-formed block.
const MAGIC: u8 = 0x44;

/// Block number of the superblock.
const SUPER_BLOCK: u8 = 0;

/// Block number of the root directory inode.
const ROOT_BLOCK: u8 = 1;

/// The largest number of blocks a volume can have; chain pointers and
/// the block count are single bytes.
const MAX_BLOCKS: usize = 256;

const BLOCK_HEADER_SIZE: usize = 4;

// Inode body layout, after the block header.
const INODE_PARENT_OFFSET: usize = 4;
const INODE_NAME_OFFSET: usize = 5;
const INODE_SIZE_OFFSET: usize = INODE_NAME_OFFSET + MAX_NAME_LEN;
const INODE_FLAGS_OFFSET: usize = INODE_SIZE_OFFSET + 4;
const INODE_HEADER_SIZE: usize = INODE_FLAGS_OFFSET + 1;

/// Payload capacity of an inode block.
const INODE_DATA_SIZE: usize = BLOCK_SIZE - INODE_HEADER_SIZE;

/// Payload capacity of an extent block.
const EXTENT_DATA_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

// Superblock body layout.
const NBLOCKS_OFFSET: usize = 4;
const FREE_MAP_OFFSET: usize = 5;
const FREE_MAP_SIZE: usize = MAX_BLOCKS / 8;

const_assert!(INODE_HEADER_SIZE == 18);
const_assert!(NBLOCKS_OFFSET + 1 + FREE_MAP_SIZE <= BLOCK_SIZE);
const_assert!(DIR_ENTRY_SIZE <= EXTENT_DATA_SIZE);
const_assert!(MAX_BLOCKS <= u8::MAX as usize + 1);

/// The kind tag in a block header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BlockKind {
    Super = 1,
    Inode = 2,
    Extent = 3,
    Free = 4,
}

bitflags! {
    /// Per-file flag bits stored in the inode.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct FileFlags: u8 {
        const DIR = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// An owned block-sized buffer with accessors for the header and the
/// inode body fields.
#[derive(Clone)]
pub(crate) struct Block([u8; BLOCK_SIZE]);

impl Block {
    pub(crate) fn zeroed() -> Block {
        Block([0; BLOCK_SIZE])
    }

    /// Returns a zero-bodied block with a fresh header of the given
    /// kind.
    pub(crate) fn new(kind: BlockKind) -> Block {
        let mut blk = Block::zeroed();
        blk.0[0] = kind as u8;
        blk.0[1] = MAGIC;
        blk
    }

    pub(crate) fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.0
    }

    pub(crate) fn kind_raw(&self) -> u8 {
        self.0[0]
    }

    pub(crate) fn set_kind(&mut self, kind: BlockKind) {
        self.0[0] = kind as u8;
    }

    pub(crate) fn next(&self) -> u8 {
        self.0[2]
    }

    pub(crate) fn set_next(&mut self, next: u8) {
        self.0[2] = next;
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        self.0[0] <= BlockKind::Free as u8
            && self.0[1] == MAGIC
            && self.0[3] == 0
    }

    pub(crate) fn inode_parent(&self) -> u8 {
        self.0[INODE_PARENT_OFFSET]
    }

    pub(crate) fn set_inode_parent(&mut self, parent: u8) {
        self.0[INODE_PARENT_OFFSET] = parent;
    }

    pub(crate) fn inode_name(&self) -> [u8; MAX_NAME_LEN] {
        self.0[INODE_NAME_OFFSET..][..MAX_NAME_LEN].try_into().unwrap()
    }

    pub(crate) fn set_inode_name(&mut self, name: &[u8; MAX_NAME_LEN]) {
        self.0[INODE_NAME_OFFSET..][..MAX_NAME_LEN].copy_from_slice(name);
    }

    pub(crate) fn inode_size(&self) -> u32 {
        u32::from_le_bytes(self.0[INODE_SIZE_OFFSET..][..4].try_into().unwrap())
    }

    pub(crate) fn set_inode_size(&mut self, size: u32) {
        self.0[INODE_SIZE_OFFSET..][..4].copy_from_slice(&size.to_le_bytes());
    }

    pub(crate) fn inode_flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.0[INODE_FLAGS_OFFSET])
    }

    pub(crate) fn set_inode_flags(&mut self, flags: FileFlags) {
        self.0[INODE_FLAGS_OFFSET] = flags.bits();
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("kind", &self.0[0])
            .field("magic", &self.0[1])
            .field("next", &self.0[2])
            .finish()
    }
}

/// The in-memory mirror of the superblock: the block count and the
/// free-block bitmap, bit set meaning free.
#[derive(Debug)]
pub(crate) struct SuperBlock {
    nblocks: u16,
    map: [u8; FREE_MAP_SIZE],
}

impl SuperBlock {
    /// Returns the superblock of a freshly formatted volume: every
    /// data block free, the superblock and root never free, trailing
    /// bits clear.
    fn format(nblocks: u16) -> SuperBlock {
        let mut map = [0u8; FREE_MAP_SIZE];
        for bnum in 2..nblocks as usize {
            bitset::set(&mut map, bnum);
        }
        SuperBlock { nblocks, map }
    }

    fn decode(blk: &Block) -> Result<SuperBlock> {
        if !blk.is_well_formed()
            || blk.kind_raw() != BlockKind::Super as u8
            || blk.next() != ROOT_BLOCK
        {
            return Err(Error::Invalid);
        }
        // A stored count of 0 means the full 256 blocks.
        let nblocks = match blk.bytes()[NBLOCKS_OFFSET] {
            0 => MAX_BLOCKS as u16,
            n => u16::from(n),
        };
        if nblocks < 2 {
            return Err(Error::Invalid);
        }
        let nbytes = (nblocks as usize).div_ceil(8);
        let mut map = [0u8; FREE_MAP_SIZE];
        map[..nbytes]
            .copy_from_slice(&blk.bytes()[FREE_MAP_OFFSET..][..nbytes]);
        if !bitset::is_clear(&map, SUPER_BLOCK as usize)
            || !bitset::is_clear(&map, ROOT_BLOCK as usize)
        {
            return Err(Error::Invalid);
        }
        Ok(SuperBlock { nblocks, map })
    }

    fn encode(&self) -> Block {
        let mut blk = Block::new(BlockKind::Super);
        blk.set_next(ROOT_BLOCK);
        blk.bytes_mut()[NBLOCKS_OFFSET] = self.nblocks as u8;
        let nbytes = (self.nblocks as usize).div_ceil(8);
        blk.bytes_mut()[FREE_MAP_OFFSET..][..nbytes]
            .copy_from_slice(&self.map[..nbytes]);
        blk
    }

    fn nblocks(&self) -> u16 {
        self.nblocks
    }

    fn free_count(&self) -> usize {
        bitset::popcount(&self.map, self.nblocks as usize)
    }

    /// Returns the lowest-numbered free block, if any.
    fn first_free(&self) -> Option<u8> {
        let bnum = bitset::ctz(&self.map, self.nblocks as usize);
        (bnum < self.nblocks as usize).then_some(bnum as u8)
    }

    fn is_free(&self, bnum: u8) -> bool {
        bitset::is_set(&self.map, bnum as usize)
    }

    fn set_free(&mut self, bnum: u8) {
        bitset::set(&mut self.map, bnum as usize);
    }

    fn clear_free(&mut self, bnum: u8) {
        bitset::clear(&mut self.map, bnum as usize);
    }

    /// Returns true iff no bit at or past the block count is set.
    fn trailing_clear(&self) -> bool {
        bitset::next_set(&self.map, MAX_BLOCKS, self.nblocks as usize)
            .is_none()
    }
}

/// Maps a file byte offset to its chain index, intra-block offset,
/// and the bytes of data region left in that block from the offset
/// onward.  Chain index 0 is the inode.
pub(crate) fn locate(ptr: u32) -> (u32, usize, usize) {
    let p = ptr as usize;
    if p < INODE_DATA_SIZE {
        (0, INODE_HEADER_SIZE + p, INODE_DATA_SIZE - p)
    } else {
        let q = (p - INODE_DATA_SIZE) / EXTENT_DATA_SIZE;
        let r = (p - INODE_DATA_SIZE) % EXTENT_DATA_SIZE;
        (q as u32 + 1, BLOCK_HEADER_SIZE + r, EXTENT_DATA_SIZE - r)
    }
}

/// The chain index of the block holding the given file byte offset.
fn block_index(ptr: u32) -> u32 {
    locate(ptr).0
}

/// The number of chain blocks a file of `size` bytes occupies.  Even
/// an empty file keeps its inode block.
fn blocks_for(size: u32) -> u32 {
    if size as usize <= INODE_DATA_SIZE {
        1
    } else {
        1 + (size - INODE_DATA_SIZE as u32).div_ceil(EXTENT_DATA_SIZE as u32)
    }
}

/// One open file: the identity of its inode, its parsed metadata,
/// the read pointer, and the single block of buffer this file is
/// allowed.
#[derive(Debug)]
struct OpenFile {
    inode: u8,
    parent: u8,
    name: [u8; MAX_NAME_LEN],
    flags: FileFlags,
    ptr: u32,
    size: u32,
    buf: Block,
    buf_bnum: Option<u8>,
    buf_index: u32,
}

impl OpenFile {
    fn from_inode(bnum: u8, blk: &Block) -> OpenFile {
        OpenFile {
            inode: bnum,
            parent: blk.inode_parent(),
            name: blk.inode_name(),
            flags: blk.inode_flags(),
            ptr: 0,
            size: blk.inode_size(),
            buf: blk.clone(),
            buf_bnum: Some(bnum),
            buf_index: 0,
        }
    }

    /// Makes the buffer hold the chain block at `target`.  Walking
    /// only goes forward; a rewind restarts from the inode.
    fn position(&mut self, disk: &Disk, target: u32) -> Result<()> {
        if self.buf_bnum.is_none() || target < self.buf_index {
            disk.read_block(self.inode as usize, self.buf.bytes_mut())?;
            self.buf_bnum = Some(self.inode);
            self.buf_index = 0;
        }
        while self.buf_index < target {
            let next = self.buf.next();
            if next == 0 {
                // The chain ended before the offset was reached.
                return Err(Error::Fault);
            }
            disk.read_block(next as usize, self.buf.bytes_mut())?;
            self.buf_bnum = Some(next);
            self.buf_index += 1;
        }
        Ok(())
    }

    fn read_byte(&mut self, disk: &Disk) -> Result<u8> {
        if self.flags.contains(FileFlags::DIR) {
            return Err(Error::IsDirectory);
        }
        if !self.flags.contains(FileFlags::READ) {
            return Err(Error::Access);
        }
        if self.ptr >= self.size {
            return Err(Error::Fault);
        }
        let (index, offset, _) = locate(self.ptr);
        self.position(disk, index)?;
        let byte = self.buf.bytes()[offset];
        self.ptr += 1;
        Ok(byte)
    }

    fn seek(&mut self, disk: &Disk, offset: u32) -> Result<()> {
        if offset < self.size {
            self.position(disk, block_index(offset))?;
        }
        self.ptr = offset;
        Ok(())
    }
}

/// Takes the allocator hint if one is pending, else scans the free
/// map.  The caller clears the free bit once the consuming write has
/// succeeded.
fn next_free_block(sb: &SuperBlock, hint: &mut Option<u8>) -> Option<u8> {
    if let Some(bnum) = hint.take() {
        return Some(bnum);
    }
    sb.first_free()
}

/// Walks the chain starting at `bnum`, rewriting each block as FREE
/// and marking it free in the map.  Passing 0 is a no-op.
fn free_chain(
    disk: &mut Disk,
    sb: &mut SuperBlock,
    hint: &mut Option<u8>,
    mut bnum: u8,
) -> Result<()> {
    let mut blk = Block::zeroed();
    while bnum != 0 {
        disk.read_block(bnum as usize, blk.bytes_mut())?;
        let next = blk.next();
        blk.set_kind(BlockKind::Free);
        blk.set_next(0);
        disk.write_block(bnum as usize, blk.bytes())?;
        sb.set_free(bnum);
        if hint.is_none() {
            *hint = Some(bnum);
        }
        trace!("freed block {bnum}");
        bnum = next;
    }
    Ok(())
}

/// The result of searching the root directory for a name.
enum Lookup {
    Found { child: u8 },
    NotFound { tombstone: Option<Slot> },
}

fn lookup(
    disk: &Disk,
    root: &Block,
    name: &[u8; MAX_NAME_LEN],
) -> Result<Lookup> {
    let mut scan = Scan::new(disk, root);
    let mut tombstone = None;
    while let Some((slot, entry)) = scan.next_entry()? {
        if entry.is_tombstone() {
            if tombstone.is_none() {
                tombstone = Some(slot);
            }
        } else if entry.name == *name {
            return Ok(Lookup::Found { child: entry.child });
        }
    }
    Ok(Lookup::NotFound { tombstone })
}

/// Rewrites the directory record at `slot`.  Block 1 goes through
/// the root mirror; extents are read-modify-written on disk.
fn write_entry_at(
    disk: &mut Disk,
    root: &mut Block,
    slot: Slot,
    entry: &Entry,
) -> Result<()> {
    if slot.bnum == ROOT_BLOCK {
        entry.encode(&mut root.bytes_mut()[slot.offset..]);
        disk.write_block(ROOT_BLOCK as usize, root.bytes())
    } else {
        let mut blk = Block::zeroed();
        disk.read_block(slot.bnum as usize, blk.bytes_mut())?;
        entry.encode(&mut blk.bytes_mut()[slot.offset..]);
        disk.write_block(slot.bnum as usize, blk.bytes())
    }
}

/// Appends a record past the current end of the directory, padding
/// over a block tail too short for a whole record and growing the
/// chain by one extent when the record lands past the last block.
fn append_entry(
    disk: &mut Disk,
    sb: &mut SuperBlock,
    hint: &mut Option<u8>,
    root: &mut Block,
    entry: &Entry,
) -> Result<()> {
    let size = root.inode_size();
    let (mut index, mut offset, room) = locate(size);
    let mut newsize = size + DIR_ENTRY_SIZE as u32;
    if room < DIR_ENTRY_SIZE {
        newsize += room as u32;
        index += 1;
        offset = BLOCK_HEADER_SIZE;
    }
    if index == 0 {
        entry.encode(&mut root.bytes_mut()[offset..]);
        root.set_inode_size(newsize);
        return disk.write_block(ROOT_BLOCK as usize, root.bytes());
    }
    // Walk to the parent of the target block.
    let mut prev_bnum = ROOT_BLOCK;
    let mut prev = root.clone();
    for _ in 1..index {
        let next = prev.next();
        if next == 0 {
            return Err(Error::Fault);
        }
        prev_bnum = next;
        disk.read_block(next as usize, prev.bytes_mut())?;
    }
    let target = prev.next();
    if target != 0 {
        let mut blk = Block::zeroed();
        disk.read_block(target as usize, blk.bytes_mut())?;
        entry.encode(&mut blk.bytes_mut()[offset..]);
        disk.write_block(target as usize, blk.bytes())?;
    } else {
        let bnum = next_free_block(sb, hint).ok_or(Error::NoMemory)?;
        let mut ext = Block::new(BlockKind::Extent);
        entry.encode(&mut ext.bytes_mut()[offset..]);
        disk.write_block(bnum as usize, ext.bytes())?;
        sb.clear_free(bnum);
        trace!("directory grew extent block {bnum}");
        prev.set_next(bnum);
        if prev_bnum == ROOT_BLOCK {
            root.set_next(bnum);
        } else {
            disk.write_block(prev_bnum as usize, prev.bytes())?;
        }
    }
    root.set_inode_size(newsize);
    disk.write_block(ROOT_BLOCK as usize, root.bytes())
}

/// Tombstones the directory record pointing at `child`.  A missing
/// record is not an error; there is simply nothing to clear.
fn clear_entry(disk: &mut Disk, root: &mut Block, child: u8) -> Result<()> {
    let mut found = None;
    let mut scan = Scan::new(disk, root);
    while let Some((slot, entry)) = scan.next_entry()? {
        if entry.child == child {
            found = Some(slot);
            break;
        }
    }
    let Some(slot) = found else {
        return Ok(());
    };
    if slot.bnum == ROOT_BLOCK {
        root.bytes_mut()[slot.offset + MAX_NAME_LEN] = 0;
        disk.write_block(ROOT_BLOCK as usize, root.bytes())
    } else {
        let mut blk = Block::zeroed();
        disk.read_block(slot.bnum as usize, blk.bytes_mut())?;
        blk.bytes_mut()[slot.offset + MAX_NAME_LEN] = 0;
        disk.write_block(slot.bnum as usize, blk.bytes())
    }
}

/// Validates and normalizes a file name.  Returns `None` for the
/// root directory itself ("/").  One leading '/' is accepted; any
/// other slash is not, since the tree is a single flat root.
fn parse_name(name: &str) -> Result<Option<[u8; MAX_NAME_LEN]>> {
    let stripped = name.strip_prefix('/').unwrap_or(name);
    if stripped.is_empty() {
        if name.is_empty() {
            return Err(Error::Invalid);
        }
        return Ok(None);
    }
    if stripped.contains('/') {
        return Err(Error::Invalid);
    }
    let bytes = stripped.as_bytes();
    if bytes.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let mut out = [0u8; MAX_NAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(Some(out))
}

/// Formats the file at `path` as an empty volume of
/// `⌊nbytes / BLOCK_SIZE⌋` blocks: a run of FREE blocks, a fresh
/// root directory at block 1, and the superblock at block 0 with an
/// all-free map.
pub fn mkfs<P: AsRef<Path>>(path: P, nbytes: u64) -> Result<()> {
    let mut disk = Disk::create(&path, nbytes)?;
    let nblocks = disk.nblocks() as usize;
    if !(2..=MAX_BLOCKS).contains(&nblocks) {
        return Err(Error::Invalid);
    }
    let free = Block::new(BlockKind::Free);
    for bnum in 2..nblocks {
        disk.write_block(bnum, free.bytes())?;
    }
    let mut root = Block::new(BlockKind::Inode);
    root.set_inode_flags(FileFlags::DIR | FileFlags::READ | FileFlags::WRITE);
    disk.write_block(ROOT_BLOCK as usize, root.bytes())?;
    let sb = SuperBlock::format(nblocks as u16);
    disk.write_block(SUPER_BLOCK as usize, sb.encode().bytes())?;
    disk.close()?;
    debug!("formatted volume of {nblocks} blocks");
    Ok(())
}

/// A mounted volume: the disk handle, the superblock and root
/// mirrors, the open-file table, and the free-block hint.
#[derive(Debug)]
pub struct Volume {
    disk: Disk,
    sb: SuperBlock,
    root: Block,
    table: FdTable<OpenFile>,
    next_block: Option<u8>,
}

impl Volume {
    /// Mounts the volume at `path`: verifies the superblock, scans
    /// every data block for well-formedness, and loads the root
    /// directory.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Volume> {
        let disk = Disk::open(path)?;
        let mut blk = Block::zeroed();
        disk.read_block(SUPER_BLOCK as usize, blk.bytes_mut())?;
        let sb = SuperBlock::decode(&blk)?;
        for bnum in 2..sb.nblocks() as usize {
            disk.read_block(bnum, blk.bytes_mut())?;
            if !blk.is_well_formed() {
                return Err(Error::Invalid);
            }
        }
        let mut root = Block::zeroed();
        disk.read_block(ROOT_BLOCK as usize, root.bytes_mut())?;
        if !root.is_well_formed()
            || root.kind_raw() != BlockKind::Inode as u8
            || !root.inode_flags().contains(FileFlags::DIR)
        {
            return Err(Error::Invalid);
        }
        debug!(
            "mounted volume: {} blocks, {} free",
            sb.nblocks(),
            sb.free_count()
        );
        Ok(Volume {
            disk,
            sb,
            root,
            table: FdTable::new(),
            next_block: None,
        })
    }

    /// Flushes the superblock and root mirrors, then closes the
    /// backing file.  Open descriptors are discarded.
    pub fn unmount(mut self) -> Result<()> {
        let sb = self.sb.encode();
        self.disk.write_block(SUPER_BLOCK as usize, sb.bytes())?;
        self.disk.write_block(ROOT_BLOCK as usize, self.root.bytes())?;
        debug!("unmounted volume");
        self.disk.close()
    }

    /// Returns the number of blocks in the volume.
    pub fn nblocks(&self) -> usize {
        self.sb.nblocks() as usize
    }

    /// Returns the number of free blocks.
    pub fn free_blocks(&self) -> usize {
        self.sb.free_count()
    }

    /// Opens `name`, creating the file if it does not exist.  A
    /// created file starts empty with read and write permission.
    pub fn open_file(&mut self, name: &str) -> Result<Fd> {
        let Some(fname) = parse_name(name)? else {
            let file = OpenFile::from_inode(ROOT_BLOCK, &self.root);
            return Ok(self.table.alloc(file));
        };
        let Volume { disk, sb, root, table, next_block } = self;
        match lookup(disk, root, &fname)? {
            Lookup::Found { child } => {
                let mut blk = Block::zeroed();
                disk.read_block(child as usize, blk.bytes_mut())?;
                if blk.kind_raw() != BlockKind::Inode as u8 {
                    return Err(Error::Fault);
                }
                Ok(table.alloc(OpenFile::from_inode(child, &blk)))
            }
            Lookup::NotFound { tombstone } => {
                let bnum =
                    next_free_block(sb, next_block).ok_or(Error::NoMemory)?;
                let mut blk = Block::new(BlockKind::Inode);
                blk.set_inode_parent(ROOT_BLOCK);
                blk.set_inode_name(&fname);
                blk.set_inode_flags(FileFlags::READ | FileFlags::WRITE);
                disk.write_block(bnum as usize, blk.bytes())?;
                sb.clear_free(bnum);
                let entry = Entry { name: fname, child: bnum };
                match tombstone {
                    Some(slot) => write_entry_at(disk, root, slot, &entry)?,
                    None => append_entry(disk, sb, next_block, root, &entry)?,
                }
                debug!(
                    "created {:?} at block {bnum}",
                    String::from_utf8_lossy(entry.name())
                );
                Ok(table.alloc(OpenFile::from_inode(bnum, &blk)))
            }
        }
    }

    /// Releases the descriptor.  No disk I/O.
    pub fn close_file(&mut self, fd: Fd) -> Result<()> {
        self.table.free(fd).map(drop).ok_or(Error::BadFd)
    }

    /// Replaces the file's contents with `buf`, reusing the existing
    /// chain, growing it block by block, and releasing any old tail.
    /// The read pointer resets to 0.
    pub fn write_file(&mut self, fd: Fd, buf: &[u8]) -> Result<()> {
        let Volume { disk, sb, table, next_block, .. } = self;
        let file = table.get_mut(fd).ok_or(Error::BadFd)?;
        if file.flags.contains(FileFlags::DIR) {
            return Err(Error::IsDirectory);
        }
        if !file.flags.contains(FileFlags::WRITE) {
            return Err(Error::Access);
        }
        let size: u32 = buf.len().try_into().map_err(|_| Error::Overflow)?;

        // Fail before touching the chain if the volume cannot hold
        // the new contents.
        let needed = blocks_for(size).saturating_sub(blocks_for(file.size));
        if (sb.free_count() as u32) < needed {
            return Err(Error::NoMemory);
        }

        let mut bnum = file.inode;
        let mut remaining = buf;
        let mut work = Block::zeroed();
        loop {
            disk.read_block(bnum as usize, work.bytes_mut())?;
            let n;
            if bnum == file.inode {
                work.set_kind(BlockKind::Inode);
                work.set_inode_size(size);
                n = remaining.len().min(INODE_DATA_SIZE);
                work.bytes_mut()[INODE_HEADER_SIZE..][..n]
                    .copy_from_slice(&remaining[..n]);
            } else {
                work.set_kind(BlockKind::Extent);
                n = remaining.len().min(EXTENT_DATA_SIZE);
                work.bytes_mut()[BLOCK_HEADER_SIZE..][..n]
                    .copy_from_slice(&remaining[..n]);
            }
            let old_next = work.next();
            let mut fresh = None;
            if remaining.len() <= n {
                work.set_next(0);
            } else if old_next == 0 {
                let nb =
                    next_free_block(sb, next_block).ok_or(Error::NoMemory)?;
                work.set_next(nb);
                fresh = Some(nb);
            }
            disk.write_block(bnum as usize, work.bytes())?;
            sb.clear_free(bnum);
            if let Some(nb) = fresh {
                sb.clear_free(nb);
                trace!("chain grew block {nb}");
            }
            remaining = &remaining[n..];
            if remaining.is_empty() {
                // Whatever hung off this block before is now past
                // the end of the file.
                free_chain(disk, sb, next_block, old_next)?;
                break;
            }
            bnum = work.next();
        }
        file.size = size;
        file.ptr = 0;
        file.buf_bnum = None;
        Ok(())
    }

    /// Frees the file's whole chain, tombstones its directory entry,
    /// and releases the descriptor.
    pub fn delete_file(&mut self, fd: Fd) -> Result<()> {
        let Volume { disk, sb, root, table, next_block } = self;
        let file = table.get(fd).ok_or(Error::BadFd)?;
        if file.flags.contains(FileFlags::DIR) {
            return Err(Error::IsDirectory);
        }
        if !file.flags.contains(FileFlags::WRITE) {
            return Err(Error::Access);
        }
        debug_assert_eq!(file.parent, ROOT_BLOCK);
        let inode = file.inode;
        let len =
            file.name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        debug!(
            "deleting {:?} at block {inode}",
            String::from_utf8_lossy(&file.name[..len])
        );
        free_chain(disk, sb, next_block, inode)?;
        clear_entry(disk, root, inode)?;
        let _ = table.free(fd);
        Ok(())
    }

    /// Reads the byte at the current pointer and advances it.
    /// Reading at or past the end of the file is a fault.
    pub fn read_byte(&mut self, fd: Fd) -> Result<u8> {
        let Volume { disk, table, .. } = self;
        let file = table.get_mut(fd).ok_or(Error::BadFd)?;
        file.read_byte(disk)
    }

    /// Moves the read pointer.  An offset past the end of the file
    /// is allowed; the subsequent read faults.
    pub fn seek(&mut self, fd: Fd, offset: u32) -> Result<()> {
        let Volume { disk, table, .. } = self;
        let file = table.get_mut(fd).ok_or(Error::BadFd)?;
        file.seek(disk, offset)
    }

    /// Returns the names of the live files in the root directory, in
    /// directory order.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut scan = Scan::new(&self.disk, &self.root);
        while let Some((_, entry)) = scan.next_entry()? {
            if !entry.is_tombstone() {
                names.push(String::from_utf8_lossy(entry.name()).into_owned());
            }
        }
        Ok(names)
    }

    /// A light consistency pass: every data block must be well
    /// formed, and a block is marked free in the map exactly when it
    /// is FREE on disk.
    pub fn check(&self) -> Result<()> {
        if self.sb.is_free(SUPER_BLOCK) || self.sb.is_free(ROOT_BLOCK) {
            return Err(Error::Invalid);
        }
        if !self.sb.trailing_clear() {
            return Err(Error::Invalid);
        }
        let mut blk = Block::zeroed();
        for bnum in 2..self.sb.nblocks() as usize {
            self.disk.read_block(bnum, blk.bytes_mut())?;
            if !blk.is_well_formed() {
                return Err(Error::Invalid);
            }
            let marked = self.sb.is_free(bnum as u8);
            let actual = blk.kind_raw() == BlockKind::Free as u8;
            if marked != actual {
                return Err(Error::Invalid);
            }
        }
        Ok(())
    }
}
