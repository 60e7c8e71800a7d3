//! The nestfs on-disk filesystem.
//!
//! The filesystem itself is stateless in memory: every operation reaches
//! disk blocks through the buffer cache, and the in-memory inode state
//! (`mlock`, `mref`) is overlaid on the cached inode blocks, zeroed by the
//! inode-block cleaner on load. An [`InodeRef`] pairs the `mref` count
//! with the buffer-cache reference on the block that holds the inode, so
//! the lock-holder invariant (whoever holds `mlock` also holds the block)
//! falls out of the handle's lifetime.

pub mod layout;

use crate::bufcache::{self, BLOCK_SIZE, EntryRef};
use crate::proc::image::ImageRead;
use crate::vfs::{File, FileType, Vnode};
use crate::KernelError;
use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::Ordering;
use layout::{
    Dirent, INODES_PER_BLOCK, Inode, MAGIC, NDIRECT, NINDIRECT, ROOT_INUM, SUPERBLOCK_OFFSET,
    SuperBlock, TYPE_DIRECTORY, TYPE_EMPTY, TYPE_REGULAR,
};

/// Decode a block number that may carry an error (`bn` at or above the
/// encoded error range).
pub fn blocknum_to_result(bn: u32) -> Result<u32, KernelError> {
    if bn >= crate::MIN_ERROR as u32 {
        Err(KernelError::try_from(bn as i32 as isize).unwrap_or(KernelError::Io))
    } else {
        Ok(bn)
    }
}

/// Zero the memory-only inode fields when an inode block is loaded.
fn clean_inode_block(buf: &mut [u8; BLOCK_SIZE]) {
    let mlock_off = core::mem::offset_of!(Inode, mlock);
    for slot in 0..INODES_PER_BLOCK {
        let base = slot * core::mem::size_of::<Inode>() + mlock_off;
        buf[base..base + 8].fill(0);
    }
}

/// Read the superblock fields through a short cache reference.
pub fn superblock() -> Result<SuperBlock, KernelError> {
    let e = bufcache::get_disk_entry(bufcache::SUPERBLOCK_BN, None)?;
    let sb = bufcache::with_block(e, |buf| unsafe {
        core::ptr::read_unaligned(buf.as_ptr().add(SUPERBLOCK_OFFSET) as *const SuperBlock)
    });
    bufcache::put_entry(e);
    if sb.magic == MAGIC {
        Ok(sb)
    } else {
        Err(KernelError::Io)
    }
}

/// A counted reference to an in-memory inode.
///
/// Holds one `mref` and one buffer-cache reference on the containing
/// block; both are released by [`put_inode`] (or the drop of a vnode that
/// owns the handle).
pub struct InodeRef {
    entry: EntryRef,
    ptr: *const Inode,
    inum: u32,
}

unsafe impl Send for InodeRef {}
unsafe impl Sync for InodeRef {}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        unsafe { &*self.ptr }
    }
}

impl InodeRef {
    /// This inode's number.
    #[inline]
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// Mark the containing block dirty so the next sync writes it back.
    pub fn mark_dirty(&self) {
        bufcache::get_write(self.entry);
        bufcache::put_write(self.entry);
    }

    /// Mutable access to the on-disk fields.
    ///
    /// # Safety
    /// The caller must hold the inode's write lock and call
    /// [`InodeRef::mark_dirty`] after the update.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn inode_mut(&self) -> &mut Inode {
        unsafe { &mut *(self.ptr as *mut Inode) }
    }
}

/// Return inode `inum`, with one `mref` and the containing block
/// referenced. Fails with `NoSuchEntry` for out-of-range numbers.
pub fn get_inode(inum: u32) -> Result<InodeRef, KernelError> {
    let sb = superblock()?;
    if inum == 0 || inum as u64 >= sb.ninodes {
        return Err(KernelError::NoSuchEntry);
    }
    let bn = sb.inode_bn as u32 + inum / INODES_PER_BLOCK as u32;
    let entry = bufcache::get_disk_entry(bn, Some(clean_inode_block))?;
    let ptr = unsafe {
        (bufcache::block_ptr(entry) as *const Inode)
            .add(inum as usize % INODES_PER_BLOCK)
    };
    let ino = InodeRef { entry, ptr, inum };
    ino.mref.fetch_add(1, Ordering::SeqCst);
    Ok(ino)
}

/// Drop a reference obtained from [`get_inode`].
pub fn put_inode(ino: InodeRef) {
    ino.mref.fetch_sub(1, Ordering::SeqCst);
    bufcache::put_entry(ino.entry);
}

// Block map.

fn read_blocknum(bn: u32, index: usize) -> Result<u32, KernelError> {
    let e = bufcache::get_disk_entry(bn, None)?;
    let value = bufcache::with_block(e, |buf| {
        u32::from_le_bytes(buf[index * 4..index * 4 + 4].try_into().unwrap())
    });
    bufcache::put_entry(e);
    Ok(value)
}

fn write_blocknum(bn: u32, index: usize, value: u32) -> Result<(), KernelError> {
    let e = bufcache::get_disk_entry(bn, None)?;
    bufcache::get_write(e);
    bufcache::with_block_mut(e, |buf| {
        buf[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    });
    bufcache::put_write(e);
    bufcache::put_entry(e);
    Ok(())
}

/// The data block number backing file block `bi` of `ino`, or 0 when no
/// block is allocated there. Walks the direct, indirect, and
/// doubly-indirect maps.
pub fn block_at(ino: &Inode, bi: usize) -> Result<u32, KernelError> {
    if bi < NDIRECT {
        return Ok(ino.direct[bi]);
    }
    let bi = bi - NDIRECT;
    if bi < NINDIRECT {
        if ino.indirect == 0 {
            return Ok(0);
        }
        return read_blocknum(ino.indirect, bi);
    }
    let bi = bi - NINDIRECT;
    if bi < NINDIRECT * NINDIRECT {
        if ino.indirect2 == 0 {
            return Ok(0);
        }
        // The indirect block number comes from the indirect2 block just
        // loaded, then the data block number from that indirect block.
        let indirect_bn = read_blocknum(ino.indirect2, bi / NINDIRECT)?;
        if indirect_bn == 0 {
            return Ok(0);
        }
        return read_blocknum(indirect_bn, bi % NINDIRECT);
    }
    Err(KernelError::InvalidArgument)
}

// A freshly allocated block may hold stale bytes; scrub it through a write
// reference before linking it anywhere.
fn zero_fresh_block(bn: u32) -> Result<(), KernelError> {
    let e = bufcache::get_disk_entry(bn, None)?;
    bufcache::get_write(e);
    bufcache::with_block_mut(e, |buf| buf.fill(0));
    bufcache::put_write(e);
    bufcache::put_entry(e);
    Ok(())
}

/// Install data block `bn` as file block `bi` of `ino`, allocating (and
/// zeroing) any indirect blocks the position needs.
///
/// The caller holds the inode's write lock.
pub fn map_block(ino: &InodeRef, bi: usize, bn: u32) -> Result<(), KernelError> {
    if bi < NDIRECT {
        unsafe { ino.inode_mut().direct[bi] = bn };
        ino.mark_dirty();
        return Ok(());
    }
    let ibi = bi - NDIRECT;
    if ibi < NINDIRECT {
        if ino.indirect == 0 {
            let fresh = allocate_block()?;
            zero_fresh_block(fresh)?;
            unsafe { ino.inode_mut().indirect = fresh };
            ino.mark_dirty();
        }
        return write_blocknum(ino.indirect, ibi, bn);
    }
    let ibi = ibi - NINDIRECT;
    if ibi < NINDIRECT * NINDIRECT {
        if ino.indirect2 == 0 {
            let fresh = allocate_block()?;
            zero_fresh_block(fresh)?;
            unsafe { ino.inode_mut().indirect2 = fresh };
            ino.mark_dirty();
        }
        let mut indirect_bn = read_blocknum(ino.indirect2, ibi / NINDIRECT)?;
        if indirect_bn == 0 {
            indirect_bn = allocate_block()?;
            zero_fresh_block(indirect_bn)?;
            write_blocknum(ino.indirect2, ibi / NINDIRECT, indirect_bn)?;
        }
        return write_blocknum(indirect_bn, ibi % NINDIRECT, bn);
    }
    Err(KernelError::InvalidArgument)
}

/// Allocate a fresh block: scan the free-block bitmap for the first set
/// bit below `nblocks`, clear it, and return the block number.
pub fn allocate_block() -> Result<u32, KernelError> {
    let sb = superblock()?;
    let fbb = bufcache::get_disk_entry(sb.fbb_bn as u32, None)?;
    bufcache::get_write(fbb);
    let found = bufcache::with_block_mut(fbb, |buf| {
        for bn in 0..sb.nblocks as usize {
            if buf[bn / 8] & (1 << (bn % 8)) != 0 {
                buf[bn / 8] &= !(1 << (bn % 8));
                return Some(bn as u32);
            }
        }
        None
    });
    bufcache::put_write(fbb);
    bufcache::put_entry(fbb);
    found.ok_or(KernelError::NoSpace)
}

/// Scan the inode table for a free slot, skipping the null and root
/// inodes. Marks the winning block dirty and returns the inode number.
pub fn find_empty_inode() -> Result<u32, KernelError> {
    let sb = superblock()?;
    for inum in 2..sb.ninodes as u32 {
        let ino = get_inode(inum)?;
        let empty = ino.typ == TYPE_EMPTY;
        if empty {
            ino.mark_dirty();
            put_inode(ino);
            return Ok(inum);
        }
        put_inode(ino);
    }
    Err(KernelError::NoSpace)
}

/// Look up `name` in directory `dir`. Returns the matching inode number,
/// or `None` when no entry matches.
///
/// The caller holds at least a read lock on the directory inode.
pub fn lookup_inode(dir: &Inode, name: &str) -> Result<Option<u32>, KernelError> {
    let mut diroff = 0usize;
    while diroff < dir.size as usize {
        let bn = block_at(dir, diroff / BLOCK_SIZE)?;
        if bn == 0 {
            break;
        }
        let e = bufcache::get_disk_entry(bn, None)?;
        let bsz = (dir.size as usize - diroff).min(BLOCK_SIZE);
        let hit = bufcache::with_block(e, |buf| {
            for slot in 0..bsz / core::mem::size_of::<Dirent>() {
                let entry = unsafe {
                    &*(buf.as_ptr().add(slot * core::mem::size_of::<Dirent>()) as *const Dirent)
                };
                if entry.matches(name) {
                    return Some(entry.inum);
                }
            }
            None
        });
        bufcache::put_entry(e);
        if hit.is_some() {
            return Ok(hit);
        }
        diroff += BLOCK_SIZE;
    }
    Ok(None)
}

// Find a free directory entry slot and write `entry` into it. Directories
// do not grow a fresh block when every slot is taken.
fn install_dirent(dir: &InodeRef, entry: Dirent) -> Result<(), KernelError> {
    let mut diroff = 0usize;
    while diroff < dir.size as usize {
        let bn = block_at(dir, diroff / BLOCK_SIZE)?;
        if bn == 0 {
            break;
        }
        let e = bufcache::get_disk_entry(bn, None)?;
        let bsz = (dir.size as usize - diroff).min(BLOCK_SIZE);
        bufcache::get_write(e);
        let installed = bufcache::with_block_mut(e, |buf| {
            for slot in 0..bsz / core::mem::size_of::<Dirent>() {
                let cursor = unsafe {
                    &mut *(buf.as_mut_ptr().add(slot * core::mem::size_of::<Dirent>())
                        as *mut Dirent)
                };
                if cursor.inum == 0 {
                    *cursor = entry;
                    return true;
                }
            }
            false
        });
        bufcache::put_write(e);
        bufcache::put_entry(e);
        if installed {
            return Ok(());
        }
        diroff += BLOCK_SIZE;
    }
    Err(KernelError::NoSpace)
}

/// Create an empty regular file named `name` in the root directory and
/// return its inode number. Fails with `FileExists` when the name is
/// already taken.
pub fn create_file(name: &str) -> Result<u32, KernelError> {
    let entry_template =
        Dirent::new(0, name).ok_or(KernelError::InvalidArgument)?;

    let root = get_inode(ROOT_INUM)?;
    root.lock_write();
    let r = (|| {
        if lookup_inode(&root, name)?.is_some() {
            return Err(KernelError::FileExists);
        }
        let inum = find_empty_inode()?;
        let ino = get_inode(inum)?;
        {
            let raw = unsafe { ino.inode_mut() };
            raw.typ = TYPE_REGULAR;
            raw.nlink = 1;
            raw.size = 0;
            raw.direct = [0; NDIRECT];
            raw.indirect = 0;
            raw.indirect2 = 0;
        }
        ino.mark_dirty();
        put_inode(ino);
        let mut entry = entry_template;
        entry.inum = inum;
        install_dirent(&root, entry)?;
        Ok(inum)
    })();
    root.unlock_write();
    put_inode(root);
    r
}

// The vnode over an on-disk inode.

/// A vnode backed by a nestfs inode. Owns one inode reference for its
/// lifetime.
pub struct InodeVnode {
    ino: InodeRef,
}

impl InodeVnode {
    /// Wrap an inode reference.
    pub fn new(ino: InodeRef) -> Self {
        Self { ino }
    }
}

impl Drop for InodeVnode {
    fn drop(&mut self) {
        // Reconstruct the handle to release both counts.
        let ino = InodeRef {
            entry: self.ino.entry,
            ptr: self.ino.ptr,
            inum: self.ino.inum,
        };
        put_inode(ino);
    }
}

impl Vnode for InodeVnode {
    fn read(&self, buf: &mut [u8], off: &mut usize) -> Result<usize, KernelError> {
        let ino = &self.ino;
        ino.lock_read();
        let r = (|| {
            let size = ino.size as usize;
            let mut nread = 0;
            while nread < buf.len() && *off < size {
                let bn = block_at(ino, *off / BLOCK_SIZE)?;
                if bn == 0 {
                    break;
                }
                let boff = *off % BLOCK_SIZE;
                let ncopy = (buf.len() - nread)
                    .min(size - *off)
                    .min(BLOCK_SIZE - boff);
                let e = bufcache::get_disk_entry(bn, None)?;
                bufcache::with_block(e, |block| {
                    buf[nread..nread + ncopy].copy_from_slice(&block[boff..boff + ncopy]);
                });
                bufcache::put_entry(e);
                nread += ncopy;
                *off += ncopy;
            }
            Ok(nread)
        })();
        ino.unlock_read();
        r
    }

    fn write(&self, buf: &[u8], off: &mut usize) -> Result<usize, KernelError> {
        let ino = &self.ino;
        ino.lock_write();
        let mut nwritten = 0;
        let r = (|| {
            while nwritten < buf.len() {
                let bi = *off / BLOCK_SIZE;
                let mut bn = block_at(ino, bi)?;
                if bn == 0 {
                    bn = allocate_block()?;
                    zero_fresh_block(bn)?;
                    map_block(ino, bi, bn)?;
                }
                let boff = *off % BLOCK_SIZE;
                let ncopy = (buf.len() - nwritten).min(BLOCK_SIZE - boff);
                let e = bufcache::get_disk_entry(bn, None)?;
                bufcache::get_write(e);
                bufcache::with_block_mut(e, |block| {
                    block[boff..boff + ncopy].copy_from_slice(&buf[nwritten..nwritten + ncopy]);
                });
                bufcache::put_write(e);
                bufcache::put_entry(e);
                nwritten += ncopy;
                *off += ncopy;
                // File size grows monotonically, never shrinks here.
                if *off > ino.size as usize {
                    unsafe { ino.inode_mut().size = *off as u32 };
                    ino.mark_dirty();
                }
            }
            Ok(())
        })();
        ino.unlock_write();
        match r {
            Ok(()) => Ok(nwritten),
            Err(_) if nwritten > 0 => Ok(nwritten),
            Err(e) => Err(e),
        }
    }

    fn size(&self) -> Result<usize, KernelError> {
        Ok(self.ino.size as usize)
    }
}

/// Look up `name` in the root directory and return a referenced inode.
pub fn open_inode(name: &str) -> Result<InodeRef, KernelError> {
    let root = get_inode(ROOT_INUM)?;
    root.lock_read();
    let found = lookup_inode(&root, name);
    root.unlock_read();
    put_inode(root);
    match found? {
        Some(inum) => get_inode(inum),
        None => Err(KernelError::NoSuchEntry),
    }
}

/// Open (optionally creating) a root-directory file as a [`File`] handle.
pub fn open_file(
    name: &str,
    readable: bool,
    writeable: bool,
    create: bool,
    truncate: bool,
) -> Result<Arc<File>, KernelError> {
    let ino = match open_inode(name) {
        Err(KernelError::NoSuchEntry) if create => {
            create_file(name)?;
            open_inode(name)?
        }
        other => other?,
    };
    if ino.typ == TYPE_DIRECTORY {
        put_inode(ino);
        return Err(KernelError::IsDirectory);
    }
    if ino.typ != TYPE_REGULAR {
        put_inode(ino);
        return Err(KernelError::NoSuchEntry);
    }
    if truncate && writeable {
        // Drop the byte count; the data blocks stay allocated.
        ino.lock_write();
        unsafe { ino.inode_mut().size = 0 };
        ino.mark_dirty();
        ino.unlock_write();
    }
    Ok(File::new(
        FileType::Regular,
        readable,
        writeable,
        Arc::new(InodeVnode::new(ino)),
    ))
}

/// A root-directory file used as an exec image source.
pub struct DiskFile {
    vnode: InodeVnode,
}

impl DiskFile {
    /// Open `name` from the root directory.
    pub fn open(name: &str) -> Result<Self, KernelError> {
        let ino = open_inode(name)?;
        if ino.typ != TYPE_REGULAR {
            put_inode(ino);
            return Err(KernelError::NoSuchEntry);
        }
        Ok(Self {
            vnode: InodeVnode::new(ino),
        })
    }
}

impl ImageRead for DiskFile {
    fn len(&self) -> usize {
        self.vnode.ino.size as usize
    }

    fn read_at(&self, off: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut off = off;
        self.vnode.read(buf, &mut off)
    }
}

/// Read up to `buf.len()` bytes from the root-directory file `name`,
/// starting at byte `off`. The `readdiskfile` system call.
pub fn read_file_data(name: &str, buf: &mut [u8], off: usize) -> Result<usize, KernelError> {
    let ino = open_inode(name)?;
    let vnode = InodeVnode::new(ino);
    let mut off = off;
    vnode.read(buf, &mut off)
}

#[cfg(test)]
pub(crate) mod mkfs {
    //! Test support: build a tiny nestfs volume image.

    use super::*;
    use alloc::vec::Vec;

    pub const NBLOCKS: usize = 256;
    pub const NINODES: usize = 64;
    const FBB_BN: usize = 1;
    const INODE_BN: usize = 2;
    const DATA_BN: usize = 3;

    fn put_inode_raw(img: &mut [u8], inum: usize, ino: &Inode) {
        let base = INODE_BN * BLOCK_SIZE + inum * core::mem::size_of::<Inode>();
        unsafe {
            core::ptr::copy_nonoverlapping(
                ino as *const _ as *const u8,
                img[base..].as_mut_ptr(),
                core::mem::size_of::<Inode>(),
            );
        }
    }

    fn raw_inode(typ: u16, size: u32, direct: &[u32]) -> Inode {
        let mut ino = Inode {
            typ,
            nlink: 1,
            size,
            direct: [0; NDIRECT],
            indirect: 0,
            indirect2: 0,
            mlock: core::sync::atomic::AtomicU32::new(0),
            mref: core::sync::atomic::AtomicU32::new(0),
            _reserved: 0,
        };
        ino.direct[..direct.len()].copy_from_slice(direct);
        ino
    }

    /// Build a volume whose root directory holds `files`.
    pub fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut img = alloc::vec![0u8; NBLOCKS * BLOCK_SIZE];
        let mut next_data = DATA_BN;

        // Root directory: one data block of dirents. The directory's size
        // covers the whole block; free entries inside it have `inum == 0`.
        let rootdir_bn = next_data;
        next_data += 1;
        let root = raw_inode(TYPE_DIRECTORY, BLOCK_SIZE as u32, &[rootdir_bn as u32]);
        put_inode_raw(&mut img, ROOT_INUM as usize, &root);

        for (i, (name, data)) in files.iter().enumerate() {
            let inum = 2 + i;
            let mut blocks = Vec::new();
            for chunk in data.chunks(BLOCK_SIZE) {
                let bn = next_data;
                next_data += 1;
                img[bn * BLOCK_SIZE..bn * BLOCK_SIZE + chunk.len()].copy_from_slice(chunk);
                blocks.push(bn as u32);
            }
            assert!(blocks.len() <= NDIRECT, "mkfs only writes direct files");
            put_inode_raw(&mut img, inum, &raw_inode(TYPE_REGULAR, data.len() as u32, &blocks));

            let entry = Dirent::new(inum as u32, name).unwrap();
            let base = rootdir_bn * BLOCK_SIZE + i * core::mem::size_of::<Dirent>();
            unsafe {
                core::ptr::copy_nonoverlapping(
                    &entry as *const _ as *const u8,
                    img[base..].as_mut_ptr(),
                    core::mem::size_of::<Dirent>(),
                );
            }
        }

        // Free-block bitmap: everything free, then clear the used prefix.
        for byte in img[FBB_BN * BLOCK_SIZE..(FBB_BN + 1) * BLOCK_SIZE].iter_mut() {
            *byte = 0xff;
        }
        for bn in 0..next_data {
            img[FBB_BN * BLOCK_SIZE + bn / 8] &= !(1 << (bn % 8));
        }
        for bn in NBLOCKS..8 * BLOCK_SIZE {
            img[FBB_BN * BLOCK_SIZE + bn / 8] &= !(1 << (bn % 8));
        }

        let sb = SuperBlock {
            magic: MAGIC,
            nblocks: NBLOCKS as u64,
            nswap: 0,
            ninodes: NINODES as u64,
            njournal: 0,
            swap_bn: 0,
            fbb_bn: FBB_BN as u64,
            inode_bn: INODE_BN as u64,
            data_bn: DATA_BN as u64,
            journal_bn: 0,
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                &sb as *const _ as *const u8,
                img[SUPERBLOCK_OFFSET..].as_mut_ptr(),
                core::mem::size_of::<SuperBlock>(),
            );
        }
        img
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufcache::testing as cache;

    #[test]
    fn read_file_from_root_directory() {
        let _env = cache::setup(mkfs::build(&[("hello.txt", b"hello world\n")]));
        let mut buf = [0u8; 16];
        let n = read_file_data("hello.txt", &mut buf, 0).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf[..12], b"hello world\n");

        // Offset reads clamp at end of file.
        let n = read_file_data("hello.txt", &mut buf, 6).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], b"world\n");
    }

    #[test]
    fn lookup_misses_report_no_entry() {
        let _env = cache::setup(mkfs::build(&[("hello.txt", b"hi")]));
        assert_eq!(
            read_file_data("absent.txt", &mut [0u8; 4], 0).unwrap_err(),
            KernelError::NoSuchEntry
        );
        let root = get_inode(layout::ROOT_INUM).unwrap();
        root.lock_read();
        assert_eq!(lookup_inode(&root, "absent.txt").unwrap(), None);
        assert_eq!(lookup_inode(&root, "hello.txt").unwrap(), Some(2));
        root.unlock_read();
        put_inode(root);
    }

    #[test]
    fn write_then_read_round_trip() {
        let _env = cache::setup(mkfs::build(&[("notes", b"")]));
        let f = open_file("notes", true, true, false, false).unwrap();
        assert_eq!(f.write(b"abcdef").unwrap(), 6);
        f.seek(0, crate::vfs::Whence::Set).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(f.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn writes_grow_size_monotonically() {
        let _env = cache::setup(mkfs::build(&[("notes", b"")]));
        let ino = open_inode("notes").unwrap();
        let vnode = InodeVnode::new(ino);
        let mut off = 0;
        vnode.write(b"abcd", &mut off).unwrap();
        assert_eq!(vnode.size().unwrap(), 4);
        // Rewriting inside the file must not shrink it.
        let mut off = 1;
        vnode.write(b"x", &mut off).unwrap();
        assert_eq!(vnode.size().unwrap(), 4);
        // Extending past the old size grows it, and the new range reads
        // back what was written.
        let mut off = 4;
        vnode.write(b"efgh", &mut off).unwrap();
        assert_eq!(vnode.size().unwrap(), 8);
        let mut off = 0;
        let mut buf = [0u8; 8];
        assert_eq!(vnode.read(&mut buf, &mut off).unwrap(), 8);
        assert_eq!(&buf, b"axcdefgh");
    }

    #[test]
    fn allocation_clears_fbb_bits_and_never_repeats() {
        let _env = cache::setup(mkfs::build(&[]));
        let a = allocate_block().unwrap();
        let b = allocate_block().unwrap();
        assert_ne!(a, b);
        let sb = superblock().unwrap();
        let fbb = bufcache::get_disk_entry(sb.fbb_bn as u32, None).unwrap();
        bufcache::with_block(fbb, |buf| {
            assert_eq!(buf[a as usize / 8] & (1 << (a % 8)), 0);
            assert_eq!(buf[b as usize / 8] & (1 << (b % 8)), 0);
        });
        bufcache::put_entry(fbb);
    }

    #[test]
    fn exhausted_bitmap_reports_no_space() {
        let _env = cache::setup(mkfs::build(&[]));
        let mut last = 0;
        loop {
            match allocate_block() {
                Ok(bn) => last = bn,
                Err(e) => {
                    assert_eq!(e, KernelError::NoSpace);
                    break;
                }
            }
        }
        assert_eq!(last as usize, mkfs::NBLOCKS - 1);
    }

    #[test]
    fn file_data_spans_indirect_blocks() {
        let _env = cache::setup(mkfs::build(&[("big", b"")]));
        let ino = open_inode("big").unwrap();
        let vnode = InodeVnode::new(ino);

        // One byte in the indirect range and one in the doubly-indirect
        // range; the map must allocate the intermediate blocks on demand.
        let indirect_off = NDIRECT * BLOCK_SIZE + 17;
        let mut off = indirect_off;
        vnode.write(b"I", &mut off).unwrap();
        let double_off = (NDIRECT + NINDIRECT) * BLOCK_SIZE + 33;
        let mut off = double_off;
        vnode.write(b"D", &mut off).unwrap();

        assert!(vnode.ino.indirect != 0);
        assert!(vnode.ino.indirect2 != 0);
        assert_eq!(block_at(&vnode.ino, NDIRECT - 1).unwrap(), 0);

        let mut buf = [0u8; 1];
        let mut off = indirect_off;
        vnode.read(&mut buf, &mut off).unwrap();
        assert_eq!(&buf, b"I");
        let mut off = double_off;
        vnode.read(&mut buf, &mut off).unwrap();
        assert_eq!(&buf, b"D");
    }

    #[test]
    fn created_files_are_found_and_persist_through_sync() {
        let _env = cache::setup(mkfs::build(&[("existing", b"x")]));
        assert_eq!(
            create_file("existing").unwrap_err(),
            KernelError::FileExists
        );
        create_file("fresh").unwrap();
        let f = open_file("fresh", true, true, false, false).unwrap();
        f.write(b"persisted").unwrap();
        drop(f);

        // Flush everything and drop the cache; a re-read must come from
        // disk.
        bufcache::sync(false).unwrap();
        bufcache::sync(true).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read_file_data("fresh", &mut buf, 0).unwrap(), 9);
        assert_eq!(&buf[..9], b"persisted");
    }

    #[test]
    fn open_missing_without_create_fails() {
        let _env = cache::setup(mkfs::build(&[]));
        assert_eq!(
            open_file("nope", true, false, false, false).unwrap_err(),
            KernelError::NoSuchEntry
        );
        // With create, the file appears empty.
        let f = open_file("nope", true, true, true, false).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }
}
