//! The disk buffer cache.
//!
//! A bounded, associative cache of disk blocks: [`NE`] fixed slots keyed by
//! block number, an LRU list of resident blocks, a prefetch list of blocks
//! fetched speculatively, and a dirty list feeding [`sync`]. Callers hold a
//! read reference (`get_disk_entry` / `put_entry`) while they touch a
//! buffer and an exclusive write reference (`get_write` / `put_write`)
//! while they modify it.
//!
//! Locking: the cache-wide lock protects every slot's block number,
//! reference count, and list membership; each slot additionally has its own
//! lock for its flags and the buffer pointer. The cache lock is always
//! taken before a slot lock, never the other way around.

use crate::mm::Page;
use crate::sync::{SpinLock, WaitQueue, wait_until};
use crate::KernelError;
use core::sync::atomic::{AtomicI32, Ordering};
use roost::dev::{self, FETCH_AGAIN, FETCH_IO};

/// Bytes per cached block; equal to the page size.
pub const BLOCK_SIZE: usize = 4096;
/// Number of cache slots.
pub const NE: usize = 100;
/// Prefetch quota: how many consecutive blocks a first load pulls in.
pub const N_PREFETCH: usize = NE / 5;
/// The pinned superblock's block number.
pub const SUPERBLOCK_BN: u32 = 0;
/// Sentinel block number of an unoccupied slot.
pub const EMPTY_BLOCK: u32 = u32::MAX;

/// Cleaner run once on a freshly loaded buffer (e.g. to zero the
/// memory-only fields of inode blocks).
pub type Cleaner = fn(&mut [u8; BLOCK_SIZE]);

const NIL: u32 = u32::MAX;

/// An intrusive list over slot indices.
struct SlotList {
    head: u32,
    tail: u32,
    prev: [u32; NE],
    next: [u32; NE],
    member: [bool; NE],
}

impl SlotList {
    const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            prev: [NIL; NE],
            next: [NIL; NE],
            member: [false; NE],
        }
    }

    fn contains(&self, i: usize) -> bool {
        self.member[i]
    }

    fn push_back(&mut self, i: usize) {
        debug_assert!(!self.member[i]);
        self.member[i] = true;
        self.prev[i] = self.tail;
        self.next[i] = NIL;
        if self.tail != NIL {
            self.next[self.tail as usize] = i as u32;
        } else {
            self.head = i as u32;
        }
        self.tail = i as u32;
    }

    fn push_front(&mut self, i: usize) {
        debug_assert!(!self.member[i]);
        self.member[i] = true;
        self.next[i] = self.head;
        self.prev[i] = NIL;
        if self.head != NIL {
            self.prev[self.head as usize] = i as u32;
        } else {
            self.tail = i as u32;
        }
        self.head = i as u32;
    }

    fn remove(&mut self, i: usize) {
        if !self.member[i] {
            return;
        }
        let (prev, next) = (self.prev[i], self.next[i]);
        if prev != NIL {
            self.next[prev as usize] = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.prev[next as usize] = prev;
        } else {
            self.tail = prev;
        }
        self.member[i] = false;
        self.prev[i] = NIL;
        self.next[i] = NIL;
    }

    fn pop_front(&mut self) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let i = self.head as usize;
        self.remove(i);
        Some(i)
    }

    /// Iterate in list order starting from the head.
    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let i = cursor as usize;
            cursor = self.next[i];
            Some(i)
        })
    }
}

bitflags::bitflags! {
    struct EntryFlags: u8 {
        const LOADED = 1 << 0;
        const LOADING = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

struct EntryState {
    flags: EntryFlags,
    buf: Option<Page>,
    write_refs: u32,
    was_prefetched: bool,
}

impl EntryState {
    const fn new() -> Self {
        Self {
            flags: EntryFlags::empty(),
            buf: None,
            write_refs: 0,
            was_prefetched: false,
        }
    }
}

struct CacheState {
    bn: [u32; NE],
    refs: [u32; NE],
    lru: SlotList,
    pref: SlotList,
    dirty: SlotList,
}

static STATE: SpinLock<CacheState> = SpinLock::new(CacheState {
    bn: [EMPTY_BLOCK; NE],
    refs: [0; NE],
    lru: SlotList::new(),
    pref: SlotList::new(),
    dirty: SlotList::new(),
});

static ENTRIES: [SpinLock<EntryState>; NE] = [const { SpinLock::new(EntryState::new()) }; NE];
static FETCH_STATUS: [AtomicI32; NE] = [const { AtomicI32::new(0) }; NE];

static READ_WQ: WaitQueue = WaitQueue::new();
static DISK_WQ: WaitQueue = WaitQueue::new();
static DISK_LOCK: SpinLock<()> = SpinLock::new(());

/// A read reference to a cache slot. Obtained from [`get_disk_entry`];
/// must be released with [`put_entry`].
#[derive(Clone, Copy, Debug)]
pub struct EntryRef {
    index: usize,
}

impl EntryRef {
    /// The slot index, used by the filesystem to pair inode pointers with
    /// the block that holds them.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

fn disk_completion() {
    DISK_WQ.wake_all();
}

/// Initialize the cache: hook the disk completion notification and pin the
/// superblock with a permanent reference.
pub fn init() -> Result<(), KernelError> {
    dev::register_disk_completion(disk_completion);
    let sb = get_disk_entry(SUPERBLOCK_BN, None)?;
    let mut state = STATE.lock();
    state.refs[sb.index] = 1;
    state.unlock();
    Ok(())
}

/// Pick (and if needed evict) a slot for `bn`. Called with the cache lock
/// held; returns `None` when every slot is pinned.
fn find_slot(state: &mut CacheState, bn: u32) -> Option<usize> {
    // Already resident?
    if let Some(i) = (0..NE).find(|&i| state.bn[i] == bn) {
        state.lru.remove(i);
        if !state.pref.contains(i) {
            state.lru.push_back(i);
        }
        return Some(i);
    }

    // An empty slot?
    let mut chosen = (0..NE).find(|&i| state.bn[i] == EMPTY_BLOCK);

    // A clean, unreferenced block in LRU order?
    if chosen.is_none() {
        chosen = state.lru.iter().find(|&i| {
            state.refs[i] == 0
                && !state.dirty.contains(i)
                && FETCH_STATUS[i].load(Ordering::SeqCst) != FETCH_AGAIN
        });
        if let Some(i) = chosen {
            evict(state, i);
        }
    }

    // A prefetched block whose fetch has resolved?
    if chosen.is_none() {
        chosen = state.pref.iter().find(|&i| {
            let guard = ENTRIES[i].lock();
            let prefetched = guard.was_prefetched;
            guard.unlock();
            prefetched && FETCH_STATUS[i].load(Ordering::SeqCst) != FETCH_AGAIN
        });
        if let Some(i) = chosen {
            evict(state, i);
        }
    }

    let i = chosen?;
    state.bn[i] = bn;
    state.lru.push_back(i);
    Some(i)
}

/// Clear a victim slot: drop its buffer, reset its flags, unlink it.
/// Called with the cache lock held; the victim has no references.
fn evict(state: &mut CacheState, i: usize) {
    debug_assert_eq!(state.refs[i], 0);
    state.lru.remove(i);
    state.pref.remove(i);
    state.dirty.remove(i);
    state.bn[i] = EMPTY_BLOCK;
    let mut guard = ENTRIES[i].lock();
    guard.buf = None;
    guard.flags = EntryFlags::empty();
    guard.was_prefetched = false;
    guard.unlock();
    FETCH_STATUS[i].store(0, Ordering::SeqCst);
}

/// Allocate the buffer if needed and issue the non-blocking read.
/// Does nothing if a load is already done or in flight.
fn load_disk_block(i: usize, bn: u32) -> Result<(), KernelError> {
    let mut guard = ENTRIES[i].lock();
    if guard.flags.intersects(EntryFlags::LOADING | EntryFlags::LOADED) {
        guard.unlock();
        return Ok(());
    }
    if guard.buf.is_none() {
        match Page::new() {
            Some(page) => guard.buf = Some(page),
            None => {
                guard.unlock();
                return Err(KernelError::NoMemory);
            }
        }
    }
    guard.flags |= EntryFlags::LOADING;
    let buf = buf_slice(&guard);
    FETCH_STATUS[i].store(FETCH_AGAIN, Ordering::SeqCst);
    guard.unlock();

    let disk = dev::block_device().ok_or(KernelError::Io)?;
    if disk.read_nonblocking(buf, bn as usize * BLOCK_SIZE, &FETCH_STATUS[i]) {
        Ok(())
    } else {
        let mut guard = ENTRIES[i].lock();
        guard.flags -= EntryFlags::LOADING;
        guard.unlock();
        Err(KernelError::Io)
    }
}

// The buffer bytes of a slot whose buffer is present. The returned slice
// stays valid while the caller holds a reference on the slot.
fn buf_slice(guard: &EntryState) -> &'static mut [u8; BLOCK_SIZE] {
    let kva = guard.buf.as_ref().expect("slot has a buffer").kva();
    unsafe { &mut *(kva.into_usize() as *mut [u8; BLOCK_SIZE]) }
}

fn drop_read_ref(i: usize) {
    let mut state = STATE.lock();
    if state.bn[i] != SUPERBLOCK_BN {
        debug_assert!(state.refs[i] > 0);
        state.refs[i] -= 1;
    }
    state.unlock();
}

/// Read block `bn` into the cache and return a referenced entry.
///
/// Blocks until the fetch completes. On a first load the optional
/// `cleaner` runs once on the buffer, and up to [`N_PREFETCH`] consecutive
/// blocks are fetched speculatively behind it. Fails with `NoMemory` when
/// no slot or buffer can be found and with `Io` when the driver refuses
/// the request; a completed fetch that reports a device error still
/// returns the entry, with unspecified buffer contents.
pub fn get_disk_entry(bn: u32, cleaner: Option<Cleaner>) -> Result<EntryRef, KernelError> {
    let mut state = STATE.lock();
    let Some(i) = find_slot(&mut state, bn) else {
        state.unlock();
        warning!("bufcache: no room for block {}", bn);
        return Err(KernelError::NoMemory);
    };
    if bn != SUPERBLOCK_BN {
        state.refs[i] += 1;
    }
    state.unlock();

    // Only prefetch when this call is the block's first load.
    let guard = ENTRIES[i].lock();
    let already = guard
        .flags
        .intersects(EntryFlags::LOADING | EntryFlags::LOADED);
    guard.unlock();
    let prefetching = bn != SUPERBLOCK_BN && !already;

    if let Err(e) = load_disk_block(i, bn) {
        if bn != SUPERBLOCK_BN {
            drop_read_ref(i);
        }
        return Err(e);
    }

    if prefetching {
        for n in 1..=N_PREFETCH as u32 {
            let mut state = STATE.lock();
            let Some(pi) = find_slot(&mut state, bn + n) else {
                state.unlock();
                break;
            };
            if state.refs[pi] == 0 {
                // First sight of this block: park it on the prefetch list
                // until someone actually asks for it.
                state.lru.remove(pi);
                if !state.pref.contains(pi) {
                    state.pref.push_front(pi);
                }
                let mut guard = ENTRIES[pi].lock();
                guard.was_prefetched = true;
                guard.unlock();
            }
            state.unlock();
            if load_disk_block(pi, bn + n).is_err() {
                break;
            }
        }
    }

    // Wait for the driver to resolve this block's fetch.
    let guard = DISK_LOCK.lock();
    let guard = wait_until(&DISK_WQ, &DISK_LOCK, guard, |_| {
        FETCH_STATUS[i].load(Ordering::SeqCst) != FETCH_AGAIN
    });
    guard.unlock();

    let mut prefetch_resolved = false;
    let mut guard = ENTRIES[i].lock();
    if guard.flags.contains(EntryFlags::LOADING) {
        if FETCH_STATUS[i].load(Ordering::SeqCst) == FETCH_IO {
            warning!("bufcache: I/O error reading block {}", bn);
        }
        guard.flags -= EntryFlags::LOADING;
        guard.flags |= EntryFlags::LOADED;
        if let Some(cleaner) = cleaner {
            cleaner(buf_slice(&guard));
        }
        if guard.was_prefetched {
            guard.was_prefetched = false;
            prefetch_resolved = true;
        }
    }
    guard.unlock();

    if prefetch_resolved {
        let mut state = STATE.lock();
        state.pref.remove(i);
        if !state.lru.contains(i) {
            state.lru.push_back(i);
        }
        state.unlock();
    }

    Ok(EntryRef { index: i })
}

/// Release a read reference. The pinned superblock is unaffected.
pub fn put_entry(e: EntryRef) {
    drop_read_ref(e.index);
}

/// Acquire the exclusive write reference for `e`, waiting out other
/// writers, and mark the entry dirty.
pub fn get_write(e: EntryRef) {
    let i = e.index;
    let guard = ENTRIES[i].lock();
    let mut guard = wait_until(&READ_WQ, &ENTRIES[i], guard, |s| s.write_refs == 0);
    guard.write_refs = 1;
    let newly_dirty = !guard.flags.contains(EntryFlags::DIRTY);
    guard.flags |= EntryFlags::DIRTY;
    guard.unlock();

    if newly_dirty {
        let mut state = STATE.lock();
        if !state.dirty.contains(i) {
            state.dirty.push_front(i);
        }
        state.unlock();
    }
}

/// Release the write reference for `e`.
pub fn put_write(e: EntryRef) {
    let mut guard = ENTRIES[e.index].lock();
    debug_assert!(guard.write_refs > 0);
    guard.write_refs -= 1;
    guard.unlock();
    READ_WQ.wake_all();
}

/// Run `f` over the block's bytes. The caller must hold a reference.
pub fn with_block<R>(e: EntryRef, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> R {
    let guard = ENTRIES[e.index].lock();
    let buf = buf_slice(&guard);
    guard.unlock();
    f(buf)
}

/// Run `f` mutably over the block's bytes. The caller must hold the write
/// reference.
pub fn with_block_mut<R>(e: EntryRef, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
    let guard = ENTRIES[e.index].lock();
    debug_assert!(guard.write_refs > 0, "mutating a block without get_write");
    let buf = buf_slice(&guard);
    guard.unlock();
    f(buf)
}

/// Raw pointer to the block's bytes, stable while the caller holds a
/// reference. Used by the filesystem to overlay inodes on cached blocks.
pub(crate) fn block_ptr(e: EntryRef) -> *mut u8 {
    let guard = ENTRIES[e.index].lock();
    let ptr = buf_slice(&guard).as_mut_ptr();
    guard.unlock();
    ptr
}

// Exclusive write reference without the dirty-list side effect; the sync
// path uses this so flushing cannot re-dirty the entry.
fn get_write_for_sync(i: usize) {
    let guard = ENTRIES[i].lock();
    let mut guard = wait_until(&READ_WQ, &ENTRIES[i], guard, |s| s.write_refs == 0);
    guard.write_refs = 1;
    guard.unlock();
}

/// Write every dirty block to disk, blocking until complete. With `drop`,
/// additionally evict every unreferenced, non-prefetched block.
pub fn sync(drop: bool) -> Result<(), KernelError> {
    // Swap the dirty list to a local one so entries dirtied during the
    // flush wait for the next sync.
    let mut drained: arrayvec::ArrayVec<usize, NE> = arrayvec::ArrayVec::new();
    let mut state = STATE.lock();
    while let Some(i) = state.dirty.pop_front() {
        drained.push(i);
    }
    state.unlock();

    let disk = dev::block_device().ok_or(KernelError::Io)?;
    for &i in drained.iter() {
        get_write_for_sync(i);

        let state = STATE.lock();
        let bn = state.bn[i];
        state.unlock();
        if bn != EMPTY_BLOCK {
            let guard = ENTRIES[i].lock();
            let buf = buf_slice(&guard);
            guard.unlock();
            if disk.write(buf, bn as usize * BLOCK_SIZE, &FETCH_STATUS[i]) < 0 {
                warning!("bufcache: I/O error writing block {}", bn);
            }
        }

        let mut guard = ENTRIES[i].lock();
        guard.flags -= EntryFlags::DIRTY;
        guard.write_refs -= 1;
        guard.unlock();
        READ_WQ.wake_all();
    }

    if drop {
        let mut state = STATE.lock();
        for i in 0..NE {
            let guard = ENTRIES[i].lock();
            let keep = guard.was_prefetched;
            guard.unlock();
            if !keep && state.bn[i] != EMPTY_BLOCK && state.refs[i] == 0 {
                evict(&mut state, i);
            }
        }
        state.unlock();
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use std::sync::MutexGuard;

    /// Serialize on the global allocator, wipe the cache, and register a
    /// fresh RAM disk built from `image`.
    pub fn setup(image: Vec<u8>) -> MutexGuard<'static, ()> {
        // The arena reset reclaims every frame wholesale and zeroes the
        // frame reference counts, so stale buffers from a previous test
        // must be leaked, not dropped, to keep the counts in range.
        let guard = crate::mm::testing::lock();
        let mut state = STATE.lock();
        for i in 0..NE {
            state.refs[i] = 0;
            state.bn[i] = EMPTY_BLOCK;
            state.lru.remove(i);
            state.pref.remove(i);
            state.dirty.remove(i);
            let mut entry = ENTRIES[i].lock();
            if let Some(stale) = entry.buf.take() {
                let _ = stale.into_raw();
            }
            entry.flags = EntryFlags::empty();
            entry.write_refs = 0;
            entry.was_prefetched = false;
            entry.unlock();
            FETCH_STATUS[i].store(0, Ordering::SeqCst);
        }
        state.unlock();

        let disk: &'static dev::RamDisk = Box::leak(Box::new(dev::RamDisk::from_image(image)));
        dev::register_block_device(disk);
        init().expect("superblock load");
        guard
    }

    pub fn slot_of(bn: u32) -> Option<usize> {
        let state = STATE.lock();
        let slot = (0..NE).find(|&i| state.bn[i] == bn);
        state.unlock();
        slot
    }

    pub fn refs_of(bn: u32) -> u32 {
        let state = STATE.lock();
        let refs = (0..NE)
            .find(|&i| state.bn[i] == bn)
            .map(|i| state.refs[i])
            .unwrap_or(0);
        state.unlock();
        refs
    }

    pub fn occupied() -> Vec<(usize, u32, u32, bool)> {
        let state = STATE.lock();
        let mut out = Vec::new();
        for i in 0..NE {
            if state.bn[i] != EMPTY_BLOCK {
                let entry = ENTRIES[i].lock();
                let wp = entry.was_prefetched;
                entry.unlock();
                out.push((i, state.bn[i], state.refs[i], wp));
            }
        }
        state.unlock();
        out
    }

    pub fn on_prefetch_list(bn: u32) -> bool {
        let state = STATE.lock();
        let r = (0..NE)
            .find(|&i| state.bn[i] == bn)
            .map(|i| state.pref.contains(i))
            .unwrap_or(false);
        state.unlock();
        r
    }

    pub fn disk_contents() -> Vec<u8> {
        let disk = dev::block_device().unwrap();
        let mut out = alloc::vec![0u8; disk.size()];
        let status = AtomicI32::new(0);
        assert!(disk.read_nonblocking(&mut out, 0, &status));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn image(nblocks: usize) -> Vec<u8> {
        let mut img = alloc::vec![0u8; nblocks * BLOCK_SIZE];
        // Stamp each block with a recognizable pattern.
        for bn in 0..nblocks {
            img[bn * BLOCK_SIZE] = bn as u8;
            img[bn * BLOCK_SIZE + 1] = 0xc4;
        }
        img
    }

    #[test]
    fn occupied_slots_hold_distinct_blocks() {
        let _env = testing::setup(image(64));
        let mut held = Vec::new();
        for bn in [3u32, 9, 3, 40, 9] {
            held.push(get_disk_entry(bn, None).unwrap());
        }
        let occupied = testing::occupied();
        for (a, (_, bn_a, _, _)) in occupied.iter().enumerate() {
            for (_, bn_b, _, _) in occupied.iter().skip(a + 1) {
                assert_ne!(bn_a, bn_b);
            }
        }
        // Two gets of block 3 share one slot and stack references.
        assert_eq!(testing::refs_of(3), 2);
        for e in held {
            put_entry(e);
        }
    }

    #[test]
    fn cached_read_returns_disk_bytes() {
        let _env = testing::setup(image(64));
        let e = get_disk_entry(7, None).unwrap();
        with_block(e, |buf| {
            assert_eq!(buf[0], 7);
            assert_eq!(buf[1], 0xc4);
        });
        put_entry(e);
    }

    #[test]
    fn write_survives_sync_and_drop() {
        let _env = testing::setup(image(64));
        let e = get_disk_entry(5, None).unwrap();
        get_write(e);
        with_block_mut(e, |buf| buf[..4].copy_from_slice(b"xyzw"));
        put_write(e);
        put_entry(e);

        sync(false).unwrap();
        sync(true).unwrap();

        // The flush reached the disk...
        let disk = testing::disk_contents();
        assert_eq!(&disk[5 * BLOCK_SIZE..5 * BLOCK_SIZE + 4], b"xyzw");
        // ...and a fresh load observes it.
        let e = get_disk_entry(5, None).unwrap();
        with_block(e, |buf| assert_eq!(&buf[..4], b"xyzw"));
        put_entry(e);
    }

    #[test]
    fn sync_drop_leaves_only_pinned_or_prefetched() {
        let _env = testing::setup(image(64));
        let held = get_disk_entry(12, None).unwrap();
        let released = get_disk_entry(13, None).unwrap();
        put_entry(released);
        sync(true).unwrap();
        for (_, bn, refs, prefetched) in testing::occupied() {
            assert!(
                bn == SUPERBLOCK_BN || refs > 0 || prefetched,
                "block {} survived sync(true) without a holder",
                bn
            );
        }
        assert!(testing::slot_of(12).is_some());
        assert!(testing::slot_of(13).is_none());
        put_entry(held);
    }

    #[test]
    fn first_load_prefetches_consecutive_blocks() {
        let _env = testing::setup(image(64));
        let e = get_disk_entry(20, None).unwrap();
        for n in 1..=4u32 {
            assert!(testing::slot_of(20 + n).is_some(), "block {} prefetched", 20 + n);
            assert!(testing::on_prefetch_list(20 + n));
            assert_eq!(testing::refs_of(20 + n), 0);
        }
        // Touching a prefetched block folds it back into the LRU list.
        let p = get_disk_entry(21, None).unwrap();
        assert!(!testing::on_prefetch_list(21));
        put_entry(p);
        put_entry(e);
    }

    #[test]
    fn cache_full_of_referenced_blocks_rejects_new_loads() {
        let _env = testing::setup(image(4096));
        let mut held = Vec::new();
        // Fill every slot with a referenced block; prefetched and pinned
        // slots do not count as free.
        let mut bn = 1u32;
        while held.len() < NE - 1 {
            held.push(get_disk_entry(bn, None).unwrap());
            bn += (N_PREFETCH as u32) + 1;
        }
        let r = get_disk_entry(4000, None);
        assert_eq!(r.unwrap_err(), KernelError::NoMemory);
        for e in held {
            put_entry(e);
        }
    }

    #[test]
    fn eviction_prefers_clean_lru_blocks() {
        let _env = testing::setup(image(4096));
        // Load-and-release a block, then churn enough referenced blocks
        // through the cache to force its eviction.
        let victim = get_disk_entry(2, None).unwrap();
        put_entry(victim);
        let mut held = Vec::new();
        let mut bn = 100u32;
        while held.len() < NE - 1 {
            held.push(get_disk_entry(bn, None).unwrap());
            bn += (N_PREFETCH as u32) + 1;
        }
        assert!(testing::slot_of(2).is_none(), "unreferenced block evicted");
        for e in held {
            put_entry(e);
        }
    }
}
