//! The x86-64 four-level page table.
//!
//! Table frames come from the buddy allocator, so a table's physical
//! address is always derivable from its kernel alias and the whole
//! structure can be handed to `cr3`. Leaf entries can *own* the frame they
//! map: mapping a [`Page`] parks its ownership inside the entry (tagged
//! with an ignored PTE bit), and unmapping or tearing the table down
//! revives the owner and lets the reference count decide when the frame
//! returns to the allocator. MMIO mappings such as the console are mapped
//! raw and never owned.

use crate::{KernelError, mm::Page};
use roost::addressing::{PAGE_MASK, PAGE_SIZE, Pa, Va};
use roost::x86_64::invlpg;

bitflags::bitflags! {
    /// Hardware page table entry flags, plus the `OWNED` software bit.
    pub struct PteFlags: usize {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const RW = 1 << 1;
        /// User-accessible.
        const US = 1 << 2;
        /// Write-through.
        const PWT = 1 << 3;
        /// Cache-disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Large page (at PD/PDP level).
        const PS = 1 << 7;
        /// Global.
        const G = 1 << 8;
        /// Software: the mapped frame is owned by this entry.
        const OWNED = 1 << 9;
        /// No-execute.
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Memory permissions at the mapping interface.
    pub struct Permission: usize {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
    }
}

impl Permission {
    fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if self.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        flags
    }
}

/// One entry, at any level of the table.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Entry(pub usize);

impl Entry {
    const ADDR_MASK: usize = 0x000f_ffff_ffff_f000;

    /// The physical address this entry points at, if present.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & Self::ADDR_MASK)
        } else {
            None
        }
    }

    /// The entry's flags.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    fn set(&mut self, pa: Pa, flags: PteFlags) {
        debug_assert_eq!(pa.into_usize() & PAGE_MASK, 0);
        self.0 = pa.into_usize() | flags.bits();
    }

    #[inline]
    fn clear(&mut self) {
        self.0 = 0;
    }

    fn table_mut(&self) -> &'static mut [Entry; 512] {
        let pa = self.pa().expect("entry is present");
        unsafe { &mut *(pa.into_kva().into_usize() as *mut [Entry; 512]) }
    }
}

/// A mapping reported by the user-space walk.
#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    /// Mapped virtual address.
    pub va: Va,
    /// Backing physical frame.
    pub pa: Pa,
    /// Leaf entry flags.
    pub flags: PteFlags,
}

impl Mapping {
    /// Whether user code may touch this mapping.
    #[inline]
    pub fn user(&self) -> bool {
        self.flags.contains(PteFlags::US)
    }

    /// Whether the mapping is writable.
    #[inline]
    pub fn writable(&self) -> bool {
        self.flags.contains(PteFlags::RW)
    }

    /// Whether the leaf entry owns the frame.
    #[inline]
    pub fn owned(&self) -> bool {
        self.flags.contains(PteFlags::OWNED)
    }

    /// The permissions to use when re-mapping this frame elsewhere.
    pub fn permission(&self) -> Permission {
        let mut perm = Permission::READ;
        if self.writable() {
            perm |= Permission::WRITE;
        }
        if self.user() {
            perm |= Permission::USER;
        }
        perm
    }
}

fn indices(va: Va) -> [usize; 4] {
    let va = va.into_usize();
    [
        (va >> 39) & 0x1ff,
        (va >> 30) & 0x1ff,
        (va >> 21) & 0x1ff,
        (va >> 12) & 0x1ff,
    ]
}

// Kernel high-half template copied into every fresh root, registered by the
// boot path. Hosted builds leave it unset and get an empty high half.
static KERNEL_TEMPLATE: crate::sync::SpinLock<Option<Pa>> = crate::sync::SpinLock::new(None);

/// Record the boot page table whose high half every process table shares.
pub fn register_kernel_template(pa: Pa) {
    let mut guard = KERNEL_TEMPLATE.lock();
    *guard = Some(pa);
    guard.unlock();
}

/// The boot page table, used as the safe table while no task is current.
pub(crate) fn kernel_template() -> Option<Pa> {
    let guard = KERNEL_TEMPLATE.lock();
    let pa = *guard;
    guard.unlock();
    pa
}

/// A level-4 page table and every user mapping reachable from it.
pub struct PageTable {
    root: Page,
}

impl PageTable {
    const KBASE: usize = 256;

    /// A fresh table with the kernel high half installed and an empty low
    /// half. `None` on memory exhaustion.
    pub fn new() -> Option<Self> {
        let root = Page::new()?;
        let this = Self { root };
        if let Some(template) = kernel_template() {
            let src = unsafe { &*(template.into_kva().into_usize() as *const [Entry; 512]) };
            let dst = this.root_entries_mut();
            dst[Self::KBASE..].copy_from_slice(&src[Self::KBASE..]);
        }
        Some(this)
    }

    fn root_entries_mut(&self) -> &mut [Entry; 512] {
        unsafe { &mut *(self.root.kva().into_usize() as *mut [Entry; 512]) }
    }

    /// The physical address to load into CR3.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.root.pa()
    }

    fn ensure_leaf(&mut self, va: Va) -> Result<&mut Entry, KernelError> {
        if !va.is_aligned() || !va.is_user() {
            return Err(KernelError::InvalidArgument);
        }
        let idx = indices(va);
        let mut table = self.root_entries_mut();
        for &i in idx[..3].iter() {
            if table[i].pa().is_none() {
                let frame = Page::new().ok_or(KernelError::NoMemory)?;
                table[i].set(frame.into_raw(), PteFlags::P | PteFlags::RW | PteFlags::US);
            }
            table = table[i].table_mut();
        }
        Ok(&mut table[idx[3]])
    }

    /// Map `page` at `va`, transferring ownership of the frame into the
    /// table. Replaces any existing mapping at `va`.
    pub fn map_page(&mut self, va: Va, page: Page, perm: Permission) -> Result<(), KernelError> {
        let pa = page.pa();
        let entry = self.ensure_leaf(va)?;
        if let Some(old) = entry.pa() {
            if entry.flags().contains(PteFlags::OWNED) {
                drop(unsafe { Page::from_pa(old) });
            }
        }
        entry.set(pa, perm.into_pte_flags() | PteFlags::OWNED);
        let _ = page.into_raw();
        invlpg(va.into_usize());
        Ok(())
    }

    /// Map a raw physical address (MMIO, console) without taking ownership.
    pub fn map_raw(&mut self, va: Va, pa: Pa, perm: Permission) -> Result<(), KernelError> {
        let entry = self.ensure_leaf(va)?;
        assert!(entry.pa().is_none(), "remapping an occupied va");
        entry.set(pa, perm.into_pte_flags());
        invlpg(va.into_usize());
        Ok(())
    }

    /// Remove the mapping at `va`, returning the owned frame if the entry
    /// held one.
    pub fn unmap(&mut self, va: Va) -> Option<Page> {
        let leaf = self.walk_entry(va)?;
        let pa = leaf.pa()?;
        let owned = leaf.flags().contains(PteFlags::OWNED);
        leaf.clear();
        invlpg(va.into_usize());
        if owned {
            Some(unsafe { Page::from_pa(pa) })
        } else {
            None
        }
    }

    fn walk_entry(&self, va: Va) -> Option<&mut Entry> {
        let idx = indices(Va::new(va.into_usize() & !PAGE_MASK)?);
        let mut table = self.root_entries_mut();
        for &i in idx[..3].iter() {
            table[i].pa()?;
            table = table[i].table_mut();
        }
        Some(&mut table[idx[3]])
    }

    /// Translate `va` to its mapping, if present.
    pub fn lookup(&self, va: Va) -> Option<Mapping> {
        let leaf = self.walk_entry(va)?;
        let pa = leaf.pa()?;
        Some(Mapping {
            va: Va::new(va.into_usize() & !PAGE_MASK)?,
            pa,
            flags: leaf.flags(),
        })
    }

    /// Walk every present user-half leaf mapping in address order.
    ///
    /// This is the address-space iterator `fork` copies from and the first
    /// phase of teardown walks.
    pub fn for_each_user(&self, mut f: impl FnMut(Mapping)) {
        let root = self.root_entries_mut();
        for (i4, e4) in root[..Self::KBASE].iter().enumerate() {
            if e4.pa().is_none() {
                continue;
            }
            let pdp = e4.table_mut();
            for (i3, e3) in pdp.iter().enumerate() {
                if e3.pa().is_none() {
                    continue;
                }
                let pd = e3.table_mut();
                for (i2, e2) in pd.iter().enumerate() {
                    if e2.pa().is_none() {
                        continue;
                    }
                    let pt = e2.table_mut();
                    for (i1, e1) in pt.iter().enumerate() {
                        if let Some(pa) = e1.pa() {
                            let va = (i4 << 39) | (i3 << 30) | (i2 << 21) | (i1 << 12);
                            f(Mapping {
                                va: Va::new(va).unwrap(),
                                pa,
                                flags: e1.flags(),
                            });
                        }
                    }
                }
            }
        }
    }
}

impl Drop for PageTable {
    /// Full teardown: every owned user frame, then every intermediate table
    /// frame, then the root (which falls out of scope as `self.root`).
    fn drop(&mut self) {
        let root = self.root_entries_mut();
        for e4 in root[..Self::KBASE].iter_mut() {
            let Some(pdp_pa) = e4.pa() else { continue };
            let pdp = e4.table_mut();
            for e3 in pdp.iter_mut() {
                let Some(pd_pa) = e3.pa() else { continue };
                let pd = e3.table_mut();
                for e2 in pd.iter_mut() {
                    let Some(pt_pa) = e2.pa() else { continue };
                    let pt = e2.table_mut();
                    for e1 in pt.iter_mut() {
                        if let Some(pa) = e1.pa() {
                            if e1.flags().contains(PteFlags::OWNED) {
                                drop(unsafe { Page::from_pa(pa) });
                            }
                            e1.clear();
                        }
                    }
                    e2.clear();
                    drop(unsafe { Page::from_pa(pt_pa) });
                }
                e3.clear();
                drop(unsafe { Page::from_pa(pd_pa) });
            }
            e4.clear();
            drop(unsafe { Page::from_pa(pdp_pa) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn map_lookup_unmap() {
        let _mm = testing::lock();
        let mut pt = PageTable::new().unwrap();
        let mut page = Page::new().unwrap();
        page.inner_mut()[0] = 0x42;
        let pa = page.pa();

        pt.map_page(va(0x40_0000), page, Permission::READ | Permission::WRITE | Permission::USER)
            .unwrap();
        let m = pt.lookup(va(0x40_0000)).unwrap();
        assert_eq!(m.pa, pa);
        assert!(m.user() && m.writable() && m.owned());
        assert!(pt.lookup(va(0x41_0000)).is_none());

        let revived = pt.unmap(va(0x40_0000)).unwrap();
        assert_eq!(revived.pa(), pa);
        assert_eq!(revived.inner()[0], 0x42);
        assert!(pt.lookup(va(0x40_0000)).is_none());
    }

    #[test]
    fn raw_mappings_are_not_owned() {
        let _mm = testing::lock();
        let mut pt = PageTable::new().unwrap();
        let frame = Page::new().unwrap();
        let pa = frame.pa();
        pt.map_raw(va(0x80_0000), pa, Permission::READ | Permission::USER)
            .unwrap();
        let m = pt.lookup(va(0x80_0000)).unwrap();
        assert!(!m.owned() && !m.writable());
        assert!(pt.unmap(va(0x80_0000)).is_none());
        drop(frame);
    }

    #[test]
    fn walk_reports_every_user_mapping() {
        let _mm = testing::lock();
        let mut pt = PageTable::new().unwrap();
        let vas = [0x40_0000usize, 0x40_1000, 0x7fff_f000];
        for &addr in &vas {
            pt.map_page(va(addr), Page::new().unwrap(), Permission::READ | Permission::USER)
                .unwrap();
        }
        let mut seen = alloc::vec::Vec::new();
        pt.for_each_user(|m| seen.push(m.va.into_usize()));
        assert_eq!(seen, vas);
    }

    #[test]
    fn teardown_returns_frames() {
        let _mm = testing::lock();
        let baseline = {
            let pt = PageTable::new().unwrap();
            let free = testing::free_count(super::super::MIN_ORDER);
            drop(pt);
            free
        };
        let mut pt = PageTable::new().unwrap();
        for i in 0..8 {
            pt.map_page(
                va(0x40_0000 + i * 0x1000),
                Page::new().unwrap(),
                Permission::READ | Permission::WRITE | Permission::USER,
            )
            .unwrap();
        }
        drop(pt);
        // Same pool shape as after dropping an empty table: every data page
        // and intermediate table frame went back to the allocator.
        let pt = PageTable::new().unwrap();
        assert_eq!(testing::free_count(super::super::MIN_ORDER), baseline);
        drop(pt);
    }

    #[test]
    fn shared_frame_survives_one_table() {
        let _mm = testing::lock();
        let page = Page::new().unwrap();
        let pa = page.pa();
        let mut a = PageTable::new().unwrap();
        let mut b = PageTable::new().unwrap();
        a.map_page(va(0x40_0000), page.clone(), Permission::READ | Permission::USER)
            .unwrap();
        b.map_page(va(0x50_0000), page, Permission::READ | Permission::USER)
            .unwrap();
        drop(a);
        // Still mapped in `b`; the frame must not be recycled.
        let fresh = Page::new().unwrap();
        assert_ne!(fresh.pa(), pa);
        drop(fresh);
        drop(b);
    }
}
