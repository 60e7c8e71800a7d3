//! Program images: the initfs catalog, the ELF loader, and the argv stack
//! builder.

use super::{AddressSpace, USER_STACK_TOP};
use crate::mm::Page;
use crate::mm::page_table::Permission;
use crate::sync::SpinLock;
use crate::KernelError;
use arrayvec::ArrayVec;
use roost::addressing::{PAGE_MASK, PAGE_SIZE, Va, VA_USER_END};

/// A boot-time program that does not live on disk.
#[derive(Clone, Copy)]
pub struct InitfsEntry {
    /// Program name, matched exactly.
    pub name: &'static str,
    /// The ELF image bytes.
    pub data: &'static [u8],
}

static INITFS: SpinLock<ArrayVec<InitfsEntry, 16>> = SpinLock::new(ArrayVec::new_const());

/// Register a boot program. Panics if the catalog is full.
pub fn register_program(name: &'static str, data: &'static [u8]) {
    let mut guard = INITFS.lock();
    guard.push(InitfsEntry { name, data });
    guard.unlock();
}

/// Look up a boot program by exact name.
pub fn initfs_lookup(name: &str) -> Option<&'static [u8]> {
    let guard = INITFS.lock();
    let hit = guard.iter().find(|e| e.name == name).map(|e| e.data);
    guard.unlock();
    hit
}

/// A backing store an image can be loaded from: the initfs blob or a file
/// read through the filesystem.
pub trait ImageRead {
    /// Total length in bytes.
    fn len(&self) -> usize;

    /// Whether the image is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read into `buf` at byte offset `off`; short reads past the end.
    fn read_at(&self, off: usize, buf: &mut [u8]) -> Result<usize, KernelError>;
}

impl ImageRead for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn read_at(&self, off: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        if off >= <[u8]>::len(self) {
            return Ok(0);
        }
        let n = buf.len().min(<[u8]>::len(self) - off);
        buf[..n].copy_from_slice(&self[off..off + n]);
        Ok(n)
    }
}

/// The ELF file header.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ElfHeader {
    /// `0x7f 'E' 'L' 'F'`.
    pub magic: [u8; 4],
    /// 1 = 32-bit, 2 = 64-bit.
    pub class: u8,
    /// 1 = little-endian.
    pub data: u8,
    /// ELF version.
    pub version: u8,
    /// OS ABI.
    pub abi: u8,
    /// ABI version.
    pub abi_version: u8,
    /// Reserved padding.
    pub pad: [u8; 7],
    /// Object type; 2 = executable.
    pub e_type: u16,
    /// Machine; 0x3e = x86-64.
    pub e_machine: u16,
    /// ELF version again.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// Program header table offset.
    pub e_phoff: u64,
    /// Section header table offset.
    pub e_shoff: u64,
    /// Flags.
    pub e_flags: u32,
    /// Size of this header.
    pub e_ehsize: u16,
    /// Size of a program header entry.
    pub e_phentsize: u16,
    /// Number of program headers.
    pub e_phnum: u16,
    /// Size of a section header entry.
    pub e_shentsize: u16,
    /// Number of section headers.
    pub e_shnum: u16,
    /// Section name string table index.
    pub e_shstrndx: u16,
}

const ELF_HEADER_SIZE: usize = core::mem::size_of::<ElfHeader>();
const PHDR_SIZE: usize = 0x38;
const SHDR_SIZE: usize = 0x40;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 1 << 1;

/// An ELF program header.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Phdr {
    /// Segment type.
    pub p_type: u32,
    /// Segment flags (R/W/X).
    pub p_flags: u32,
    /// Offset of the segment in the file.
    pub p_offset: u64,
    /// Virtual address the segment is mapped at.
    pub p_vaddr: u64,
    /// Physical address (unused).
    pub p_paddr: u64,
    /// Bytes present in the file.
    pub p_filesz: u64,
    /// Bytes occupied in memory.
    pub p_memsz: u64,
    /// Required alignment.
    pub p_align: u64,
}

fn parse_header(src: &dyn ImageRead) -> Result<ElfHeader, KernelError> {
    if src.len() < ELF_HEADER_SIZE {
        return Err(KernelError::NoExec);
    }
    let mut raw = [0u8; ELF_HEADER_SIZE];
    src.read_at(0, &mut raw)?;
    let header = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const ElfHeader) };

    let sane = header.magic == *b"\x7fELF"
        && header.class == 2
        && header.data == 1
        && header.e_machine == 0x3e
        && header.e_type == 2
        && header.e_phentsize as usize == PHDR_SIZE
        && header.e_shentsize as usize == SHDR_SIZE
        && (header.e_phoff as usize) <= src.len()
        && header.e_phnum != 0
        && (src.len() - header.e_phoff as usize) / header.e_phnum as usize >= PHDR_SIZE;
    if sane { Ok(header) } else { Err(KernelError::NoExec) }
}

fn segment_sane(ph: &Phdr, image_len: usize) -> bool {
    ph.p_offset as usize <= image_len
        && image_len - ph.p_offset as usize >= ph.p_filesz as usize
        && ph.p_filesz <= ph.p_memsz
        && (ph.p_vaddr as usize) < VA_USER_END
        && VA_USER_END - ph.p_vaddr as usize >= ph.p_memsz as usize
}

/// Load the ELF image from `src` into `aspace`.
///
/// Maps and copies every LOAD segment, zeroing the `[filesz, memsz)` tail,
/// and returns the entry point. A malformed image fails with `NoExec`
/// before anything is mapped; memory exhaustion fails with `NoMemory` and
/// leaves cleanup to the address space's teardown.
pub fn load(aspace: &AddressSpace, src: &dyn ImageRead) -> Result<usize, KernelError> {
    let header = parse_header(src)?;

    // Validate every program header before touching the address space.
    let mut phdrs: ArrayVec<Phdr, 16> = ArrayVec::new();
    for i in 0..header.e_phnum as usize {
        let mut raw = [0u8; PHDR_SIZE];
        src.read_at(header.e_phoff as usize + i * PHDR_SIZE, &mut raw)?;
        let ph = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Phdr) };
        if ph.p_type != PT_LOAD {
            continue;
        }
        if !segment_sane(&ph, src.len()) || phdrs.try_push(ph).is_err() {
            return Err(KernelError::NoExec);
        }
    }

    for ph in phdrs.iter() {
        load_segment(aspace, src, ph)?;
    }
    Ok(header.e_entry as usize)
}

fn load_segment(aspace: &AddressSpace, src: &dyn ImageRead, ph: &Phdr) -> Result<(), KernelError> {
    let va_start = ph.p_vaddr as usize & !PAGE_MASK;
    let va_end = ph.p_vaddr as usize + ph.p_memsz as usize;
    let file_start = ph.p_vaddr as usize;
    let file_end = file_start + ph.p_filesz as usize;

    let mut perm = Permission::READ | Permission::USER;
    if ph.p_flags & PF_W != 0 {
        perm |= Permission::WRITE;
    }

    let mut table = aspace.table.lock();
    let mut va = va_start;
    let r = loop {
        if va >= va_end {
            break Ok(());
        }
        let mut page = match Page::new() {
            Some(page) => page,
            None => break Err(KernelError::NoMemory),
        };
        // Copy the slice of the file that lands in this page; the page is
        // already zeroed, which covers the [filesz, memsz) tail.
        let copy_start = va.max(file_start);
        let copy_end = (va + PAGE_SIZE).min(file_end);
        if copy_start < copy_end {
            let dst = &mut page.inner_mut()[copy_start - va..copy_end - va];
            let file_off = ph.p_offset as usize + (copy_start - file_start);
            if src.read_at(file_off, dst)? != dst.len() {
                break Err(KernelError::NoExec);
            }
        }
        if let Err(e) = table.map_page(Va::new(va).unwrap(), page, perm) {
            break Err(e);
        }
        va += PAGE_SIZE;
    };
    table.unlock();
    r
}

/// Builds the initial user stack inside the stack page mapped just below
/// [`USER_STACK_TOP`].
///
/// The argv layout per `exec`: string bytes at the top, then the
/// NUL-terminated pointer array below them, then the final stack pointer
/// aligned down to 16 bytes.
pub struct StackBuilder<'a> {
    page: &'a mut Page,
    sp: usize,
}

impl<'a> StackBuilder<'a> {
    /// Start building in `page`, which will be mapped at
    /// `USER_STACK_TOP - PAGE_SIZE`.
    pub fn new(page: &'a mut Page) -> Self {
        Self {
            page,
            sp: USER_STACK_TOP,
        }
    }

    /// The current stack pointer.
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Align the stack pointer down to `align` bytes.
    pub fn align(&mut self, align: usize) {
        self.sp &= !(align - 1);
    }

    /// Push raw bytes; returns their user virtual address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<usize, KernelError> {
        let base = USER_STACK_TOP - PAGE_SIZE;
        if self.sp - base < bytes.len() {
            return Err(KernelError::TooBig);
        }
        self.sp -= bytes.len();
        let off = self.sp - base;
        self.page.inner_mut()[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(self.sp)
    }

    /// Push a `usize` value.
    pub fn push_usize(&mut self, v: usize) -> Result<usize, KernelError> {
        self.push_bytes(&v.to_ne_bytes())
    }

    /// Push a NUL-terminated copy of `s`.
    pub fn push_str(&mut self, s: &str) -> Result<usize, KernelError> {
        self.push_bytes(&[0u8])?;
        self.push_bytes(s.as_bytes())
    }

    /// Lay out `argv` and finish the stack: returns
    /// `(argc, argv pointer, initial rsp)`, with `rsp` 16-byte aligned.
    pub fn build_argv(mut self, argv: &[&str]) -> Result<(usize, usize, usize), KernelError> {
        let mut ptrs: ArrayVec<usize, 64> = ArrayVec::new();
        for arg in argv {
            if ptrs.try_push(self.push_str(arg)?).is_err() {
                return Err(KernelError::TooBig);
            }
        }
        self.align(core::mem::size_of::<usize>());
        self.push_usize(0)?;
        for &ptr in ptrs.iter().rev() {
            self.push_usize(ptr)?;
        }
        let argv_va = self.sp;
        self.align(16);
        Ok((argv.len(), argv_va, self.sp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing;

    #[test]
    fn rejects_bad_magic_and_short_images() {
        struct Empty;
        impl ImageRead for Empty {
            fn len(&self) -> usize {
                0
            }
            fn read_at(&self, _: usize, _: &mut [u8]) -> Result<usize, KernelError> {
                Ok(0)
            }
        }
        let mut raw = [0u8; 0x80];
        raw[0..4].copy_from_slice(b"\x7fBAD");
        assert_eq!(parse_header(&Empty).unwrap_err(), KernelError::NoExec);
        assert_eq!(
            parse_header(&(&raw[..] as &[u8])).unwrap_err(),
            KernelError::NoExec
        );
    }

    fn minimal_elf(entry: u64, body: &[u8]) -> alloc::vec::Vec<u8> {
        // One LOAD segment at 0x400000 carrying `body`.
        let mut image = alloc::vec![0u8; 0x200];
        let header = ElfHeader {
            magic: *b"\x7fELF",
            class: 2,
            data: 1,
            version: 1,
            abi: 0,
            abi_version: 0,
            pad: [0; 7],
            e_type: 2,
            e_machine: 0x3e,
            e_version: 1,
            e_entry: entry,
            e_phoff: 0x40,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 0x40,
            e_phentsize: 0x38,
            e_phnum: 1,
            e_shentsize: 0x40,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let ph = Phdr {
            p_type: PT_LOAD,
            p_flags: PF_W | 4,
            p_offset: 0x100,
            p_vaddr: 0x40_0000,
            p_paddr: 0,
            p_filesz: body.len() as u64,
            p_memsz: body.len() as u64 + 0x20,
            p_align: 0x1000,
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                &header as *const _ as *const u8,
                image.as_mut_ptr(),
                ELF_HEADER_SIZE,
            );
            core::ptr::copy_nonoverlapping(
                &ph as *const _ as *const u8,
                image.as_mut_ptr().add(0x40),
                PHDR_SIZE,
            );
        }
        image[0x100..0x100 + body.len()].copy_from_slice(body);
        image
    }

    #[test]
    fn loads_segment_and_zeroes_tail() {
        let _mm = testing::lock();
        let image = minimal_elf(0x40_0010, b"payload!");
        let aspace = AddressSpace::new().unwrap();
        let entry = load(&aspace, &(&image[..] as &[u8])).unwrap();
        assert_eq!(entry, 0x40_0010);

        let table = aspace.table.lock();
        let mapping = table.lookup(Va::new(0x40_0000).unwrap()).unwrap();
        assert!(mapping.user() && mapping.writable());
        let bytes = unsafe {
            core::slice::from_raw_parts(mapping.pa.into_kva().into_usize() as *const u8, 0x30)
        };
        assert_eq!(&bytes[..8], b"payload!");
        assert!(bytes[8..].iter().all(|&b| b == 0), "memsz tail is zeroed");
        table.unlock();
    }

    #[test]
    fn argv_layout_matches_exec_contract() {
        let _mm = testing::lock();
        let mut page = Page::new().unwrap();
        let builder = StackBuilder::new(&mut page);
        let (argc, argv_va, rsp) = builder.build_argv(&["echo", "hi"]).unwrap();
        assert_eq!(argc, 2);
        assert_eq!(rsp % 16, 0);
        let base = USER_STACK_TOP - PAGE_SIZE;
        assert!((base..USER_STACK_TOP).contains(&argv_va));

        let read_usize = |va: usize| {
            let off = va - base;
            usize::from_ne_bytes(page.inner()[off..off + 8].try_into().unwrap())
        };
        let read_cstr = |va: usize| {
            let off = va - base;
            let bytes = &page.inner()[off..];
            let nul = bytes.iter().position(|&b| b == 0).unwrap();
            core::str::from_utf8(&bytes[..nul]).unwrap().to_owned()
        };
        let argv0 = read_usize(argv_va);
        let argv1 = read_usize(argv_va + 8);
        let argv2 = read_usize(argv_va + 16);
        assert_eq!(read_cstr(argv0), "echo");
        assert_eq!(read_cstr(argv1), "hi");
        assert_eq!(argv2, 0, "argv is NUL-terminated");
        assert!((base..USER_STACK_TOP).contains(&argv0));
        assert!((base..USER_STACK_TOP).contains(&argv1));
    }
}
