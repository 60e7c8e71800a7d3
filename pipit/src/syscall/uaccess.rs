//! Safe access to user memory.
//!
//! The kernel never dereferences a user pointer directly: every access
//! translates the user virtual address through the process's page table
//! and copies through the kernel's direct map, page by page. A hole or a
//! permission mismatch anywhere in the range is `BadAddress`.

use crate::proc::AddressSpace;
use crate::KernelError;
use alloc::{string::String, vec::Vec};
use roost::addressing::{PAGE_MASK, PAGE_SIZE, Va};

/// Longest C string (path, argument) the kernel will read from user space.
pub const USER_STR_MAX: usize = 4096;
/// Most argv entries `execv` accepts.
pub const ARGV_MAX: usize = 64;

fn page_kva(aspace: &AddressSpace, va: usize, write: bool) -> Result<usize, KernelError> {
    let page_va = Va::new(va & !PAGE_MASK).ok_or(KernelError::BadAddress)?;
    if !page_va.is_user() {
        return Err(KernelError::BadAddress);
    }
    let table = aspace.table.lock();
    let mapping = table.lookup(page_va);
    table.unlock();
    let mapping = mapping.ok_or(KernelError::BadAddress)?;
    if !mapping.user() || (write && !mapping.writable()) {
        return Err(KernelError::BadAddress);
    }
    Ok(mapping.pa.into_kva().into_usize() + (va & PAGE_MASK))
}

/// Copy `buf.len()` bytes from user address `va` into `buf`.
pub fn copy_from_user(
    aspace: &AddressSpace,
    va: usize,
    buf: &mut [u8],
) -> Result<(), KernelError> {
    let mut copied = 0;
    while copied < buf.len() {
        let cursor = va + copied;
        let kva = page_kva(aspace, cursor, false)?;
        let n = (buf.len() - copied).min(PAGE_SIZE - (cursor & PAGE_MASK));
        unsafe {
            core::ptr::copy_nonoverlapping(kva as *const u8, buf[copied..].as_mut_ptr(), n);
        }
        copied += n;
    }
    Ok(())
}

/// Copy `data` to user address `va`.
pub fn copy_to_user(aspace: &AddressSpace, va: usize, data: &[u8]) -> Result<(), KernelError> {
    let mut copied = 0;
    while copied < data.len() {
        let cursor = va + copied;
        let kva = page_kva(aspace, cursor, true)?;
        let n = (data.len() - copied).min(PAGE_SIZE - (cursor & PAGE_MASK));
        unsafe {
            core::ptr::copy_nonoverlapping(data[copied..].as_ptr(), kva as *mut u8, n);
        }
        copied += n;
    }
    Ok(())
}

/// Read a NUL-terminated user string of at most [`USER_STR_MAX`] bytes.
pub fn read_user_cstr(aspace: &AddressSpace, va: usize) -> Result<String, KernelError> {
    let mut bytes = Vec::new();
    for i in 0..USER_STR_MAX {
        let mut byte = [0u8; 1];
        copy_from_user(aspace, va + i, &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
        }
        bytes.push(byte[0]);
    }
    Err(KernelError::TooBig)
}

/// Read a NUL-terminated user pointer array of C strings (an argv).
pub fn read_user_argv(aspace: &AddressSpace, va: usize) -> Result<Vec<String>, KernelError> {
    let mut argv = Vec::new();
    for i in 0..=ARGV_MAX {
        let mut raw = [0u8; core::mem::size_of::<usize>()];
        copy_from_user(aspace, va + i * raw.len(), &mut raw)?;
        let ptr = usize::from_ne_bytes(raw);
        if ptr == 0 {
            return Ok(argv);
        }
        if i == ARGV_MAX {
            break;
        }
        argv.push(read_user_cstr(aspace, ptr)?);
    }
    Err(KernelError::TooBig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page_table::Permission;
    use crate::mm::{Page, testing};

    fn aspace_with_page(va: usize, perm: Permission) -> (alloc::sync::Arc<AddressSpace>, Page) {
        let aspace = AddressSpace::new().unwrap();
        let page = Page::new().unwrap();
        let alias = page.clone();
        let mut table = aspace.table.lock();
        table.map_page(Va::new(va).unwrap(), page, perm).unwrap();
        table.unlock();
        (aspace, alias)
    }

    #[test]
    fn copies_round_trip_through_user_pages() {
        let _mm = testing::lock();
        let va = 0x40_0000;
        let (aspace, _alias) =
            aspace_with_page(va, Permission::READ | Permission::WRITE | Permission::USER);
        copy_to_user(&aspace, va + 100, b"hello user").unwrap();
        let mut back = [0u8; 10];
        copy_from_user(&aspace, va + 100, &mut back).unwrap();
        assert_eq!(&back, b"hello user");
    }

    #[test]
    fn unmapped_and_readonly_targets_fault() {
        let _mm = testing::lock();
        let va = 0x40_0000;
        let (aspace, _alias) = aspace_with_page(va, Permission::READ | Permission::USER);
        let mut buf = [0u8; 4];
        // Readable mapping: loads work, stores fault.
        copy_from_user(&aspace, va, &mut buf).unwrap();
        assert_eq!(
            copy_to_user(&aspace, va, b"x").unwrap_err(),
            KernelError::BadAddress
        );
        // A hole one page later faults a spanning copy.
        let mut big = [0u8; PAGE_SIZE + 1];
        assert_eq!(
            copy_from_user(&aspace, va, &mut big).unwrap_err(),
            KernelError::BadAddress
        );
    }

    #[test]
    fn cstrings_and_argv_arrays_parse() {
        let _mm = testing::lock();
        let va = 0x40_0000;
        let (aspace, _alias) =
            aspace_with_page(va, Permission::READ | Permission::WRITE | Permission::USER);
        copy_to_user(&aspace, va, b"echo\0hi\0").unwrap();
        // argv = [va, va+5, NULL]
        let ptrs = [va, va + 5, 0usize];
        let mut raw = [0u8; 24];
        for (i, p) in ptrs.iter().enumerate() {
            raw[i * 8..i * 8 + 8].copy_from_slice(&p.to_ne_bytes());
        }
        copy_to_user(&aspace, va + 0x100, &raw).unwrap();

        assert_eq!(read_user_cstr(&aspace, va).unwrap(), "echo");
        let argv = read_user_argv(&aspace, va + 0x100).unwrap();
        assert_eq!(argv, alloc::vec!["echo".to_string(), "hi".to_string()]);
    }
}
