//! Physical and virtual memory addressing.
//!
//! Kernel virtual memory is a direct map of physical memory: the first page
//! of the direct map aliases the first physical frame, the second page the
//! second frame, and so on. Converting between a physical address ([`Pa`])
//! and a kernel virtual address ([`Kva`]) is therefore a single offset
//! addition, with the offset fixed once at boot by
//! [`set_directmap_base`]. User virtual addresses are a separate type
//! ([`Va`]) so the two spaces cannot be confused.

use core::sync::atomic::{AtomicUsize, Ordering};

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount converting an address into a page-frame number.
pub const PAGE_SHIFT: usize = 12;

/// Mask extracting the offset within a page.
pub const PAGE_MASK: usize = 0xfff;

/// Highest user virtual address + 1 (the base of the sign-extended hole).
pub const VA_USER_END: usize = 0x8000_0000_0000;

static DIRECTMAP_BASE: AtomicUsize = AtomicUsize::new(0);

/// Fix the direct-map base address.
///
/// Called once during early boot, before the physical allocator is
/// initialized. Hosted tests call this with the base of their fostered
/// memory arena.
pub fn set_directmap_base(base: usize) {
    DIRECTMAP_BASE.store(base, Ordering::SeqCst);
}

#[inline]
fn directmap_base() -> usize {
    DIRECTMAP_BASE.load(Ordering::Relaxed)
}

/// A physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is canonical.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 1 << 52 { Some(Self(addr)) } else { None }
    }

    /// Cast into `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Convert into the kernel virtual address that aliases this frame.
    #[inline]
    pub fn into_kva(self) -> Kva {
        Kva(self.0 + directmap_base())
    }
}

/// A kernel virtual address inside the direct map.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Kva(usize);

impl Kva {
    /// Creates a new kernel virtual address. Rejects null.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr != 0 { Some(Self(addr)) } else { None }
    }

    /// Cast into `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Convert back into the physical address this alias covers.
    #[inline]
    pub fn into_pa(self) -> Pa {
        Pa(self.0 - directmap_base())
    }
}

/// A user virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address. Rejects null.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr != 0 { Some(Self(addr)) } else { None }
    }

    /// Cast into `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Whether this address lies below the user-space limit.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < VA_USER_END
    }

    /// Whether this address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

macro_rules! impl_addr_arith {
    ($t:ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;
            #[inline]
            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            #[inline]
            fn add_assign(&mut self, rhs: usize) {
                self.0 += rhs;
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;
            #[inline]
            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            #[inline]
            fn sub_assign(&mut self, rhs: usize) {
                self.0 -= rhs;
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = usize;
            #[inline]
            fn sub(self, rhs: $t) -> usize {
                self.0 - rhs.0
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:#x})", stringify!($t), self.0)
            }
        }
    };
}

impl_addr_arith!(Pa);
impl_addr_arith!(Kva);
impl_addr_arith!(Va);
