//! Page, frame and process number types.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Page numbers are zero-indexed and correspond to PAGE_SIZE-aligned virtual addresses."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

/// Identifies the process that owns an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}
