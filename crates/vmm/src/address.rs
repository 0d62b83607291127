//! Address types for physical and virtual memory.
//!
//! Architecture-independent wrappers around raw addresses, validated against
//! the widths of the current architecture.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
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

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Newtype over the architecture-dependent representation of a physical address."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Newtype over the architecture-dependent representation of a virtual address.\n\
     User addresses lie strictly below `PHYS_BASE`."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns whether this address belongs to user space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < arch::PHYS_BASE
    }

    /// Returns the page containing this address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }

    /// Subtracts `rhs`, stopping at zero instead of underflowing.
    #[inline]
    pub const fn saturating_sub(self, rhs: usize) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}
