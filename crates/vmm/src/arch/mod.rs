#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(all(
    target_arch = "x86_64",
    not(any(test, feature = "software-emulation"))
))]
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;

#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
