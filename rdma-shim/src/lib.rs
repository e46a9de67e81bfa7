//! The shim between the RC link logic and whatever implements the verbs.
//!
//! Two providers live here: [`soft::SoftFabric`], an in-process emulation
//! that needs no hardware, and (with the `user` feature) the libibverbs one.
//! [`audit::AuditedVerbs`] wraps either to record calls and enforce the
//! teardown order.
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod audit;
pub mod soft;
pub mod types;
pub mod utils;
pub mod verbs;

#[cfg(feature = "user")]
pub mod user;

pub use log;
pub use types::*;
pub use verbs::Verbs;

use core::num::TryFromIntError;

use libc::c_int;

/// An errno carried the kernel way, i.e., negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub c_int);

impl Error {
    pub const EPERM: Self = Error(-(libc::EPERM as c_int));
    pub const EINVAL: Self = Error(-(libc::EINVAL as c_int));
    pub const ENOMEM: Self = Error(-(libc::ENOMEM as c_int));
    pub const EFAULT: Self = Error(-(libc::EFAULT as c_int));
    pub const EAGAIN: Self = Error(-(libc::EAGAIN as c_int));
    pub const EBUSY: Self = Error(-(libc::EBUSY as c_int));
    pub const ENODEV: Self = Error(-(libc::ENODEV as c_int));
    pub const ENOSYS: Self = Error(-(libc::ENOSYS as c_int));

    /// Accepts either sign, libibverbs returns positive errno values while
    /// some calls report them negated.
    pub fn from_kernel_errno(errno: c_int) -> Error {
        Error(-errno.abs())
    }

    pub fn to_kernel_errno(&self) -> c_int {
        self.0
    }

    /// The positive errno value
    pub fn errno(&self) -> c_int {
        -self.0
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut ::core::fmt::Formatter) -> core::fmt::Result {
        match self.errno() {
            libc::EINVAL => write!(fmt, "Invalid value"),
            libc::ENOMEM => write!(fmt, "Not enough memory"),
            libc::ENOSYS => write!(fmt, "Not supported by RDMA device"),
            libc::EPERM => write!(fmt, "Invalid permissions"),
            libc::EBUSY => write!(fmt, "Busy because in the middle of processing"),
            errno => write!(fmt, "Unknown error {}", errno),
        }
    }
}

impl From<TryFromIntError> for Error {
    fn from(_: TryFromIntError) -> Error {
        Error::EINVAL
    }
}

pub type KernelResult<T> = Result<T, Error>;
