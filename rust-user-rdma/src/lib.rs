//! Raw libibverbs bindings, generated at build time from `<infiniband/verbs.h>`.
#![no_std]
#![allow(deref_nullptr)]
#![allow(non_snake_case, non_camel_case_types, non_upper_case_globals)]

#[allow(unused_imports)]
use libc::*;

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// bindgen does not derive `Default` for these, an all-zero value is what
/// the verbs API expects for unused fields
macro_rules! zeroed_default {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    unsafe { core::mem::zeroed() }
                }
            }
        )*
    };
}

zeroed_default!(
    ibv_port_attr,
    ibv_ah_attr,
    ibv_qp_attr,
    ibv_qp_init_attr,
    ibv_send_wr,
    ibv_wc,
);

impl core::fmt::Debug for ibv_port_attr {
    /// print the port attr, the detailed fields can be found at:
    /// https://www.rdmamojo.com/2012/07/21/ibv_query_port/
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ibv_port_attr")
            .field("lid", &self.lid)
            .field("state", &self.state)
            .field("active_mtu", &self.active_mtu)
            .field("max_msg_sz", &self.max_msg_sz)
            .finish()
    }
}
