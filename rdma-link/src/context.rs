use alloc::sync::Arc;

use rdma_shim::{log, ContextHandle, KernelResult, PdHandle, PortAttr, Verbs};

use crate::device::DeviceRef;
use crate::ControlpathError;

/// An opened device context together with its protection domain.
///
/// CQs, QPs and MRs hold an `Arc<Context>`, so the context outlives all of
/// them. [`Context::destroy`] refuses to run while any of them is alive.
pub struct Context {
    inner_device: DeviceRef,
    ctx: ContextHandle,
    pd: PdHandle,
    pd_alive: bool,
    ctx_alive: bool,
}

pub type ContextRef = Arc<Context>;

impl Context {
    pub(crate) fn new(dev: &DeviceRef) -> Result<Arc<Self>, ControlpathError> {
        let verbs = dev.verbs();
        let ctx = verbs.open_device(dev.index()).map_err(|e| {
            log::error!("failed to open the device '{}': {}", dev.name(), e);
            ControlpathError::ContextError("open device", e)
        })?;
        log::info!("The device '{}' was opened", dev.name());

        let pd = match verbs.alloc_pd(ctx) {
            Ok(pd) => pd,
            Err(e) => {
                log::error!("failed to allocate the protection domain: {}", e);
                if let Err(close) = verbs.close_device(ctx) {
                    log::error!("failed to close the device after that: {}", close);
                }
                return Err(ControlpathError::ContextError("alloc pd", e));
            }
        };
        log::info!("The protection domain was created for the device");

        Ok(Arc::new(Self {
            inner_device: dev.clone(),
            ctx,
            pd,
            pd_alive: true,
            ctx_alive: true,
        }))
    }

    #[inline]
    pub fn verbs(&self) -> &Arc<dyn Verbs> {
        self.inner_device.verbs()
    }

    #[inline]
    pub fn get_dev_ref(&self) -> &DeviceRef {
        &self.inner_device
    }

    #[inline]
    pub fn raw_handle(&self) -> ContextHandle {
        self.ctx
    }

    #[inline]
    pub fn get_pd(&self) -> PdHandle {
        self.pd
    }

    pub fn get_port_attr(&self, port_num: u8) -> KernelResult<PortAttr> {
        self.verbs().query_port(self.ctx, port_num)
    }

    /// Deallocate the protection domain, then close the device.
    ///
    /// # Errors
    /// - `TeardownOrder`: a CQ, QP or MR created from this context is still alive
    /// - `DestroyError`: the provider refused one of the two calls
    pub fn destroy(self: Arc<Self>) -> Result<(), ControlpathError> {
        let mut ctx = Arc::try_unwrap(self).map_err(|_| {
            log::error!("context destroyed while resources created from it are alive");
            ControlpathError::TeardownOrder("context")
        })?;
        ctx.release()
    }

    fn release(&mut self) -> Result<(), ControlpathError> {
        if self.pd_alive {
            self.verbs().dealloc_pd(self.pd).map_err(|e| {
                log::error!("failed to deallocate the protection domain: {}", e);
                ControlpathError::DestroyError("PD", e)
            })?;
            self.pd_alive = false;
        }
        if self.ctx_alive {
            self.verbs().close_device(self.ctx).map_err(|e| {
                log::error!("failed to close the device: {}", e);
                ControlpathError::DestroyError("context", e)
            })?;
            self.ctx_alive = false;
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("context leaked on drop: {}", e);
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.inner_device.name())
            .field("ctx", &self.ctx)
            .field("pd", &self.pd)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use rdma_shim::soft::SoftFabric;

    use crate::UDriver;

    #[test]
    fn destroy_releases_pd_and_context() {
        let fabric = Arc::new(SoftFabric::new());
        let ctx = UDriver::with_provider(fabric.clone())
            .expect("driver")
            .get_dev(0)
            .expect("no rdma device available")
            .open_context()
            .expect("failed to create RDMA context");
        assert_eq!(fabric.live_resources(), 2);
        assert_eq!(ctx.get_port_attr(1).expect("port").lid, 1);

        ctx.destroy().expect("destroy");
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn destroy_while_shared_is_refused() {
        let fabric = Arc::new(SoftFabric::new());
        let ctx = UDriver::with_provider(fabric.clone())
            .expect("driver")
            .get_dev(0)
            .expect("dev")
            .open_context()
            .expect("ctx");
        let other = ctx.clone();
        assert!(matches!(
            ctx.destroy(),
            Err(crate::ControlpathError::TeardownOrder("context"))
        ));
        // the surviving reference still releases everything on drop
        drop(other);
        assert_eq!(fabric.live_resources(), 0);
    }
}
