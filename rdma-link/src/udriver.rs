use alloc::sync::Arc;
use alloc::vec::Vec;

use rdma_shim::{log, Verbs};

use crate::device::{Device, DeviceRef};
use crate::ControlpathError;

#[cfg(not(feature = "user"))]
lazy_static::lazy_static! {
    /// One fabric per process, so that every `UDriver::create` in it sees
    /// the same subnet
    static ref SOFT_FABRIC: Arc<rdma_shim::soft::SoftFabric> =
        Arc::new(rdma_shim::soft::SoftFabric::new());
}

/// UDriver abstracts the RDMA device lists on this machine
pub struct UDriver {
    verbs: Arc<dyn Verbs>,
    rnics: Vec<DeviceRef>,
}

pub type KDriverRef = Arc<UDriver>;

impl UDriver {
    pub fn devices(&self) -> &Vec<DeviceRef> {
        &self.rnics
    }

    /// Query the device lists of the default provider: libibverbs with the
    /// `user` feature, the process-wide soft fabric otherwise
    pub fn create() -> Result<Arc<Self>, ControlpathError> {
        Self::with_provider(default_provider()?)
    }

    /// Query the device lists through `verbs`.
    ///
    /// The provider is fork-initialized first, as libibverbs requires before
    /// any other call when the process may fork.
    pub fn with_provider(verbs: Arc<dyn Verbs>) -> Result<Arc<Self>, ControlpathError> {
        verbs.fork_init().map_err(|e| {
            log::error!("fork init of provider {} failed: {}", verbs.name(), e);
            ControlpathError::ContextError("fork init", e)
        })?;

        let names = verbs.device_names().map_err(|e| {
            log::error!("failed to list the RDMA devices: {}", e);
            ControlpathError::ContextError("device list", e)
        })?;

        let rnics = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| Device::new(verbs.clone(), index, name))
            .collect();

        Ok(Arc::new(Self { verbs, rnics }))
    }

    /// return the overall wrapped devices
    pub fn iter(&self) -> core::slice::Iter<'_, DeviceRef> {
        self.rnics.iter()
    }

    /// Device at `index` in the device list
    pub fn get_dev(&self, index: usize) -> Option<&DeviceRef> {
        self.rnics.get(index)
    }

    pub fn provider(&self) -> &Arc<dyn Verbs> {
        &self.verbs
    }
}

#[cfg(not(feature = "user"))]
fn default_provider() -> Result<Arc<dyn Verbs>, ControlpathError> {
    Ok(SOFT_FABRIC.clone())
}

#[cfg(feature = "user")]
fn default_provider() -> Result<Arc<dyn Verbs>, ControlpathError> {
    let provider = rdma_shim::user::IbvProvider::create().map_err(|e| {
        log::error!("Error in finding RDMA devices: {}", e);
        ControlpathError::ContextError("device list", e)
    })?;
    Ok(Arc::new(provider))
}

impl core::fmt::Debug for UDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("User-space RDMA device list")
            .field("provider", &self.verbs.name())
            .field("num_devices", &self.rnics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma_shim::soft::SoftFabric;

    #[test]
    fn check_device_num() {
        let d = UDriver::with_provider(Arc::new(SoftFabric::with_devices(3))).expect("driver");
        assert_eq!(d.devices().len(), 3);
        assert_eq!(d.get_dev(2).expect("dev").name(), "soft_2");
        assert!(d.get_dev(3).is_none());
    }

    #[cfg(not(feature = "user"))]
    #[test]
    fn default_driver_has_a_device() {
        let d = UDriver::create().expect("driver");
        assert!(!d.devices().is_empty());
    }
}
