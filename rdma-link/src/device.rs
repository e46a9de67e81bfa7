use alloc::string::String;
use alloc::sync::Arc;

use rdma_shim::Verbs;

use crate::context::Context;

/// One RDMA device as listed by the provider
pub struct Device {
    verbs: Arc<dyn Verbs>,
    index: usize,
    name: String,
}

pub type DeviceRef = Arc<Device>;

impl Device {
    pub(crate) fn new(verbs: Arc<dyn Verbs>, index: usize, name: String) -> DeviceRef {
        Arc::new(Self { verbs, index, name })
    }

    /// Open the device and allocate the protection domain every later
    /// resource is created in
    pub fn open_context(self: &DeviceRef) -> Result<Arc<Context>, crate::ControlpathError> {
        Context::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the provider's device list
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.verbs
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}
