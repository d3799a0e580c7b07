//! Device classes shipped with the runtime.
//!
//! They form the `karabo.devices` plugin namespace and are what a server
//! offers when no other namespace is configured.


use std::sync::Arc;

pub use property_test::PropertyTest;

use crate::device::DeviceClasses;
use crate::error::KaraboResult;

/// Register every class of this namespace.
pub fn register(classes: &mut DeviceClasses) -> KaraboResult<()> {
    classes.register(Arc::new(PropertyTest))?;
    Ok(())
}
