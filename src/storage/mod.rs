//! Persistence of instance state.
//!
//! The lifecycle service only talks to [`InstanceStore`]. [`FsInstanceStore`]
//! keeps everything under the data directory; [`MemoryStore`] is used for
//! embedding and tests.

mod env_file;
mod fs;
mod memory;

use std::collections::BTreeMap;

use crate::error::Result;
use crate::instance::InstanceSettings;
use crate::service::ServiceDescriptor;

pub use fs::FsInstanceStore;
pub use memory::MemoryStore;

pub trait InstanceStore: Send + Sync {
    /// Prepare storage for a new instance.
    fn create_dir(&self, instance_id: &str) -> Result<()>;

    /// Every instance that has storage, in a stable order.
    fn list_ids(&self) -> Result<Vec<String>>;

    /// Remove everything stored for the instance. Missing state is not an error.
    fn delete(&self, instance_id: &str) -> Result<()>;

    fn load_descriptor(&self, instance_id: &str) -> Result<ServiceDescriptor>;
    fn save_descriptor(&self, instance_id: &str, service: &ServiceDescriptor) -> Result<()>;

    /// Missing settings load as the defaults.
    fn load_settings(&self, instance_id: &str) -> Result<InstanceSettings>;
    fn save_settings(&self, instance_id: &str, settings: &InstanceSettings) -> Result<()>;

    /// A missing environment loads as empty.
    fn load_env(&self, instance_id: &str) -> Result<BTreeMap<String, String>>;
    fn save_env(&self, instance_id: &str, env: &BTreeMap<String, String>) -> Result<()>;
}
