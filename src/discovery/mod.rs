pub mod instance;
pub mod registry;

pub use instance::{HealthStatus, InstanceSnapshot, ServiceInstance};
pub use registry::{RegistryCounts, ServiceRegistry};
