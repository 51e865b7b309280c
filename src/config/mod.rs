mod target_registry;

pub use target_registry::{TargetRegistry, TargetRegistryCreationError};
