pub mod builder;
pub mod graph;
pub mod intent;
pub mod persist;
pub mod ports;
pub mod profile;
pub mod validate;

pub use builder::WiringBuilder;
pub use graph::WiringGraph;
pub use intent::{FabricMode, TopologyIntent};
pub use ports::{nic_id, PortError, ServerNicAllocator, SwitchPortAllocator};
pub use profile::SwitchProfile;
pub use validate::{validate, ValidationError};
