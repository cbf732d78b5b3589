pub mod compiler;
pub mod config;
pub mod external;
pub mod ids;
pub mod netdev;
pub mod release;
pub mod sizes;

pub use compiler::{CompileError, Vlab, VlabCompiler, VlabOpts, VmDescriptor, EXTERNAL_VM_NAME};
pub use config::{RegistryConfig, VlabConfig, VmEntry};
pub use ids::{VmIds, VmKind};
pub use netdev::{NicBinding, NicDescriptor};
pub use sizes::{VmSize, VmSizeOverrides, VmSizes};
