//! Entity model: nodes, modules and connections of one deployment
//!
//! Entities are stored as plain [`Record`](crate::record::Record)s inside a
//! [`Descriptor`]; the view types give typed access and carry the lifecycle
//! transitions (deployment, attestation, establishment state).

pub mod entity;
pub mod descriptor;
pub mod module;
pub mod node;
pub mod connection;

pub use entity::{EntityId, EntityKind};
pub use descriptor::{Descriptor, DescriptorError, DescriptorFormat};
pub use module::{LifecycleError, ModuleMut, ModuleView};
pub use node::NodeView;
pub use connection::{ConnectionState, ConnectionView, Encryption, Endpoints};
