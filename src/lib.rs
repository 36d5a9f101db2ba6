//! Reactive: validation and connection lifecycle for TEE module deployments
//!
//! Modules run inside trusted execution environments (Sancus, SGX,
//! TrustZone, native) on a set of nodes and talk over authenticated
//! connections. Before anything is deployed, every node, module and
//! connection record is checked against declarative rule sets; connections
//! are then established exactly once, receiving a key, a nonce and a
//! deployment-unique id.

pub mod record;
pub mod rules;
pub mod model;
pub mod validator;
pub mod establish;
pub mod deploy;
pub mod config;
pub mod error;

pub use record::{Record, Value, ValueType};
pub use rules::{RuleRegistry, RuleSet, AUTHORIZED_KEYS_RULE};
pub use model::{Descriptor, DescriptorFormat, EntityId, EntityKind};
pub use validator::{ValidationResult, Validator, Violation, ViolationKind};
pub use establish::{DeploymentIdAllocator, EstablishRequest, Establisher, EstablishmentError, IdAllocator, KeyMaterial};
pub use deploy::{Deployer, DeploymentReport};
pub use config::ToolConfig;
pub use error::{Error, Result};
