//! Crate-level error type

use crate::config::ConfigError;
use crate::deploy::{CollaboratorError, DeployError};
use crate::establish::EstablishmentError;
use crate::model::DescriptorError;
use crate::rules::RuleError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rules: {0}")]
    Rules(#[from] RuleError),

    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("establishment: {0}")]
    Establishment(#[from] EstablishmentError),

    #[error("collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("deployment: {0}")]
    Deploy(#[from] DeployError),
}

pub type Result<T> = std::result::Result<T, Error>;
