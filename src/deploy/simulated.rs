//! Simulated collaborators for development and tests
//!
//! No real toolchain, node or attestation service is contacted. Failures
//! can be injected per module name.

use super::{Attester, BuildArtifact, CollaboratorError, DeployOutcome, KeyGenerator, Toolchain};
use crate::config::BuildMode;
use crate::establish::KeyMaterial;
use crate::model::{Encryption, ModuleView, NodeView};
use crate::record::Record;
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashSet;
use std::path::PathBuf;

/// Backends whose rule sets authorize a `binary` field
const KNOWN_BACKENDS: &[&str] = &["sancus", "sgx", "native", "trustzone"];

fn binary_extension(module_type: &str) -> &'static str {
    match module_type {
        "sancus" => "elf",
        "sgx" => "sgxs",
        "trustzone" => "ta",
        _ => "bin",
    }
}

/// Pretends to build and deploy modules
#[derive(Debug, Clone, Default)]
pub struct SimulatedToolchain {
    pub build_mode: BuildMode,
    pub build_dir: PathBuf,
    failing: HashSet<String>,
}

impl SimulatedToolchain {
    pub fn new(build_mode: BuildMode, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_mode,
            build_dir: build_dir.into(),
            failing: HashSet::new(),
        }
    }

    /// Make every build and deployment of `module` fail
    pub fn failing(mut self, module: &str) -> Self {
        self.failing.insert(module.to_string());
        self
    }

    fn artifact(&self, module: &Record) -> Result<BuildArtifact, CollaboratorError> {
        let view = ModuleView::new(module);
        let name = view.name().unwrap_or("unnamed");
        if self.failing.contains(name) {
            return Err(CollaboratorError::Build {
                module: name.to_string(),
                reason: "simulated compiler error".into(),
            });
        }
        let ext = binary_extension(view.module_type().unwrap_or(""));
        Ok(BuildArtifact {
            module: name.to_string(),
            binary: self
                .build_dir
                .join(name)
                .join(self.build_mode.as_str())
                .join(format!("{}.{}", name, ext)),
        })
    }
}

#[async_trait]
impl Toolchain for SimulatedToolchain {
    async fn build(&self, module: &Record) -> Result<BuildArtifact, CollaboratorError> {
        tokio::task::yield_now().await;
        self.artifact(module)
    }

    async fn compile_and_deploy(&self, module: &Record, node: &Record) -> Result<DeployOutcome, CollaboratorError> {
        let artifact = self.artifact(module).map_err(|e| match e {
            CollaboratorError::Build { module, reason } => CollaboratorError::Deploy { module, reason },
            other => other,
        })?;
        tokio::task::yield_now().await;
        log::debug!(
            "Simulated upload of {} to {}",
            artifact.binary.display(),
            NodeView::new(node).reactive_address().unwrap_or_default()
        );

        let mut updates = Record::new();
        let module_type = ModuleView::new(module).module_type().unwrap_or("");
        if KNOWN_BACKENDS.contains(&module_type) {
            updates.set("binary", artifact.binary.to_string_lossy().into_owned());
        }
        Ok(DeployOutcome { updates })
    }
}

/// Accepts every deployed module unless told otherwise
#[derive(Debug, Clone, Default)]
pub struct SimulatedAttester {
    failing: HashSet<String>,
}

impl SimulatedAttester {
    pub fn failing(mut self, module: &str) -> Self {
        self.failing.insert(module.to_string());
        self
    }
}

#[async_trait]
impl Attester for SimulatedAttester {
    async fn attest(&self, module: &Record, _node: &Record) -> Result<(), CollaboratorError> {
        tokio::task::yield_now().await;
        let name = ModuleView::new(module).name().unwrap_or("unnamed");
        if self.failing.contains(name) {
            return Err(CollaboratorError::Attestation {
                module: name.to_string(),
                reason: "simulated quote mismatch".into(),
            });
        }
        Ok(())
    }
}

/// Random keys sized for the connection's encryption scheme
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeyGenerator;

#[async_trait]
impl KeyGenerator for RandomKeyGenerator {
    async fn generate_key_material(&self, encryption: &Encryption) -> Result<KeyMaterial, CollaboratorError> {
        let mut key = vec![0u8; encryption.key_size()];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(KeyMaterial {
            key: hex::encode(key),
            nonce: 0,
        })
    }
}
