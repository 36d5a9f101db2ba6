//! Deployment orchestration
//!
//! Drives a validated descriptor through the external collaborators:
//! - **Toolchain**: builds a module and deploys it to its node
//! - **Attester**: proves a deployed module runs genuine code
//! - **KeyGenerator**: mints key material for each connection
//!
//! Collaborator failures abort only the entity they concern. Entities that
//! were already deployed or established are never rolled back.

pub mod simulated;

pub use simulated::{RandomKeyGenerator, SimulatedAttester, SimulatedToolchain};

use crate::establish::{DeploymentIdAllocator, EstablishRequest, Establisher, EstablishmentError, KeyMaterial};
use crate::model::{
    ConnectionView, Descriptor, Encryption, EntityId, EntityKind, LifecycleError, ModuleMut, ModuleView,
};
use crate::record::Record;
use crate::validator::{EntityFailures, ValidationResult, Validator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CollaboratorError {
    #[error("build of module '{module}' failed: {reason}")]
    Build { module: String, reason: String },

    #[error("deployment of module '{module}' failed: {reason}")]
    Deploy { module: String, reason: String },

    #[error("attestation of module '{module}' failed: {reason}")]
    Attestation { module: String, reason: String },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// Output of a module build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub module: String,
    pub binary: PathBuf,
}

/// Result of a successful deployment: fields to merge into the module record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    pub updates: Record,
}

/// Backend-specific build and deployment
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Build the module without deploying it
    async fn build(&self, module: &Record) -> Result<BuildArtifact, CollaboratorError>;

    /// Build the module and push it to `node`
    async fn compile_and_deploy(&self, module: &Record, node: &Record) -> Result<DeployOutcome, CollaboratorError>;
}

/// Remote attestation of deployed modules
#[async_trait]
pub trait Attester: Send + Sync {
    async fn attest(&self, module: &Record, node: &Record) -> Result<(), CollaboratorError>;
}

/// Source of connection key material
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate_key_material(&self, encryption: &Encryption) -> Result<KeyMaterial, CollaboratorError>;
}

/// Which pipeline produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Build,
    Deploy,
}

/// Pipeline stage at which an entity failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Build,
    Deploy,
    Attest,
    Establish,
}

/// Why an entity failed a stage. Collaborator and establishment errors are
/// carried as returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Establishment(#[from] EstablishmentError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("host node '{0}' not found")]
    MissingHost(String),

    #[error("endpoint modules are not deployed and attested")]
    EndpointsNotReady,
}

impl Serialize for StageError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub entity: EntityId,
    pub stage: Stage,
    pub error: StageError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EstablishedConnection {
    pub name: String,
    pub id: u16,
}

/// What one build or deploy run did
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub built: Vec<BuildArtifact>,
    pub deployed: Vec<String>,
    pub attested: Vec<String>,
    pub established: Vec<EstablishedConnection>,
    pub failures: Vec<StageFailure>,
    /// Violations found when re-validating the output descriptor
    pub output_violations: Vec<EntityFailures>,
    /// Fingerprint of the descriptor at the end of the run
    pub fingerprint: String,
}

impl DeploymentReport {
    fn start(mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: now,
            finished_at: now,
            built: Vec::new(),
            deployed: Vec::new(),
            attested: Vec::new(),
            established: Vec::new(),
            failures: Vec::new(),
            output_violations: Vec::new(),
            fingerprint: String::new(),
        }
    }

    fn fail(&mut self, entity: EntityId, stage: Stage, error: impl Into<StageError>) {
        let error = error.into();
        log::warn!("{} failed at {:?}: {}", entity, stage, error);
        self.failures.push(StageFailure { entity, stage, error });
    }

    fn finish(&mut self, descriptor: &Descriptor) {
        self.finished_at = Utc::now();
        self.fingerprint = descriptor.fingerprint();
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.output_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        let elapsed = (self.finished_at - self.started_at).num_milliseconds();
        match self.mode {
            RunMode::Build => format!(
                "Build {} | {} built | {} failed | {}ms",
                self.run_id,
                self.built.len(),
                self.failures.len(),
                elapsed
            ),
            RunMode::Deploy => format!(
                "Deploy {} | {} deployed | {} attested | {} established | {} failed | {}ms",
                self.run_id,
                self.deployed.len(),
                self.attested.len(),
                self.established.len(),
                self.failures.len(),
                elapsed
            ),
        }
    }
}

/// Errors that stop a run before any collaborator is called
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    #[error("descriptor is invalid ({} entities with violations)", .0.len())]
    Invalid(Vec<EntityFailures>),
}

/// Runs build and deploy pipelines over the given collaborators
pub struct Deployer<T, A, K> {
    validator: Validator,
    toolchain: T,
    attester: A,
    keys: K,
}

impl<T: Toolchain, A: Attester, K: KeyGenerator> Deployer<T, A, K> {
    pub fn new(validator: Validator, toolchain: T, attester: A, keys: K) -> Self {
        Self {
            validator,
            toolchain,
            attester,
            keys,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    fn ensure_valid(&self, descriptor: &Descriptor) -> Result<(), DeployError> {
        match self.validator.validate(descriptor) {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(failures) => Err(DeployError::Invalid(failures)),
        }
    }

    /// Dry run: validate, then build every module. Never mutates.
    pub async fn build(&self, descriptor: &Descriptor) -> Result<DeploymentReport, DeployError> {
        self.ensure_valid(descriptor)?;
        let mut report = DeploymentReport::start(RunMode::Build);

        for (index, module) in descriptor.modules.iter().enumerate() {
            match self.toolchain.build(module).await {
                Ok(artifact) => {
                    log::info!("Built {} -> {}", artifact.module, artifact.binary.display());
                    report.built.push(artifact);
                }
                Err(e) => report.fail(descriptor.entity_id(EntityKind::Module, index), Stage::Build, e),
            }
        }

        report.finish(descriptor);
        log::info!("{}", report.summary());
        Ok(report)
    }

    /// Deploy, attest and connect everything the descriptor describes
    pub async fn deploy(&self, descriptor: &mut Descriptor) -> Result<DeploymentReport, DeployError> {
        self.ensure_valid(descriptor)?;
        let mut report = DeploymentReport::start(RunMode::Deploy);

        self.deploy_modules(descriptor, &mut report).await;
        self.attest_modules(descriptor, &mut report).await;
        self.establish_connections(descriptor, &mut report).await;

        if let ValidationResult::Invalid(failures) = self.validator.validate(descriptor) {
            log::warn!("Output descriptor failed validation: {} entities", failures.len());
            report.output_violations = failures;
        }

        report.finish(descriptor);
        log::info!("{}", report.summary());
        Ok(report)
    }

    /// Modules in priority order; modules without a priority go last
    fn deploy_order(descriptor: &Descriptor) -> Vec<usize> {
        let mut order: Vec<usize> = (0..descriptor.modules.len()).collect();
        order.sort_by_key(|&i| {
            let priority = ModuleView::new(&descriptor.modules[i]).priority();
            (priority.is_none(), priority)
        });
        order
    }

    fn host_of(descriptor: &Descriptor, module: &Record) -> Result<Record, StageError> {
        let node = ModuleView::new(module).node().unwrap_or_default();
        descriptor
            .node(node)
            .map(|n| n.record().clone())
            .ok_or_else(|| StageError::MissingHost(node.to_string()))
    }

    async fn deploy_modules(&self, descriptor: &mut Descriptor, report: &mut DeploymentReport) {
        for index in Self::deploy_order(descriptor) {
            let module = descriptor.modules[index].clone();
            if ModuleView::new(&module).is_deployed() {
                continue;
            }
            let entity = descriptor.entity_id(EntityKind::Module, index);
            let node = match Self::host_of(descriptor, &module) {
                Ok(node) => node,
                Err(e) => {
                    report.fail(entity, Stage::Deploy, e);
                    continue;
                }
            };

            match self.toolchain.compile_and_deploy(&module, &node).await {
                Ok(outcome) => {
                    let record = &mut descriptor.modules[index];
                    for (field, value) in outcome.updates.iter() {
                        record.set(field, value.clone());
                    }
                    ModuleMut::new(record).mark_deployed();
                    report.deployed.push(entity.name.unwrap_or_default());
                }
                Err(e) => report.fail(entity, Stage::Deploy, e),
            }
        }
    }

    async fn attest_modules(&self, descriptor: &mut Descriptor, report: &mut DeploymentReport) {
        for index in 0..descriptor.modules.len() {
            let module = descriptor.modules[index].clone();
            let view = ModuleView::new(&module);
            if !view.is_deployed() || view.is_attested() {
                continue;
            }
            let entity = descriptor.entity_id(EntityKind::Module, index);
            let node = match Self::host_of(descriptor, &module) {
                Ok(node) => node,
                Err(e) => {
                    report.fail(entity, Stage::Attest, e);
                    continue;
                }
            };

            let attested = match self.attester.attest(&module, &node).await {
                Ok(()) => ModuleMut::new(&mut descriptor.modules[index])
                    .mark_attested()
                    .map_err(StageError::from),
                Err(e) => Err(StageError::from(e)),
            };
            match attested {
                Ok(()) => report.attested.push(entity.name.unwrap_or_default()),
                Err(e) => report.fail(entity, Stage::Attest, e),
            }
        }
    }

    async fn establish_connections(&self, descriptor: &mut Descriptor, report: &mut DeploymentReport) {
        let ready: HashSet<String> = descriptor
            .modules
            .iter()
            .map(ModuleView::new)
            .filter(|m| m.is_ready())
            .filter_map(|m| m.name().map(str::to_string))
            .collect();

        let mut pending = Vec::new();
        let mut selected = vec![false; descriptor.connections.len()];
        for index in 0..descriptor.connections.len() {
            let conn = ConnectionView::new(&descriptor.connections[index]);
            if conn.is_established() {
                continue;
            }
            let endpoints_ready = conn.to_module().is_some_and(|m| ready.contains(m))
                && conn.from_module().map_or(true, |m| ready.contains(m));
            let nonce_left = conn
                .to_module()
                .and_then(|m| descriptor.module(m))
                .map_or(true, |m| m.nonce() < i64::MAX);

            let entity = descriptor.entity_id(EntityKind::Connection, index);
            if !endpoints_ready {
                report.fail(entity, Stage::Establish, StageError::EndpointsNotReady);
            } else if !nonce_left {
                let module = conn.to_module().unwrap_or_default().to_string();
                report.fail(entity, Stage::Establish, LifecycleError::NonceExhausted(module));
            } else {
                pending.push(index);
                selected[index] = true;
            }
        }
        if pending.is_empty() {
            return;
        }

        let allocator = DeploymentIdAllocator::from_descriptor(descriptor);
        let establisher = Establisher::from_registry(self.validator.registry(), &allocator);
        let entities: Vec<EntityId> = pending
            .iter()
            .map(|&i| descriptor.entity_id(EntityKind::Connection, i))
            .collect();

        let tasks = descriptor
            .connections
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| selected[*i])
            .map(|(_, conn)| {
                let establisher = &establisher;
                let keys = &self.keys;
                async move {
                    let encryption = ConnectionView::new(conn)
                        .encryption()
                        .unwrap_or(Encryption::Plain);
                    let material = keys.generate_key_material(&encryption).await?;
                    let id = establisher.establish(conn, EstablishRequest::new(material))?;
                    Ok::<_, StageError>(EstablishedConnection {
                        name: ConnectionView::new(conn).label(),
                        id,
                    })
                }
            });
        let results = join_all(tasks).await;

        for (entity, result) in entities.into_iter().zip(results) {
            match result {
                Ok(established) => report.established.push(established),
                Err(e) => report.fail(entity, Stage::Establish, e),
            }
        }

        // every key set on a module consumes one of its nonces
        let touched: Vec<String> = report
            .established
            .iter()
            .filter_map(|c| descriptor.connection(&c.name))
            .filter_map(|c| c.to_module().map(str::to_string))
            .collect();
        for module in touched {
            let Some(index) = descriptor
                .modules
                .iter()
                .position(|r| r.get_str("name") == Some(module.as_str()))
            else {
                continue;
            };
            if let Err(e) = ModuleMut::new(&mut descriptor.modules[index]).bump_nonce() {
                let entity = descriptor.entity_id(EntityKind::Module, index);
                report.fail(entity, Stage::Establish, e);
            }
        }
    }
}
