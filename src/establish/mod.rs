//! Connection establishment
//!
//! A connection moves from unestablished to established exactly once. The
//! transition writes `key`, `nonce`, `id`, `name`, `direct` and
//! `established = true` in one step:
//! - the id is reserved first (explicit or allocated) under an
//!   [`IdReservation`] guard
//! - all fields are written to a candidate copy of the record
//! - the candidate must pass the connection rules
//! - only then is the record replaced and the reservation committed
//!
//! Any error leaves the record untouched and the id released.

pub mod allocator;

pub use allocator::{AllocatorError, DeploymentIdAllocator, IdAllocator, IdReservation};

use crate::model::{ConnectionView, EntityKind};
use crate::record::Record;
use crate::rules::{ResolvedRules, RuleFailure, RuleRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Key and nonce minted by the key-management collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Hex-encoded key bytes; empty for unencrypted connections
    pub key: String,
    pub nonce: i64,
}

/// Inputs to one establishment
#[derive(Debug, Clone)]
pub struct EstablishRequest {
    pub material: KeyMaterial,
    pub name: Option<String>,
    pub direct: Option<bool>,
    pub id: Option<u16>,
}

impl EstablishRequest {
    pub fn new(material: KeyMaterial) -> Self {
        Self {
            material,
            name: None,
            direct: None,
            id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_direct(mut self, direct: bool) -> Self {
        self.direct = Some(direct);
        self
    }

    /// Request a specific id instead of allocating one
    pub fn with_id(mut self, id: u16) -> Self {
        self.id = Some(id);
        self
    }
}

/// Drives connections through establishment against one id pool
pub struct Establisher<'a> {
    rules: Arc<ResolvedRules>,
    allocator: &'a dyn IdAllocator,
}

impl<'a> Establisher<'a> {
    pub fn new(rules: Arc<ResolvedRules>, allocator: &'a dyn IdAllocator) -> Self {
        Self { rules, allocator }
    }

    /// Establisher checking against the registry's connection rules
    pub fn from_registry(registry: &RuleRegistry, allocator: &'a dyn IdAllocator) -> Self {
        Self::new(registry.resolve(EntityKind::Connection, None), allocator)
    }

    /// Establish `conn`, returning its id.
    ///
    /// Unless given in the request, `name` defaults to the record's name or
    /// `conn<id>`, and `direct` to the record's value or `false`.
    pub fn establish(&self, conn: &mut Record, request: EstablishRequest) -> Result<u16, EstablishmentError> {
        let view = ConnectionView::new(conn);
        if view.is_established() {
            return Err(EstablishmentError::AlreadyEstablished(view.label()));
        }

        let reservation = match request.id {
            Some(id) => IdReservation::reserve(self.allocator, id).map_err(|e| match e {
                AllocatorError::InUse(id) => EstablishmentError::IdCollision(id),
                other => EstablishmentError::Allocator(other),
            })?,
            None => IdReservation::allocate(self.allocator)?,
        };
        let id = reservation.id();

        let name = request
            .name
            .or_else(|| view.name().map(str::to_string))
            .unwrap_or_else(|| format!("conn{}", id));
        let direct = request
            .direct
            .or_else(|| conn.get_bool("direct"))
            .unwrap_or(false);

        let mut candidate = conn.clone();
        candidate.set("key", request.material.key);
        candidate.set("nonce", request.material.nonce);
        candidate.set("id", id);
        candidate.set("name", name.as_str());
        candidate.set("direct", direct);
        candidate.set("established", true);

        let failures = self.rules.check(&candidate);
        if !failures.is_empty() {
            log::warn!("Connection {} rejected at establishment: {} rule(s) failed", name, failures.len());
            return Err(EstablishmentError::Rejected(failures));
        }

        *conn = candidate;
        let id = reservation.commit();
        log::info!("Connection {} established with id {}", name, id);
        Ok(id)
    }

    /// Tear an established connection down so it can be established again
    /// as a new instance. Returns the released id.
    pub fn teardown(&self, conn: &mut Record) -> Option<u16> {
        let view = ConnectionView::new(conn);
        if !view.is_established() {
            return None;
        }
        let id = view.id();
        if let Some(id) = id {
            self.allocator.release(id);
        }
        for field in ["key", "nonce", "id"] {
            conn.remove(field);
        }
        conn.set("established", false);
        log::info!("Connection {} torn down", ConnectionView::new(conn).label());
        id
    }
}

/// Establishment failures. None of them leave a partial write behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EstablishmentError {
    #[error("connection {0} is already established")]
    AlreadyEstablished(String),

    #[error("connection id {0} is already assigned")]
    IdCollision(u16),

    #[error("established connection would violate: {}", .0.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    Rejected(Vec<RuleFailure>),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),
}
