//! Connection id allocation, scoped to one deployment run

use crate::model::{ConnectionView, Descriptor};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Source of connection ids. Implementations must be safe to share between
/// concurrent establishments and must never hand out an id that is in use.
pub trait IdAllocator: Send + Sync {
    /// Reserve the lowest free id
    fn allocate(&self) -> Result<u16, AllocatorError>;
    /// Reserve a specific id
    fn reserve(&self, id: u16) -> Result<(), AllocatorError>;
    /// Return an id to the pool. Releasing a free id is a no-op.
    fn release(&self, id: u16);
}

/// Allocator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("all connection ids are in use")]
    Exhausted,
    #[error("connection id {0} is already in use")]
    InUse(u16),
    #[error("id allocator lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct AllocatorState {
    next: u16,
    in_use: BTreeSet<u16>,
}

/// Mutex-guarded id pool over `1..=u16::MAX`
#[derive(Debug)]
pub struct DeploymentIdAllocator {
    state: Mutex<AllocatorState>,
}

impl Default for DeploymentIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentIdAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next: 1,
                in_use: BTreeSet::new(),
            }),
        }
    }

    /// Pool with the ids of already-established connections marked in use
    pub fn from_descriptor(descriptor: &Descriptor) -> Self {
        let in_use: BTreeSet<u16> = descriptor
            .connections
            .iter()
            .map(ConnectionView::new)
            .filter(|c| c.is_established())
            .filter_map(|c| c.id())
            .filter(|&id| id != 0)
            .collect();
        log::debug!("Id allocator seeded with {} ids in use", in_use.len());
        Self {
            state: Mutex::new(AllocatorState { next: 1, in_use }),
        }
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().map(|s| s.in_use.len()).unwrap_or(0)
    }
}

impl IdAllocator for DeploymentIdAllocator {
    fn allocate(&self) -> Result<u16, AllocatorError> {
        let mut state = self.state.lock().map_err(|_| AllocatorError::Poisoned)?;
        if state.in_use.len() >= usize::from(u16::MAX) {
            return Err(AllocatorError::Exhausted);
        }
        // scan forward from the cursor, wrapping past u16::MAX back to 1
        let mut candidate = state.next.max(1);
        while state.in_use.contains(&candidate) {
            candidate = candidate.checked_add(1).unwrap_or(1);
        }
        state.in_use.insert(candidate);
        state.next = candidate.checked_add(1).unwrap_or(1);
        Ok(candidate)
    }

    fn reserve(&self, id: u16) -> Result<(), AllocatorError> {
        if id == 0 {
            return Err(AllocatorError::InUse(0));
        }
        let mut state = self.state.lock().map_err(|_| AllocatorError::Poisoned)?;
        if !state.in_use.insert(id) {
            return Err(AllocatorError::InUse(id));
        }
        Ok(())
    }

    fn release(&self, id: u16) {
        if let Ok(mut state) = self.state.lock() {
            state.in_use.remove(&id);
        }
    }
}

/// A reserved id that is returned to its allocator unless committed
#[must_use = "dropping a reservation releases the id"]
pub struct IdReservation<'a> {
    allocator: &'a dyn IdAllocator,
    id: u16,
    committed: bool,
}

impl<'a> IdReservation<'a> {
    pub fn allocate(allocator: &'a dyn IdAllocator) -> Result<Self, AllocatorError> {
        let id = allocator.allocate()?;
        Ok(Self {
            allocator,
            id,
            committed: false,
        })
    }

    pub fn reserve(allocator: &'a dyn IdAllocator, id: u16) -> Result<Self, AllocatorError> {
        allocator.reserve(id)?;
        Ok(Self {
            allocator,
            id,
            committed: false,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Keep the id: it now belongs to an established connection
    pub fn commit(mut self) -> u16 {
        self.committed = true;
        self.id
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            log::debug!("Releasing uncommitted connection id {}", self.id);
            self.allocator.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DescriptorFormat;
    use std::sync::Arc;

    #[test]
    fn test_allocates_from_one() {
        let alloc = DeploymentIdAllocator::new();
        assert_eq!(alloc.allocate(), Ok(1));
        assert_eq!(alloc.allocate(), Ok(2));
        alloc.release(1);
        assert_eq!(alloc.allocate(), Ok(3));
        assert_eq!(alloc.in_use(), 3);
    }

    #[test]
    fn test_reserve_conflicts() {
        let alloc = DeploymentIdAllocator::new();
        alloc.reserve(2).unwrap();
        assert_eq!(alloc.reserve(2), Err(AllocatorError::InUse(2)));
        assert_eq!(alloc.reserve(0), Err(AllocatorError::InUse(0)));
        assert_eq!(alloc.allocate(), Ok(1));
        assert_eq!(alloc.allocate(), Ok(3));
    }

    #[test]
    fn test_wraps_around() {
        let alloc = DeploymentIdAllocator::new();
        alloc.reserve(u16::MAX).unwrap();
        alloc.state.lock().unwrap().next = u16::MAX;
        assert_eq!(alloc.allocate(), Ok(1));
    }

    #[test]
    fn test_exhausted() {
        let alloc = DeploymentIdAllocator::new();
        alloc.state.lock().unwrap().in_use = (1..=u16::MAX).collect();
        assert_eq!(alloc.allocate(), Err(AllocatorError::Exhausted));
    }

    #[test]
    fn test_seeded_from_descriptor() {
        let text = r#"{ "connections": [
            { "established": true, "id": 1 },
            { "established": true, "id": 2 },
            { "id": 3 }
        ] }"#;
        let d = Descriptor::from_str_as(text, DescriptorFormat::Json).unwrap();
        let alloc = DeploymentIdAllocator::from_descriptor(&d);
        assert_eq!(alloc.in_use(), 2);
        assert_eq!(alloc.allocate(), Ok(3));
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let alloc = DeploymentIdAllocator::new();
        {
            let r = IdReservation::allocate(&alloc).unwrap();
            assert_eq!(r.id(), 1);
        }
        assert_eq!(alloc.in_use(), 0);

        let kept = IdReservation::reserve(&alloc, 9).unwrap().commit();
        assert_eq!(kept, 9);
        assert_eq!(alloc.in_use(), 1);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = Arc::new(DeploymentIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..100).map(|_| alloc.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }
}
