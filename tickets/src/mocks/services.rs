//! Mock service resolver for testing.

use crate::error::Result;
use crate::providers::ServiceResolver;
use crate::ticket::Service;
use dashmap::DashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mock service resolver.
///
/// Either accepts every service, or only the registered ones. Disabling a
/// service wins over both. Clones share state.
#[derive(Debug, Clone)]
pub struct MockServiceResolver {
    accept_any: bool,
    registered: Arc<DashSet<Service>>,
    disabled: Arc<DashSet<Service>>,
    lookups: Arc<AtomicUsize>,
}

impl MockServiceResolver {
    /// Resolver that accepts every service not explicitly disabled.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            accept_any: true,
            registered: Arc::new(DashSet::new()),
            disabled: Arc::new(DashSet::new()),
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Resolver that only accepts `services`.
    #[must_use]
    pub fn with_services<I>(services: I) -> Self
    where
        I: IntoIterator<Item = Service>,
    {
        let resolver = Self {
            accept_any: false,
            ..Self::allow_all()
        };
        for service in services {
            resolver.registered.insert(service);
        }
        resolver
    }

    /// Register a service.
    pub fn register(&self, service: Service) {
        self.registered.insert(service);
    }

    /// Disable a service.
    pub fn disable(&self, service: Service) {
        self.disabled.insert(service);
    }

    /// Re-enable a disabled service.
    pub fn enable(&self, service: &Service) {
        self.disabled.remove(service);
    }

    /// Number of lookups performed.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for MockServiceResolver {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl ServiceResolver for MockServiceResolver {
    fn is_known_and_enabled(&self, service: &Service) -> impl Future<Output = Result<bool>> + Send {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let allowed = !self.disabled.contains(service)
            && (self.accept_any || self.registered.contains(service));

        async move { Ok(allowed) }
    }
}
