//! Execution context provider: the bridge to per-identity execution environments.
//!
//! Resuming a flow needs the same flow implementations and serializer that
//! suspended it. The provider hands these out per holding identity and
//! refuses to do so while an identity's environment is being rebuilt.

use crate::fiber_cache::FiberCache;
use async_trait::async_trait;
use flow_core::serialization::JsonFiberSerializer;
use flow_core::{ExecutionContext, FlowRegistry, HoldingIdentity};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The identity's environment is being rebuilt; try again later.
    #[error("execution environment of {0} is in maintenance")]
    InMaintenance(HoldingIdentity),
    #[error("execution environment unavailable: {0}")]
    Unavailable(String),
    /// The environment cannot be built at all.
    #[error("execution environment of {owner} could not be constructed: {reason}")]
    Construction {
        owner: HoldingIdentity,
        reason: String,
    },
}

impl SandboxError {
    /// Whether redelivering the event later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Construction { .. })
    }
}

/// Supplies the execution context flows of one identity run in.
#[async_trait]
pub trait ExecutionContextProvider: Send + Sync {
    /// Get the execution context for `owner`, building it if needed.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError` if the environment is in maintenance or cannot
    /// be built.
    async fn acquire(&self, owner: &HoldingIdentity) -> Result<Arc<ExecutionContext>, SandboxError>;

    /// Fail fast if `owner`'s environment is being rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InMaintenance`] during a rebuild.
    fn validate_not_in_maintenance(&self, owner: &HoldingIdentity) -> Result<(), SandboxError>;
}

#[async_trait]
impl<P> ExecutionContextProvider for Arc<P>
where
    P: ExecutionContextProvider + ?Sized,
{
    async fn acquire(&self, owner: &HoldingIdentity) -> Result<Arc<ExecutionContext>, SandboxError> {
        (**self).acquire(owner).await
    }

    fn validate_not_in_maintenance(&self, owner: &HoldingIdentity) -> Result<(), SandboxError> {
        (**self).validate_not_in_maintenance(owner)
    }
}

type ContextFactory =
    dyn Fn(&HoldingIdentity) -> anyhow::Result<ExecutionContext> + Send + Sync;

/// Provider that builds contexts from a factory function and caches them per identity.
///
/// Putting an identity into maintenance evicts its cached context, and any
/// fibers parked in the attached [`FiberCache`], so the first acquire after
/// [`end_maintenance`](Self::end_maintenance) sees a freshly built environment.
pub struct StaticContextProvider {
    factory: Box<ContextFactory>,
    contexts: RwLock<HashMap<HoldingIdentity, Arc<ExecutionContext>>>,
    maintenance: RwLock<HashSet<HoldingIdentity>>,
    fibers: Option<Arc<FiberCache>>,
}

impl StaticContextProvider {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&HoldingIdentity) -> anyhow::Result<ExecutionContext> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            contexts: RwLock::new(HashMap::new()),
            maintenance: RwLock::new(HashSet::new()),
            fibers: None,
        }
    }

    /// Evict `cache`'s fibers of an identity whenever it enters maintenance.
    #[must_use]
    pub fn with_fiber_cache(mut self, cache: Arc<FiberCache>) -> Self {
        self.fibers = Some(cache);
        self
    }

    /// Every identity shares `registry` and serializes fibers as JSON.
    pub fn with_registry(registry: Arc<FlowRegistry>) -> Self {
        Self::new(move |owner| {
            Ok(ExecutionContext::new(
                owner.clone(),
                Arc::clone(&registry),
                Arc::new(JsonFiberSerializer),
            ))
        })
    }

    pub fn begin_maintenance(&self, owner: &HoldingIdentity) {
        tracing::info!(owner = %owner, "execution environment entering maintenance");
        self.maintenance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner.clone());
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner);
        if let Some(fibers) = &self.fibers {
            fibers.evict_owner(owner);
        }
    }

    pub fn end_maintenance(&self, owner: &HoldingIdentity) {
        tracing::info!(owner = %owner, "execution environment leaving maintenance");
        self.maintenance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner);
    }
}

#[async_trait]
impl ExecutionContextProvider for StaticContextProvider {
    async fn acquire(&self, owner: &HoldingIdentity) -> Result<Arc<ExecutionContext>, SandboxError> {
        self.validate_not_in_maintenance(owner)?;
        if let Some(ctx) = self
            .contexts
            .read()
            .map_err(|e| SandboxError::Unavailable(format!("Lock error: {}", e)))?
            .get(owner)
        {
            return Ok(Arc::clone(ctx));
        }

        let ctx = (self.factory)(owner).map_err(|e| SandboxError::Construction {
            owner: owner.clone(),
            reason: format!("{e:#}"),
        })?;
        tracing::debug!(owner = %owner, "built execution context");
        let ctx = Arc::new(ctx);
        let mut contexts = self
            .contexts
            .write()
            .map_err(|e| SandboxError::Unavailable(format!("Lock error: {}", e)))?;
        // Maintenance may have begun while the factory ran.
        self.validate_not_in_maintenance(owner)?;
        Ok(Arc::clone(contexts.entry(owner.clone()).or_insert(ctx)))
    }

    fn validate_not_in_maintenance(&self, owner: &HoldingIdentity) -> Result<(), SandboxError> {
        let maintenance = self
            .maintenance
            .read()
            .map_err(|e| SandboxError::Unavailable(format!("Lock error: {}", e)))?;
        if maintenance.contains(owner) {
            return Err(SandboxError::InMaintenance(owner.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    fn alice() -> HoldingIdentity {
        HoldingIdentity::new("O=Alice", "g1")
    }

    fn counting_provider(built: Arc<AtomicUsize>) -> StaticContextProvider {
        let registry = Arc::new(FlowRegistry::new());
        StaticContextProvider::new(move |owner| {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionContext::new(
                owner.clone(),
                Arc::clone(&registry),
                Arc::new(JsonFiberSerializer),
            ))
        })
    }

    #[tokio::test]
    async fn test_contexts_are_cached_per_owner() {
        let built = Arc::new(AtomicUsize::new(0));
        let provider = counting_provider(Arc::clone(&built));

        let a = provider.acquire(&alice()).await.unwrap();
        let b = provider.acquire(&alice()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.owner(), &alice());

        provider
            .acquire(&HoldingIdentity::new("O=Bob", "g1"))
            .await
            .unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_maintenance_refuses_and_rebuilds() {
        let built = Arc::new(AtomicUsize::new(0));
        let provider = counting_provider(Arc::clone(&built));
        provider.acquire(&alice()).await.unwrap();

        provider.begin_maintenance(&alice());
        let err = provider.validate_not_in_maintenance(&alice()).unwrap_err();
        assert!(matches!(err, SandboxError::InMaintenance(_)));
        assert!(err.is_transient());
        assert!(provider.acquire(&alice()).await.is_err());

        provider.end_maintenance(&alice());
        provider.validate_not_in_maintenance(&alice()).unwrap();
        provider.acquire(&alice()).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_context_built_across_maintenance_not_cached() {
        let built = Arc::new(AtomicUsize::new(0));
        let this: Arc<OnceLock<Weak<StaticContextProvider>>> = Arc::new(OnceLock::new());
        let registry = Arc::new(FlowRegistry::new());
        let provider = Arc::new(StaticContextProvider::new({
            let built = Arc::clone(&built);
            let this = Arc::clone(&this);
            move |owner| {
                // The first build races with an operator starting maintenance.
                if built.fetch_add(1, Ordering::SeqCst) == 0
                    && let Some(provider) = this.get().and_then(Weak::upgrade)
                {
                    provider.begin_maintenance(owner);
                }
                Ok(ExecutionContext::new(
                    owner.clone(),
                    Arc::clone(&registry),
                    Arc::new(JsonFiberSerializer),
                ))
            }
        }));
        this.set(Arc::downgrade(&provider)).unwrap();

        let err = provider.acquire(&alice()).await.unwrap_err();
        assert!(matches!(err, SandboxError::InMaintenance(_)));

        provider.end_maintenance(&alice());
        provider.acquire(&alice()).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_construction_failure_is_fatal() {
        let provider = StaticContextProvider::new(|_| anyhow::bail!("cpk missing"));
        let err = provider.acquire(&alice()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Construction { .. }));
        assert!(!err.is_transient());
    }
}
