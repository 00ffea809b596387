//! The environment a fiber is created, restored and serialized in.

use crate::primitives::HoldingIdentity;
use crate::registry::FlowRegistry;
use crate::serialization::FiberSerializer;
use std::fmt;
use std::sync::Arc;

/// Flow resolution plus fiber serialization for one holding identity.
///
/// Continuations are only meaningful inside the context that produced them:
/// the same flow names must resolve to the same implementations and the same
/// serializer must read them back.
#[derive(Clone)]
pub struct ExecutionContext {
    owner: HoldingIdentity,
    registry: Arc<FlowRegistry>,
    serializer: Arc<dyn FiberSerializer>,
}

impl ExecutionContext {
    pub fn new(
        owner: HoldingIdentity,
        registry: Arc<FlowRegistry>,
        serializer: Arc<dyn FiberSerializer>,
    ) -> Self {
        Self {
            owner,
            registry,
            serializer,
        }
    }

    pub fn owner(&self) -> &HoldingIdentity {
        &self.owner
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn serializer(&self) -> &dyn FiberSerializer {
        self.serializer.as_ref()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("owner", &self.owner)
            .field("flows", &self.registry.len())
            .field("format", &self.serializer.format())
            .finish()
    }
}
