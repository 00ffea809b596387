//! Flow registry: resolves flow names to their implementations.
//!
//! A continuation only records the *name* of the flow it belongs to. On
//! restore the name is looked up here, so every process that may resume a
//! flow must build the same registry from code:
//!
//! ```rust,ignore
//! fn build_registry() -> FlowRegistry {
//!     FlowRegistry::with_codec(Arc::new(JsonCodec))
//!         .register("ping", PingFlow)
//!         .register("pong", PongResponder)
//!         .build()
//! }
//! ```

use crate::codec::{Codec, sealed};
use crate::context::FlowContext;
use crate::error::FlowError;
use crate::flow::{Flow, FlowIoRequest, Resumed, Step};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// A step whose state and output are already encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStep {
    Suspend { state: Bytes, request: FlowIoRequest },
    Finish(Bytes),
}

/// Byte-level view of a [`Flow`], independent of its argument, state and output types.
pub trait ErasedFlow: Send + Sync {
    /// Decode `args` and run the flow from the start.
    fn start<'a>(
        &'a self,
        ctx: &'a mut FlowContext,
        args: Bytes,
    ) -> BoxFuture<'a, Result<RawStep, FlowError>>;

    /// Decode `state` and build the future that resumes the flow.
    ///
    /// # Errors
    ///
    /// Fails before any flow logic runs if `state` does not decode.
    fn resume<'a>(
        &'a self,
        ctx: &'a mut FlowContext,
        state: Bytes,
        resumed: Resumed,
    ) -> anyhow::Result<BoxFuture<'a, Result<RawStep, FlowError>>>;
}

struct FlowWrapper<F, C> {
    flow: Arc<F>,
    codec: Arc<C>,
}

impl<F, C> FlowWrapper<F, C>
where
    F: Flow,
    C: Codec + sealed::EncodeValue<F::State> + sealed::EncodeValue<F::Output>,
{
    fn encode_step(&self, step: Step<F::State, F::Output>) -> Result<RawStep, FlowError> {
        match step {
            Step::Suspend(state, request) => Ok(RawStep::Suspend {
                state: self.codec.encode(&state)?,
                request,
            }),
            Step::Finish(output) => Ok(RawStep::Finish(self.codec.encode(&output)?)),
        }
    }
}

impl<F, C> ErasedFlow for FlowWrapper<F, C>
where
    F: Flow,
    C: Codec
        + sealed::DecodeValue<F::Args>
        + sealed::DecodeValue<F::State>
        + sealed::EncodeValue<F::State>
        + sealed::EncodeValue<F::Output>
        + Sync,
{
    fn start<'a>(
        &'a self,
        ctx: &'a mut FlowContext,
        args: Bytes,
    ) -> BoxFuture<'a, Result<RawStep, FlowError>> {
        Box::pin(async move {
            let args: F::Args = self.codec.decode(args)?;
            let step = self.flow.start(ctx, args).await?;
            self.encode_step(step)
        })
    }

    fn resume<'a>(
        &'a self,
        ctx: &'a mut FlowContext,
        state: Bytes,
        resumed: Resumed,
    ) -> anyhow::Result<BoxFuture<'a, Result<RawStep, FlowError>>> {
        let state: F::State = self.codec.decode(state)?;
        Ok(Box::pin(async move {
            let step = self.flow.resume(ctx, state, resumed).await?;
            self.encode_step(step)
        }))
    }
}

/// Registry of flow implementations keyed by flow name.
///
/// The registry is code, not data: it holds trait objects and is never
/// serialized. Flow names are the stable identifiers written into
/// checkpoints and must not be reused for a different flow.
#[derive(Default)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn ErasedFlow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `flow` under `name`, encoding its values with `codec`.
    ///
    /// Registering the same name twice replaces the earlier flow.
    pub fn register<F, C>(&mut self, name: &str, codec: Arc<C>, flow: F)
    where
        F: Flow,
        C: Codec
            + sealed::DecodeValue<F::Args>
            + sealed::DecodeValue<F::State>
            + sealed::EncodeValue<F::State>
            + sealed::EncodeValue<F::Output>
            + Sync,
    {
        let wrapper = FlowWrapper {
            flow: Arc::new(flow),
            codec,
        };
        self.flows.insert(name.to_string(), Arc::new(wrapper));
    }

    /// Returns `None` if no flow is registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedFlow>> {
        self.flows.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flow_names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(|s| s.as_str())
    }

    /// Start a builder that registers every flow with the same codec.
    pub fn with_codec<C: Codec>(codec: Arc<C>) -> RegistryBuilder<C> {
        RegistryBuilder {
            codec,
            registry: FlowRegistry::new(),
        }
    }
}

/// Builder created by [`FlowRegistry::with_codec`].
pub struct RegistryBuilder<C> {
    codec: Arc<C>,
    registry: FlowRegistry,
}

impl<C: Codec> RegistryBuilder<C> {
    pub fn register<F>(mut self, name: &str, flow: F) -> Self
    where
        F: Flow,
        C: sealed::DecodeValue<F::Args>
            + sealed::DecodeValue<F::State>
            + sealed::EncodeValue<F::State>
            + sealed::EncodeValue<F::Output>
            + Sync,
    {
        self.registry.register(name, Arc::clone(&self.codec), flow);
        self
    }

    pub fn build(self) -> FlowRegistry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, Encoder};
    use crate::flow::ReceivedMessages;
    use crate::primitives::{FlowId, HoldingIdentity};
    use crate::serialization::JsonCodec;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Waits for `n` confirmations, then reports how many it asked for.
    struct CountDown;

    #[async_trait]
    impl Flow for CountDown {
        type Args = u32;
        type State = u32;
        type Output = String;

        async fn start(
            &self,
            ctx: &mut FlowContext,
            args: u32,
        ) -> Result<Step<u32, String>, FlowError> {
            Ok(Step::Suspend(args, ctx.wait_for_confirmations(args)))
        }

        async fn resume(
            &self,
            _ctx: &mut FlowContext,
            state: u32,
            _resumed: Resumed,
        ) -> Result<Step<u32, String>, FlowError> {
            Ok(Step::Finish(format!("confirmed {state}")))
        }
    }

    fn ctx() -> FlowContext {
        FlowContext::new(FlowId::new(), HoldingIdentity::new("O=Alice", "g1"), Utc::now())
    }

    fn registry() -> FlowRegistry {
        FlowRegistry::with_codec(Arc::new(JsonCodec))
            .register("count-down", CountDown)
            .build()
    }

    #[test]
    fn test_lookup() {
        let registry = registry();
        assert!(registry.contains("count-down"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.flow_names().collect::<Vec<_>>(), vec!["count-down"]);
    }

    #[tokio::test]
    async fn test_start_and_resume_through_bytes() {
        let flow = registry().get("count-down").unwrap();
        let mut ctx = ctx();
        let step = flow
            .start(&mut ctx, JsonCodec.encode(&3u32).unwrap())
            .await
            .unwrap();
        let RawStep::Suspend { state, request } = step else {
            panic!("expected suspension");
        };
        assert_eq!(request, FlowIoRequest::WaitForConfirmations { required: 3 });

        let resumed = Resumed::Confirmed { confirmations: 3 };
        let step = flow.resume(&mut ctx, state, resumed).unwrap().await.unwrap();
        let RawStep::Finish(output) = step else {
            panic!("expected completion");
        };
        let output: String = JsonCodec.decode(output).unwrap();
        assert_eq!(output, "confirmed 3");
    }

    #[tokio::test]
    async fn test_bad_args_are_payload_errors() {
        let flow = registry().get("count-down").unwrap();
        let mut ctx = ctx();
        let err = flow
            .start(&mut ctx, Bytes::from_static(b"\"three\""))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Payload(_)));
    }

    #[test]
    fn test_bad_state_fails_before_running() {
        let flow = registry().get("count-down").unwrap();
        let mut ctx = ctx();
        let resumed = Resumed::Messages(ReceivedMessages::new());
        assert!(flow
            .resume(&mut ctx, Bytes::from_static(b"not json"), resumed)
            .is_err());
    }
}
