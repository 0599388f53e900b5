// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The contract flows are written against.
//!
//! A flow is an explicit state machine. The manager calls
//! [`FlowLogic::step`] with the payload it was waiting for (nothing on the
//! very first step) and the flow answers with either its final output or a
//! [`SuspensionRequest`] saying what to send and what to wait for. Between
//! steps the flow struct itself is the checkpointed state, so anything the
//! flow needs after a receive must live in its fields.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! enum Swap {
//!     Start { amount: i32, counterparty: PeerAddress },
//!     AwaitingConfirmation,
//! }
//!
//! impl FlowLogic for Swap {
//!     const NAME: &'static str = "examples.swap";
//!     type Output = String;
//!
//!     fn step(&mut self, _ctx: &FlowContext<'_>, incoming: Option<Received>) -> Result<FlowStep<String>> {
//!         match (&*self, incoming) {
//!             (Swap::Start { amount, counterparty }, None) => {
//!                 let request = SuspensionRequest::send_and_receive::<String>(
//!                     "swap", counterparty.clone(), 1, 2, amount,
//!                 )?;
//!                 *self = Swap::AwaitingConfirmation;
//!                 Ok(FlowStep::Suspend(request))
//!             }
//!             (Swap::AwaitingConfirmation, Some(reply)) => {
//!                 let answer = reply.payload::<String>()?.validate(Ok)?;
//!                 Ok(FlowStep::Finished(answer))
//!             }
//!             _ => Err(FlowError::logic("unexpected step")),
//!         }
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::manager::FlowRunId;
use crate::message::{Envelope, Payload, PeerAddress, TopicSession};
use crate::services::FlowContext;

/// Business logic of one flow type.
pub trait FlowLogic: Serialize + DeserializeOwned + Send + 'static {
    /// Registered name, stored in checkpoints to rebuild the flow on restart.
    const NAME: &'static str;

    /// Value the flow finishes with.
    type Output: Clone + Send + Sync + 'static;

    /// Advance the flow.
    ///
    /// `incoming` is `None` on the first step and after a send that expects
    /// no response. After an [`SuspensionRequest::ExpectingResponse`] it
    /// carries the reply, already checked against the expected type tag.
    fn step(
        &mut self,
        ctx: &FlowContext<'_>,
        incoming: Option<Received>,
    ) -> Result<FlowStep<Self::Output>>;
}

/// What a flow asks for after a step.
#[derive(Debug)]
pub enum FlowStep<T> {
    /// The flow is done.
    Finished(T),
    /// The flow wants to send and/or receive.
    Suspend(SuspensionRequest),
}

/// A send and/or receive requested by a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspensionRequest {
    /// Optionally send, then wait for a typed reply.
    ExpectingResponse {
        /// Topic namespace.
        topic: String,
        /// Recipient of the outgoing payload.
        destination: Option<PeerAddress>,
        /// Session the outgoing payload is sent on.
        send_session_id: i64,
        /// Session the reply is expected on.
        receive_session_id: i64,
        /// Outgoing payload, if any.
        payload: Option<Envelope>,
        /// Type tag the reply must carry.
        expected_type: String,
    },
    /// Send and carry on.
    NotExpectingResponse {
        /// Topic namespace.
        topic: String,
        /// Recipient.
        destination: PeerAddress,
        /// Session the payload is sent on.
        send_session_id: i64,
        /// Outgoing payload.
        payload: Envelope,
    },
}

impl SuspensionRequest {
    /// Send `payload` on `topic.send_session_id`, then wait for an `R` on
    /// `topic.receive_session_id`.
    pub fn send_and_receive<R: Payload>(
        topic: impl Into<String>,
        destination: impl Into<Option<PeerAddress>>,
        send_session_id: i64,
        receive_session_id: i64,
        payload: &impl Payload,
    ) -> Result<Self> {
        Ok(Self::ExpectingResponse {
            topic: topic.into(),
            destination: destination.into(),
            send_session_id,
            receive_session_id,
            payload: Some(Envelope::wrap(payload)?),
            expected_type: R::TYPE_TAG.to_string(),
        })
    }

    /// Wait for an `R` on `topic.receive_session_id` without sending.
    pub fn receive<R: Payload>(topic: impl Into<String>, receive_session_id: i64) -> Self {
        Self::ExpectingResponse {
            topic: topic.into(),
            destination: None,
            send_session_id: 0,
            receive_session_id,
            payload: None,
            expected_type: R::TYPE_TAG.to_string(),
        }
    }

    /// Send `payload` on `topic.send_session_id` and continue.
    pub fn send(
        topic: impl Into<String>,
        destination: PeerAddress,
        send_session_id: i64,
        payload: &impl Payload,
    ) -> Result<Self> {
        Ok(Self::NotExpectingResponse {
            topic: topic.into(),
            destination,
            send_session_id,
            payload: Envelope::wrap(payload)?,
        })
    }

    /// Topic namespace of the request.
    pub fn topic(&self) -> &str {
        match self {
            Self::ExpectingResponse { topic, .. } | Self::NotExpectingResponse { topic, .. } => {
                topic
            }
        }
    }

    /// Whether the flow blocks on a reply.
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::ExpectingResponse { .. })
    }

    /// The outgoing leg: full topic, destination and payload.
    pub fn outgoing(&self) -> Option<(TopicSession, Option<&PeerAddress>, &Envelope)> {
        match self {
            Self::ExpectingResponse {
                topic,
                destination,
                send_session_id,
                payload: Some(payload),
                ..
            } => Some((
                TopicSession::new(topic.clone(), *send_session_id),
                destination.as_ref(),
                payload,
            )),
            Self::ExpectingResponse { payload: None, .. } => None,
            Self::NotExpectingResponse {
                topic,
                destination,
                send_session_id,
                payload,
            } => Some((
                TopicSession::new(topic.clone(), *send_session_id),
                Some(destination),
                payload,
            )),
        }
    }

    /// The awaited leg: full topic and expected type tag.
    pub fn awaiting(&self) -> Option<(TopicSession, &str)> {
        match self {
            Self::ExpectingResponse {
                topic,
                receive_session_id,
                expected_type,
                ..
            } => Some((
                TopicSession::new(topic.clone(), *receive_session_id),
                expected_type.as_str(),
            )),
            Self::NotExpectingResponse { .. } => None,
        }
    }
}

/// A reply handed to a resumed flow.
#[derive(Debug, Clone)]
pub struct Received {
    topic: String,
    envelope: Envelope,
    message_id: Uuid,
}

impl Received {
    pub(crate) fn new(topic: String, envelope: Envelope, message_id: Uuid) -> Self {
        Self {
            topic,
            envelope,
            message_id,
        }
    }

    /// Full topic the reply arrived on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Type tag the reply carries.
    pub fn type_tag(&self) -> &str {
        &self.envelope.type_tag
    }

    /// Unique id of the carrying message.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Decode the payload. It still came from another party and must be
    /// validated before use.
    pub fn payload<T: Payload>(self) -> Result<UntrustworthyData<T>> {
        let topic = self.topic;
        self.envelope.unwrap_as(&topic).map(UntrustworthyData)
    }
}

/// A value received from a counterparty that has not been checked yet.
pub struct UntrustworthyData<T>(T);

impl<T> UntrustworthyData<T> {
    /// Run `validator` over the value and return what it produces.
    pub fn validate<R>(self, validator: impl FnOnce(T) -> Result<R>) -> Result<R> {
        validator(self.0)
    }
}

impl<T> fmt::Debug for UntrustworthyData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UntrustworthyData(..)")
    }
}

/// Resolves once a flow reaches a terminal state.
pub struct ResultHandle<T> {
    run_id: FlowRunId,
    rx: watch::Receiver<Option<Result<T>>>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id,
            rx: self.rx.clone(),
        }
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> ResultHandle<T> {
    /// Run id of the flow.
    pub fn run_id(&self) -> FlowRunId {
        self.run_id
    }

    /// Whether the flow has finished.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The outcome, if the flow has finished.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.rx.borrow().clone()
    }

    /// Wait for the flow to finish.
    ///
    /// Fails with [`FlowError::ShutDown`] if the manager is dropped while the
    /// flow is still suspended.
    pub async fn result(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => match &*value {
                Some(result) => result.clone(),
                None => Err(FlowError::ShutDown),
            },
            Err(_) => Err(FlowError::ShutDown),
        }
    }
}

/// Outcome of one erased step.
pub(crate) enum StepOutcome {
    Finished,
    Suspend(SuspensionRequest),
}

/// Type-erased flow, as held by the manager.
pub(crate) trait ErasedFlow: Send {
    fn flow_name(&self) -> &'static str;
    fn logic_type(&self) -> TypeId;
    fn step(&mut self, ctx: &FlowContext<'_>, incoming: Option<Received>) -> Result<StepOutcome>;
    fn snapshot(&self) -> Result<serde_json::Value>;
    /// Publish the stored output. Called once cleanup is done.
    fn complete(&mut self);
    fn fail(&mut self, error: FlowError);
    /// A `ResultHandle<Output>` behind `Any`.
    fn handle(&self) -> Arc<dyn Any + Send + Sync>;
}

pub(crate) struct FlowAdapter<F: FlowLogic> {
    run_id: FlowRunId,
    logic: F,
    output: Option<F::Output>,
    result: watch::Sender<Option<Result<F::Output>>>,
}

impl<F: FlowLogic> FlowAdapter<F> {
    pub(crate) fn new(run_id: FlowRunId, logic: F) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            run_id,
            logic,
            output: None,
            result,
        }
    }

    pub(crate) fn result_handle(&self) -> ResultHandle<F::Output> {
        ResultHandle {
            run_id: self.run_id,
            rx: self.result.subscribe(),
        }
    }

    fn publish(&self, outcome: Result<F::Output>) {
        self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }
}

impl<F: FlowLogic> ErasedFlow for FlowAdapter<F> {
    fn flow_name(&self) -> &'static str {
        F::NAME
    }

    fn logic_type(&self) -> TypeId {
        TypeId::of::<F>()
    }

    fn step(&mut self, ctx: &FlowContext<'_>, incoming: Option<Received>) -> Result<StepOutcome> {
        match self.logic.step(ctx, incoming)? {
            FlowStep::Finished(output) => {
                self.output = Some(output);
                Ok(StepOutcome::Finished)
            }
            FlowStep::Suspend(request) => Ok(StepOutcome::Suspend(request)),
        }
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.logic).map_err(|e| FlowError::Serialization {
            context: format!("state of flow '{}'", F::NAME),
            details: e.to_string(),
        })
    }

    fn complete(&mut self) {
        match self.output.take() {
            Some(output) => self.publish(Ok(output)),
            None => self.publish(Err(FlowError::logic("flow completed without output"))),
        }
    }

    fn fail(&mut self, error: FlowError) {
        self.publish(Err(error));
    }

    fn handle(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::new(self.result_handle())
    }
}

type FlowFactory =
    fn(FlowRunId, serde_json::Value) -> std::result::Result<Box<dyn ErasedFlow>, serde_json::Error>;

fn restore_flow<F: FlowLogic>(
    run_id: FlowRunId,
    state: serde_json::Value,
) -> std::result::Result<Box<dyn ErasedFlow>, serde_json::Error> {
    let logic: F = serde_json::from_value(state)?;
    Ok(Box::new(FlowAdapter::new(run_id, logic)))
}

/// Flow types this node can rebuild from checkpoints.
#[derive(Clone, Default)]
pub struct FlowFactoryRegistry {
    factories: HashMap<&'static str, FlowFactory>,
}

impl FlowFactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `F` under [`FlowLogic::NAME`].
    pub fn register<F: FlowLogic>(&mut self) -> &mut Self {
        self.factories.insert(F::NAME, restore_flow::<F>);
        self
    }

    /// Whether a flow name is known.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn restore(
        &self,
        name: &str,
        run_id: FlowRunId,
        state: serde_json::Value,
    ) -> Option<std::result::Result<Box<dyn ErasedFlow>, serde_json::Error>> {
        self.factories.get(name).map(|factory| factory(run_id, state))
    }
}

impl fmt::Debug for FlowFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowFactoryRegistry")
            .field("flows", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        seen: Vec<String>,
    }

    impl FlowLogic for Echo {
        const NAME: &'static str = "test.echo";
        type Output = Vec<String>;

        fn step(
            &mut self,
            _ctx: &FlowContext<'_>,
            incoming: Option<Received>,
        ) -> Result<FlowStep<Self::Output>> {
            match incoming {
                None => Ok(FlowStep::Suspend(SuspensionRequest::receive::<String>("echo", 1))),
                Some(reply) => {
                    let text = reply.payload::<String>()?.validate(Ok)?;
                    self.seen.push(text);
                    Ok(FlowStep::Finished(self.seen.clone()))
                }
            }
        }
    }

    #[test]
    fn test_send_and_receive_request() {
        let peer = PeerAddress::new(1, "bob");
        let request =
            SuspensionRequest::send_and_receive::<String>("swap", peer.clone(), 1, 2, &42i32)
                .unwrap();

        assert!(request.expects_response());
        assert_eq!(request.topic(), "swap");

        let (send_topic, destination, payload) = request.outgoing().unwrap();
        assert_eq!(send_topic.to_string(), "swap.1");
        assert_eq!(destination, Some(&peer));
        assert_eq!(payload.type_tag, "i32");

        let (receive_topic, expected) = request.awaiting().unwrap();
        assert_eq!(receive_topic.to_string(), "swap.2");
        assert_eq!(expected, "String");
    }

    #[test]
    fn test_receive_request_has_no_outgoing_leg() {
        let request = SuspensionRequest::receive::<i32>("late", 5);
        assert!(request.outgoing().is_none());
        assert_eq!(request.awaiting().unwrap().0.to_string(), "late.5");
    }

    #[test]
    fn test_send_request_does_not_wait() {
        let request =
            SuspensionRequest::send("ping", PeerAddress::new(2, "carol"), 1, &"hi".to_string())
                .unwrap();
        assert!(!request.expects_response());
        assert!(request.awaiting().is_none());
        assert_eq!(request.outgoing().unwrap().0.to_string(), "ping.1");
    }

    #[test]
    fn test_received_payload_checks_tag() {
        let envelope = Envelope::wrap(&"done".to_string()).unwrap();
        let received = Received::new("swap.2".to_string(), envelope, Uuid::new_v4());
        assert_eq!(received.type_tag(), "String");

        let err = received.payload::<i32>().unwrap_err();
        assert_eq!(err.error_code(), "PROTOCOL_MISMATCH");
    }

    #[test]
    fn test_validate_can_reject() {
        let envelope = Envelope::wrap(&-5i32).unwrap();
        let received = Received::new("swap.2".to_string(), envelope, Uuid::new_v4());
        let err = received
            .payload::<i32>()
            .unwrap()
            .validate(|n| {
                if n < 0 {
                    Err(FlowError::logic("negative amount"))
                } else {
                    Ok(n)
                }
            })
            .unwrap_err();
        assert_eq!(err, FlowError::logic("negative amount"));
    }

    #[tokio::test]
    async fn test_result_handle_resolves_once() {
        let mut adapter = FlowAdapter::new(FlowRunId::new(), Echo { seen: vec![] });
        let handle = adapter.result_handle();
        assert!(!handle.is_done());

        adapter.output = Some(vec!["a".to_string()]);
        adapter.complete();
        adapter.fail(FlowError::logic("too late"));

        assert_eq!(handle.result().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(handle.try_result(), Some(Ok(vec!["a".to_string()])));
    }

    #[tokio::test]
    async fn test_dropped_flow_reports_shutdown() {
        let adapter = FlowAdapter::new(FlowRunId::new(), Echo { seen: vec![] });
        let handle = adapter.result_handle();
        drop(adapter);
        assert_eq!(handle.result().await.unwrap_err(), FlowError::ShutDown);
    }

    #[test]
    fn test_factory_registry_restores_registered_flows() {
        let mut registry = FlowFactoryRegistry::new();
        registry.register::<Echo>();
        assert!(registry.contains("test.echo"));
        assert_eq!(registry.names(), vec!["test.echo"]);

        let state = serde_json::json!({ "seen": ["x"] });
        let flow = registry
            .restore("test.echo", FlowRunId::new(), state)
            .unwrap()
            .unwrap();
        assert_eq!(flow.flow_name(), "test.echo");
        assert_eq!(flow.logic_type(), TypeId::of::<Echo>());
        assert_eq!(flow.snapshot().unwrap(), serde_json::json!({ "seen": ["x"] }));

        assert!(registry.restore("missing", FlowRunId::new(), serde_json::Value::Null).is_none());
        assert!(
            registry
                .restore("test.echo", FlowRunId::new(), serde_json::json!(42))
                .unwrap()
                .is_err()
        );
    }
}
