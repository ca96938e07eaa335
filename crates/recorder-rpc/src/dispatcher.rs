//! RPC core: builds outbound requests and routes inbound envelopes.
//!
//! Outbound envelopes go onto an unbounded queue drained by the writer task, so
//! sending never awaits and write order equals call order. Inbound envelopes
//! are handled one at a time by the reader task:
//!
//! - responses settle the correlation table;
//! - `perform` against a target with no action invokes a host closure;
//! - every other request gets a 501, since the engine never creates objects
//!   inside the host.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::codec::{self, DecodeError};
use crate::bridge::protocol::{
    Envelope, PROTOCOL_VERSION, Procedure, Request, RequestId, Response, Status, TargetId,
    error_payload,
};
use crate::closures::{ClosureHandle, ClosureRegistry, InvokeError};
use crate::correlation::{CorrelationTable, PendingReply};
use crate::error::RpcError;
use crate::lifecycle::{Lifecycle, ReleaseGuard};

pub struct Dispatcher {
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: CorrelationTable,
    closures: Arc<ClosureRegistry>,
    lifecycle: Lifecycle,
    verbose: bool,
}

impl Dispatcher {
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        lifecycle: Lifecycle,
        verbose: bool,
    ) -> Self {
        Self {
            outbound,
            pending: CorrelationTable::new(),
            closures: ClosureRegistry::new(),
            lifecycle,
            verbose,
        }
    }

    pub fn pending(&self) -> &CorrelationTable {
        &self.pending
    }

    pub fn closures(&self) -> &Arc<ClosureRegistry> {
        &self.closures
    }

    fn send(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.outbound.send(envelope).map_err(|_| RpcError::Closed)
    }

    /// Register a correlation entry, then write the request.
    fn request(&self, build: impl FnOnce(RequestId) -> Request) -> Result<PendingReply, RpcError> {
        let id = CorrelationTable::generate_id();
        let reply = self.pending.register(id.clone())?;
        let request = build(id.clone());
        tracing::debug!(
            %id,
            procedure = request.procedure.as_str(),
            target = ?request.target,
            action = ?request.action,
            "Sending request"
        );
        if let Err(e) = self.send(request.into()) {
            self.pending.forget(&id);
            return Err(e);
        }
        Ok(reply)
    }

    /// Create a remote object of `type_name` under a fresh `<type>_<uuid>` target.
    pub async fn initialize_remote_object(
        &self,
        type_name: &str,
        params: Value,
    ) -> Result<ReleaseGuard, RpcError> {
        let target = TargetId::generate(type_name);
        self.initialize_with_target(target, type_name, params).await
    }

    /// Create a remote object under a caller-chosen target.
    ///
    /// The release guard is bound before `init` goes out, so an object whose
    /// init fails is still released once the guard drops.
    pub async fn initialize_with_target(
        &self,
        target: TargetId,
        type_name: &str,
        params: Value,
    ) -> Result<ReleaseGuard, RpcError> {
        let guard = self.lifecycle.bind(target.clone());
        let reply = self.request(|id| Request::init(id, target, type_name, params))?;
        reply.await?;
        Ok(guard)
    }

    pub async fn perform_on_target(
        &self,
        target: &TargetId,
        action: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, RpcError> {
        self.request(|id| Request::perform(id, target.clone(), action, params))?
            .await
    }

    /// Static call on a type (discovery, permissions, logging config).
    pub async fn perform_static(
        &self,
        type_name: &str,
        action: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, RpcError> {
        self.request(|id| Request::perform_static(id, type_name, action, params))?
            .await
    }

    /// Send `release` now. Used by the release task for dropped owners.
    pub fn release(&self, target: &TargetId) -> Result<PendingReply, RpcError> {
        self.request(|id| Request::release(id, target.clone()))
    }

    /// Send `manual-release` now.
    ///
    /// The request is on the wire when this returns; awaiting the reply only
    /// observes the acknowledgement.
    pub fn manual_release(&self, target: &TargetId) -> Result<PendingReply, RpcError> {
        self.request(|id| Request::manual_release(id, target.clone()))
    }

    pub fn register_closure<F>(&self, prefix: &str, handler: F) -> ClosureHandle
    where
        F: Fn(Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.closures.register(prefix, handler)
    }

    /// Decode and dispatch one raw line.
    pub fn on_line(&self, line: &str) {
        self.dispatch_decoded(codec::decode(line.as_bytes()));
    }

    /// Dispatch one codec item.
    ///
    /// Decode failures are logged and dropped, except an unreadable response
    /// that still names its request: that entry is rejected.
    pub fn dispatch_decoded(&self, decoded: Result<Envelope, DecodeError>) {
        match decoded {
            Ok(envelope) => self.dispatch(envelope),
            Err(DecodeError::Response { id, source }) => {
                tracing::warn!(%id, error = %source, "Unreadable response from engine");
                self.pending.reject(
                    &id,
                    RpcError::Protocol(format!("unreadable response: {}", source)),
                );
            }
            Err(e) => {
                if self.verbose {
                    tracing::warn!(error = %e, "Dropping malformed line from engine");
                } else {
                    tracing::debug!(error = %e, "Dropping malformed line from engine");
                }
            }
        }
    }

    pub fn dispatch(&self, envelope: Envelope) {
        if envelope.version() != PROTOCOL_VERSION {
            tracing::debug!(version = envelope.version(), "Envelope with foreign protocol version");
        }

        match envelope {
            Envelope::Response(response) => {
                tracing::debug!(id = %response.id, status = response.status.0, "Response received");
                self.pending.settle(response);
            }
            Envelope::Request(request) => {
                if let Some(response) = self.answer(request)
                    && let Err(e) = self.send(response.into())
                {
                    tracing::warn!(error = %e, "Could not send response to engine");
                }
            }
        }
    }

    /// Handle an inbound request. `None` when the request carried no id.
    pub fn answer(&self, request: Request) -> Option<Response> {
        let outcome = if request.is_closure_invocation()
            && let Some(target) = &request.target
        {
            self.invoke_closure(target, request.params)
        } else {
            Err(Self::refuse(&request))
        };

        let id = request.id?;
        Some(match outcome {
            Ok(result) => Response::ok(id, result),
            Err((status, payload)) => Response::error(id, status, payload),
        })
    }

    /// Status and payload for anything other than a closure invocation.
    fn refuse(request: &Request) -> (Status, Value) {
        match (request.procedure, &request.target, &request.action) {
            (Procedure::Perform, None, None) => (
                Status::BAD_REQUEST,
                error_payload("perform requires a target or an action", None),
            ),
            (Procedure::Perform, target, Some(action)) => {
                let addressed = target
                    .as_ref()
                    .map(|t| t.to_string())
                    .or_else(|| request.type_name.clone())
                    .unwrap_or_default();
                tracing::warn!(%addressed, %action, "Engine requested a host method call");
                (
                    Status::NOT_IMPLEMENTED,
                    error_payload(format!("perform with action '{}' is not implemented", action), None),
                )
            }
            (procedure, target, _) => {
                tracing::warn!(
                    procedure = procedure.as_str(),
                    target = ?target,
                    "Engine sent unsupported procedure"
                );
                (
                    Status::NOT_IMPLEMENTED,
                    error_payload(format!("procedure '{}' is not implemented", procedure.as_str()), None),
                )
            }
        }
    }

    fn invoke_closure(
        &self,
        target: &TargetId,
        params: Option<Value>,
    ) -> Result<Option<Value>, (Status, Value)> {
        match self.closures.invoke(target, params.unwrap_or(Value::Null)) {
            Ok(result) => Ok(result),
            Err(InvokeError::NotFound(target)) => {
                tracing::warn!(%target, "Closure invocation for unknown target");
                Err((
                    Status::NOT_FOUND,
                    error_payload(format!("target not found: {}", target), None),
                ))
            }
            Err(InvokeError::Failed {
                target,
                message,
                cause,
            }) => {
                tracing::warn!(%target, %message, "Closure failed");
                Err((Status::HANDLER_FAILED, error_payload(message, cause)))
            }
        }
    }

    /// The engine's output ended: fail everything in flight and refuse new requests.
    pub fn connection_lost(&self) {
        let failed = self.pending.close();
        if failed > 0 {
            tracing::warn!(failed, "Engine connection lost with requests in flight");
        } else {
            tracing::debug!("Engine connection lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn harness() -> (
        Dispatcher,
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::UnboundedReceiver<TargetId>,
    ) {
        let (tx, outbound) = mpsc::unbounded_channel();
        let (lifecycle, releases) = Lifecycle::new();
        (Dispatcher::new(tx, lifecycle, false), outbound, releases)
    }

    fn next_request(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Request {
        match rx.try_recv().expect("expected an outbound envelope") {
            Envelope::Request(r) => r,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn next_response(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Response {
        match rx.try_recv().expect("expected an outbound envelope") {
            Envelope::Response(r) => r,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn perform_resolves_with_result() {
        let (dispatcher, mut outbound, _releases) = harness();
        let target = TargetId::from("Recorder_abc");

        let call = dispatcher.perform_on_target(&target, "prepare", None);
        let respond = async {
            tokio::task::yield_now().await;
            let req = next_request(&mut outbound);
            assert_eq!(req.procedure, Procedure::Perform);
            assert_eq!(req.action.as_deref(), Some("prepare"));
            dispatcher
                .dispatch(Response::ok(req.id.unwrap(), Some(json!({"ready": true}))).into());
        };

        let (result, ()) = tokio::join!(call, respond);
        assert_eq!(result.unwrap(), Some(json!({"ready": true})));
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test]
    async fn perform_rejects_with_remote_payload() {
        let (dispatcher, mut outbound, _releases) = harness();
        let target = TargetId::from("Recorder_abc");

        let call = dispatcher.perform_on_target(&target, "start", None);
        let respond = async {
            tokio::task::yield_now().await;
            let req = next_request(&mut outbound);
            dispatcher.on_line(&format!(
                r#"{{"version":"v1","id":"{}","status":500,"error":{{"message":"busy"}}}}"#,
                req.id.unwrap()
            ));
        };

        let (result, ()) = tokio::join!(call, respond);
        let err = result.unwrap_err();
        assert_eq!(err.payload(), Some(&json!({"message": "busy"})));
    }

    #[tokio::test]
    async fn failed_init_still_schedules_release() {
        let (dispatcher, mut outbound, mut releases) = harness();

        let call = dispatcher.initialize_with_target(
            TargetId::from("Recorder_x"),
            "Recorder",
            json!({}),
        );
        let respond = async {
            tokio::task::yield_now().await;
            let req = next_request(&mut outbound);
            assert_eq!(req.procedure, Procedure::Init);
            dispatcher.dispatch(
                Response::error(req.id.unwrap(), Status::BAD_REQUEST, json!({"message": "bad schema"}))
                    .into(),
            );
        };

        let (result, ()) = tokio::join!(call, respond);
        assert!(result.is_err());
        assert_eq!(releases.try_recv().unwrap(), TargetId::from("Recorder_x"));
    }

    #[test]
    fn closure_invocation_round_trip() {
        let (dispatcher, mut outbound, _releases) = harness();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let handle = dispatcher.register_closure("Segment", move |params| {
            *seen_clone.lock().unwrap() = Some(params);
            Ok(None)
        });

        dispatcher.dispatch(
            Request::invoke(
                Some(RequestId::from("e1")),
                handle.target().clone(),
                Some(json!({"path": "/tmp/seg-0001.mp4", "index": 1})),
            )
            .into(),
        );

        let resp = next_response(&mut outbound);
        assert_eq!(resp.id, RequestId::from("e1"));
        assert_eq!(resp.status, Status::OK);
        assert_eq!(resp.result, None);
        assert_eq!(
            *seen.lock().unwrap(),
            Some(json!({"path": "/tmp/seg-0001.mp4", "index": 1}))
        );
    }

    #[test]
    fn closure_result_is_returned() {
        let (dispatcher, mut outbound, _releases) = harness();
        let handle = dispatcher.register_closure("Echo", |p| Ok(Some(p)));

        dispatcher.dispatch(
            Request::invoke(Some(RequestId::from("e2")), handle.target().clone(), Some(json!(42)))
                .into(),
        );

        let resp = next_response(&mut outbound);
        assert_eq!(resp.result, Some(json!(42)));
    }

    #[test]
    fn failing_closure_yields_handler_failed() {
        let (dispatcher, mut outbound, _releases) = harness();
        let handle = dispatcher
            .register_closure("Stream", |_| Err(anyhow::anyhow!("buffer rejected")));

        dispatcher.dispatch(
            Request::invoke(Some(RequestId::from("e3")), handle.target().clone(), None).into(),
        );

        let resp = next_response(&mut outbound);
        assert_eq!(resp.status, Status::HANDLER_FAILED);
        assert_eq!(resp.error.unwrap()["message"], "buffer rejected");
    }

    #[test]
    fn unknown_target_yields_not_found() {
        let (dispatcher, mut outbound, _releases) = harness();
        dispatcher.on_line(
            r#"{"version":"v1","id":"e4","procedure":"perform","target":"Segment_gone","params":{}}"#,
        );

        let resp = next_response(&mut outbound);
        assert_eq!(resp.status, Status::NOT_FOUND);
        insta::assert_json_snapshot!(resp, @r#"
        {
          "version": "v1",
          "id": "e4",
          "status": 404,
          "error": {
            "message": "target not found: Segment_gone"
          }
        }
        "#);
    }

    #[test]
    fn engine_side_object_calls_are_not_implemented() {
        let (dispatcher, mut outbound, _releases) = harness();
        let lines = [
            r#"{"version":"v1","id":"n1","procedure":"init","target":"X_1","type":"Recorder","params":{}}"#,
            r#"{"version":"v1","id":"n2","procedure":"perform","target":"X_1","action":"start"}"#,
            r#"{"version":"v1","id":"n3","procedure":"perform","type":"Host","action":"query"}"#,
            r#"{"version":"v1","id":"n4","procedure":"release","target":"X_1"}"#,
            r#"{"version":"v1","id":"n5","procedure":"manual-release","target":"X_1"}"#,
            r#"{"version":"v1","id":"n6","procedure":"teleport"}"#,
        ];
        for line in lines {
            dispatcher.on_line(line);
        }
        for expected in ["n1", "n2", "n3", "n4", "n5", "n6"] {
            let resp = next_response(&mut outbound);
            assert_eq!(resp.id, RequestId::from(expected));
            assert_eq!(resp.status, Status::NOT_IMPLEMENTED);
        }
    }

    #[test]
    fn perform_without_target_or_action_is_bad_request() {
        let (dispatcher, mut outbound, _releases) = harness();
        dispatcher
            .on_line(r#"{"version":"v1","id":"b1","procedure":"perform","params":{}}"#);
        assert_eq!(next_response(&mut outbound).status, Status::BAD_REQUEST);
    }

    #[test]
    fn fire_and_forget_invocation_sends_nothing() {
        let (dispatcher, mut outbound, _releases) = harness();
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = Arc::clone(&calls);
        let handle = dispatcher.register_closure("Audio", move |_| {
            *calls_clone.lock().unwrap() += 1;
            Ok(Some(json!("ignored")))
        });

        dispatcher
            .dispatch(Request::invoke(None, handle.target().clone(), Some(json!({}))).into());

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn initialize_remote_object_binds_generated_target() {
        let (dispatcher, mut outbound, mut releases) = harness();

        let call = dispatcher.initialize_remote_object("Recorder", json!({"schema": {}}));
        let respond = async {
            tokio::task::yield_now().await;
            let req = next_request(&mut outbound);
            dispatcher.dispatch(Response::ok(req.id.clone().unwrap(), None).into());
            req
        };

        let (guard, req) = tokio::join!(call, respond);
        let guard = guard.unwrap();
        assert_eq!(req.procedure, Procedure::Init);
        assert_eq!(req.type_name.as_deref(), Some("Recorder"));
        assert_eq!(req.params, Some(json!({"schema": {}})));

        let target = req.target.unwrap();
        assert!(target.as_str().starts_with("Recorder_"));
        assert!(target.as_str().len() > "Recorder_".len());
        assert_eq!(guard.target(), &target);
        assert!(guard.is_armed());

        drop(guard);
        assert_eq!(releases.try_recv().unwrap(), target);
    }

    #[tokio::test]
    async fn out_of_range_status_still_settles() {
        let (dispatcher, mut outbound, _releases) = harness();
        let reply = dispatcher.manual_release(&TargetId::from("Recorder_s")).unwrap();
        let req = next_request(&mut outbound);

        dispatcher.on_line(&format!(
            r#"{{"id":"{}","status":-1,"error":{{"message":"boom"}}}}"#,
            req.id.unwrap()
        ));

        assert!(dispatcher.pending().is_empty());
        let err = reply.await.unwrap_err();
        assert_eq!(err.status(), Some(Status(-1)));
        assert_eq!(err.payload(), Some(&json!({"message": "boom"})));
    }

    #[tokio::test]
    async fn unreadable_response_rejects_its_request() {
        let (dispatcher, mut outbound, _releases) = harness();
        let reply = dispatcher.manual_release(&TargetId::from("Recorder_u")).unwrap();
        let req = next_request(&mut outbound);

        dispatcher.on_line(&format!(
            r#"{{"id":"{}","status":200,"version":["v1"]}}"#,
            req.id.unwrap()
        ));

        assert!(dispatcher.pending().is_empty());
        assert!(matches!(reply.await, Err(RpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn malformed_line_changes_nothing() {
        let (dispatcher, mut outbound, _releases) = harness();
        let reply = dispatcher.manual_release(&TargetId::from("Recorder_m")).unwrap();
        let req = next_request(&mut outbound);

        dispatcher.on_line("this is not json");
        dispatcher.on_line(r#"{"status": "#);
        assert_eq!(dispatcher.pending().len(), 1);
        assert!(outbound.try_recv().is_err());

        dispatcher
            .dispatch(Response::ok(req.id.unwrap(), None).into());
        assert_eq!(reply.await.unwrap(), None);
    }

    #[tokio::test]
    async fn manual_then_automatic_release_keeps_state_consistent() {
        let (dispatcher, mut outbound, _releases) = harness();
        let target = TargetId::from("Recorder_r");
        let _abort = dispatcher.register_closure("Abort", |_| Ok(None));

        let manual = dispatcher.manual_release(&target).unwrap();
        let automatic = dispatcher.release(&target).unwrap();
        assert_eq!(dispatcher.pending().len(), 2);

        let first = next_request(&mut outbound);
        let second = next_request(&mut outbound);
        assert_eq!(first.procedure, Procedure::ManualRelease);
        assert_eq!(second.procedure, Procedure::Release);
        assert_ne!(first.id, second.id);

        dispatcher.dispatch(Response::ok(second.id.unwrap(), None).into());
        dispatcher.dispatch(
            Response::error(first.id.unwrap(), Status::NOT_FOUND, json!({"message": "gone"})).into(),
        );

        assert!(automatic.await.is_ok());
        assert!(manual.await.is_err());
        assert!(dispatcher.pending().is_empty());
        assert_eq!(dispatcher.closures().len(), 1);
    }

    #[tokio::test]
    async fn connection_lost_fails_in_flight_requests() {
        let (dispatcher, _outbound, _releases) = harness();
        let reply = dispatcher.manual_release(&TargetId::from("Recorder_z")).unwrap();

        dispatcher.connection_lost();
        assert!(matches!(reply.await, Err(RpcError::EngineExited)));
        assert!(matches!(
            dispatcher.perform_static("Devices", "list", None).await,
            Err(RpcError::EngineExited)
        ));
    }

    #[tokio::test]
    async fn closed_outbound_fails_fast_without_leaking_entries() {
        let (dispatcher, outbound, _releases) = harness();
        drop(outbound);

        let result = dispatcher.perform_static("Devices", "list", None).await;
        assert!(matches!(result, Err(RpcError::Closed)));
        assert!(dispatcher.pending().is_empty());
    }
}
