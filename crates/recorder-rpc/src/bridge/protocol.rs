//! Wire protocol types for host-engine communication.
//!
//! Every line on the wire is one envelope: a request (`procedure` present) or a
//! response (`status` present). Both directions share the same shapes; the host
//! only ever answers `perform` requests addressed to its own closures.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version tag carried by every envelope the host writes.
pub const PROTOCOL_VERSION: &str = "v1";

/// Correlates a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh id of the form `req_<uuid>`.
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names an engine-side object or a host-side closure.
///
/// Both kinds share one string space; which side holds the handler decides
/// who answers a `perform` against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Fresh id of the form `<prefix>_<uuid>`, e.g. `Recorder_6f1c...`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response status. `200` is success; anything else is an error category.
///
/// Decoding never fails on the status field: a value that is not an integer
/// becomes [`Status::UNRECOGNIZED`], so the response still settles its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Status(pub i64);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const INTERNAL: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);
    /// A host closure returned an error or panicked.
    pub const HANDLER_FAILED: Status = Status(520);
    /// Stand-in for a status the engine sent as something other than an integer.
    pub const UNRECOGNIZED: Status = Status(0);

    pub fn is_success(self) -> bool {
        self == Self::OK
    }

    pub fn from_wire(raw: &Value) -> Self {
        match raw {
            Value::Number(n) => n.as_i64().map(Status).unwrap_or(Self::UNRECOGNIZED),
            Value::String(s) => s.trim().parse().map(Status).unwrap_or(Self::UNRECOGNIZED),
            _ => Self::UNRECOGNIZED,
        }
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Procedure {
    /// Create a remote object bound to a target.
    Init,
    /// Invoke an instance action, a static action, or a closure.
    Perform,
    /// Lifecycle-driven teardown of a target.
    Release,
    /// Caller-driven teardown of a target.
    ManualRelease,
    /// Anything else the peer sends. Answered with 501.
    #[serde(other)]
    Unknown,
}

impl Procedure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Perform => "perform",
            Self::Release => "release",
            Self::ManualRelease => "manual-release",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub version: String,
    /// Absent for fire-and-forget invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub procedure: Procedure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    fn new(id: Option<RequestId>, procedure: Procedure) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id,
            procedure,
            target: None,
            type_name: None,
            action: None,
            params: None,
        }
    }

    pub fn init(id: RequestId, target: TargetId, type_name: &str, params: Value) -> Self {
        Self {
            target: Some(target),
            type_name: Some(type_name.to_string()),
            params: Some(params),
            ..Self::new(Some(id), Procedure::Init)
        }
    }

    pub fn perform(id: RequestId, target: TargetId, action: &str, params: Option<Value>) -> Self {
        Self {
            target: Some(target),
            action: Some(action.to_string()),
            params,
            ..Self::new(Some(id), Procedure::Perform)
        }
    }

    pub fn perform_static(
        id: RequestId,
        type_name: &str,
        action: &str,
        params: Option<Value>,
    ) -> Self {
        Self {
            type_name: Some(type_name.to_string()),
            action: Some(action.to_string()),
            params,
            ..Self::new(Some(id), Procedure::Perform)
        }
    }

    /// Closure invocation: a `perform` against a target with no action.
    pub fn invoke(id: Option<RequestId>, target: TargetId, params: Option<Value>) -> Self {
        Self {
            target: Some(target),
            params,
            ..Self::new(id, Procedure::Perform)
        }
    }

    pub fn release(id: RequestId, target: TargetId) -> Self {
        Self {
            target: Some(target),
            ..Self::new(Some(id), Procedure::Release)
        }
    }

    pub fn manual_release(id: RequestId, target: TargetId) -> Self {
        Self {
            target: Some(target),
            ..Self::new(Some(id), Procedure::ManualRelease)
        }
    }

    /// True when this request addresses a closure rather than an object method.
    pub fn is_closure_invocation(&self) -> bool {
        self.procedure == Procedure::Perform && self.target.is_some() && self.action.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub version: String,
    pub id: RequestId,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    pub fn ok(id: RequestId, result: Option<Value>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id,
            status: Status::OK,
            result,
            error: None,
        }
    }

    pub fn error(id: RequestId, status: Status, error: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id,
            status,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl Envelope {
    pub fn version(&self) -> &str {
        match self {
            Self::Request(r) => &r.version,
            Self::Response(r) => &r.version,
        }
    }
}

impl From<Request> for Envelope {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

/// Error body the host attaches to failure responses it produces.
pub fn error_payload(message: impl Into<String>, cause: Option<String>) -> Value {
    let mut payload = serde_json::json!({ "message": message.into() });
    if let Some(cause) = cause {
        payload["cause"] = Value::String(cause);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_decodes_any_value() {
        let decode = |raw: Value| serde_json::from_value::<Status>(raw).unwrap();
        assert_eq!(decode(json!(200)), Status::OK);
        assert_eq!(decode(json!(-1)), Status(-1));
        assert_eq!(decode(json!(70000)), Status(70000));
        assert_eq!(decode(json!("500")), Status::INTERNAL);
        assert_eq!(decode(json!("busy")), Status::UNRECOGNIZED);
        assert_eq!(decode(json!(2.5)), Status::UNRECOGNIZED);
        assert_eq!(decode(json!(null)), Status::UNRECOGNIZED);
        assert!(!decode(json!(u64::MAX)).is_success());
    }

    #[test]
    fn init_request_serializes() {
        let req = Request::init(
            RequestId::from("req_1"),
            TargetId::from("Recorder_abc"),
            "Recorder",
            json!({"schema": {"items": []}}),
        );
        insta::assert_json_snapshot!(req, @r#"
        {
          "version": "v1",
          "id": "req_1",
          "procedure": "init",
          "target": "Recorder_abc",
          "type": "Recorder",
          "params": {
            "schema": {
              "items": []
            }
          }
        }
        "#);
    }

    #[test]
    fn static_perform_omits_target() {
        let req = Request::perform_static(RequestId::from("req_7"), "Devices", "list", None);
        insta::assert_json_snapshot!(req, @r#"
        {
          "version": "v1",
          "id": "req_7",
          "procedure": "perform",
          "type": "Devices",
          "action": "list"
        }
        "#);
    }

    #[test]
    fn manual_release_uses_kebab_case() {
        let req = Request::manual_release(RequestId::from("req_2"), TargetId::from("Recorder_abc"));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["procedure"], "manual-release");
        assert_eq!(value["target"], "Recorder_abc");
        assert!(value.get("params").is_none());
    }

    #[test]
    fn error_response_serializes() {
        let resp = Response::error(
            RequestId::from("req_3"),
            Status::NOT_FOUND,
            error_payload("target not found: Closure_x", None),
        );
        insta::assert_json_snapshot!(resp, @r#"
        {
          "version": "v1",
          "id": "req_3",
          "status": 404,
          "error": {
            "message": "target not found: Closure_x"
          }
        }
        "#);
    }

    #[test]
    fn unknown_procedure_deserializes() {
        let req: Request =
            serde_json::from_value(json!({"version": "v1", "id": "x", "procedure": "explode"}))
                .unwrap();
        assert_eq!(req.procedure, Procedure::Unknown);
    }

    #[test]
    fn closure_invocation_shape() {
        let call = Request::invoke(None, TargetId::from("Segment_1"), Some(json!({"n": 1})));
        assert!(call.is_closure_invocation());

        let method = Request::perform(RequestId::from("r"), TargetId::from("Recorder_1"), "start", None);
        assert!(!method.is_closure_invocation());

        let stat = Request::perform_static(RequestId::from("r"), "Devices", "list", None);
        assert!(!stat.is_closure_invocation());
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = TargetId::generate("Recorder");
        let b = TargetId::generate("Recorder");
        assert!(a.as_str().starts_with("Recorder_"));
        assert_ne!(a, b);

        let r = RequestId::generate();
        assert!(r.as_str().starts_with("req_"));
        assert_ne!(r, RequestId::generate());
    }
}
