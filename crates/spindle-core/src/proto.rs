//! RPC message types and the pluggable serializer.
//!
//! A [`Message`] is what travels inside one wire frame: either a
//! [`Request`] naming a `"handler.method"` target with positional
//! arguments, or a [`Response`] carrying a result or a [`Fault`].
//! Serialization is pluggable per client/server via [`Serializer`];
//! the default is JSON, which keeps the value space self-describing.

use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, ErrorKind, RemoteFault, RpcError};
use crate::wire::WireError;

/// The RPC value type: any self-describing JSON value.
pub type Value = serde_json::Value;

/// One logical message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// A remote call: `"handlerName.methodName"` plus positional arguments and
/// an optional bearer token checked by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Vec<Value>, token: Option<String>) -> Self {
        Self {
            method: method.into(),
            args,
            token,
        }
    }

    /// Split `"handler.method"` into its two halves.
    pub fn target(&self) -> Option<(&str, &str)> {
        self.method.split_once('.')
    }
}

/// The reply to a request: exactly one of `result` or `fault` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    /// Set when the response was produced by an async handler's completion
    /// callback rather than the dispatch path.
    #[serde(default)]
    pub asynchronous: bool,
}

impl Response {
    pub fn success(result: Value, asynchronous: bool) -> Self {
        Self {
            result: Some(result),
            fault: None,
            asynchronous,
        }
    }

    pub fn failure(error: &RpcError, asynchronous: bool) -> Self {
        Self {
            result: None,
            fault: Some(Fault::from_error(error)),
            asynchronous,
        }
    }

    /// Resolve into the caller-visible result, reconstructing the typed
    /// error when the response carries a fault.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.fault {
            Some(fault) => Err(fault.into_error()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Wire form of an [`RpcError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Taxonomy kind name, per [`ErrorKind::as_str`].
    pub kind: String,
    /// Remote error type name (`RemoteException` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Compact payload: the offending name for dispatch faults, the error
    /// message otherwise.
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

impl Fault {
    pub fn from_error(error: &RpcError) -> Self {
        let kind = error.kind().as_str().to_string();
        match error {
            RpcError::Remote(fault) => Self {
                kind,
                class: Some(fault.class.clone()),
                message: fault.message.clone(),
                backtrace: fault.backtrace.clone(),
            },
            RpcError::InvalidObject(name)
            | RpcError::UnsafeMethod(name)
            | RpcError::InvalidMethod(name) => Self {
                kind,
                class: None,
                message: name.clone(),
                backtrace: Vec::new(),
            },
            RpcError::InvalidToken => Self {
                kind,
                class: None,
                message: String::new(),
                backtrace: Vec::new(),
            },
            RpcError::Connection(e) => Self {
                kind,
                class: None,
                message: e.to_string(),
                backtrace: Vec::new(),
            },
        }
    }

    pub fn into_error(self) -> RpcError {
        match ErrorKind::from_wire(&self.kind) {
            Some(ErrorKind::Remote) | None => RpcError::Remote(RemoteFault {
                // Unknown kinds are treated as remote exceptions of that
                // class so new peers stay debuggable against old clients.
                class: self.class.unwrap_or(self.kind),
                message: self.message,
                backtrace: self.backtrace,
            }),
            Some(ErrorKind::InvalidObject) => RpcError::InvalidObject(self.message),
            Some(ErrorKind::UnsafeMethod) => RpcError::UnsafeMethod(self.message),
            Some(ErrorKind::InvalidMethod) => RpcError::InvalidMethod(self.message),
            Some(ErrorKind::InvalidToken) => RpcError::InvalidToken,
            Some(ErrorKind::Connection) => {
                RpcError::Connection(ConnectionError::Closed(self.message))
            }
            Some(ErrorKind::SslPeerVerification) => {
                RpcError::Connection(ConnectionError::PeerVerification(self.message))
            }
        }
    }
}

/// Pluggable message (de)serialization.
pub trait Serializer: Send + Sync + 'static {
    fn dump(&self, message: &Message) -> Result<Vec<u8>, WireError>;
    fn load(&self, bytes: &[u8]) -> Result<Message, WireError>;
}

/// Default serializer: self-describing JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dump(&self, message: &Message) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(message).map_err(|e| WireError::Encode(e.to_string()))
    }

    fn load(&self, bytes: &[u8]) -> Result<Message, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_through_json() {
        let serializer = JsonSerializer;
        let request = Message::Request(Request::new(
            "echo.reply",
            vec![json!(42), json!("x")],
            Some("secret".into()),
        ));
        let bytes = serializer.dump(&request).unwrap();
        assert_eq!(serializer.load(&bytes).unwrap(), request);
    }

    #[test]
    fn target_splits_on_first_dot() {
        let request = Request::new("echo.reply", vec![], None);
        assert_eq!(request.target(), Some(("echo", "reply")));
        let bad = Request::new("noseparator", vec![], None);
        assert_eq!(bad.target(), None);
    }

    #[test]
    fn fault_reconstructs_typed_errors() {
        let cases = [
            RpcError::InvalidObject("ghost".into()),
            RpcError::UnsafeMethod("exec".into()),
            RpcError::InvalidMethod("nope".into()),
            RpcError::InvalidToken,
            RpcError::Remote(RemoteFault {
                class: "ArgumentError".into(),
                message: "bad input".into(),
                backtrace: vec!["frame 0".into()],
            }),
        ];
        for original in cases {
            let kind = original.kind();
            let rebuilt = Fault::from_error(&original).into_error();
            assert_eq!(rebuilt.kind(), kind);
        }
    }

    #[test]
    fn unknown_fault_kind_degrades_to_remote() {
        let fault = Fault {
            kind: "SomethingNew".into(),
            class: None,
            message: "surprise".into(),
            backtrace: Vec::new(),
        };
        match fault.into_error() {
            RpcError::Remote(f) => {
                assert_eq!(f.class, "SomethingNew");
                assert_eq!(f.message, "surprise");
            }
            other => panic!("expected remote fault, got {other:?}"),
        }
    }

    #[test]
    fn response_with_fault_resolves_to_error() {
        let response = Response::failure(&RpcError::InvalidToken, false);
        assert!(matches!(
            response.into_result(),
            Err(RpcError::InvalidToken)
        ));

        let response = Response::success(json!([1, 2]), true);
        assert_eq!(response.into_result().unwrap(), json!([1, 2]));
    }
}
