//! Message envelopes exchanged with the peer.
//!
//! Every message is a JSON object carrying an `id` and exactly one of:
//! - `method` + `params` + `request_return`: a [`Call`]
//! - `result`: a [`Reply`] to an earlier call
//! - `error`: an [`ErrorReply`] to an earlier call
//!
//! When more than one of those keys is present, `result` wins over `method`,
//! which wins over `error`.

use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Version tag written into every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Named call arguments.
pub type Params = Map<String, Value>;

/// Opaque request identifier.
///
/// Ids generated locally are random hex strings; the peer numbers its own
/// requests, so integer ids are accepted and echoed back unchanged. A float
/// id with no fractional part is read as the integer it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Str(String),
    Num(i64),
    /// Integer ids above `i64::MAX`.
    Unsigned(u64),
}

impl RequestId {
    /// A fresh random 128-bit identifier rendered as hex.
    pub fn generate() -> Self {
        Self::Str(uuid::Uuid::new_v4().simple().to_string())
    }

    fn from_value(value: Option<&Value>) -> Result<Self, ProtocolError> {
        let number = match value {
            Some(Value::String(s)) if !s.is_empty() => return Ok(Self::Str(s.clone())),
            Some(Value::Number(n)) => n,
            None | Some(Value::Null) | Some(Value::String(_)) => {
                return Err(ProtocolError::MissingId)
            }
            Some(other) => return Err(ProtocolError::UnsupportedId(other.clone())),
        };

        if let Some(n) = number.as_i64() {
            return Ok(Self::Num(n));
        }
        if let Some(n) = number.as_u64() {
            return Ok(Self::Unsigned(n));
        }
        match number.as_f64() {
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(Self::Num(f as i64))
            }
            _ => Err(ProtocolError::UnsupportedId(Value::Number(number.clone()))),
        }
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestId::Str(s) => serializer.serialize_str(s),
            RequestId::Num(n) => serializer.serialize_i64(*n),
            RequestId::Unsigned(n) => serializer.serialize_u64(*n),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Str(s) => f.write_str(s),
            RequestId::Num(n) => write!(f, "{n}"),
            RequestId::Unsigned(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Num(value)
    }
}

/// Invocation of a named operation on the other side.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: RequestId,
    pub method: String,
    pub params: Params,
    /// Whether the sender expects a [`Reply`].
    pub request_return: bool,
}

/// Successful result of an earlier call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: RequestId,
    pub result: Value,
}

/// Failure reported by the peer for an earlier call.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub id: RequestId,
    pub error: Value,
}

/// Error payload of an [`ErrorReply`], kept as sent.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render_error(.0))]
pub struct RemoteError(pub Value);

impl RemoteError {
    pub fn message(&self) -> String {
        render_error(&self.0)
    }
}

fn render_error(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "unspecified error".to_string(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    Reply(Reply),
    Error(ErrorReply),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no usable id")]
    MissingId,
    #[error("message id {0} is not a string or an integer")]
    UnsupportedId(Value),
    #[error("message {id} has a non-string method")]
    InvalidMethod { id: RequestId },
    #[error("message {id} has params that are not an object")]
    InvalidParams { id: RequestId },
    #[error("message {id} is neither a call, a reply nor an error")]
    Unrecognized { id: RequestId },
}

impl Message {
    pub fn call(method: impl Into<String>, params: Params, request_return: bool) -> Self {
        Message::Call(Call {
            id: RequestId::generate(),
            method: method.into(),
            params,
            request_return,
        })
    }

    pub fn reply(id: RequestId, result: Value) -> Self {
        Message::Reply(Reply { id, result })
    }

    pub fn error(id: RequestId, error: impl Into<Value>) -> Self {
        Message::Error(ErrorReply {
            id,
            error: error.into(),
        })
    }

    pub fn id(&self) -> &RequestId {
        match self {
            Message::Call(call) => &call.id,
            Message::Reply(reply) => &reply.id,
            Message::Error(error) => &error.id,
        }
    }

    /// Classify a parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let id = RequestId::from_value(map.get("id"))?;

        if let Some(result) = map.remove("result") {
            return Ok(Message::Reply(Reply { id, result }));
        }

        if let Some(method) = map.remove("method") {
            let Value::String(method) = method else {
                return Err(ProtocolError::InvalidMethod { id });
            };
            let params = match map.remove("params") {
                None | Some(Value::Null) => Params::new(),
                Some(Value::Object(params)) => params,
                Some(_) => return Err(ProtocolError::InvalidParams { id }),
            };
            let request_return = matches!(map.get("request_return"), Some(Value::Bool(true)));
            return Ok(Message::Call(Call {
                id,
                method,
                params,
                request_return,
            }));
        }

        if let Some(error) = map.remove("error") {
            return Ok(Message::Error(ErrorReply { id, error }));
        }

        Err(ProtocolError::Unrecognized { id })
    }
}

#[derive(serde::Serialize)]
struct WireCall<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Params,
    request_return: bool,
    id: &'a RequestId,
}

#[derive(serde::Serialize)]
struct WireReply<'a> {
    jsonrpc: &'static str,
    result: &'a Value,
    request_return: bool,
    id: &'a RequestId,
}

#[derive(serde::Serialize)]
struct WireError<'a> {
    jsonrpc: &'static str,
    error: &'a Value,
    id: &'a RequestId,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Call(call) => WireCall {
                jsonrpc: JSONRPC_VERSION,
                method: &call.method,
                params: &call.params,
                request_return: call.request_return,
                id: &call.id,
            }
            .serialize(serializer),
            Message::Reply(reply) => WireReply {
                jsonrpc: JSONRPC_VERSION,
                result: &reply.result,
                request_return: false,
                id: &reply.id,
            }
            .serialize(serializer),
            Message::Error(error) => WireError {
                jsonrpc: JSONRPC_VERSION,
                error: &error.error,
                id: &error.id,
            }
            .serialize(serializer),
        }
    }
}

/// Build [`Params`] from `key => value` pairs.
///
/// ```
/// use harmony_bridge::params;
///
/// let params = params! { "start_frame" => 1, "stop_frame" => 48 };
/// assert_eq!(params["stop_frame"], 48);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::protocol::Params::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut params = $crate::protocol::Params::new();
        $(params.insert(::std::string::String::from($key), $crate::__private::json!($value));)+
        params
    }};
}
