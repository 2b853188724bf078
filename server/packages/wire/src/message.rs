use acp_bridge_error::{ProtocolError, RpcErrorObject};
use serde_json::{json, Value};

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        outcome: Result<Value, RpcErrorObject>,
    },
}

impl Message {
    /// Classifies a parsed JSON value. On failure the frame's id (when it had
    /// one) is returned alongside the error so the caller can answer it.
    pub fn from_value(payload: Value) -> Result<Self, (Option<Value>, ProtocolError)> {
        let id = payload.get("id").cloned();
        if let Err(err) = validate_envelope(&payload) {
            return Err((id, err));
        }
        let Value::Object(mut object) = payload else {
            return Err((id, invalid("JSON-RPC payload must be an object")));
        };

        let params = object.remove("params").unwrap_or(Value::Null);
        match (object.remove("method"), object.remove("id")) {
            (Some(Value::String(method)), Some(id)) => Ok(Self::Request { id, method, params }),
            (Some(Value::String(method)), None) => Ok(Self::Notification { method, params }),
            (Some(_), id) => Err((id, invalid("method must be a string"))),
            (None, Some(id)) => {
                if let Some(error) = object.remove("error") {
                    match serde_json::from_value::<RpcErrorObject>(error) {
                        Ok(error) => Ok(Self::Response {
                            id,
                            outcome: Err(error),
                        }),
                        Err(err) => {
                            Err((Some(id), invalid(&format!("malformed error object: {err}"))))
                        }
                    }
                } else {
                    let result = object.remove("result").unwrap_or(Value::Null);
                    Ok(Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                }
            }
            (None, None) => Err((
                None,
                invalid("JSON-RPC payload must include either method or id"),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Self::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            Self::Response {
                id,
                outcome: Ok(result),
            } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Self::Response {
                id,
                outcome: Err(error),
            } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

fn invalid(message: &str) -> ProtocolError {
    ProtocolError::InvalidRequest {
        message: message.to_string(),
    }
}

pub fn validate_envelope(payload: &Value) -> Result<(), ProtocolError> {
    let object = payload
        .as_object()
        .ok_or_else(|| invalid("JSON-RPC payload must be an object"))?;

    let Some(jsonrpc) = object.get("jsonrpc").and_then(Value::as_str) else {
        return Err(invalid("JSON-RPC payload must include jsonrpc field"));
    };

    if jsonrpc != "2.0" {
        return Err(invalid("jsonrpc must be '2.0'"));
    }

    let has_method = object.get("method").is_some();
    let has_id = object.get("id").is_some();
    let has_result_or_error = object.get("result").is_some() || object.get("error").is_some();

    if !has_method && !has_id {
        return Err(invalid("JSON-RPC payload must include either method or id"));
    }

    if has_method && has_result_or_error {
        return Err(invalid(
            "JSON-RPC request/notification must not include result or error",
        ));
    }

    Ok(())
}

/// Stable map key for a JSON-RPC id (`1` and `"1"` stay distinct).
pub fn id_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
