//! The wire shapes and dispatch table for the `/rpc` entrypoint. Kept
//! separate from the router so the method table can be unit-tested without
//! spinning up axum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::UpdateError;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(err: RpcError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

fn field<'a>(params: &'a Value, name: &str) -> Result<&'a str, RpcError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Update(UpdateError::Caller(format!("missing or non-string field '{name}'"))))
}

fn parse_handler_id(raw: &str) -> Result<u64, RpcError> {
    raw.parse::<u64>()
        .map_err(|_| RpcError::Update(UpdateError::Caller(format!("malformed handlerId '{raw}'"))))
}

/// Routes one request to the matching [`Dispatcher`] method, converting the
/// loosely-typed JSON params into the dispatcher's native argument types and
/// its `Outcome` back into a bare JSON value.
pub async fn dispatch(dispatcher: &Dispatcher, request: RpcRequest) -> Result<Value, RpcError> {
    match request.method.as_str() {
        "RegisterProcess" => {
            let process_name = field(&request.params, "processName")?;
            let lib_version = field(&request.params, "libVersion")?;
            let caller_unique_name = request.params.get("callerId").and_then(Value::as_str).unwrap_or(process_name);
            let handler_id = dispatcher
                .register_process(process_name, lib_version, caller_unique_name)
                .map_err(|e| RpcError::Update(UpdateError::Caller(e.to_string())))?;
            Ok(serde_json::json!({ "handlerId": handler_id }))
        }
        "UnregisterProcess" => {
            let handler_id = parse_handler_id(field(&request.params, "handlerId")?)?;
            let success = dispatcher.unregister_process(handler_id);
            Ok(serde_json::json!({ "success": success }))
        }
        "CheckForUpdate" => {
            let handler_id = parse_handler_id(field(&request.params, "handlerId")?)?;
            dispatcher.check_for_update(handler_id).await.map_err(RpcError::from)
        }
        "DownloadFirmware" => {
            let handler_id = parse_handler_id(field(&request.params, "handlerId")?)?;
            let image_name = field(&request.params, "imageName")?;
            dispatcher.download_firmware(handler_id, image_name).await.map_err(RpcError::from)
        }
        "UpdateFirmware" => {
            let handler_id = parse_handler_id(field(&request.params, "handlerId")?)?;
            let curr_fw_version = request.params.get("currFWVersion").and_then(Value::as_str).unwrap_or("");
            let available_version = field(&request.params, "availableVersion")?;
            dispatcher
                .update_firmware(handler_id, curr_fw_version, available_version)
                .await
                .map_err(RpcError::from)
        }
        other => Err(RpcError::UnknownMethod(other.to_string())),
    }
}
