use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::b64;

/// Method names carried in request frame headers.
pub mod method {
    pub const CONTAINER_HEARTBEAT: &str = "container.heartbeat";
    pub const FUNCTION_GET_INPUTS: &str = "function.get_inputs";
    pub const FUNCTION_GET_SERIALIZED: &str = "function.get_serialized";
    pub const FUNCTION_PUT_OUTPUTS: &str = "function.put_outputs";
    pub const TASK_RESULT: &str = "task.result";
    pub const BLOB_GET: &str = "blob.get";
    pub const BLOB_PUT: &str = "blob.put";
    pub const PTY_INPUT: &str = "pty.input";
    pub const PTY_DATA: &str = "pty.data";
    pub const PTY_EOF: &str = "pty.eof";
}

/// Startup payload handed to the container as base64(JSON) in argv[1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerArguments {
    pub task_id: String,
    pub function_id: String,
    pub app_id: String,
    pub function_def: FunctionDef,
    #[serde(default)]
    pub proxy_info: Option<ProxyInfo>,
    #[serde(default)]
    pub tracing_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub module_name: String,
    pub function_name: String,
    #[serde(default)]
    pub function_type: FunctionType,
    #[serde(default)]
    pub definition_type: DefinitionType,
    #[serde(default)]
    pub webhook_config: WebhookConfig,
    #[serde(default)]
    pub pty_info: PtyInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    #[default]
    Scalar,
    Generator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionType {
    #[default]
    Inline,
    Serialized,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub kind: WebhookKind,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    #[default]
    None,
    AsgiApp,
    WsgiApp,
    RawWebhook,
}

/// Window-size fields are carried but resize events are not consumed yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PtyInfo {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub winsz_rows: u16,
    #[serde(default)]
    pub winsz_cols: u16,
    #[serde(default)]
    pub env_term: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub host: String,
    pub port: u16,
}

/// Reference to a registered handler, used as the decoded form of a
/// serialized function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub module_name: String,
    pub function_name: String,
}

/// One unit of work pulled from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEnvelope {
    pub input_id: String,
    #[serde(default)]
    pub args: Option<InputArgs>,
    #[serde(default)]
    pub final_input: bool,
    #[serde(default)]
    pub kill_switch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputArgs {
    Inline(#[serde(with = "b64")] Vec<u8>),
    BlobId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenStatus {
    #[default]
    NotGenerator,
    Incomplete,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericResult {
    pub status: ResultStatus,
    #[serde(default, with = "b64::opt")]
    pub data: Option<Vec<u8>>,
    #[serde(default)]
    pub data_blob_id: Option<String>,
    #[serde(default)]
    pub gen_status: GenStatus,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default, with = "b64::opt")]
    pub serialized_tb: Option<Vec<u8>>,
    #[serde(default, with = "b64::opt")]
    pub tb_line_cache: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub input_id: String,
    #[serde(default)]
    pub input_started_at: Option<f64>,
    pub output_created_at: f64,
    pub gen_index: u64,
    pub result: GenericResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub task_id: String,
    #[serde(default)]
    pub current_input_id: Option<String>,
    #[serde(default)]
    pub current_input_started_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInputsRequest {
    pub function_id: String,
    pub average_call_time: f64,
    pub max_values: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetInputsResponse {
    #[serde(default)]
    pub inputs: Vec<InputEnvelope>,
    #[serde(default)]
    pub rate_limit_sleep_duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSerializedRequest {
    pub function_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSerializedResponse {
    #[serde(with = "b64")]
    pub function_serialized: Vec<u8>,
    #[serde(default, with = "b64::opt")]
    pub class_serialized: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutOutputsRequest {
    pub outputs: Vec<OutputRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultRequest {
    pub task_id: String,
    pub result: GenericResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyInputRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobGetRequest {
    pub blob_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobPutResponse {
    pub blob_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_args_oneof_is_self_describing() {
        let inline = InputArgs::Inline(b"abc".to_vec());
        let json = serde_json::to_string(&inline).unwrap();
        assert!(json.contains("inline"));

        let blob = InputArgs::BlobId("bl-1".to_string());
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"blob_id":"bl-1"}"#);

        let back: InputArgs = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, InputArgs::BlobId(id) if id == "bl-1"));
    }

    #[test]
    fn generic_result_data_round_trips_as_base64() {
        let result = GenericResult {
            status: ResultStatus::Success,
            data: Some(vec![0, 159, 146, 150]),
            data_blob_id: None,
            gen_status: GenStatus::NotGenerator,
            exception: None,
            traceback: None,
            serialized_tb: None,
            tb_line_cache: None,
        };
        let json = serde_json::to_vec(&result).unwrap();
        let back: GenericResult = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.data.as_deref(), Some(&[0, 159, 146, 150][..]));
        assert_eq!(back.gen_status, GenStatus::NotGenerator);
    }

    #[test]
    fn container_arguments_tolerate_missing_optionals() {
        let raw = r#"{
            "task_id": "ta-1",
            "function_id": "fu-1",
            "app_id": "ap-1",
            "function_def": {
                "module_name": "pkg.mod",
                "function_name": "square"
            }
        }"#;
        let args: ContainerArguments = serde_json::from_str(raw).unwrap();
        assert_eq!(args.function_def.function_type, FunctionType::Scalar);
        assert_eq!(args.function_def.definition_type, DefinitionType::Inline);
        assert!(!args.function_def.pty_info.enabled);
        assert!(args.proxy_info.is_none());
    }
}
