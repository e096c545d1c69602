//! Wire shapes shared by the transports.

use crate::dispatcher::{InvocationRequest, InvocationResult};
use crate::error::{DispatchError, ErrorKind};
use crate::registry::TARGET_HOST_ARG;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One inbound call as framed on the stdio transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallRequest {
    /// Caller correlation id, echoed back verbatim.
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub operation_name: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl CallRequest {
    pub fn into_invocation(self) -> InvocationRequest {
        let mut arguments = self.arguments;
        let target_host = lift_target_host(&mut arguments, None);
        InvocationRequest {
            operation: self.operation_name,
            arguments,
            credential: self.credential,
            target_host,
        }
    }
}

/// Body of `POST /api/v1/operations/:name`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationBody {
    #[serde(default)]
    pub arguments: HashMap<String, String>,
    #[serde(default)]
    pub target_host: Option<String>,
}

/// Remove the reserved `target_host` argument. An explicit host wins.
pub fn lift_target_host(
    arguments: &mut HashMap<String, String>,
    explicit: Option<String>,
) -> Option<String> {
    let embedded = arguments.remove(TARGET_HOST_ARG);
    explicit.or(embedded).filter(|host| !host.is_empty())
}

/// Outbound result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        output: String,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
    Error {
        #[serde(rename = "errorKind")]
        error_kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn error(err: &DispatchError) -> Self {
        Response::Error {
            error_kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<&InvocationResult> for Response {
    fn from(result: &InvocationResult) -> Self {
        match result.outcome {
            Ok(ref output) => Response::Ok {
                output: output.clone(),
                elapsed_ms: result.elapsed.as_millis() as u64,
            },
            Err(ref err) => Response::error(err),
        }
    }
}

/// A response with correlation fields attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(flatten)]
    pub response: Response,
}

impl Envelope {
    pub fn new(id: Option<serde_json::Value>, result: &InvocationResult) -> Self {
        Self {
            id,
            request_id: Some(result.request_id),
            response: Response::from(result),
        }
    }

    /// For calls rejected before dispatch, such as unparseable input.
    pub fn rejected(id: Option<serde_json::Value>, err: &DispatchError) -> Self {
        Self {
            id,
            request_id: None,
            response: Response::error(err),
        }
    }
}
