//! Wire protocol between the main context and the loader worker.
//!
//! Messages are JSON objects tagged by `type`. Fetches carry a generated
//! request id and responses are matched on it alone, so two in-flight
//! requests for the same URL cannot resolve each other.
//!
//! ```json
//! {"type":"fetchRequest","id":"6f1c…","url":"https://host/_framework/dotnet.js"}
//! {"type":"fetchResponse","id":"6f1c…","url":"…","headers":[["content-type","application/javascript"]],
//!  "status":200,"statusText":"OK","body":{"responseType":"text","data":"…"}}
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::fetch::{FetchOptions, FetchRequest, FetchResponse, ResponseBody};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Main → worker: import and start the loader at `url`.
    LoadRuntime { url: String },
    /// Main → worker: invoke the reset entry point.
    Reset,
    /// Main → worker without a value: invoke the toggle entry point.
    /// Worker → main with the running flag it returned.
    Toggle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_running: Option<bool>,
    },
    /// Worker → main: DOM text update requested by the loader.
    SetInnerText { selector: String, text: String },
    /// Worker → main: fetch `url` on my behalf. The body travels as base64.
    FetchRequest {
        id: Uuid,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Main → worker: the response to request `id`.
    FetchResponse {
        id: Uuid,
        url: String,
        headers: Vec<(String, String)>,
        status: u16,
        status_text: String,
        body: WireBody,
    },
    /// Main → worker: request `id` was rejected.
    FetchError { id: Uuid, url: String, message: String },
    /// Worker → main: unrecoverable loader failure.
    Error { message: String },
    /// Worker → main: the worker context is up.
    Ready,
    /// Worker → main: the loader's exports are callable.
    ExportsReady,
}

/// Response body on the wire. Binary data travels as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "responseType", content = "data", rename_all = "camelCase")]
pub enum WireBody {
    Text(String),
    ArrayBuffer(String),
}

impl From<&ResponseBody> for WireBody {
    fn from(body: &ResponseBody) -> Self {
        match body {
            ResponseBody::Text(text) => WireBody::Text(text.clone()),
            ResponseBody::Binary(bytes) => WireBody::ArrayBuffer(BASE64.encode(bytes)),
        }
    }
}

impl TryFrom<WireBody> for ResponseBody {
    type Error = ProxyError;

    fn try_from(body: WireBody) -> Result<Self, Self::Error> {
        match body {
            WireBody::Text(text) => Ok(ResponseBody::Text(text)),
            WireBody::ArrayBuffer(data) => Ok(ResponseBody::Binary(BASE64.decode(data)?)),
        }
    }
}

/// Rebuild a request from the fields of a `fetchRequest` message.
///
/// # Errors
///
/// [`ProxyError::Decode`] when the body is not valid base64.
pub fn wire_request(
    url: String,
    method: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<String>,
) -> Result<FetchRequest, ProxyError> {
    let body = body.map(|data| BASE64.decode(data)).transpose()?;
    Ok(FetchRequest::new(
        url,
        FetchOptions {
            method,
            headers,
            body,
        },
    ))
}

impl WorkerMessage {
    pub fn fetch_request(id: Uuid, request: &FetchRequest) -> Self {
        WorkerMessage::FetchRequest {
            id,
            url: request.url.clone(),
            method: Some(request.method.clone()),
            headers: request.headers.clone(),
            body: request.body.as_ref().map(|bytes| BASE64.encode(bytes)),
        }
    }

    pub fn fetch_response(id: Uuid, response: &FetchResponse) -> Self {
        WorkerMessage::FetchResponse {
            id,
            url: response.url.clone(),
            headers: response.headers.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            body: WireBody::from(&response.body),
        }
    }

    /// Rebuild the response carried by a `fetchResponse` message.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Protocol`] for any other message kind, or
    /// [`ProxyError::Decode`] for a malformed binary body.
    pub fn into_response(self) -> Result<FetchResponse, ProxyError> {
        match self {
            WorkerMessage::FetchResponse {
                url,
                headers,
                status,
                status_text,
                body,
                ..
            } => Ok(FetchResponse {
                url,
                status,
                status_text,
                headers,
                body: body.try_into()?,
            }),
            other => Err(ProxyError::Protocol(format!(
                "expected fetchResponse, got {}",
                other.kind()
            ))),
        }
    }

    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::LoadRuntime { .. } => "loadRuntime",
            WorkerMessage::Reset => "reset",
            WorkerMessage::Toggle { .. } => "toggle",
            WorkerMessage::SetInnerText { .. } => "setInnerText",
            WorkerMessage::FetchRequest { .. } => "fetchRequest",
            WorkerMessage::FetchResponse { .. } => "fetchResponse",
            WorkerMessage::FetchError { .. } => "fetchError",
            WorkerMessage::Error { .. } => "error",
            WorkerMessage::Ready => "ready",
            WorkerMessage::ExportsReady => "exportsReady",
        }
    }

    pub fn encode(&self) -> Result<String, ProxyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProxyError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Sending half of one direction of the channel.
#[derive(Debug, Clone)]
pub struct Port {
    sender: mpsc::UnboundedSender<String>,
}

impl Port {
    /// Post one message to the other context.
    ///
    /// The message is encoded to its JSON wire form here, so both sides only
    /// ever exchange what [`WorkerMessage::decode`] accepts. Sending never
    /// waits; the channel is unbounded.
    ///
    /// # Arguments
    /// * `message` - The message to encode and post
    ///
    /// # Errors
    ///
    /// [`ProxyError::Protocol`] when the other side has gone away.
    pub fn send(&self, message: &WorkerMessage) -> Result<(), ProxyError> {
        let raw = message.encode()?;
        self.sender
            .send(raw)
            .map_err(|_| ProxyError::Protocol(format!("channel closed, dropped {}", message.kind())))
    }
}

/// Receiving half of one direction of the channel.
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Inbox {
    /// Next well-formed message, or `None` once every [`Port`] is gone.
    /// Malformed messages are logged and skipped.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        loop {
            let raw = self.receiver.recv().await?;
            match WorkerMessage::decode(&raw) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("Dropping malformed worker message: {e}"),
            }
        }
    }
}

/// One direction of the bridge.
pub fn channel() -> (Port, Inbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Port { sender }, Inbox { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let id = Uuid::nil();
        let cases = [
            (
                WorkerMessage::LoadRuntime {
                    url: "https://h/_framework/dotnet.js".to_string(),
                },
                json!({"type": "loadRuntime", "url": "https://h/_framework/dotnet.js"}),
            ),
            (WorkerMessage::Reset, json!({"type": "reset"})),
            (WorkerMessage::Toggle { is_running: None }, json!({"type": "toggle"})),
            (
                WorkerMessage::Toggle {
                    is_running: Some(false),
                },
                json!({"type": "toggle", "isRunning": false}),
            ),
            (
                WorkerMessage::SetInnerText {
                    selector: "#time".to_string(),
                    text: "00:01".to_string(),
                },
                json!({"type": "setInnerText", "selector": "#time", "text": "00:01"}),
            ),
            (
                WorkerMessage::FetchRequest {
                    id,
                    url: "u".to_string(),
                    method: None,
                    headers: Vec::new(),
                    body: None,
                },
                json!({"type": "fetchRequest", "id": id.to_string(), "url": "u"}),
            ),
            (WorkerMessage::ExportsReady, json!({"type": "exportsReady"})),
        ];
        for (message, expected) in cases {
            assert_eq!(serde_json::to_value(&message).unwrap(), expected);
            assert_eq!(WorkerMessage::decode(&expected.to_string()).unwrap(), message);
        }
    }

    #[test]
    fn test_fetch_request_keeps_method_headers_and_body() {
        let id = Uuid::new_v4();
        let request = FetchRequest::new(
            "https://api.example.com/echo",
            FetchOptions {
                method: Some("POST".to_string()),
                headers: vec![("x-loader-tag".to_string(), "boot".to_string())],
                body: Some(b"payload".to_vec()),
            },
        );
        let value = serde_json::to_value(WorkerMessage::fetch_request(id, &request)).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["body"], "cGF5bG9hZA==");

        match WorkerMessage::decode(&value.to_string()).unwrap() {
            WorkerMessage::FetchRequest {
                url,
                method,
                headers,
                body,
                ..
            } => assert_eq!(wire_request(url, method, headers, body).unwrap(), request),
            other => panic!("expected fetchRequest, got {other:?}"),
        }

        assert!(matches!(
            wire_request("u".to_string(), None, Vec::new(), Some("%%".to_string())),
            Err(ProxyError::Decode(_))
        ));
    }

    #[test]
    fn test_fetch_response_carries_binary_as_base64() {
        let id = Uuid::new_v4();
        let response = FetchResponse {
            url: "https://h/_framework/dotnet.native.wasm".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "application/wasm".to_string())],
            body: ResponseBody::Binary(vec![0, 97, 115, 109]),
        };
        let message = WorkerMessage::fetch_response(id, &response);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "fetchResponse");
        assert_eq!(value["statusText"], "OK");
        assert_eq!(value["body"], json!({"responseType": "arrayBuffer", "data": "AGFzbQ=="}));
        assert_eq!(value["headers"], json!([["content-type", "application/wasm"]]));

        let decoded = WorkerMessage::decode(&value.to_string()).unwrap();
        assert_eq!(decoded.into_response().unwrap(), response);
    }

    #[test]
    fn test_into_response_rejects_other_kinds() {
        assert!(matches!(
            WorkerMessage::Reset.into_response(),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(WorkerMessage::decode(r#"{"type":"launchMissiles"}"#).is_err());
        assert!(WorkerMessage::decode(r#"{"url":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_inbox_skips_malformed() {
        let (port, mut inbox) = channel();
        port.sender.send("not json".to_string()).unwrap();
        port.send(&WorkerMessage::Ready).unwrap();
        assert_eq!(inbox.recv().await, Some(WorkerMessage::Ready));

        drop(port);
        assert_eq!(inbox.recv().await, None);
    }
}
