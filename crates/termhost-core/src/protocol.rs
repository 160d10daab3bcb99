//! JSON wire protocol spoken between the transport gateway and its clients.
//!
//! Every frame is a single JSON object with a `type` discriminator. Client
//! frames may carry a `request_id`, which the server echoes on the reply.
//! Events are pushed unsolicited as `{"type":"event","event":{...}}`.

use crate::error::{TermError, TermResult};
use crate::event::SessionEvent;
use crate::session::{SessionInfo, SpawnRequest};
use serde::{Deserialize, Serialize};

/// Largest text frame the gateway accepts (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// A request frame sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

/// Operations a client can invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Spawn(SpawnRequest),
    Write { execution_id: String, data: String },
    Resize { execution_id: String, cols: u16, rows: u16 },
    GetSession { execution_id: String },
    GetBuffer { execution_id: String },
    Kill { execution_id: String },
    List,
    /// Start receiving events for an existing session; replies with its
    /// current metadata so a reconnecting client can catch up.
    Attach { execution_id: String },
    Detach { execution_id: String },
}

/// A frame sent by the server: either a reply or a pushed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub body: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Spawned { session: SessionInfo },
    Written { ok: bool },
    Resized { execution_id: String },
    Session { session: Option<SessionInfo> },
    Buffer { execution_id: String, lines: Vec<String> },
    Killed { execution_id: String, killed: bool },
    Sessions { execution_ids: Vec<String> },
    Attached { session: SessionInfo },
    Detached { execution_id: String },
    Error { code: String, message: String },
    Event { event: SessionEvent },
}

impl ServerMessage {
    pub fn reply(request_id: Option<u64>, body: Response) -> Self {
        Self { request_id, body }
    }

    pub fn event(event: SessionEvent) -> Self {
        Self {
            request_id: None,
            body: Response::Event { event },
        }
    }

    pub fn error(request_id: Option<u64>, err: &TermError) -> Self {
        Self {
            request_id,
            body: Response::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Parse a client text frame.
pub fn decode_client(text: &str) -> TermResult<ClientMessage> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(TermError::InvalidMessage(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }
    Ok(serde_json::from_str(text)?)
}

/// Serialize a server frame.
pub fn encode_server(msg: &ServerMessage) -> TermResult<String> {
    serde_json::to_string(msg).map_err(|e| TermError::Other(format!("encode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_spawn_with_request_id() {
        let msg = decode_client(
            r#"{"type":"spawn","request_id":7,"execution_id":"s1","working_dir":"/tmp","cols":100}"#,
        )
        .unwrap();
        assert_eq!(msg.request_id, Some(7));
        match msg.request {
            Request::Spawn(req) => {
                assert_eq!(req.execution_id, "s1");
                assert_eq!(req.cols, Some(100));
                assert_eq!(req.rows, None);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_decode_list_without_fields() {
        let msg = decode_client(r#"{"type":"list"}"#).unwrap();
        assert!(msg.request_id.is_none());
        assert!(matches!(msg.request, Request::List));
    }

    #[test]
    fn test_decode_unknown_type_is_invalid_message() {
        let err = decode_client(r#"{"type":"reboot"}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_message");
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let text = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            decode_client(&text),
            Err(TermError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_encode_error_reply() {
        let err = TermError::NotFound("s9".into());
        let json = encode_server(&ServerMessage::error(Some(3), &err)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["request_id"], 3);
        assert_eq!(value["code"], "not_found");
        assert_eq!(value["message"], "session not found: s9");
    }

    #[test]
    fn test_encode_event_push() {
        let msg = ServerMessage::event(SessionEvent::Output {
            execution_id: "s1".into(),
            data: "hi\r\n".into(),
        });
        let value: serde_json::Value =
            serde_json::from_str(&encode_server(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "event");
        assert!(value.get("request_id").is_none());
        assert_eq!(value["event"]["kind"], "output");
        assert_eq!(value["event"]["data"], "hi\r\n");
    }
}
