use base64::Engine;
use prost::Message;

/// Frames sent by the controller side (the remote transport) to an agent.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "req")]
    Req {
        id: u64,
        method: String,
        payload_b64: String,
    },
    #[serde(other)]
    Unknown,
}

/// Frames sent by an agent. `Hello` is always the first frame on a new
/// connection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum AgentFrame {
    #[serde(rename = "hello")]
    Hello { agent_version: String, pid: u32 },
    #[serde(rename = "resp")]
    Resp {
        id: u64,
        ok: bool,
        payload_b64: Option<String>,
        status_message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl AgentFrame {
    pub fn ok(id: u64, payload: &[u8]) -> Self {
        AgentFrame::Resp {
            id,
            ok: true,
            payload_b64: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
            status_message: None,
        }
    }

    /// Frame-level failure: unknown method, undecodable payload. Application
    /// errors travel inside the payload as an `RpcError` instead.
    pub fn failed(id: u64, message: impl Into<String>) -> Self {
        AgentFrame::Resp {
            id,
            ok: false,
            payload_b64: None,
            status_message: Some(message.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid payload base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub fn encode_payload<M: Message>(msg: &M) -> String {
    base64::engine::general_purpose::STANDARD.encode(msg.encode_to_vec())
}

pub fn decode_payload<M: Message + Default>(payload_b64: &str) -> Result<M, PayloadError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload_b64.as_bytes())?;
    Ok(M::decode(bytes.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_v1::{GetStdioResponse, StdioLine};

    #[test]
    fn unknown_frame_types_do_not_fail_parsing() {
        let f: ClientFrame = serde_json::from_str(r#"{"type":"subscribe","topic":"x"}"#).unwrap();
        assert_eq!(f, ClientFrame::Unknown);
        let f: AgentFrame = serde_json::from_str(r#"{"type":"event"}"#).unwrap();
        assert_eq!(f, AgentFrame::Unknown);
    }

    #[test]
    fn request_frame_uses_tagged_json() {
        let f = ClientFrame::Req {
            id: 7,
            method: crate::method::PING.to_string(),
            payload_b64: String::new(),
        };
        let v: serde_json::Value = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "req");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "/warden.agent.v1.Agent/Ping");
    }

    #[test]
    fn payload_survives_frame_transport() {
        let resp = GetStdioResponse {
            lines: vec![StdioLine {
                seq: 3,
                text: "Done (4.2s)! For help, type \"help\"".to_string(),
            }],
            finished: false,
            error: None,
        };
        let frame = AgentFrame::ok(1, &resp.encode_to_vec());
        let text = serde_json::to_string(&frame).unwrap();
        let AgentFrame::Resp { payload_b64, ok, .. } = serde_json::from_str(&text).unwrap() else {
            panic!("expected resp frame");
        };
        assert!(ok);
        let decoded: GetStdioResponse = decode_payload(&payload_b64.unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let err = decode_payload::<GetStdioResponse>("@@not base64@@").unwrap_err();
        assert!(matches!(err, PayloadError::Base64(_)));
    }
}
