//! Tagged-union frame envelope carried over the tunnel transport.
//!
//! Each variant corresponds to one `type` value from the wire table; serde's
//! adjacently-tagged representation (`type` + `payload`) produces exactly
//! the `{type, payload}` envelope shape the transport requires.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stream_id::StreamId;

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Message kind carried by a `ws_message` frame, mirroring the WebSocket
/// opcode space. Serializes as a bare integer on the wire (no `serde_repr`
/// dependency needed for a single enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsMessageType {
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl WsMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }
}

impl Serialize for WsMessageType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for WsMessageType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(d)?;
        WsMessageType::from_u8(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown ws message_type {}", raw)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub id: StreamId,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    pub id: StreamId,
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOpenPayload {
    pub id: StreamId,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAckPayload {
    pub id: StreamId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectDataPayload {
    pub id: StreamId,
    #[serde(with = "b64")]
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectClosePayload {
    pub id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsOpenPayload {
    pub id: StreamId,
    pub url: String,
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsAckPayload {
    pub id: StreamId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessagePayload {
    pub id: StreamId,
    pub message_type: WsMessageType,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClosePayload {
    pub id: StreamId,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// A single frame on the wire. The `type`/`payload` tagging is handled by
/// serde's adjacent-tag representation (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    #[serde(rename = "http_request")]
    HttpRequest(HttpRequestPayload),
    #[serde(rename = "http_response")]
    HttpResponse(HttpResponsePayload),
    #[serde(rename = "connect_open")]
    ConnectOpen(ConnectOpenPayload),
    #[serde(rename = "connect_ack")]
    ConnectAck(ConnectAckPayload),
    #[serde(rename = "connect_data")]
    ConnectData(ConnectDataPayload),
    #[serde(rename = "connect_close")]
    ConnectClose(ConnectClosePayload),
    #[serde(rename = "ws_open")]
    WsOpen(WsOpenPayload),
    #[serde(rename = "ws_ack")]
    WsAck(WsAckPayload),
    #[serde(rename = "ws_message")]
    WsMessage(WsMessagePayload),
    #[serde(rename = "ws_close")]
    WsClose(WsClosePayload),
}

impl Frame {
    /// Stream ID every frame variant carries.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::HttpRequest(p) => p.id,
            Frame::HttpResponse(p) => p.id,
            Frame::ConnectOpen(p) => p.id,
            Frame::ConnectAck(p) => p.id,
            Frame::ConnectData(p) => p.id,
            Frame::ConnectClose(p) => p.id,
            Frame::WsOpen(p) => p.id,
            Frame::WsAck(p) => p.id,
            Frame::WsMessage(p) => p.id,
            Frame::WsClose(p) => p.id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::HttpRequest(_) => "http_request",
            Frame::HttpResponse(_) => "http_response",
            Frame::ConnectOpen(_) => "connect_open",
            Frame::ConnectAck(_) => "connect_ack",
            Frame::ConnectData(_) => "connect_data",
            Frame::ConnectClose(_) => "connect_close",
            Frame::WsOpen(_) => "ws_open",
            Frame::WsAck(_) => "ws_ack",
            Frame::WsMessage(_) => "ws_message",
            Frame::WsClose(_) => "ws_close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_round_trips_as_adjacent_tagged_json() {
        let frame = Frame::HttpRequest(HttpRequestPayload {
            id: StreamId::new(),
            method: "GET".into(),
            url: "http://example.com/".into(),
            headers: HashMap::new(),
            body: b"hello".to_vec(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "http_request");
        assert_eq!(json["payload"]["method"], "GET");

        let decoded: Frame = serde_json::from_value(json).unwrap();
        match decoded {
            Frame::HttpRequest(p) => assert_eq!(p.body, b"hello"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ws_message_type_serializes_as_bare_integer() {
        let frame = Frame::WsMessage(WsMessagePayload {
            id: StreamId::new(),
            message_type: WsMessageType::Binary,
            data: vec![1, 2, 3],
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["payload"]["message_type"], 2);
    }

    #[test]
    fn unknown_type_fails_to_decode_and_is_dropped_by_caller() {
        let raw = serde_json::json!({"type": "frobnicate", "payload": {}});
        let result: Result<Frame, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }
}
