//! Messages exchanged over the control channel.
//!
//! On the wire every message is a frame: a big-endian `u16` kind, a big-endian `u32` payload
//! length and that many payload bytes. Structured payloads are JSON.
//!
//! Kinds below `0x8000` are requests from the client, kinds from `0x8000` up are sent by the
//! service. The numbers are a stable contract with the launcher, never reuse or renumber them.
//! Peers ignore kinds they don't know: the service answers them with a failed [`Response`],
//! clients skip them.

use std::io;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest payload either side accepts. Anything bigger ends the session.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 6;

pub mod kind {
    pub const STATUS_QUERY: u16 = 0x0001;
    pub const LOG_GET: u16 = 0x0002;
    pub const LOG_CLEAR: u16 = 0x0003;
    pub const TUNNEL_LIST: u16 = 0x0010;
    pub const TUNNEL_START: u16 = 0x0011;
    pub const TUNNEL_STOP: u16 = 0x0012;

    pub const RESPONSE: u16 = 0x8000;
    pub const PUSH_LOG_APPEND: u16 = 0x8001;
    pub const PUSH_TUNNEL_STATUS: u16 = 0x8002;
    pub const PUSH_TERMINATING: u16 = 0x8003;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: u16) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn json<T: Serialize>(kind: u16, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_vec(value)?))
    }

    fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Splits the byte stream into [`Frame`]s.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_offset(2)
                .length_field_length(4)
                .num_skip(0)
                .max_frame_length(MAX_PAYLOAD_LEN)
                .big_endian()
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        let Some(mut frame) = self.inner.decode(buf)? else {
            return Ok(None);
        };

        let kind = frame.get_u16();
        frame.advance(4); // The length, `inner` already checked it.

        Ok(Some(Frame {
            kind,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), io::Error> {
        let len = frame.payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit"),
            ));
        }

        buf.reserve(HEADER_LEN + len);
        buf.put_u16(frame.kind);
        buf.put_u32(len as u32);
        buf.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// What a client can ask the service to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    StatusQuery,
    LogGet,
    LogClear,
    TunnelList,
    TunnelStart { id: u32 },
    TunnelStop { id: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Unknown message kind 0x{0:04x}")]
    UnknownKind(u16),
    #[error("Malformed payload for `{name}`")]
    Malformed {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct TunnelId {
    id: u32,
}

impl Request {
    pub fn kind(&self) -> u16 {
        match self {
            Self::StatusQuery => kind::STATUS_QUERY,
            Self::LogGet => kind::LOG_GET,
            Self::LogClear => kind::LOG_CLEAR,
            Self::TunnelList => kind::TUNNEL_LIST,
            Self::TunnelStart { .. } => kind::TUNNEL_START,
            Self::TunnelStop { .. } => kind::TUNNEL_STOP,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StatusQuery => "StatusQuery",
            Self::LogGet => "LogGet",
            Self::LogClear => "LogClear",
            Self::TunnelList => "TunnelList",
            Self::TunnelStart { .. } => "TunnelStart",
            Self::TunnelStop { .. } => "TunnelStop",
        }
    }

    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        match *self {
            Self::TunnelStart { id } | Self::TunnelStop { id } => {
                Frame::json(self.kind(), &TunnelId { id })
            }
            Self::StatusQuery | Self::LogGet | Self::LogClear | Self::TunnelList => {
                Ok(Frame::empty(self.kind()))
            }
        }
    }

    /// Payloads of requests that don't take arguments are ignored.
    pub fn from_frame(frame: &Frame) -> Result<Self, RequestError> {
        let tunnel_id = |name| {
            frame
                .parse_json::<TunnelId>()
                .map(|t| t.id)
                .map_err(|source| RequestError::Malformed { name, source })
        };

        Ok(match frame.kind {
            kind::STATUS_QUERY => Self::StatusQuery,
            kind::LOG_GET => Self::LogGet,
            kind::LOG_CLEAR => Self::LogClear,
            kind::TUNNEL_LIST => Self::TunnelList,
            kind::TUNNEL_START => Self::TunnelStart {
                id: tunnel_id("TunnelStart")?,
            },
            kind::TUNNEL_STOP => Self::TunnelStop {
                id: tunnel_id("TunnelStop")?,
            },
            other => return Err(RequestError::UnknownKind(other)),
        })
    }
}

/// Exactly one of these answers every request, in the order the requests came in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            success: true,
            message: None,
            body,
        }
    }

    pub fn done(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            body: ResponseBody::None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            body: ResponseBody::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResponseBody {
    #[default]
    None,
    Status(ServiceStatus),
    Logs(Vec<LogEntry>),
    Tunnels(Vec<TunnelStatus>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub running_tunnels: usize,
    pub buffered_log_lines: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// `service` or `tunnel:<id>`
    pub source: String,
    pub level: LogLevel,
    /// Milliseconds since the Unix epoch.
    pub time: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub id: u32,
    #[serde(flatten)]
    pub state: TunnelState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    Running { pid: Option<u32> },
    Stopped { exit_code: Option<i32> },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogAppend {
    entries: Vec<LogEntry>,
}

/// Everything the service sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Response(Response),
    LogAppend(Vec<LogEntry>),
    TunnelStatus(TunnelStatus),
    Terminating,
}

impl ServerMessage {
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        match self {
            Self::Response(response) => Frame::json(kind::RESPONSE, response),
            Self::LogAppend(entries) => Frame::json(
                kind::PUSH_LOG_APPEND,
                &LogAppend {
                    entries: entries.clone(),
                },
            ),
            Self::TunnelStatus(status) => Frame::json(kind::PUSH_TUNNEL_STATUS, status),
            Self::Terminating => Ok(Frame::empty(kind::PUSH_TERMINATING)),
        }
    }

    /// `Ok(None)` for kinds this build doesn't know, which clients must skip.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, serde_json::Error> {
        Ok(Some(match frame.kind {
            kind::RESPONSE => Self::Response(frame.parse_json()?),
            kind::PUSH_LOG_APPEND => Self::LogAppend(frame.parse_json::<LogAppend>()?.entries),
            kind::PUSH_TUNNEL_STATUS => Self::TunnelStatus(frame.parse_json()?),
            kind::PUSH_TERMINATING => Self::Terminating,
            _ => return Ok(None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn wire_layout() {
        let mut buf = BytesMut::new();
        FrameCodec::default()
            .encode(Frame::new(0x0011, &b"{\"id\":7}"[..]), &mut buf)
            .unwrap();

        assert_eq!(&buf[..6], &[0x00, 0x11, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(&buf[6..], b"{\"id\":7}");
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut wire = BytesMut::new();
        let mut codec = FrameCodec::default();
        codec
            .encode(Frame::empty(kind::LOG_CLEAR), &mut wire)
            .unwrap();
        codec
            .encode(Frame::new(kind::TUNNEL_STOP, &b"{\"id\":1}"[..]), &mut wire)
            .unwrap();

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(
            frames,
            vec![
                Frame::empty(kind::LOG_CLEAR),
                Frame::new(kind::TUNNEL_STOP, &b"{\"id\":1}"[..])
            ]
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(kind::LOG_GET);
        buf.put_u32(MAX_PAYLOAD_LEN as u32 + 1);

        assert!(FrameCodec::default().decode(&mut buf).is_err());
        assert!(
            FrameCodec::default()
                .encode(
                    Frame::new(kind::RESPONSE, vec![0u8; MAX_PAYLOAD_LEN + 1]),
                    &mut BytesMut::new()
                )
                .is_err()
        );
    }

    #[test]
    fn unknown_kinds_still_decode_as_frames() {
        let frames = decode_all(&[0x12, 0x34, 0, 0, 0, 2, 0xAB, 0xCD]);

        assert_eq!(frames, vec![Frame::new(0x1234, vec![0xAB, 0xCD])]);
        assert!(matches!(
            Request::from_frame(&frames[0]),
            Err(RequestError::UnknownKind(0x1234))
        ));
        assert_eq!(ServerMessage::from_frame(&frames[0]).unwrap(), None);
    }

    #[test_case(Request::StatusQuery, 0x0001)]
    #[test_case(Request::LogGet, 0x0002)]
    #[test_case(Request::LogClear, 0x0003)]
    #[test_case(Request::TunnelList, 0x0010)]
    #[test_case(Request::TunnelStart { id: 4 }, 0x0011)]
    #[test_case(Request::TunnelStop { id: 4 }, 0x0012)]
    fn request_kinds_are_stable(request: Request, expected: u16) {
        let frame = request.to_frame().unwrap();

        assert_eq!(frame.kind, expected);
        assert_eq!(Request::from_frame(&frame).unwrap(), request);
    }

    #[test]
    fn tunnel_requests_need_an_id() {
        let err = Request::from_frame(&Frame::new(kind::TUNNEL_START, &b"{}"[..])).unwrap_err();

        assert!(matches!(err, RequestError::Malformed { name: "TunnelStart", .. }));
    }

    #[test]
    fn argumentless_requests_ignore_their_payload() {
        let request = Request::from_frame(&Frame::new(kind::LOG_CLEAR, &b"junk"[..])).unwrap();

        assert_eq!(request, Request::LogClear);
    }

    #[test]
    fn response_json_shape() {
        let frame = ServerMessage::Response(Response::ok(ResponseBody::Tunnels(vec![
            TunnelStatus {
                id: 3,
                state: TunnelState::Running { pid: Some(42) },
            },
        ])))
        .to_frame()
        .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(frame.kind, kind::RESPONSE);
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "body": {
                    "type": "tunnels",
                    "data": [{ "id": 3, "state": "running", "pid": 42 }]
                }
            })
        );
    }

    #[test]
    fn error_response_parses_back() {
        let message = ServerMessage::Response(Response::error("Tunnel 3 is not running"));

        let frame = message.to_frame().unwrap();

        assert_eq!(ServerMessage::from_frame(&frame).unwrap(), Some(message));
    }

    #[test]
    fn log_append_wraps_entries() {
        let entry = LogEntry {
            source: "tunnel:1".to_owned(),
            level: LogLevel::Warn,
            time: 1_700_000_000_000,
            message: "Reconnecting".to_owned(),
        };

        let frame = ServerMessage::LogAppend(vec![entry.clone()])
            .to_frame()
            .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(frame.kind, kind::PUSH_LOG_APPEND);
        assert_eq!(json["entries"][0]["level"], "warn");
        assert_eq!(
            ServerMessage::from_frame(&frame).unwrap(),
            Some(ServerMessage::LogAppend(vec![entry]))
        );
    }
}
