//! Framed request/response codec.
//!
//! Request frame: `"FACE"`, big-endian `u32` JSON length, the JSON header,
//! then `face_data_size` raw image bytes. Response frame: `"RESP"`,
//! big-endian `u32` JSON length, the JSON body. One frame each way per
//! connection.

use crate::common::FaceAuthError;
use crate::core::AuthError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const REQUEST_MAGIC: &[u8; 4] = b"FACE";
pub const RESPONSE_MAGIC: &[u8; 4] = b"RESP";
pub const HEADER_LEN: usize = 8;
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad frame magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("Declared JSON length {declared} does not fit in {available} bytes")]
    JsonLength { declared: usize, available: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Unknown request type: {0}")]
    UnknownType(String),

    #[error("Declared face data size {declared} overruns the frame ({available} bytes left)")]
    FaceDataOverrun { declared: usize, available: usize },

    #[error("Frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for FaceAuthError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(e) => FaceAuthError::Io(e),
            other => FaceAuthError::Protocol(other.to_string()),
        }
    }
}

impl From<ProtocolError> for AuthError {
    fn from(e: ProtocolError) -> Self {
        AuthError::Protocol(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Register,
    Authenticate,
    UpdateFace,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Register => "register",
            RequestKind::Authenticate => "login",
            RequestKind::UpdateFace => "update_face",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(RequestKind::Register),
            "login" => Some(RequestKind::Authenticate),
            "update_face" => Some(RequestKind::UpdateFace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub username: String,
    pub password: String,
    pub face_image: Vec<u8>,
    pub user_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Reply(RequestKind),
    Error,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::Reply(kind) => kind.as_str(),
            ResponseKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: ResponseKind,
    pub success: bool,
    pub message: String,
    pub extra: BTreeMap<String, String>,
}

impl Response {
    pub fn reply(kind: RequestKind, success: bool, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Reply(kind),
            success,
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            success: false,
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, extra: BTreeMap<String, String>) -> Self {
        self.extra.extend(extra);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

#[derive(Serialize, Deserialize)]
struct RequestHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    face_data_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<Value>,
}

// Accepts both `"user_id": 7` and `"user_id": "7"`.
fn parse_user_id(value: Option<Value>) -> Result<Option<i32>, ProtocolError> {
    let invalid = |v: &Value| ProtocolError::InvalidJson(format!("user_id is not an integer: {}", v));
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(&Value::Number(n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| invalid(&Value::String(s))),
        Some(other) => Err(invalid(&other)),
    }
}

fn frame_header(magic: &[u8; 4], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.extend_from_slice(magic);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out
}

fn split_header(header: &[u8], expected: &[u8; 4]) -> Result<usize, ProtocolError> {
    if header.len() < HEADER_LEN {
        return Err(ProtocolError::TooShort(header.len()));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if &magic != expected {
        return Err(ProtocolError::BadMagic(magic));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[4..HEADER_LEN]);
    Ok(u32::from_be_bytes(len) as usize)
}

fn check_json_len(declared: usize, available: usize) -> Result<(), ProtocolError> {
    if declared == 0 {
        return Err(ProtocolError::JsonLength { declared, available });
    }
    if HEADER_LEN + declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(HEADER_LEN + declared));
    }
    if declared > available {
        return Err(ProtocolError::JsonLength { declared, available });
    }
    Ok(())
}

// `face_data_size` is a client-supplied u64, so the sum is taken in u64.
fn check_face_len(json_end: usize, declared: u64) -> Result<usize, ProtocolError> {
    let total = (json_end as u64).saturating_add(declared);
    if total > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge(usize::try_from(total).unwrap_or(usize::MAX)));
    }
    Ok(declared as usize)
}

fn parse_request_header(json: &[u8]) -> Result<(RequestKind, RequestHeader), ProtocolError> {
    let header: RequestHeader =
        serde_json::from_slice(json).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = RequestKind::parse(&header.kind)
        .ok_or_else(|| ProtocolError::UnknownType(header.kind.clone()))?;
    Ok((kind, header))
}

fn build_request(
    kind: RequestKind,
    header: RequestHeader,
    face_image: Vec<u8>,
) -> Result<Request, ProtocolError> {
    Ok(Request {
        kind,
        username: header.username,
        password: header.password,
        face_image,
        user_id: parse_user_id(header.user_id)?,
    })
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    let header = RequestHeader {
        kind: request.kind.as_str().to_string(),
        username: request.username.clone(),
        password: request.password.clone(),
        face_data_size: request.face_image.len() as u64,
        user_id: request.user_id.map(Value::from),
    };
    let json = serde_json::to_vec(&header).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let total = HEADER_LEN + json.len() + request.face_image.len();
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(total));
    }

    let mut out = frame_header(REQUEST_MAGIC, json.len());
    out.reserve(json.len() + request.face_image.len());
    out.extend_from_slice(&json);
    out.extend_from_slice(&request.face_image);
    Ok(out)
}

/// Decodes one request frame from the start of `buf`. Bytes past the
/// declared frame are ignored.
pub fn decode_request(buf: &[u8]) -> Result<Request, ProtocolError> {
    let json_len = split_header(buf, REQUEST_MAGIC)?;
    check_json_len(json_len, buf.len() - HEADER_LEN)?;

    let json_end = HEADER_LEN + json_len;
    let (kind, header) = parse_request_header(&buf[HEADER_LEN..json_end])?;

    let face_len = check_face_len(json_end, header.face_data_size)?;
    let available = buf.len() - json_end;
    if face_len > available {
        return Err(ProtocolError::FaceDataOverrun { declared: face_len, available });
    }

    let face_image = buf[json_end..json_end + face_len].to_vec();
    build_request(kind, header, face_image)
}

/// Reads exactly one request frame, sized by its header.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request, ProtocolError> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf)?;
    let json_len = split_header(&header_buf, REQUEST_MAGIC)?;
    check_json_len(json_len, MAX_FRAME_SIZE - HEADER_LEN)?;

    let mut json = vec![0u8; json_len];
    reader.read_exact(&mut json)?;
    let (kind, header) = parse_request_header(&json)?;

    let face_len = check_face_len(HEADER_LEN + json_len, header.face_data_size)?;

    tracing::debug!("Reading {} request: {} JSON bytes, {} image bytes", kind.as_str(), json_len, face_len);
    let mut face_image = vec![0u8; face_len];
    reader.read_exact(&mut face_image)?;
    build_request(kind, header, face_image)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Map::new();
    for (key, value) in &response.extra {
        body.insert(key.clone(), Value::String(value.clone()));
    }
    body.insert("type".to_string(), Value::String(response.kind.as_str().to_string()));
    body.insert("success".to_string(), Value::Bool(response.success));
    body.insert("message".to_string(), Value::String(response.message.clone()));

    let json = serde_json::to_vec(&Value::Object(body)).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if HEADER_LEN + json.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(HEADER_LEN + json.len()));
    }

    let mut out = frame_header(RESPONSE_MAGIC, json.len());
    out.extend_from_slice(&json);
    Ok(out)
}

fn parse_response_body(json: &[u8]) -> Result<Response, ProtocolError> {
    let body: Map<String, Value> =
        serde_json::from_slice(json).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let mut kind = None;
    let mut success = false;
    let mut message = String::new();
    let mut extra = BTreeMap::new();

    for (key, value) in body {
        match (key.as_str(), value) {
            ("type", Value::String(t)) => {
                kind = Some(if t == "error" {
                    ResponseKind::Error
                } else {
                    ResponseKind::Reply(RequestKind::parse(&t).ok_or(ProtocolError::UnknownType(t))?)
                });
            }
            ("success", Value::Bool(b)) => success = b,
            ("success", Value::String(s)) => success = s == "true",
            ("message", Value::String(m)) => message = m,
            (_, Value::String(s)) => {
                extra.insert(key, s);
            }
            (_, other) => {
                extra.insert(key, other.to_string());
            }
        }
    }

    let kind = kind.ok_or_else(|| ProtocolError::InvalidJson("response has no type".into()))?;
    Ok(Response { kind, success, message, extra })
}

pub fn decode_response(buf: &[u8]) -> Result<Response, ProtocolError> {
    let json_len = split_header(buf, RESPONSE_MAGIC)?;
    check_json_len(json_len, buf.len() - HEADER_LEN)?;
    parse_response_body(&buf[HEADER_LEN..HEADER_LEN + json_len])
}

pub fn read_response<R: Read>(reader: &mut R) -> Result<Response, ProtocolError> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf)?;
    let json_len = split_header(&header_buf, RESPONSE_MAGIC)?;
    check_json_len(json_len, MAX_FRAME_SIZE - HEADER_LEN)?;

    let mut json = vec![0u8; json_len];
    reader.read_exact(&mut json)?;
    parse_response_body(&json)
}

pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<(), ProtocolError> {
    writer.write_all(&encode_response(response)?)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn login() -> Request {
        Request {
            kind: RequestKind::Authenticate,
            username: "alice".into(),
            password: "secret".into(),
            face_image: vec![0xFF, 0xD8, 1, 2, 3],
            user_id: None,
        }
    }

    fn raw_frame(json: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = frame_header(REQUEST_MAGIC, json.len());
        out.extend_from_slice(json.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn request_round_trip() {
        let frame = encode_request(&login()).unwrap();
        assert_eq!(&frame[..4], b"FACE");
        assert_eq!(decode_request(&frame).unwrap(), login());
    }

    #[test]
    fn header_length_is_big_endian() {
        let frame = encode_request(&login()).unwrap();
        let json_len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(frame.len(), HEADER_LEN + json_len + 5);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(matches!(decode_request(b"FACE\0\0"), Err(ProtocolError::TooShort(6))));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = encode_request(&login()).unwrap();
        frame[..4].copy_from_slice(b"XXXX");
        assert!(matches!(decode_request(&frame), Err(ProtocolError::BadMagic(m)) if &m == b"XXXX"));
    }

    #[test]
    fn json_length_overrun_is_rejected() {
        let mut frame = encode_request(&login()).unwrap();
        frame[4..8].copy_from_slice(&100_000u32.to_be_bytes());
        assert!(matches!(decode_request(&frame), Err(ProtocolError::JsonLength { .. })));

        frame[4..8].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(decode_request(&frame), Err(ProtocolError::JsonLength { declared: 0, .. })));
    }

    #[test]
    fn face_data_overrun_is_rejected() {
        let frame = raw_frame(r#"{"type":"login","username":"a","password":"b","face_data_size":10}"#, &[1, 2, 3]);
        assert!(matches!(
            decode_request(&frame),
            Err(ProtocolError::FaceDataOverrun { declared: 10, available: 3 })
        ));
    }

    #[test]
    fn unknown_type_and_bad_json_are_rejected() {
        let frame = raw_frame(r#"{"type":"delete","username":"a","password":"b","face_data_size":0}"#, &[]);
        assert!(matches!(decode_request(&frame), Err(ProtocolError::UnknownType(t)) if t == "delete"));

        let frame = raw_frame("{not json", &[]);
        assert!(matches!(decode_request(&frame), Err(ProtocolError::InvalidJson(_))));
    }

    #[test]
    fn update_face_accepts_string_user_id() {
        let frame = raw_frame(r#"{"type":"update_face","user_id":"12","face_data_size":1}"#, &[9]);
        let request = decode_request(&frame).unwrap();
        assert_eq!(request.kind, RequestKind::UpdateFace);
        assert_eq!(request.user_id, Some(12));
        assert_eq!(request.face_image, vec![9]);
    }

    #[test]
    fn read_request_consumes_exactly_one_frame() {
        let mut bytes = encode_request(&login()).unwrap();
        bytes.extend_from_slice(b"trailing");
        let mut cursor = Cursor::new(bytes);

        assert_eq!(read_request(&mut cursor).unwrap(), login());
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"trailing");
    }

    #[test]
    fn oversize_frame_is_rejected_before_reading_payload() {
        let json = format!(
            r#"{{"type":"login","username":"a","password":"b","face_data_size":{}}}"#,
            MAX_FRAME_SIZE
        );
        let mut cursor = Cursor::new(raw_frame(&json, &[]));
        assert!(matches!(read_request(&mut cursor), Err(ProtocolError::FrameTooLarge(_))));

        let request = Request { face_image: vec![0; MAX_FRAME_SIZE], ..login() };
        assert!(matches!(encode_request(&request), Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn huge_face_data_size_is_rejected_without_allocating() {
        let json = format!(
            r#"{{"type":"login","username":"a","password":"b","face_data_size":{}}}"#,
            u64::MAX
        );
        let frame = raw_frame(&json, &[1, 2, 3]);

        assert!(matches!(decode_request(&frame), Err(ProtocolError::FrameTooLarge(_))));
        assert!(matches!(
            read_request(&mut Cursor::new(frame)),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let frame = encode_request(&login()).unwrap();
        let mut cursor = Cursor::new(frame[..frame.len() - 2].to_vec());
        assert!(matches!(read_request(&mut cursor), Err(ProtocolError::Io(_))));
    }

    #[test]
    fn response_echoes_request_type_and_extras() {
        let mut extra = BTreeMap::new();
        extra.insert("face_verified".to_string(), "true".to_string());
        let response = Response::reply(RequestKind::Authenticate, true, "Authentication successful").with_extra(extra);

        let frame = encode_response(&response).unwrap();
        assert_eq!(&frame[..4], b"RESP");
        let json: Value = serde_json::from_slice(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(json["type"], "login");
        assert_eq!(json["success"], true);
        assert_eq!(json["face_verified"], "true");

        assert_eq!(read_response(&mut Cursor::new(frame)).unwrap(), response);
    }

    #[test]
    fn error_response_round_trip() {
        let frame = encode_response(&Response::error("Bad frame magic")).unwrap();
        let decoded = decode_response(&frame).unwrap();
        assert_eq!(decoded.kind, ResponseKind::Error);
        assert!(!decoded.success);
        assert_eq!(decoded.message, "Bad frame magic");
    }
}
