use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use tether_std::compression;
use tether_std::errors::{RemoteError, TetherError};

use crate::header::{decode_header, encode_header, EventType, Header, HEADER_SIZE};
use crate::value::Value;

/// Payloads longer than this are Brotli-compressed by the sender.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// A parsed request as the server sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sequence_number: u16,
    pub method: String,
    pub args: Vec<Value>,
}

/// A parsed response as the client sees it. A non-zero errno on the wire
/// arrives rehydrated into the matching error kind.
#[derive(Debug)]
pub struct Response {
    pub sequence_number: u16,
    pub result: Result<Value, RemoteError>,
}

fn encode_value(value: &Value) -> Result<Vec<u8>, RemoteError> {
    let mut data = Vec::new();
    rmpv::encode::write_value(&mut data, &value.to_rmpv())
        .map_err(|e| RemoteError::PackUnpack(e.to_string()))?;
    Ok(data)
}

/// Serialize one message and prepend its header. An error body stringifies
/// the error and stamps its errno into the header.
pub fn pack_message(
    sequence_number: u16,
    event_type: EventType,
    body: Result<&Value, &RemoteError>,
) -> Result<Bytes, RemoteError> {
    let (errno, mut data) = match body {
        Ok(value) => (0, encode_value(value)?),
        Err(error) => (
            error.wire_errno(),
            encode_value(&Value::Str(error.to_string()))?,
        ),
    };

    let compress_flag = if data.len() > COMPRESS_THRESHOLD {
        data = compression::compress(&data).map_err(|e| RemoteError::PackUnpack(e.to_string()))?;
        1
    } else {
        0
    };

    let header = encode_header(
        data.len() as u32,
        sequence_number,
        compress_flag,
        errno,
        event_type as u8,
    );
    let mut buffer = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buffer.put_slice(&header);
    buffer.put_slice(&data);
    Ok(buffer.freeze())
}

/// Decompress (when flagged) and decode one payload.
pub fn unpack_payload(compress_flag: u8, data: &[u8]) -> Result<Value, RemoteError> {
    let decompressed;
    let mut cursor = if compress_flag != 0 {
        decompressed =
            compression::decompress(data).map_err(|e| RemoteError::PackUnpack(e.to_string()))?;
        decompressed.as_slice()
    } else {
        data
    };

    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| RemoteError::PackUnpack(e.to_string()))?;
    if !cursor.is_empty() {
        return Err(RemoteError::PackUnpack(format!(
            "{} trailing bytes after payload",
            cursor.len()
        )));
    }
    Value::from_rmpv(value)
}

/// Shared reassembly state for both directions: an optional in-progress
/// header, and a poison slot. Once any frame fails to parse, every later
/// call re-raises the stored error and drops buffered input; the owning
/// transport is expected to close.
#[derive(Debug, Default)]
struct FrameState {
    header: Option<Header>,
    poisoned: Option<RemoteError>,
}

impl FrameState {
    fn decode<T>(
        &mut self,
        src: &mut BytesMut,
        expected: EventType,
        finish: impl Fn(Header, Value) -> Result<T, RemoteError>,
    ) -> Result<Option<T>, TetherError> {
        if let Some(error) = &self.poisoned {
            src.clear();
            return Err(error.clone().into());
        }

        match self.try_decode(src, expected, finish) {
            Ok(item) => Ok(item),
            Err(error) => {
                self.poisoned = Some(error.clone());
                src.clear();
                Err(error.into())
            }
        }
    }

    fn try_decode<T>(
        &mut self,
        src: &mut BytesMut,
        expected: EventType,
        finish: impl Fn(Header, Value) -> Result<T, RemoteError>,
    ) -> Result<Option<T>, RemoteError> {
        loop {
            match self.header {
                None => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let mut raw = [0u8; HEADER_SIZE];
                    raw.copy_from_slice(&src.split_to(HEADER_SIZE));
                    let header = decode_header(&raw)?;
                    if header.event_type != expected as u8 {
                        return Err(RemoteError::Frame(format!(
                            "expect {expected:?}, got event type {}",
                            header.event_type
                        )));
                    }
                    src.reserve(header.payload_size as usize);
                    self.header = Some(header);
                }
                Some(header) => {
                    if src.len() < header.payload_size as usize {
                        return Ok(None);
                    }
                    let body = src.split_to(header.payload_size as usize);
                    self.header = None;
                    let value = unpack_payload(header.compress_flag, &body)?;
                    return finish(header, value).map(Some);
                }
            }
        }
    }
}

/// Server-side decoder: reassembles REQUEST frames into [`Message`]s.
#[derive(Debug, Default)]
pub struct RequestCodec {
    state: FrameState,
}

impl Decoder for RequestCodec {
    type Item = Message;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TetherError> {
        self.state.decode(src, EventType::Request, parse_request)
    }
}

fn parse_request(header: Header, value: Value) -> Result<Message, RemoteError> {
    fn invalid(value: &Value) -> RemoteError {
        RemoteError::ContentVerifyFailed(format!("invalid request: {value:?}"))
    }

    match value {
        Value::Array(mut items) if items.len() == 2 => {
            let args = items.pop().unwrap_or(Value::Nil);
            let method = items.pop().unwrap_or(Value::Nil);
            match (method, args) {
                (Value::Str(method), Value::Array(args)) => Ok(Message {
                    sequence_number: header.sequence_number,
                    method,
                    args,
                }),
                (method, args) => Err(invalid(&Value::Array(vec![method, args]))),
            }
        }
        other => Err(invalid(&other)),
    }
}

/// Client-side decoder: reassembles RESPONSE frames into [`Response`]s.
#[derive(Debug, Default)]
pub struct ResponseCodec {
    state: FrameState,
}

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, TetherError> {
        self.state.decode(src, EventType::Response, parse_response)
    }
}

fn parse_response(header: Header, value: Value) -> Result<Response, RemoteError> {
    let result = if header.errno != 0 {
        let message = match value {
            Value::Str(message) => message,
            other => format!("{other:?}"),
        };
        Err(RemoteError::from_wire(header.errno, message))
    } else {
        Ok(value)
    };

    Ok(Response {
        sequence_number: header.sequence_number,
        result,
    })
}
