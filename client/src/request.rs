use std::cell::Cell;

use bytes::Bytes;

use tether_protocol::{pack_message, EventType, Value, MAX_SEQUENCE_ID};
use tether_std::errors::RemoteError;

thread_local! {
    static SEQUENCE: Cell<u16> = const { Cell::new(0) };
}

/// Per-producer cycling sequence allocator. Values cycle through
/// `[0, 65534]`; uniqueness only matters among live requests on a single
/// connection, so producers never coordinate.
pub fn next_sequence_id() -> u16 {
    SEQUENCE.with(|cell| {
        let id = cell.get();
        cell.set((id + 1) % MAX_SEQUENCE_ID);
        id
    })
}

#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    parameters: Vec<Value>,
    sequence_number: u16,
}

impl Request {
    /// Parameters are expected to be bound and coerced already.
    pub fn new(method: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            parameters,
            sequence_number: next_sequence_id(),
        }
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    /// Frame this request as `[method, parameters]`.
    pub fn pack(&self) -> Result<Bytes, RemoteError> {
        let body = Value::Array(vec![
            Value::Str(self.method.clone()),
            Value::Array(self.parameters.clone()),
        ]);
        pack_message(self.sequence_number, EventType::Request, Ok(&body))
    }
}
