use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use crate::error::{DocError, ErrorRecord};

/// The data carried by actions, responses and stream chunks: structured data plus an
///  optional binary part. The binary part is moved rather than copied on channels that support
///  transfer.
#[derive(Clone, PartialEq, Default)]
pub struct Payload {
    pub value: Value,
    pub binary: Option<Bytes>,
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.binary {
            None => write!(f, "Payload({})", self.value),
            Some(b) => write!(f, "Payload({}+{} bytes)", self.value, b.len()),
        }
    }
}

impl Payload {
    pub fn empty() -> Payload {
        Payload::default()
    }

    pub fn value(value: Value) -> Payload {
        Payload { value, binary: None }
    }

    pub fn binary(data: Bytes) -> Payload {
        Payload { value: Value::Null, binary: Some(data) }
    }

    pub fn with_binary(mut self, data: Bytes) -> Payload {
        self.binary = Some(data);
        self
    }

    pub fn from_serde<T: Serialize>(value: &T) -> Result<Payload, DocError> {
        serde_json::to_value(value)
            .map(Payload::value)
            .map_err(|e| DocError::unknown("payload serialization failed", e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DocError> {
        T::deserialize(&self.value)
            .map_err(|e| DocError::unknown("unexpected payload shape", e.to_string()))
    }

    pub fn binary_len(&self) -> usize {
        self.binary.as_ref().map(|b| b.len()).unwrap_or(0)
    }
}

/// The unit sent over a [crate::channel::Channel].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub source: String,
    pub target: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// fire-and-forget
    Action { action: String, data: Payload },
    Call { action: String, call_id: u64, data: Payload },
    Response { call_id: u64, outcome: Result<Payload, ErrorRecord> },
    Stream { stream_id: u64, op: StreamOp },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOp {
    /// consumer -> producer: invoke the action's stream handler
    Start { action: String, data: Payload, desired_size: i64 },
    StartAck(Result<(), ErrorRecord>),
    Pull { desired_size: i64 },
    PullAck(Result<(), ErrorRecord>),
    Enqueue { chunk: Payload, size: i64 },
    Close,
    Error(ErrorRecord),
    Cancel(ErrorRecord),
    CancelAck(Result<(), ErrorRecord>),
}

impl StreamOp {
    pub fn name(&self) -> &'static str {
        match self {
            StreamOp::Start { .. } => "start",
            StreamOp::StartAck(_) => "startAck",
            StreamOp::Pull { .. } => "pull",
            StreamOp::PullAck(_) => "pullAck",
            StreamOp::Enqueue { .. } => "enqueue",
            StreamOp::Close => "close",
            StreamOp::Error(_) => "error",
            StreamOp::Cancel(_) => "cancel",
            StreamOp::CancelAck(_) => "cancelAck",
        }
    }

    /// true for ops that travel from producer to consumer
    pub fn is_for_consumer(&self) -> bool {
        !matches!(self, StreamOp::Start { .. } | StreamOp::Pull { .. } | StreamOp::Cancel(_))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct PageRequest {
        page_index: u32,
    }

    #[test]
    fn test_decode() {
        let payload = Payload::value(json!({"pageIndex": 3}));
        assert_eq!(payload.decode::<PageRequest>().unwrap(), PageRequest { page_index: 3 });
    }

    #[test]
    fn test_decode_wrong_shape() {
        let payload = Payload::value(json!("abc"));
        match payload.decode::<PageRequest>() {
            Err(DocError::UnknownRemote { .. }) => {}
            other => panic!("expected UnknownRemote, was {:?}", other),
        }
    }

    #[test]
    fn test_debug_shows_binary_len() {
        let payload = Payload::binary(Bytes::from_static(b"1234"));
        assert_eq!(format!("{:?}", payload), "Payload(null+4 bytes)");
    }

    #[test]
    fn test_direction() {
        assert!(!StreamOp::Pull { desired_size: 1 }.is_for_consumer());
        assert!(StreamOp::Close.is_for_consumer());
        assert!(StreamOp::CancelAck(Ok(())).is_for_consumer());
    }
}
