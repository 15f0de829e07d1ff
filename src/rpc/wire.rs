//! Binary encoding of [Message]s for channels that cross a process boundary.
//!
//! ```ascii
//! message:  source (string) | target (string) | body kind (u8) | body
//! string:   length (varint) | UTF-8 bytes
//! payload:  JSON text (length-prefixed) | binary marker (u8) | [binary (length-prefixed)]
//! error:    kind (string) | message (string) | status (opt u16) | code (opt u8) | details (opt string)
//! outcome:  1 | payload     - success
//!           0 | error       - failure
//! ```
//!
//! Body kinds:
//! ```ascii
//! 1 ACTION    action | payload
//! 2 CALL      action | call id (varint) | payload
//! 3 RESPONSE  call id (varint) | outcome
//! 4 STREAM    stream id (varint) | stream op (u8) | op fields
//! ```
//!
//! Ids and sizes are varint encoded, desired sizes as zigzag varints since they can become
//!  negative.

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::Value;

use crate::error::ErrorRecord;
use crate::rpc::message::{Message, MessageBody, Payload, StreamOp};
use crate::util::buf::{put_bytes, put_opt_string, put_string, try_get_bool, try_get_bytes, try_get_i64_varint, try_get_opt_string, try_get_string, try_get_u64_varint};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum BodyKind {
    Action = 1,
    Call = 2,
    Response = 3,
    Stream = 4,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum StreamOpKind {
    Start = 1,
    StartAck = 2,
    Pull = 3,
    PullAck = 4,
    Enqueue = 5,
    Close = 6,
    Error = 7,
    Cancel = 8,
    CancelAck = 9,
}

impl Message {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_string(buf, &self.source);
        put_string(buf, &self.target);

        match &self.body {
            MessageBody::Action { action, data } => {
                buf.put_u8(BodyKind::Action.into());
                put_string(buf, action);
                ser_payload(data, buf)?;
            }
            MessageBody::Call { action, call_id, data } => {
                buf.put_u8(BodyKind::Call.into());
                put_string(buf, action);
                buf.put_u64_varint(*call_id);
                ser_payload(data, buf)?;
            }
            MessageBody::Response { call_id, outcome } => {
                buf.put_u8(BodyKind::Response.into());
                buf.put_u64_varint(*call_id);
                match outcome {
                    Ok(payload) => {
                        buf.put_u8(1);
                        ser_payload(payload, buf)?;
                    }
                    Err(record) => {
                        buf.put_u8(0);
                        ser_error(record, buf);
                    }
                }
            }
            MessageBody::Stream { stream_id, op } => {
                buf.put_u8(BodyKind::Stream.into());
                buf.put_u64_varint(*stream_id);
                ser_stream_op(op, buf)?;
            }
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let source = try_get_string(buf)?;
        let target = try_get_string(buf)?;

        let kind = BodyKind::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid message body kind {}", e.number))?;

        let body = match kind {
            BodyKind::Action => MessageBody::Action {
                action: try_get_string(buf)?,
                data: deser_payload(buf)?,
            },
            BodyKind::Call => MessageBody::Call {
                action: try_get_string(buf)?,
                call_id: try_get_u64_varint(buf)?,
                data: deser_payload(buf)?,
            },
            BodyKind::Response => {
                let call_id = try_get_u64_varint(buf)?;
                let outcome = if try_get_bool(buf)? {
                    Ok(deser_payload(buf)?)
                }
                else {
                    Err(deser_error(buf)?)
                };
                MessageBody::Response { call_id, outcome }
            }
            BodyKind::Stream => MessageBody::Stream {
                stream_id: try_get_u64_varint(buf)?,
                op: deser_stream_op(buf)?,
            },
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after message", buf.remaining()));
        }

        Ok(Message { source, target, body })
    }
}

fn ser_payload(payload: &Payload, buf: &mut BytesMut) -> anyhow::Result<()> {
    let json = serde_json::to_vec(&payload.value)?;
    put_bytes(buf, &json);
    match &payload.binary {
        None => buf.put_u8(0),
        Some(data) => {
            buf.put_u8(1);
            put_bytes(buf, data);
        }
    }
    Ok(())
}

fn deser_payload(buf: &mut impl Buf) -> anyhow::Result<Payload> {
    let json = try_get_bytes(buf)?;
    let value: Value = serde_json::from_slice(&json)?;
    let binary = if try_get_bool(buf)? {
        Some(try_get_bytes(buf)?)
    }
    else {
        None
    };
    Ok(Payload { value, binary })
}

fn ser_error(record: &ErrorRecord, buf: &mut BytesMut) {
    put_string(buf, &record.kind);
    put_string(buf, &record.message);
    match record.status {
        None => buf.put_u8(0),
        Some(status) => {
            buf.put_u8(1);
            buf.put_u16(status);
        }
    }
    match record.code {
        None => buf.put_u8(0),
        Some(code) => {
            buf.put_u8(1);
            buf.put_u8(code);
        }
    }
    put_opt_string(buf, record.details.as_deref());
}

fn deser_error(buf: &mut impl Buf) -> anyhow::Result<ErrorRecord> {
    let kind = try_get_string(buf)?;
    let message = try_get_string(buf)?;
    let status = if try_get_bool(buf)? { Some(buf.try_get_u16()?) } else { None };
    let code = if try_get_bool(buf)? { Some(buf.try_get_u8()?) } else { None };
    let details = try_get_opt_string(buf)?;
    Ok(ErrorRecord { kind, message, status, code, details })
}

fn ser_ack(ack: &Result<(), ErrorRecord>, buf: &mut BytesMut) {
    match ack {
        Ok(()) => buf.put_u8(1),
        Err(record) => {
            buf.put_u8(0);
            ser_error(record, buf);
        }
    }
}

fn deser_ack(buf: &mut impl Buf) -> anyhow::Result<Result<(), ErrorRecord>> {
    if try_get_bool(buf)? {
        Ok(Ok(()))
    }
    else {
        Ok(Err(deser_error(buf)?))
    }
}

fn ser_stream_op(op: &StreamOp, buf: &mut BytesMut) -> anyhow::Result<()> {
    match op {
        StreamOp::Start { action, data, desired_size } => {
            buf.put_u8(StreamOpKind::Start.into());
            put_string(buf, action);
            ser_payload(data, buf)?;
            buf.put_i64_varint(*desired_size);
        }
        StreamOp::StartAck(ack) => {
            buf.put_u8(StreamOpKind::StartAck.into());
            ser_ack(ack, buf);
        }
        StreamOp::Pull { desired_size } => {
            buf.put_u8(StreamOpKind::Pull.into());
            buf.put_i64_varint(*desired_size);
        }
        StreamOp::PullAck(ack) => {
            buf.put_u8(StreamOpKind::PullAck.into());
            ser_ack(ack, buf);
        }
        StreamOp::Enqueue { chunk, size } => {
            buf.put_u8(StreamOpKind::Enqueue.into());
            ser_payload(chunk, buf)?;
            buf.put_i64_varint(*size);
        }
        StreamOp::Close => buf.put_u8(StreamOpKind::Close.into()),
        StreamOp::Error(record) => {
            buf.put_u8(StreamOpKind::Error.into());
            ser_error(record, buf);
        }
        StreamOp::Cancel(record) => {
            buf.put_u8(StreamOpKind::Cancel.into());
            ser_error(record, buf);
        }
        StreamOp::CancelAck(ack) => {
            buf.put_u8(StreamOpKind::CancelAck.into());
            ser_ack(ack, buf);
        }
    }
    Ok(())
}

fn deser_stream_op(buf: &mut impl Buf) -> anyhow::Result<StreamOp> {
    let kind = StreamOpKind::try_from(buf.try_get_u8()?)
        .map_err(|e| anyhow!("invalid stream op {}", e.number))?;

    let op = match kind {
        StreamOpKind::Start => StreamOp::Start {
            action: try_get_string(buf)?,
            data: deser_payload(buf)?,
            desired_size: try_get_i64_varint(buf)?,
        },
        StreamOpKind::StartAck => StreamOp::StartAck(deser_ack(buf)?),
        StreamOpKind::Pull => StreamOp::Pull { desired_size: try_get_i64_varint(buf)? },
        StreamOpKind::PullAck => StreamOp::PullAck(deser_ack(buf)?),
        StreamOpKind::Enqueue => StreamOp::Enqueue {
            chunk: deser_payload(buf)?,
            size: try_get_i64_varint(buf)?,
        },
        StreamOpKind::Close => StreamOp::Close,
        StreamOpKind::Error => StreamOp::Error(deser_error(buf)?),
        StreamOpKind::Cancel => StreamOp::Cancel(deser_error(buf)?),
        StreamOpKind::CancelAck => StreamOp::CancelAck(deser_ack(buf)?),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use serde_json::json;
    use crate::error::DocError;
    use super::*;

    fn msg(body: MessageBody) -> Message {
        Message {
            source: "main".to_string(),
            target: "worker".to_string(),
            body,
        }
    }

    #[test]
    fn test_ser_action_layout() {
        let mut buf = BytesMut::new();
        msg(MessageBody::Action { action: "Go".to_string(), data: Payload::empty() })
            .ser(&mut buf).unwrap();

        let expected: &[u8] = b"\x04main\x06worker\x01\x02Go\x04null\x00";
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::call(msg(MessageBody::Call { action: "GetPage".to_string(), call_id: 300, data: Payload::value(json!({"pageIndex": 0})) }))]
    #[case::response_ok(msg(MessageBody::Response { call_id: 7, outcome: Ok(Payload::binary(Bytes::from_static(b"abc"))) }))]
    #[case::response_err(msg(MessageBody::Response { call_id: 7, outcome: Err(DocError::UnexpectedResponse { message: "x".to_string(), status: 500 }.to_record()) }))]
    #[case::start(msg(MessageBody::Stream { stream_id: 1, op: StreamOp::Start { action: "GetReader".to_string(), data: Payload::empty(), desired_size: -3 } }))]
    #[case::enqueue(msg(MessageBody::Stream { stream_id: 2, op: StreamOp::Enqueue { chunk: Payload::binary(Bytes::from_static(&[0, 255])), size: 1 } }))]
    #[case::cancel(msg(MessageBody::Stream { stream_id: 2, op: StreamOp::Cancel(DocError::abort("stop").to_record()) }))]
    #[case::cancel_ack_err(msg(MessageBody::Stream { stream_id: 2, op: StreamOp::CancelAck(Err(DocError::unknown("m", "d").to_record())) }))]
    fn test_deser_reverses_ser(#[case] message: Message) {
        let mut buf = BytesMut::new();
        message.ser(&mut buf).unwrap();

        let mut parse_buf = buf.freeze();
        assert_eq!(Message::deser(&mut parse_buf).unwrap(), message);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::bad_kind(b"\x04main\x06worker\x09")]
    #[case::bad_stream_op(b"\x04main\x06worker\x04\x01\x63")]
    #[case::truncated_payload(b"\x04main\x06worker\x01\x02Go\x09nu")]
    #[case::trailing(b"\x04main\x06worker\x04\x01\x06\x00")]
    fn test_deser_invalid(#[case] mut buf: &[u8]) {
        assert!(Message::deser(&mut buf).is_err());
    }
}
