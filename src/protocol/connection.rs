//! A typed, deadline-aware message stream over any byte channel.
//!
//! Frames are length-delimited; inside a frame the header tag (a single
//! msgpack integer) selects the payload variant, followed by the payload
//! encoded with named fields so either peer can grow a struct without
//! breaking the other.

use std::io::Cursor;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::common::make_protocol_builder;
use crate::protocol::messages::{
    CompileJob, CompileResult, Message, MessageTag, WorkerResponse, WorkerState,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MessageConnection<T> {
    frames: Framed<T, LengthDelimitedCodec>,
    timeout: Duration,
}

impl<T: AsyncRead + AsyncWrite + Unpin> MessageConnection<T> {
    pub fn new(stream: T, timeout: Duration) -> MessageConnection<T> {
        MessageConnection {
            frames: make_protocol_builder().new_framed(stream),
            timeout,
        }
    }

    /// Sends one message, giving up with `Timeout` when the peer does not
    /// accept it within the connection deadline.
    pub async fn send(&mut self, message: &Message) -> crate::Result<()> {
        let frame = encode_message(message)?;
        match tokio::time::timeout(self.timeout, self.frames.send(frame)).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(crate::Error::Timeout),
        }
    }

    /// Reads the next message of any type.
    pub async fn read(&mut self) -> crate::Result<Message> {
        let frame = match tokio::time::timeout(self.timeout, self.frames.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Err(crate::Error::ConnectionClosed),
            Err(_) => return Err(crate::Error::Timeout),
        };
        decode_message(&frame)
    }

    pub async fn read_compile_job(&mut self) -> crate::Result<CompileJob> {
        match self.read().await? {
            Message::CompileJob(job) => Ok(job),
            other => Err(crate::Error::UnexpectedMessage(
                "CompileJob",
                other.type_name(),
            )),
        }
    }

    pub async fn read_compile_result(&mut self) -> crate::Result<CompileResult> {
        match self.read().await? {
            Message::CompileResult(result) => Ok(result),
            other => Err(crate::Error::UnexpectedMessage(
                "CompileResult",
                other.type_name(),
            )),
        }
    }

    pub async fn read_worker_response(&mut self) -> crate::Result<WorkerResponse> {
        match self.read().await? {
            Message::WorkerResponse(response) => Ok(response),
            other => Err(crate::Error::UnexpectedMessage(
                "WorkerResponse",
                other.type_name(),
            )),
        }
    }

    pub async fn read_worker_state(&mut self) -> crate::Result<WorkerState> {
        match self.read().await? {
            Message::WorkerState(state) => Ok(state),
            other => Err(crate::Error::UnexpectedMessage(
                "WorkerState",
                other.type_name(),
            )),
        }
    }
}

/// Appends the default port when the address does not carry one.
pub fn add_port_if_needed(address: &str, default_port: u16) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, default_port)
    }
}

/// Opens a TCP message connection to `host` or `host:port`.
pub async fn connect(
    address: &str,
    default_port: u16,
    timeout: Duration,
) -> crate::Result<MessageConnection<TcpStream>> {
    let address = add_port_if_needed(address, default_port);
    let stream = TcpStream::connect(&address).await?;
    stream.set_nodelay(true)?;
    Ok(MessageConnection::new(stream, timeout))
}

fn encode_message(message: &Message) -> crate::Result<Bytes> {
    let mut writer = BytesMut::new().writer();
    rmp_serde::encode::write(&mut writer, &(message.tag() as u8))?;
    match message {
        Message::CompileJob(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::CompileResult(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::WorkerRequest(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::WorkerResponse(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::WorkerState(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::MonitorRequest(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::CompletedJob(m) => rmp_serde::encode::write_named(&mut writer, m)?,
        Message::ServerStateInfo(m) => rmp_serde::encode::write_named(&mut writer, m)?,
    }
    Ok(writer.into_inner().freeze())
}

fn decode_message(frame: &[u8]) -> crate::Result<Message> {
    let mut reader = Cursor::new(frame);
    let tag: u8 = rmp_serde::decode::from_read(&mut reader)?;
    let tag = MessageTag::from_u8(tag).ok_or(crate::Error::UnknownTag(tag))?;

    Ok(match tag {
        MessageTag::CompileJob => Message::CompileJob(rmp_serde::decode::from_read(&mut reader)?),
        MessageTag::CompileResult => {
            Message::CompileResult(rmp_serde::decode::from_read(&mut reader)?)
        }
        MessageTag::WorkerRequest => {
            Message::WorkerRequest(rmp_serde::decode::from_read(&mut reader)?)
        }
        MessageTag::WorkerResponse => {
            Message::WorkerResponse(rmp_serde::decode::from_read(&mut reader)?)
        }
        MessageTag::WorkerState => Message::WorkerState(rmp_serde::decode::from_read(&mut reader)?),
        MessageTag::MonitorRequest => {
            Message::MonitorRequest(rmp_serde::decode::from_read(&mut reader)?)
        }
        MessageTag::CompletedJob => {
            Message::CompletedJob(rmp_serde::decode::from_read(&mut reader)?)
        }
        MessageTag::ServerStateInfo => {
            Message::ServerStateInfo(rmp_serde::decode::from_read(&mut reader)?)
        }
    })
}
