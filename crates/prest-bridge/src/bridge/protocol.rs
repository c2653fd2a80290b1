//! Wire protocol spoken with the core over its stdin/stdout.
//!
//! A request is the operation name as a string followed by the request payload.
//! The core answers with a stream of [`Message`]s: any number of `Progress` and
//! `Log` messages, terminated by exactly one `AnswerFollows` (response payload
//! follows) or `Error`.

use std::io::{Read, Write};

use thiserror::Error;

use crate::codec::{
    BytesCodec, Codec, CodecError, Record, StrCodec, TaggedUnion, UnitCodec, VarintCodec,
    mapped, record_of,
};
use crate::progress::{Cancelled, ProgressTracker};

/// Operation name that asks the core to exit.
pub const QUIT: &str = "quit";

/// Target under which core log messages are re-emitted.
pub const CORE_LOG_TARGET: &str = "prest::core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Unknown codes are treated as `Info`.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            3 => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }
}

/// Failure reported by the core for one call. The connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteFailure {
    pub message: String,
    /// Opaque details attached by the core.
    pub extra: Vec<u8>,
}

impl Record for RemoteFailure {
    const NAME: &'static str = "Error";
    const FIELDS: &'static [&'static str] = &["message", "extra"];

    type Fields = (String, Vec<u8>);

    fn from_fields((message, extra): Self::Fields) -> Self {
        Self { message, extra }
    }

    fn to_fields(&self) -> Self::Fields {
        (self.message.clone(), self.extra.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl Record for LogRecord {
    const NAME: &'static str = "Log";
    const FIELDS: &'static [&'static str] = &["level", "message"];

    type Fields = (LogLevel, String);

    fn from_fields((level, message): Self::Fields) -> Self {
        Self { level, message }
    }

    fn to_fields(&self) -> Self::Fields {
        (self.level, self.message.clone())
    }
}

/// One message on the core's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Progress(u64),
    AnswerFollows,
    Error(RemoteFailure),
    Log(LogRecord),
}

/// Outcome of a single request/response exchange, before it is mapped onto the
/// connection state.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The stream ended or broke. The core is gone.
    #[error("connection closed: {0}")]
    Closed(#[source] CodecError),

    #[error("malformed response: {0}")]
    Malformed(#[source] CodecError),

    #[error(transparent)]
    Remote(RemoteFailure),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ExchangeError {
    fn from_codec(e: CodecError) -> Self {
        if e.is_disconnect() {
            Self::Closed(e)
        } else {
            Self::Malformed(e)
        }
    }
}

/// Receives what the core reports while a call is in flight.
pub trait CallObserver {
    /// Returning `Err` aborts the call.
    fn progress(&mut self, position: u64) -> Result<(), Cancelled>;

    fn log(&mut self, record: &LogRecord) {
        forward_core_log(record);
    }
}

impl CallObserver for ProgressTracker {
    fn progress(&mut self, position: u64) -> Result<(), Cancelled> {
        self.set_position(position)
    }
}

/// Re-emit a core log message as a tracing event.
pub fn forward_core_log(record: &LogRecord) {
    let message = record.message.as_str();
    match record.level {
        LogLevel::Debug => tracing::debug!(target: CORE_LOG_TARGET, "{message}"),
        LogLevel::Info => tracing::info!(target: CORE_LOG_TARGET, "{message}"),
        LogLevel::Warn => tracing::warn!(target: CORE_LOG_TARGET, "{message}"),
        LogLevel::Error => tracing::error!(target: CORE_LOG_TARGET, "{message}"),
    }
}

/// Message codec plus the request/response loop.
#[derive(Debug)]
pub struct Protocol {
    messages: TaggedUnion<Message>,
}

impl Protocol {
    pub fn new() -> Result<Self, CodecError> {
        let level = mapped(VarintCodec, LogLevel::from_code, |l: &LogLevel| l.code());
        let messages = TaggedUnion::<Message>::builder("Message")
            .variant(0, VarintCodec, Message::Progress, |m| match m {
                Message::Progress(position) => Some(position),
                _ => None,
            })
            .variant(1, UnitCodec, |()| Message::AnswerFollows, |m| {
                matches!(m, Message::AnswerFollows).then_some(&())
            })
            .variant(
                2,
                record_of::<RemoteFailure, _>((StrCodec, BytesCodec))?,
                Message::Error,
                |m| match m {
                    Message::Error(failure) => Some(failure),
                    _ => None,
                },
            )
            .variant(
                3,
                record_of::<LogRecord, _>((level, StrCodec))?,
                Message::Log,
                |m| match m {
                    Message::Log(record) => Some(record),
                    _ => None,
                },
            )
            .build()?;
        Ok(Self { messages })
    }

    pub fn messages(&self) -> &TaggedUnion<Message> {
        &self.messages
    }

    /// Write `operation` and its pre-encoded payload, then flush.
    pub fn write_request(
        &self,
        sink: &mut dyn Write,
        operation: &str,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        StrCodec.encode_str(sink, operation)?;
        sink.write_all(payload)?;
        sink.flush()?;
        Ok(())
    }

    /// Consume messages until the call terminates; decode the answer with `codec`.
    pub fn read_response<C: Codec + ?Sized>(
        &self,
        source: &mut dyn Read,
        codec: &C,
        observer: &mut dyn CallObserver,
    ) -> Result<C::Value, ExchangeError> {
        loop {
            let message = self
                .messages
                .decode(source)
                .map_err(ExchangeError::from_codec)?;
            match message {
                Message::Progress(position) => {
                    tracing::trace!(position, "progress");
                    observer.progress(position)?;
                }
                Message::Log(record) => observer.log(&record),
                Message::AnswerFollows => {
                    return codec.decode(source).map_err(ExchangeError::from_codec);
                }
                Message::Error(failure) => return Err(ExchangeError::Remote(failure)),
            }
        }
    }

    /// One full request/response exchange.
    pub fn exchange<C: Codec + ?Sized>(
        &self,
        sink: &mut dyn Write,
        source: &mut dyn Read,
        operation: &str,
        payload: &[u8],
        codec: &C,
        observer: &mut dyn CallObserver,
    ) -> Result<C::Value, ExchangeError> {
        self.write_request(sink, operation, payload)
            .map_err(ExchangeError::from_codec)?;
        self.read_response(source, codec, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CancellationToken;
    use std::io::Cursor;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        cancel_at: Option<u64>,
    }

    impl CallObserver for Recorder {
        fn progress(&mut self, position: u64) -> Result<(), Cancelled> {
            if self.cancel_at == Some(position) {
                return Err(Cancelled);
            }
            self.events.push(format!("progress {position}"));
            Ok(())
        }

        fn log(&mut self, record: &LogRecord) {
            self.events
                .push(format!("log {:?} {}", record.level, record.message));
        }
    }

    fn stream(protocol: &Protocol, messages: &[Message], tail: &[u8]) -> Cursor<Vec<u8>> {
        let mut bytes = Vec::new();
        for m in messages {
            protocol.messages().encode(&mut bytes, m).unwrap();
        }
        bytes.extend_from_slice(tail);
        Cursor::new(bytes)
    }

    #[test]
    fn progress_and_logs_arrive_in_order_before_answer() {
        let protocol = Protocol::new().unwrap();
        let answer = VarintCodec.encode_to_vec(&42).unwrap();
        let mut source = stream(
            &protocol,
            &[
                Message::Progress(1),
                Message::Log(LogRecord {
                    level: LogLevel::Warn,
                    message: "hi".into(),
                }),
                Message::Progress(2),
                Message::AnswerFollows,
            ],
            &answer,
        );

        let mut recorder = Recorder::default();
        let value = protocol
            .read_response(&mut source, &VarintCodec, &mut recorder)
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(
            recorder.events,
            vec!["progress 1", "log Warn hi", "progress 2"]
        );
    }

    #[test]
    fn remote_error_is_reported_verbatim() {
        let protocol = Protocol::new().unwrap();
        let mut source = stream(
            &protocol,
            &[Message::Error(RemoteFailure {
                message: "boom".into(),
                extra: vec![1, 2],
            })],
            &[],
        );
        let err = protocol
            .read_response(&mut source, &VarintCodec, &mut Recorder::default())
            .unwrap_err();
        let failure = match err {
            ExchangeError::Remote(failure) => failure,
            other => panic!("expected remote failure, got {other:?}"),
        };
        assert_eq!(failure.to_string(), "boom");
        assert_eq!(failure.extra, vec![1, 2]);
    }

    #[test]
    fn immediate_eof_means_closed() {
        let protocol = Protocol::new().unwrap();
        let err = protocol
            .read_response(&mut Cursor::new(Vec::<u8>::new()), &VarintCodec, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Closed(CodecError::Eof)));
    }

    #[test]
    fn eof_inside_answer_means_closed() {
        let protocol = Protocol::new().unwrap();
        let mut source = stream(&protocol, &[Message::AnswerFollows], &[]);
        let err = protocol
            .read_response(&mut source, &StrCodec, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Closed(_)));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let protocol = Protocol::new().unwrap();
        let err = protocol
            .read_response(&mut Cursor::new(vec![9]), &VarintCodec, &mut Recorder::default())
            .unwrap_err();
        let inner = match err {
            ExchangeError::Malformed(inner) => inner,
            other => panic!("expected malformed, got {other:?}"),
        };
        insta::assert_snapshot!(inner.to_string(), @"cannot decode enum tag: Message/9");
    }

    #[test]
    fn observer_cancellation_stops_the_loop() {
        let protocol = Protocol::new().unwrap();
        let mut source = stream(
            &protocol,
            &[Message::Progress(1), Message::Progress(2), Message::AnswerFollows],
            &[0],
        );
        let mut recorder = Recorder {
            cancel_at: Some(2),
            ..Default::default()
        };
        let err = protocol
            .read_response(&mut source, &VarintCodec, &mut recorder)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Cancelled(_)));
        assert_eq!(recorder.events, vec!["progress 1"]);
    }

    #[test]
    fn cancelled_tracker_aborts_on_progress() {
        let protocol = Protocol::new().unwrap();
        let mut source = stream(&protocol, &[Message::Progress(5)], &[]);
        let token = CancellationToken::new();
        token.cancel();
        let mut tracker = ProgressTracker::new(token);
        let err = protocol
            .read_response(&mut source, &VarintCodec, &mut tracker)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Cancelled(_)));
    }

    #[test]
    fn request_is_operation_then_payload() {
        let protocol = Protocol::new().unwrap();
        let mut sink = Vec::new();
        let payload = StrCodec.encode_to_vec(&"hi".to_string()).unwrap();
        protocol.write_request(&mut sink, "echo", &payload).unwrap();
        assert_eq!(sink, b"\x04echo\x02hi");
    }

    #[test]
    fn unknown_log_level_reads_as_info() {
        let protocol = Protocol::new().unwrap();
        // tag 3, level 7, message "x"
        let decoded = protocol
            .messages()
            .decode_from_slice(&[3, 7, 1, b'x'])
            .unwrap();
        assert_eq!(
            decoded,
            Message::Log(LogRecord {
                level: LogLevel::Info,
                message: "x".into()
            })
        );
    }

    #[test]
    fn message_wire_bytes() {
        let protocol = Protocol::new().unwrap();
        let bytes = protocol
            .messages()
            .encode_to_vec(&Message::Error(RemoteFailure {
                message: "no".into(),
                extra: vec![],
            }))
            .unwrap();
        assert_eq!(bytes, vec![2, 2, b'n', b'o', 0]);
    }
}
