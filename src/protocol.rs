use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

pub const SUBSYSTEM: &str = "smtp-in";

/// A lone dot terminates the data stream in both directions.
pub const END_OF_DATA: &[u8] = b".";

const DELIMITER: u8 = b'|';

// kind|version|timestamp|subsystem|event|session
const ENVELOPE_FIELDS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated line, expected at least 6 fields: {0:?}")]
    Truncated(String),
    #[error("unknown line kind {0:?}")]
    UnknownKind(String),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("invalid protocol version {0:?}")]
    InvalidVersion(String),
    #[error("{event} is registered as {registered} but was received as {received}")]
    KindMismatch {
        event: Event,
        registered: Kind,
        received: Kind,
    },
    #[error("{0} received without a token")]
    MissingToken(Event),
    #[error("{event} is missing parameter {index}")]
    MissingParam { event: Event, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Fire-and-forget notification.
    Report,
    /// Requires a response from the filter.
    Filter,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Report => "report",
            Kind::Filter => "filter",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    LinkConnect,
    LinkDisconnect,
    LinkIdentify,
    TxBegin,
    TxMail,
    TxRcpt,
    TxData,
    TxCommit,
    TxRollback,
    Commit,
    DataLine,
}

impl Event {
    /// Every event the filter registers for, in registration order.
    pub const ALL: [Event; 11] = [
        Event::LinkConnect,
        Event::LinkDisconnect,
        Event::LinkIdentify,
        Event::TxBegin,
        Event::TxMail,
        Event::TxRcpt,
        Event::TxData,
        Event::TxCommit,
        Event::TxRollback,
        Event::Commit,
        Event::DataLine,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Event::LinkConnect => "link-connect",
            Event::LinkDisconnect => "link-disconnect",
            Event::LinkIdentify => "link-identify",
            Event::TxBegin => "tx-begin",
            Event::TxMail => "tx-mail",
            Event::TxRcpt => "tx-rcpt",
            Event::TxData => "tx-data",
            Event::TxCommit => "tx-commit",
            Event::TxRollback => "tx-rollback",
            Event::Commit => "commit",
            Event::DataLine => "data-line",
        }
    }

    pub fn kind(self) -> Kind {
        match self {
            Event::Commit | Event::DataLine => Kind::Filter,
            _ => Kind::Report,
        }
    }

    pub fn from_name(name: &str) -> Option<Event> {
        Event::ALL.into_iter().find(|event| event.name() == name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol version announced in field 1 of every event line.
///
/// The version decides both the position of some event parameters and the
/// order of the session and token fields in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    /// First version announcing the HELO/EHLO method in link-identify and
    /// answering with the session id before the token.
    pub const SESSION_FIRST: ProtocolVersion = ProtocolVersion::new(0, 5);
    /// First version placing the status before the address in tx-mail/tx-rcpt.
    pub const STATUS_FIRST: ProtocolVersion = ProtocolVersion::new(0, 6);

    pub const fn new(major: u32, minor: u32) -> Self {
        ProtocolVersion { major, minor }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidVersion(text.to_string());
        let (major, minor) = text.split_once('.').ok_or_else(invalid)?;
        Ok(ProtocolVersion {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A decoded report or filter line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLine {
    pub kind: Kind,
    pub version: ProtocolVersion,
    pub timestamp: String,
    pub subsystem: String,
    pub event: Event,
    pub session: String,
    /// Fields after the session id. For filter events the first one is the token.
    pub params: Vec<String>,
    /// The same fields as received, message content is not necessarily UTF-8.
    raw: Vec<u8>,
}

impl EventLine {
    pub fn param(&self, index: usize) -> Result<&str, ProtocolError> {
        self.params
            .get(index)
            .map(String::as_str)
            .ok_or(ProtocolError::MissingParam {
                event: self.event,
                index,
            })
    }

    pub fn token(&self) -> Result<&str, ProtocolError> {
        match self.kind {
            Kind::Filter => self.param(0),
            Kind::Report => Err(ProtocolError::MissingToken(self.event)),
        }
    }

    /// Raw parameters from `index` on, delimiters included. Message lines are
    /// free text and may contain the delimiter themselves.
    pub fn rest(&self, index: usize) -> Result<&[u8], ProtocolError> {
        self.param(index)?;
        Ok(self
            .raw
            .splitn(index + 1, |b| *b == DELIMITER)
            .nth(index)
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `config|<key>|<value>` handshake lines, `config|ready` has no value.
    Config { key: String, value: Option<String> },
    Event(EventLine),
}

/// Decode one inbound line, without its trailing newline.
///
/// Envelope fields are decoded as text, invalid UTF-8 replaced; message
/// content stays available as bytes through [`EventLine::rest`].
///
/// Any error means the stream can no longer be attributed to sessions and
/// is fatal to the caller.
pub fn decode(line: &[u8]) -> Result<Line, ProtocolError> {
    let truncated = || ProtocolError::Truncated(String::from_utf8_lossy(line).into_owned());
    let raw: Vec<&[u8]> = line.splitn(ENVELOPE_FIELDS + 1, |b| *b == DELIMITER).collect();
    let fields: Vec<Cow<'_, str>> = line
        .split(|b| *b == DELIMITER)
        .map(String::from_utf8_lossy)
        .collect();

    let kind = match &*fields[0] {
        "config" => {
            return match fields.get(1) {
                Some(key) => Ok(Line::Config {
                    key: key.to_string(),
                    value: (fields.len() > 2).then(|| fields[2..].join("|")),
                }),
                None => Err(truncated()),
            };
        }
        "report" => Kind::Report,
        "filter" => Kind::Filter,
        other => return Err(ProtocolError::UnknownKind(other.to_string())),
    };

    if fields.len() < ENVELOPE_FIELDS {
        return Err(truncated());
    }

    let version = ProtocolVersion::parse(&fields[1])?;
    let event = Event::from_name(&fields[4])
        .ok_or_else(|| ProtocolError::UnknownEvent(fields[4].to_string()))?;
    if event.kind() != kind {
        return Err(ProtocolError::KindMismatch {
            event,
            registered: event.kind(),
            received: kind,
        });
    }

    let params: Vec<String> = fields[ENVELOPE_FIELDS..]
        .iter()
        .map(|field| field.to_string())
        .collect();
    if kind == Kind::Filter && params.is_empty() {
        return Err(ProtocolError::MissingToken(event));
    }

    Ok(Line::Event(EventLine {
        kind,
        version,
        timestamp: fields[2].to_string(),
        subsystem: fields[3].to_string(),
        event,
        session: fields[5].to_string(),
        params,
        raw: raw.get(ENVELOPE_FIELDS).map(|tail| tail.to_vec()).unwrap_or_default(),
    }))
}

/// Final answer to a `commit` filter event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Reject(String),
}

impl Decision {
    /// An empty reason means the message may proceed.
    pub fn from_reason(reason: String) -> Self {
        if reason.is_empty() {
            Decision::Proceed
        } else {
            Decision::Reject(reason)
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Proceed => f.write_str("proceed"),
            Decision::Reject(reason) => write!(f, "reject|{reason}"),
        }
    }
}

/// Identifies the filter request a response belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub version: ProtocolVersion,
    pub session: String,
    pub token: String,
}

impl Correlation {
    pub fn new(event: &EventLine, token: &str) -> Self {
        Correlation {
            version: event.version,
            session: event.session.clone(),
            token: token.to_string(),
        }
    }

    fn fields(&self) -> (&str, &str) {
        if self.version < ProtocolVersion::SESSION_FIRST {
            (self.token.as_str(), self.session.as_str())
        } else {
            (self.session.as_str(), self.token.as_str())
        }
    }
}

pub fn encode_register(event: Event) -> String {
    format!("register|{}|{SUBSYSTEM}|{}", event.kind(), event.name())
}

pub fn encode_ready() -> String {
    "register|ready".to_string()
}

pub fn encode_result(reply: &Correlation, decision: &Decision) -> String {
    let (first, second) = reply.fields();
    format!("filter-result|{first}|{second}|{decision}")
}

pub fn encode_dataline(reply: &Correlation, content: &[u8]) -> Vec<u8> {
    let (first, second) = reply.fields();
    let mut line = format!("filter-dataline|{first}|{second}|").into_bytes();
    line.extend_from_slice(content);
    line
}

/// Remove the transparency dot the SMTP client added to a data line.
pub fn unstuff(line: &[u8]) -> &[u8] {
    line.strip_prefix(b".").unwrap_or(line)
}

/// Escape a message line for the data stream.
pub fn stuff(line: &[u8]) -> Cow<'_, [u8]> {
    if line.starts_with(b".") {
        let mut stuffed = Vec::with_capacity(line.len() + 1);
        stuffed.push(b'.');
        stuffed.extend_from_slice(line);
        Cow::Owned(stuffed)
    } else {
        Cow::Borrowed(line)
    }
}
