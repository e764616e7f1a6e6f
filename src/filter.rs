use crate::config::Config;
use crate::output::Output;
use crate::protocol::{
    decode, encode_ready, encode_register, encode_result, unstuff, Correlation, Decision, Event,
    EventLine, Line, ProtocolError, ProtocolVersion, END_OF_DATA,
};
use crate::rspamd::Scanner;
use crate::session::{Session, SessionRegistry};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// What handlers may reach besides their own session.
struct Context<'a> {
    scanner: &'a Arc<Scanner>,
    output: &'a Output,
}

type Handler = fn(&Context<'_>, &mut Session, &EventLine) -> Result<(), ProtocolError>;

fn handler(event: Event) -> Option<Handler> {
    match event {
        Event::LinkConnect => Some(link_connect),
        Event::LinkIdentify => Some(link_identify),
        Event::TxBegin => Some(tx_begin),
        Event::TxMail => Some(tx_mail),
        Event::TxRcpt => Some(tx_rcpt),
        Event::TxData => Some(tx_data),
        Event::TxCommit | Event::TxRollback => Some(tx_cleanup),
        Event::DataLine => Some(data_line),
        Event::Commit => Some(commit),
        // handled by the control loop itself
        Event::LinkDisconnect => None,
    }
}

/// The control loop: reads events in order and drives the session handlers.
pub struct Filter {
    sessions: SessionRegistry,
    scanner: Arc<Scanner>,
    output: Output,
}

impl Filter {
    pub fn new(config: &Config, output: Output) -> anyhow::Result<Self> {
        Ok(Filter {
            sessions: SessionRegistry::new(),
            scanner: Arc::new(Scanner::new(config)?),
            output,
        })
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Announce the events the filter wants to see.
    pub fn register(&self) {
        for event in Event::ALL {
            self.output.send(encode_register(event));
        }
        self.output.send(encode_ready());
    }

    /// Register, then process `reader` until end of input.
    pub async fn run<R>(&mut self, mut reader: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.register();
        log::info!("Scanning with rspamd at {}", self.scanner.url());

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                log::info!("Input closed, {} sessions still open", self.sessions.len());
                return Ok(());
            }
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }

            self.process_line(&buf)?;
        }
    }

    /// Handle one line. Message content is passed on as raw bytes.
    pub fn process_line(&mut self, line: &[u8]) -> Result<(), ProtocolError> {
        match decode(line)? {
            Line::Config { key, value } => {
                log::debug!("config {key}: {}", value.as_deref().unwrap_or_default());
                Ok(())
            }
            Line::Event(event) => self.dispatch(&event),
        }
    }

    fn dispatch(&mut self, event: &EventLine) -> Result<(), ProtocolError> {
        match event.event {
            Event::LinkDisconnect => {
                if self.sessions.remove(&event.session).is_some() {
                    log::debug!("session {}: disconnected", event.session);
                }
                return Ok(());
            }
            Event::LinkConnect => {
                self.sessions.create(&event.session);
            }
            _ => {}
        }

        let context = Context {
            scanner: &self.scanner,
            output: &self.output,
        };
        let Some(session) = self.sessions.get_mut(&event.session) else {
            log::debug!(
                "Dropping {} for unknown session {}",
                event.event,
                event.session
            );
            return Ok(());
        };

        match handler(event.event) {
            Some(handle) => handle(&context, session, event),
            None => Ok(()),
        }
    }
}

fn link_connect(
    _: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    let rdns = event.param(0)?;
    let source = event.param(2)?;

    let link = session.link_mut();
    link.set("Pass", "all");
    if let Some(ip) = source_address(source) {
        link.set("Ip", ip);
    }
    if !rdns.is_empty() {
        link.set("Hostname", rdns);
    }
    Ok(())
}

/// Client address from a link-connect source, `None` for local submissions.
fn source_address(source: &str) -> Option<String> {
    if let Ok(addr) = source.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    if let Ok(ip) = source.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    match source.split(':').next() {
        None | Some("") | Some("local") | Some("unix") => None,
        Some(host) => Some(host.to_string()),
    }
}

fn link_identify(
    _: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    // newer versions announce the HELO/EHLO method first
    let helo = if event.version < ProtocolVersion::SESSION_FIRST {
        event.param(0)?
    } else {
        event.param(1)?
    };
    session.link_mut().set("Helo", helo);
    Ok(())
}

fn tx_begin(
    _: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    session.transaction_mut().set("Queue-Id", event.param(0)?);
    Ok(())
}

/// Address and status of tx-mail / tx-rcpt.
fn address_status(event: &EventLine) -> Result<(&str, &str), ProtocolError> {
    if event.version < ProtocolVersion::STATUS_FIRST {
        Ok((event.param(1)?, event.param(2)?))
    } else {
        Ok((event.param(2)?, event.param(1)?))
    }
}

fn tx_mail(
    _: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    let (address, status) = address_status(event)?;
    if status == "ok" {
        session.transaction_mut().set("From", address);
    }
    Ok(())
}

fn tx_rcpt(
    _: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    let (address, status) = address_status(event)?;
    if status == "ok" {
        session.transaction_mut().append("Rcpt", address);
    }
    Ok(())
}

fn tx_data(
    _: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    if event.param(1)? == "ok" {
        session.begin_data();
    }
    Ok(())
}

fn tx_cleanup(
    _: &Context<'_>,
    session: &mut Session,
    _: &EventLine,
) -> Result<(), ProtocolError> {
    session.end_transaction();
    Ok(())
}

fn data_line(
    context: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    let token = event.token()?;
    let line = event.rest(1)?;

    if session.is_scanning() {
        log::warn!(
            "session {}: data line while a scan is in flight, dropping it",
            session.id()
        );
        return Ok(());
    }

    if line != END_OF_DATA {
        session.append_line(unstuff(line));
        return Ok(());
    }

    let (metadata, message) = session.take_message();
    log::debug!(
        "session {}: scanning {} bytes",
        session.id(),
        message.len()
    );
    let pending = context.scanner.dispatch(
        metadata,
        Correlation::new(event, token),
        message,
        context.output.clone(),
    );
    session.set_pending(pending);
    Ok(())
}

fn commit(
    context: &Context<'_>,
    session: &mut Session,
    event: &EventLine,
) -> Result<(), ProtocolError> {
    let reply = Correlation::new(event, event.token()?);
    let output = context.output.clone();

    let Some(pending) = session.take_pending() else {
        log::warn!("session {}: commit without a scanned message", session.id());
        output.send(encode_result(&reply, &Decision::Proceed));
        return Ok(());
    };

    // wait off the control loop so other sessions keep flowing
    tokio::spawn(async move {
        let decision = Decision::from_reason(pending.wait().await);
        log::info!("session {}: {decision}", reply.session);
        output.send(encode_result(&reply, &decision));
    });
    Ok(())
}
