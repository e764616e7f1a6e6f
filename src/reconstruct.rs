//! Turn an rspamd verdict into the rewritten message and a rejection reason.

use crate::message::Message;
use crate::output::Output;
use crate::protocol::{encode_dataline, stuff, Correlation, END_OF_DATA};
use crate::rspamd::Verdict;

pub const TEMPORARY_FAILURE: &str = "421 Temporary failure";
pub const REJECTED: &str = "550 message rejected";
pub const GREYLISTED: &str = "421 greylisted";
pub const SOFT_REJECTED: &str = "451 try again later";

pub const SPAM_HEADER: &str = "X-Spam";
pub const SCORE_HEADER: &str = "X-Spam-Score";
pub const SIGNATURE_HEADER: &str = "DKIM-Signature";

/// rspamd action tags this filter acts upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AddHeader,
    RewriteSubject,
    Reject,
    Greylist,
    SoftReject,
    /// "no action" and anything unknown.
    Accept,
}

impl Action {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "add header" => Action::AddHeader,
            "rewrite subject" => Action::RewriteSubject,
            "reject" => Action::Reject,
            "greylist" => Action::Greylist,
            "soft reject" => Action::SoftReject,
            _ => Action::Accept,
        }
    }
}

/// Apply the verdict's header mutations and return the rejection reason,
/// empty when the message may proceed.
pub fn apply(message: &mut Message, verdict: &Verdict) -> String {
    match Action::from_tag(&verdict.action) {
        Action::AddHeader => {
            message.set_header(SPAM_HEADER, "yes");
            message.set_header(
                SCORE_HEADER,
                &format!("{} / {}", verdict.score, verdict.required_score),
            );
            String::new()
        }
        Action::RewriteSubject => {
            message.set_header("Subject", verdict.subject.as_deref().unwrap_or_default());
            String::new()
        }
        Action::Reject => reason(verdict, "550", REJECTED),
        Action::Greylist => reason(verdict, "421", GREYLISTED),
        Action::SoftReject => reason(verdict, "451", SOFT_REJECTED),
        Action::Accept => String::new(),
    }
}

// rspamd may supply its own SMTP text, the code stays ours
fn reason(verdict: &Verdict, code: &str, default: &str) -> String {
    match verdict.smtp_message() {
        Some(text) => format!("{code} {}", text.lines().collect::<Vec<_>>().join(" ")),
        None => default.to_string(),
    }
}

/// The message lines to replay, ready for the data stream: signatures,
/// headers in their original order, the empty separator, the body, and the
/// end-of-data marker.
pub fn render(message: &Message, verdict: &Verdict) -> Vec<Vec<u8>> {
    let mut lines: Vec<Vec<u8>> = Vec::new();

    for signature in verdict.signatures() {
        let field = format!("{SIGNATURE_HEADER}: {signature}");
        lines.extend(
            field
                .split('\n')
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.is_empty())
                .map(|line| line.as_bytes().to_vec()),
        );
    }

    for header in message.headers() {
        lines.extend(header.lines().iter().cloned());
    }

    lines.push(Vec::new());
    lines.extend(message.body().iter().cloned());

    let mut lines: Vec<Vec<u8>> = lines
        .into_iter()
        .map(|line| stuff(&line).into_owned())
        .collect();
    lines.push(END_OF_DATA.to_vec());
    lines
}

/// Write the rewritten message for `reply` and return the rejection reason.
///
/// The reason is not written here; the commit handler owns the decision line.
pub fn reconstruct(
    reply: &Correlation,
    mut message: Message,
    verdict: &Verdict,
    output: &Output,
) -> String {
    let reason = apply(&mut message, verdict);
    for line in render(&message, verdict) {
        output.send(encode_dataline(reply, &line));
    }
    reason
}
