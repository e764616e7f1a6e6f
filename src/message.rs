use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("header block starts with a continuation line: {0:?}")]
    LeadingContinuation(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
}

/// One header field, kept as the physical lines it arrived in so untouched
/// headers are replayed byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    lines: Vec<Vec<u8>>,
}

impl Header {
    pub fn new(name: &str, value: &str) -> Self {
        Header {
            name: name.to_string(),
            lines: vec![format!("{name}: {value}").into_bytes()],
        }
    }

    #[cfg(test)]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }

    /// Unfolded value.
    #[cfg(test)]
    pub fn value(&self) -> String {
        let unfolded = self.lines.join(&b' ');
        let text = String::from_utf8_lossy(&unfolded);
        let value = text.split_once(':').map_or("", |(_, value)| value);
        value.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A message split into its header block and body lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<Header>,
    body: Vec<Vec<u8>>,
}

impl Message {
    /// Split `text`, newline-terminated lines, at the first empty line.
    ///
    /// Lines are kept as bytes; only header names need to be ASCII. A message
    /// made of headers only, without the separating empty line, has an empty
    /// body.
    pub fn parse(text: &[u8]) -> Result<Self, MessageError> {
        if text.is_empty() {
            return Err(MessageError::Empty);
        }

        let text = text.strip_suffix(b"\n").unwrap_or(text);
        let mut lines = text.split(|b| *b == b'\n');
        let mut headers: Vec<Header> = Vec::new();

        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }

            if line.starts_with(b" ") || line.starts_with(b"\t") {
                match headers.last_mut() {
                    Some(header) => header.lines.push(line.to_vec()),
                    None => return Err(MessageError::LeadingContinuation(lossy(line))),
                }
                continue;
            }

            let name = match line.iter().position(|b| *b == b':') {
                Some(colon) if is_field_name(&line[..colon]) => lossy(&line[..colon]),
                _ => return Err(MessageError::MalformedHeader(lossy(line))),
            };
            headers.push(Header {
                name,
                lines: vec![line.to_vec()],
            });
        }

        Ok(Message {
            headers,
            body: lines.map(<[u8]>::to_vec).collect(),
        })
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body(&self) -> &[Vec<u8>] {
        &self.body
    }

    /// First header named `name`, case-insensitively.
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|header| header.is_named(name))
    }

    /// Replace the value of `name`.
    ///
    /// The first occurrence keeps its position and further occurrences are
    /// dropped; a header not present yet is appended to the header block.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self.headers.iter().position(|header| header.is_named(name)) {
            Some(index) => {
                self.headers[index] = Header::new(name, value);
                let mut seen = 0;
                self.headers.retain(|header| {
                    if !header.is_named(name) {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.headers.push(Header::new(name, value)),
        }
    }
}

// RFC 5322 ftext: printable US-ASCII except colon
fn is_field_name(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|b| (33..=126).contains(b) && *b != b':')
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
