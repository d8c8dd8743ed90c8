//! Splits the component stream into top-level frames.
//!
//! The stream header stays open for the life of the connection, so stanzas
//! are extracted by tracking element depth over the buffered bytes. Partial
//! input is left in the buffer until more data arrives.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::xml::{Element, XmlError};

/// Upper bound on buffered, not yet framed input.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` header; the element carries its attributes only.
    StreamOpen(Element),
    /// `</stream:stream>`
    StreamClose,
    /// A complete top-level element (stanza, handshake or stream error).
    Element(Element),
}

#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, XmlError> {
        match scan(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn scan(buf: &[u8]) -> Result<Option<(Frame, usize)>, XmlError> {
    let mut reader = Reader::from_reader(buf);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut depth = 0usize;
    let mut start = 0usize;

    loop {
        let pos = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            // Truncated markup at the end of the buffer.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let end = reader.buffer_position() as usize;

        match event {
            Event::Start(e) if depth == 0 && e.local_name().as_ref() == b"stream" => {
                let header = String::from_utf8_lossy(&buf[pos..end]);
                let el = Element::parse(&format!("{}</{}>", header, String::from_utf8_lossy(e.name().as_ref())))?;
                return Ok(Some((Frame::StreamOpen(el), end)));
            }
            Event::Start(_) => {
                if depth == 0 {
                    start = pos;
                }
                depth += 1;
            }
            Event::Empty(_) if depth == 0 => {
                let el = Element::parse(&String::from_utf8_lossy(&buf[pos..end]))?;
                return Ok(Some((Frame::Element(el), end)));
            }
            Event::End(_) if depth == 0 => {
                return Ok(Some((Frame::StreamClose, end)));
            }
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    let el = Element::parse(&String::from_utf8_lossy(&buf[start..end]))?;
                    return Ok(Some((Frame::Element(el), end)));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}
