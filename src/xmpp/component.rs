//! XEP-0114 component connection.

use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::framer::{Frame, Framer, MAX_FRAME_BYTES};
use super::stanza::{Stanza, NS_COMPONENT, NS_STREAM};
use super::transport::TransportError;
use super::xml::{escape_attr, Element};

const READ_CHUNK: usize = 8 * 1024;

/// `hex(SHA-1(stream id + secret))`, the XEP-0114 handshake digest.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// An authenticated component stream.
pub struct ComponentStream {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    framer: Framer,
    stream_id: String,
}

impl ComponentStream {
    /// Connect to `server`, open the stream for `domain` and authenticate.
    pub async fn connect(
        server: &str,
        domain: &str,
        secret: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        debug!(server = %server, domain = %domain, "connecting component stream");

        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| TransportError::ConnectTimeout(server.to_string()))??;
        tcp.set_nodelay(true)?;

        let (reader, writer) = tcp.into_split();
        let mut stream = Self {
            reader,
            writer,
            framer: Framer::new(),
            stream_id: String::new(),
        };

        let header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' to='{}'>",
            NS_COMPONENT,
            NS_STREAM,
            escape_attr(domain)
        );
        stream.writer.write_all(header.as_bytes()).await?;

        stream.stream_id = match stream.next_frame().await? {
            Frame::StreamOpen(header) => header
                .attr("id")
                .map(str::to_string)
                .ok_or_else(|| TransportError::Handshake("stream header without id".to_string()))?,
            Frame::Element(el) if el.local_name() == "error" => {
                return Err(TransportError::Stream(describe_stream_error(&el)))
            }
            other => {
                return Err(TransportError::Handshake(format!(
                    "expected stream header, got {:?}",
                    other
                )))
            }
        };

        let digest = handshake_digest(&stream.stream_id, secret);
        let handshake = Element::new("handshake").with_text(digest).to_xml();
        stream.writer.write_all(handshake.as_bytes()).await?;

        match stream.next_frame().await? {
            Frame::Element(el) if el.local_name() == "handshake" => {}
            Frame::Element(el) if el.local_name() == "error" => {
                return Err(TransportError::Handshake(describe_stream_error(&el)))
            }
            other => {
                return Err(TransportError::Handshake(format!(
                    "unexpected reply to handshake: {:?}",
                    other
                )))
            }
        }

        info!(
            server = %server,
            domain = %domain,
            stream_id = %stream.stream_id,
            "component authenticated"
        );

        Ok(stream)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next top-level element from the server.
    ///
    /// Cancel safe: partial input stays buffered in the framer.
    pub async fn next_element(&mut self) -> Result<Element, TransportError> {
        match self.next_frame().await? {
            Frame::Element(el) if el.name() == "stream:error" || el.is("error", NS_STREAM) => {
                Err(TransportError::Stream(describe_stream_error(&el)))
            }
            Frame::Element(el) => Ok(el),
            Frame::StreamClose => Err(TransportError::Closed),
            Frame::StreamOpen(_) => Err(TransportError::Stream("unexpected stream restart".to_string())),
        }
    }

    /// Write a batch of stanzas with a single write.
    pub async fn send(&mut self, stanzas: &[Stanza]) -> Result<(), TransportError> {
        let mut out = String::new();
        for stanza in stanzas {
            out.push_str(&stanza.to_xml());
        }
        self.writer.write_all(out.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Close our side of the stream.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.writer.write_all(b"</stream:stream>").await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.framer.next_frame()? {
                return Ok(frame);
            }
            if self.framer.buffered() > MAX_FRAME_BYTES {
                return Err(TransportError::Overflow(MAX_FRAME_BYTES));
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.framer.extend(&chunk[..n]);
        }
    }
}

fn describe_stream_error(el: &Element) -> String {
    let condition = el
        .children()
        .find(|c| c.local_name() != "text")
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());

    match el.child("text").map(Element::text) {
        Some(text) if !text.is_empty() => format!("{}: {}", condition, text),
        _ => condition,
    }
}
