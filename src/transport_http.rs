//! HTTP/1.1 transport to storage nodes.
//!
//! The backend dialect needs explicit control a high-level client does not
//! give us: the `Expect: 100-continue` interim response decides whether a
//! node gets the body at all, and body chunks must flush to N peers under
//! per-write deadlines. So requests are framed by hand over `TcpStream` and
//! responses parsed with `httparse`. Connections are never reused; every
//! exchange is `Connection: close`.

use crate::error::TransportError;
use crate::ring::Node;
use crate::transport::{BodyKind, Exchange, RequestHead, ResponseHead, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Path bytes that travel as-is; everything else is percent-encoded.
const PATH_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Largest response head we are willing to buffer.
const HEAD_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransport;

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(
        &self,
        node: &Node,
        part: u32,
        head: &RequestHead,
    ) -> Result<Box<dyn Exchange>, TransportError> {
        let addr = node.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Connect { addr: addr.clone(), source })?;
        let _ = stream.set_nodelay(true);

        let encoded_path = utf8_percent_encode(&head.path, PATH_KEEP).to_string();
        let mut target = format!("/{}/{}{}", node.device, part, encoded_path);
        if let Some(query) = &head.query {
            target.push('?');
            target.push_str(query);
        }
        let mut wire = String::with_capacity(256);
        wire.push_str(&format!("{} {} HTTP/1.1\r\n", head.method, target));
        wire.push_str(&format!("Host: {addr}\r\n"));
        for (name, value) in &head.headers {
            wire.push_str(name.as_str());
            wire.push_str(": ");
            wire.push_str(value.to_str().unwrap_or(""));
            wire.push_str("\r\n");
        }
        match head.body {
            BodyKind::None => {}
            BodyKind::Sized(n) => {
                wire.push_str(&format!("Content-Length: {n}\r\n"));
                wire.push_str("Expect: 100-continue\r\n");
            }
            BodyKind::Chunked => {
                wire.push_str("Transfer-Encoding: chunked\r\n");
                wire.push_str("Expect: 100-continue\r\n");
            }
        }
        wire.push_str("Connection: close\r\n\r\n");

        let mut exchange = HttpExchange {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            method: head.method.clone(),
            write_kind: head.body,
            expect_pending: head.body.has_body(),
            early_response: None,
            reader: None,
        };
        exchange.stream.write_all(wire.as_bytes()).await?;
        Ok(Box::new(exchange))
    }
}

enum BodyReader {
    NoBody,
    Sized { remaining: u64 },
    Chunked(ChunkState),
    /// No framing; the backend signals end-of-body by closing.
    UntilClose,
    Done,
}

enum ChunkState {
    AwaitSize,
    InChunk { remaining: u64 },
    AwaitChunkEnd,
    Finished,
}

struct HttpExchange {
    stream: TcpStream,
    buf: BytesMut,
    method: Method,
    write_kind: BodyKind,
    expect_pending: bool,
    early_response: Option<ResponseHead>,
    reader: Option<BodyReader>,
}

impl HttpExchange {
    async fn fill(&mut self) -> Result<usize, TransportError> {
        Ok(self.stream.read_buf(&mut self.buf).await?)
    }

    async fn read_head(&mut self) -> Result<ResponseHead, TransportError> {
        loop {
            if let Some((head, consumed)) = try_parse_head(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                return Ok(head);
            }
            if self.buf.len() > HEAD_MAX {
                return Err(TransportError::Malformed("response head too large"));
            }
            if self.fill().await? == 0 {
                return Err(TransportError::Malformed("connection closed mid-head"));
            }
        }
    }

    fn pick_reader(&self, head: &ResponseHead) -> BodyReader {
        let status = head.status;
        if self.method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || status.is_informational()
        {
            return BodyReader::NoBody;
        }
        let chunked = head
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            return BodyReader::Chunked(ChunkState::AwaitSize);
        }
        match head.content_length() {
            Some(0) => BodyReader::NoBody,
            Some(n) => BodyReader::Sized { remaining: n },
            None => BodyReader::UntilClose,
        }
    }

    async fn next_sized(&mut self, remaining: u64) -> Result<Option<Bytes>, TransportError> {
        if remaining == 0 {
            self.reader = Some(BodyReader::Done);
            return Ok(None);
        }
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Err(TransportError::Malformed("connection closed mid-body"));
        }
        let take = (self.buf.len() as u64).min(remaining) as usize;
        let chunk = self.buf.split_to(take).freeze();
        self.reader = Some(BodyReader::Sized { remaining: remaining - take as u64 });
        Ok(Some(chunk))
    }

    async fn next_chunked(&mut self, mut state: ChunkState) -> Result<Option<Bytes>, TransportError> {
        loop {
            match state {
                ChunkState::AwaitSize => {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.fill().await? == 0 {
                            return Err(TransportError::Malformed("connection closed mid-chunk"));
                        }
                        continue;
                    };
                    let line = self.buf.split_to(line_end + 2);
                    let size = parse_chunk_size(&line[..line_end])?;
                    state = if size == 0 {
                        ChunkState::Finished
                    } else {
                        ChunkState::InChunk { remaining: size }
                    };
                }
                ChunkState::InChunk { remaining } => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        return Err(TransportError::Malformed("connection closed mid-chunk"));
                    }
                    let take = (self.buf.len() as u64).min(remaining) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.reader = Some(BodyReader::Chunked(if left == 0 {
                        ChunkState::AwaitChunkEnd
                    } else {
                        ChunkState::InChunk { remaining: left }
                    }));
                    return Ok(Some(chunk));
                }
                ChunkState::AwaitChunkEnd => {
                    while self.buf.len() < 2 {
                        if self.fill().await? == 0 {
                            return Err(TransportError::Malformed("connection closed mid-chunk"));
                        }
                    }
                    let sep = self.buf.split_to(2);
                    if &sep[..] != b"\r\n" {
                        return Err(TransportError::Malformed("bad chunk terminator"));
                    }
                    state = ChunkState::AwaitSize;
                }
                ChunkState::Finished => {
                    // Trailers are ignored; the connection closes anyway.
                    self.reader = Some(BodyReader::Done);
                    return Ok(None);
                }
            }
        }
    }

    async fn next_until_close(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.buf.is_empty() {
            let all = self.buf.split().freeze();
            return Ok(Some(all));
        }
        if self.fill().await? == 0 {
            self.reader = Some(BodyReader::Done);
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    async fn await_continue(&mut self) -> Result<StatusCode, TransportError> {
        if !self.expect_pending {
            return Ok(StatusCode::CONTINUE);
        }
        self.expect_pending = false;
        let head = self.read_head().await?;
        if head.status == StatusCode::CONTINUE {
            Ok(StatusCode::CONTINUE)
        } else if head.status.is_success() {
            // Backend answered without waiting for the body.
            let status = head.status;
            self.early_response = Some(head);
            Ok(status)
        } else {
            Err(TransportError::ExpectRefused(head.status.as_u16()))
        }
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        match self.write_kind {
            BodyKind::Chunked => {
                let frame = format!("{:x}\r\n", chunk.len());
                self.stream.write_all(frame.as_bytes()).await?;
                self.stream.write_all(&chunk).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            _ => self.stream.write_all(&chunk).await?,
        }
        Ok(())
    }

    async fn finish_body(&mut self) -> Result<(), TransportError> {
        if matches!(self.write_kind, BodyKind::Chunked) {
            self.stream.write_all(b"0\r\n\r\n").await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<ResponseHead, TransportError> {
        let head = match self.early_response.take() {
            Some(head) => head,
            None => self.read_head().await?,
        };
        self.reader = Some(self.pick_reader(&head));
        Ok(head)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.reader.take() {
            None => Err(TransportError::Malformed("body read before response head")),
            Some(BodyReader::NoBody) | Some(BodyReader::Done) => {
                self.reader = Some(BodyReader::Done);
                Ok(None)
            }
            Some(BodyReader::Sized { remaining }) => self.next_sized(remaining).await,
            Some(BodyReader::Chunked(state)) => self.next_chunked(state).await,
            Some(BodyReader::UntilClose) => {
                self.reader = Some(BodyReader::UntilClose);
                self.next_until_close().await
            }
        }
    }
}

fn try_parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let code = parsed.code.ok_or(TransportError::Malformed("missing status code"))?;
            let status = StatusCode::from_u16(code)
                .map_err(|_| TransportError::Malformed("status code out of range"))?;
            let mut map = HeaderMap::new();
            for header in parsed.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| TransportError::Malformed("bad header name"))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| TransportError::Malformed("bad header value"))?;
                map.append(name, value);
            }
            Ok(Some((ResponseHead { status, headers: map }, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(TransportError::Malformed("unparsable response head")),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, TransportError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| TransportError::Malformed("bad chunk size line"))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(digits, 16).map_err(|_| TransportError::Malformed("bad chunk size"))
}
