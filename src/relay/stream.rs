use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use flate2::write::{DeflateDecoder, GzDecoder};
use futures::Stream;

use crate::models::TokenUsage;

/// Content-Encoding applied by the upstream to the SSE body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Identity,
    Gzip,
    Deflate,
}

impl Coding {
    pub fn from_content_encoding(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("gzip") => Coding::Gzip,
            Some(v) if v.eq_ignore_ascii_case("deflate") => Coding::Deflate,
            _ => Coding::Identity,
        }
    }

    pub fn is_identity(self) -> bool {
        self == Coding::Identity
    }

    /// Cheap sanity check on the first body chunk, done before the response
    /// is committed so a bad stream can still fail with a proper error
    /// instead of dying mid-body.
    pub fn validate_first_chunk(self, chunk: &[u8]) -> Result<(), String> {
        match self {
            Coding::Gzip if chunk.len() >= 2 && chunk[..2] != [0x1f, 0x8b] => {
                Err("gzip stream missing magic header".into())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct WriteBuf {
    buf: Vec<u8>,
}

impl Write for WriteBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl WriteBuf {
    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

enum Decoder {
    Identity,
    Gzip(GzDecoder<WriteBuf>),
    // Raw DEFLATE, no zlib wrapper.
    Deflate(DeflateDecoder<WriteBuf>),
}

impl Decoder {
    fn new(coding: Coding) -> Self {
        match coding {
            Coding::Identity => Decoder::Identity,
            Coding::Gzip => Decoder::Gzip(GzDecoder::new(WriteBuf::default())),
            Coding::Deflate => Decoder::Deflate(DeflateDecoder::new(WriteBuf::default())),
        }
    }

    /// Feed one compressed chunk; returns decoded output produced so far.
    fn ingest(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Decoder::Identity => Ok(chunk.to_vec()),
            Decoder::Gzip(d) => {
                d.write_all(chunk)?;
                d.flush()?;
                Ok(d.get_mut().take())
            }
            Decoder::Deflate(d) => {
                d.write_all(chunk)?;
                d.flush()?;
                Ok(d.get_mut().take())
            }
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        match self {
            Decoder::Identity => Vec::new(),
            Decoder::Gzip(d) => {
                let _ = d.try_finish();
                d.get_mut().take()
            }
            Decoder::Deflate(d) => {
                let _ = d.try_finish();
                d.get_mut().take()
            }
        }
    }
}

/// `Stream` adaptor that transparently decodes an upstream `bytes_stream()`.
/// Upstream transport errors and decode errors are both surfaced as
/// `io::Error` so the result plugs straight into `Body::from_stream`.
pub struct DecodeStream<S> {
    upstream: S,
    decoder: Decoder,
    queued: Option<Bytes>,
    pending_error: Option<std::io::Error>,
    upstream_done: bool,
}

impl<S> DecodeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    pub fn new(coding: Coding, upstream: S) -> Self {
        Self {
            upstream,
            decoder: Decoder::new(coding),
            queued: None,
            pending_error: None,
            upstream_done: false,
        }
    }

    /// As `new`, but with a chunk already read off the upstream (used after
    /// first-chunk validation). Decode errors on it are deferred to the
    /// first poll.
    pub fn with_first_chunk(coding: Coding, first: Bytes, upstream: S) -> Self {
        let mut s = Self::new(coding, upstream);
        s.ingest(&first);
        s
    }

    fn ingest(&mut self, chunk: &[u8]) {
        match self.decoder.ingest(chunk) {
            Ok(out) if out.is_empty() => {}
            Ok(out) => self.queued = Some(Bytes::from(out)),
            Err(e) => {
                // Emit whatever decoded cleanly, then the error, then EOF.
                let tail = self.decoder.finish();
                if !tail.is_empty() {
                    self.queued = Some(Bytes::from(tail));
                }
                self.pending_error = Some(e);
                self.upstream_done = true;
            }
        }
    }
}

impl<S> Stream for DecodeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();

        loop {
            if let Some(bytes) = this.queued.take() {
                return Poll::Ready(Some(Ok(bytes)));
            }
            if this.upstream_done {
                if let Some(err) = this.pending_error.take() {
                    return Poll::Ready(Some(Err(err)));
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.upstream_done = true;
                    let tail = this.decoder.finish();
                    if !tail.is_empty() {
                        this.queued = Some(Bytes::from(tail));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.upstream_done = true;
                    this.pending_error = Some(std::io::Error::other(err));
                    let tail = this.decoder.finish();
                    if !tail.is_empty() {
                        this.queued = Some(Bytes::from(tail));
                    }
                }
                Poll::Ready(Some(Ok(chunk))) => this.ingest(&chunk),
            }
        }
    }
}

/// Incremental SSE scanner that pulls token usage out of `data:` lines.
/// Chunk boundaries may fall anywhere, so bytes are line-buffered. Lines
/// that are not valid JSON, or JSON without usage, are ignored; a stream
/// that never carries usage simply finalizes to `None`.
#[derive(Default)]
pub struct SseUsageTracker {
    line_buf: Vec<u8>,
    usage: TokenUsage,
    seen: bool,
}

impl SseUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest_chunk(&mut self, chunk: &[u8]) {
        self.line_buf.extend_from_slice(chunk);
        while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return;
        };

        match value.get("type").and_then(|t| t.as_str()) {
            // message_start carries the authoritative input-side counters.
            Some("message_start") => {
                if let Some(usage) = value.pointer("/message/usage") {
                    self.absorb(usage);
                }
            }
            // message_delta carries the running output count; the last one
            // observed wins.
            Some("message_delta") => {
                if let Some(usage) = value.get("usage") {
                    self.absorb(usage);
                }
            }
            _ => {}
        }
    }

    fn absorb(&mut self, usage: &serde_json::Value) {
        let take = |key: &str| usage.get(key).and_then(|v| v.as_u64());
        if let Some(v) = take("input_tokens") {
            self.usage.input_tokens = v;
            self.seen = true;
        }
        if let Some(v) = take("output_tokens") {
            self.usage.output_tokens = v;
            self.seen = true;
        }
        if let Some(v) = take("cache_read_input_tokens") {
            self.usage.cache_read_input_tokens = v;
            self.seen = true;
        }
        if let Some(v) = take("cache_creation_input_tokens") {
            self.usage.cache_creation_input_tokens = v;
            self.seen = true;
        }
    }

    /// Flush any trailing partial line and report what was extracted.
    pub fn finalize(&mut self) -> Option<TokenUsage> {
        if !self.line_buf.is_empty() {
            let tail = std::mem::take(&mut self.line_buf);
            self.handle_line(&tail);
        }
        self.seen.then_some(self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder};
    use flate2::Compression;
    use futures::StreamExt;

    fn gzip(input: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(input).unwrap();
        enc.finish().unwrap()
    }

    fn deflate_raw(input: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(input).unwrap();
        enc.finish().unwrap()
    }

    fn upstream(chunks: Vec<Vec<u8>>) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Unpin {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    async fn collect<S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin>(
        mut s: S,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(item) = s.next().await {
            out.extend_from_slice(&item.unwrap());
        }
        out
    }

    #[test]
    fn coding_parses_content_encoding() {
        assert_eq!(Coding::from_content_encoding(Some("gzip")), Coding::Gzip);
        assert_eq!(Coding::from_content_encoding(Some("GZIP")), Coding::Gzip);
        assert_eq!(
            Coding::from_content_encoding(Some("deflate")),
            Coding::Deflate
        );
        assert_eq!(Coding::from_content_encoding(None), Coding::Identity);
        assert_eq!(Coding::from_content_encoding(Some("br")), Coding::Identity);
    }

    #[test]
    fn gzip_first_chunk_validation_rejects_bad_magic() {
        assert!(Coding::Gzip.validate_first_chunk(b"event: ping\n").is_err());
        assert!(Coding::Gzip
            .validate_first_chunk(&gzip(b"data: {}\n")[..4])
            .is_ok());
        assert!(Coding::Identity.validate_first_chunk(b"anything").is_ok());
    }

    #[tokio::test]
    async fn decodes_gzip_split_across_chunks() {
        let original = b"data: {\"type\":\"ping\"}\n\n".repeat(50);
        let gz = gzip(&original);
        let mid = gz.len() / 2;
        let s = DecodeStream::new(
            Coding::Gzip,
            upstream(vec![gz[..mid].to_vec(), gz[mid..].to_vec()]),
        );
        assert_eq!(collect(s).await, original);
    }

    #[tokio::test]
    async fn decodes_raw_deflate_split_across_chunks() {
        let original = b"data: {\"type\":\"ping\"}\n\n".repeat(50);
        let compressed = deflate_raw(&original);
        let mid = compressed.len() / 2;
        let s = DecodeStream::new(
            Coding::Deflate,
            upstream(vec![compressed[..mid].to_vec(), compressed[mid..].to_vec()]),
        );
        assert_eq!(collect(s).await, original);
    }

    #[tokio::test]
    async fn identity_passes_through() {
        let s = DecodeStream::new(Coding::Identity, upstream(vec![b"abc".to_vec()]));
        assert_eq!(collect(s).await, b"abc");
    }

    #[tokio::test]
    async fn first_chunk_is_emitted_before_the_rest() {
        let original = b"data: hello\n\n";
        let gz = gzip(original);
        let mid = 4;
        let s = DecodeStream::with_first_chunk(
            Coding::Gzip,
            Bytes::copy_from_slice(&gz[..mid]),
            upstream(vec![gz[mid..].to_vec()]),
        );
        assert_eq!(collect(s).await, original);
    }

    #[tokio::test]
    async fn corrupt_gzip_surfaces_an_error_after_partial_output() {
        let mut gz = gzip(b"data: x\n");
        for b in gz.iter_mut().skip(12) {
            *b = !*b;
        }
        let mut s = DecodeStream::new(Coding::Gzip, upstream(vec![gz]));
        let mut saw_error = false;
        while let Some(item) = s.next().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn tracker_extracts_usage_from_start_and_delta() {
        let mut t = SseUsageTracker::new();
        t.ingest_chunk(
            b"event: message_start\n\
              data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":25,\"cache_read_input_tokens\":100,\"cache_creation_input_tokens\":7,\"output_tokens\":1}}}\n\n",
        );
        t.ingest_chunk(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":12}}\n\n");
        t.ingest_chunk(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\n");
        let usage = t.finalize().unwrap();
        assert_eq!(usage.input_tokens, 25);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.cache_read_input_tokens, 100);
        assert_eq!(usage.cache_creation_input_tokens, 7);
    }

    #[test]
    fn tracker_handles_split_lines_and_garbage() {
        let mut t = SseUsageTracker::new();
        t.ingest_chunk(b"data: {\"type\":\"message_start\",\"mess");
        t.ingest_chunk(b"age\":{\"usage\":{\"input_tokens\":3}}}\n");
        t.ingest_chunk(b"data: not json at all\n");
        t.ingest_chunk(b"data: [DONE]\n");
        let usage = t.finalize().unwrap();
        assert_eq!(usage.input_tokens, 3);
    }

    #[test]
    fn tracker_without_usage_finalizes_to_none() {
        let mut t = SseUsageTracker::new();
        t.ingest_chunk(b"data: {\"type\":\"ping\"}\n\n");
        assert!(t.finalize().is_none());
    }

    #[test]
    fn tracker_flushes_trailing_partial_line_on_finalize() {
        let mut t = SseUsageTracker::new();
        t.ingest_chunk(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9}}");
        let usage = t.finalize().unwrap();
        assert_eq!(usage.output_tokens, 9);
    }
}
