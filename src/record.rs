//! Read-side interposers for the `-record` and `-replay` debug flags.
//!
//! A recording wraps a live connection and logs every received slice to a
//! file as `i64 delay (nanoseconds since the previous slice), i32 length,
//! length bytes`. A replay synthesizes an inbound stream from such a file,
//! honoring the recorded delays. Both are transparent to protocol
//! handling.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::task;
use tokio::time::{sleep, Duration, Sleep};

pub struct RecordingReader<R> {
    inner: R,
    log: File,
    last: Instant,
}

impl<R> RecordingReader<R> {
    pub fn new(inner: R, log: File) -> RecordingReader<R> {
        RecordingReader {
            inner,
            log,
            last: Instant::now(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecordingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let data = &buf.filled()[before..];
        if !data.is_empty() {
            let now = Instant::now();
            let delay = now.duration_since(this.last).as_nanos() as i64;
            this.last = now;

            let mut header = [0u8; 12];
            header[..8].copy_from_slice(&delay.to_be_bytes());
            header[8..].copy_from_slice(&(data.len() as i32).to_be_bytes());
            // Disk writes must not stall the worker thread this connection
            // shares with others.
            let log = &mut this.log;
            task::block_in_place(|| {
                log.write_all(&header)?;
                log.write_all(data)
            })?;
        }
        Poll::Ready(Ok(()))
    }
}

pub struct ReplayReader {
    log: BufReader<File>,
    pending: Vec<u8>,
    offset: usize,
    delay: Option<Pin<Box<Sleep>>>,
}

impl ReplayReader {
    pub fn new(log: File) -> ReplayReader {
        ReplayReader {
            log: BufReader::new(log),
            pending: Vec::new(),
            offset: 0,
            delay: None,
        }
    }
}

impl AsyncRead for ReplayReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(delay) = this.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                this.delay = None;
            }

            if this.offset < this.pending.len() {
                let count = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + count]);
                this.offset += count;
                return Poll::Ready(Ok(()));
            }

            // Next record: header, then wait out the recorded delay before
            // serving its payload. A clean end of file is end of stream.
            let mut header = [0u8; 12];
            let log = &mut this.log;
            if !task::block_in_place(|| read_exact_or_eof(log, &mut header))? {
                return Poll::Ready(Ok(()));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[..8]);
            let delay_ns = i64::from_be_bytes(raw);
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&header[8..]);
            let length = i32::from_be_bytes(raw);
            if length < 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "negative record length",
                )));
            }

            this.pending.resize(length as usize, 0);
            let log = &mut this.log;
            let pending = &mut this.pending;
            task::block_in_place(|| log.read_exact(pending))?;
            this.offset = 0;
            this.delay = Some(Box::pin(sleep(Duration::from_nanos(
                delay_ns.max(0) as u64
            ))));
        }
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 if filled == 0 => return Ok(false),
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => filled += n,
        }
    }
    Ok(true)
}
