//! transfer::pipe
//!
//! Bounded in-memory pipe between a producer and a consumer thread.
//!
//! The writer can end the stream cleanly (drop or [`PipeWriter::close`]) or
//! with an error ([`PipeWriter::fail`]); either way the reader is released.
//! Dropping the reader makes further writes fail with `BrokenPipe`, so a
//! producer never blocks on a consumer that gave up.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Chunks buffered before the writer blocks.
const CAPACITY: usize = 16;

type Chunk = Result<Vec<u8>, String>;

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(CAPACITY);
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

/// Sending half of a [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<SyncSender<Chunk>>,
}

impl PipeWriter {
    /// End the stream; the reader sees EOF after buffered data.
    pub fn close(mut self) {
        self.tx.take();
    }

    /// End the stream with an error the reader will return.
    pub fn fail(mut self, message: impl Into<String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(message.into()));
        }
    }

    /// Close or fail depending on how the producer finished.
    pub fn finish<T, E: std::fmt::Display>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.close(),
            Err(e) => self.fail(e.to_string()),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        tx.send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiving half of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Chunk>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Ok(Err(message)) => return Err(io::Error::other(message)),
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
