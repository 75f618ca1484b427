//! In-memory stream with scripted read results, for driving connections
//! without sockets.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
    Error(io::ErrorKind),
}

/// A `Read + Write` stream whose reads replay a script and whose writes are
/// captured. An exhausted script reads as `WouldBlock`.
#[derive(Default)]
pub struct ScriptedStream {
    reads: VecDeque<ReadStep>,
    written: Vec<u8>,
    /// Maximum bytes accepted per `write` call.
    write_limit: Option<usize>,
    /// Writes left before the stream starts returning `WouldBlock`.
    writes_before_block: Option<usize>,
    /// Once set, every `write` fails with this error.
    write_error: Option<io::ErrorKind>,
}

impl ScriptedStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&mut self, data: Vec<u8>) {
        self.reads.push_back(ReadStep::Data(data));
    }

    pub fn push_would_block(&mut self) {
        self.reads.push_back(ReadStep::WouldBlock);
    }

    pub fn push_eof(&mut self) {
        self.reads.push_back(ReadStep::Eof);
    }

    pub fn push_error(&mut self, kind: io::ErrorKind) {
        self.reads.push_back(ReadStep::Error(kind));
    }

    pub fn set_write_limit(&mut self, limit: usize) {
        self.write_limit = Some(limit);
    }

    pub fn block_writes_after(&mut self, writes: usize) {
        self.writes_before_block = Some(writes);
    }

    pub fn unblock_writes(&mut self) {
        self.writes_before_block = None;
    }

    pub fn fail_writes(&mut self, kind: io::ErrorKind) {
        self.write_error = Some(kind);
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Error(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.write_error {
            return Err(kind.into());
        }
        if let Some(left) = self.writes_before_block.as_mut() {
            if *left == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            *left -= 1;
        }
        let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
