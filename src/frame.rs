use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use nix::errno::Errno;
use nix::unistd;

use crate::wire::{FRAME_HEADER_SIZE, MAX_FRAME, MAX_FRAME_PAYLOAD};
use crate::Error;

fn write_errno(err: nix::Error) -> std::io::Error {
    match err.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}

/// PID-framed output: wraps payloads in `[pid:4 LE][len:2 LE]` frames so a
/// reader can demultiplex several writer processes sharing one sink. Each
/// frame goes to the fd in a single buffer; `EINTR` is retried and short
/// writes are resumed.
pub struct FrameWriter {
    fd: RawFd,
    frame: Vec<u8>,
}

impl FrameWriter {
    pub fn new(fd: RawFd) -> FrameWriter {
        FrameWriter::with_pid(fd, unistd::getpid().as_raw() as u32)
    }

    /// Frame with an explicit PID instead of the process's own. Used by
    /// tests and by hosts that relay another process's stream.
    pub fn with_pid(fd: RawFd, pid: u32) -> FrameWriter {
        let mut frame = vec![0u8; MAX_FRAME];
        LittleEndian::write_u32(&mut frame[0..4], pid);
        FrameWriter { fd, frame }
    }

    pub fn write(&mut self, mut payload: &[u8]) -> std::io::Result<()> {
        while !payload.is_empty() {
            let chunk = payload.len().min(MAX_FRAME_PAYLOAD);
            LittleEndian::write_u16(&mut self.frame[4..6], chunk as u16);
            self.frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + chunk]
                .copy_from_slice(&payload[..chunk]);

            let mut out = &self.frame[..FRAME_HEADER_SIZE + chunk];
            while !out.is_empty() {
                match unistd::write(self.fd, out) {
                    Ok(n) => out = &out[n..],
                    Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
                    Err(err) => return Err(write_errno(err)),
                }
            }
            payload = &payload[chunk..];
        }
        Ok(())
    }
}

/// The read half: strips frames from the sink, feeding only the active PID's
/// payload bytes to the decoder and buffering every other PID for a later
/// `set_active_pid`. Payload boundaries are not significant once framing is
/// removed.
pub struct FrameReader {
    file: Option<File>,
    read_timeout: Duration,
    bytes_read: u64,
    frame: Vec<u8>,
    frame_pos: usize,
    /// 0 until the first frame is seen, then the PID being decoded.
    active_pid: u32,
    skipped: HashMap<u32, Vec<u8>>,
    replay: Vec<u8>,
    replay_pos: usize,
}

impl FrameReader {
    pub fn new(file: File, read_timeout: Duration) -> FrameReader {
        FrameReader {
            file: Some(file),
            read_timeout,
            bytes_read: 0,
            frame: Vec::new(),
            frame_pos: 0,
            active_pid: 0,
            skipped: HashMap::new(),
            replay: Vec::new(),
            replay_pos: 0,
        }
    }

    /// Payload bytes handed to the decoder so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn active_pid(&self) -> u32 {
        self.active_pid
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Switch the PID filter. Bytes already buffered for `pid` are drained
    /// before any new frame is pulled from the sink.
    pub fn set_active_pid(&mut self, pid: u32) {
        self.active_pid = pid;
        self.frame.clear();
        self.frame_pos = 0;
        self.replay = self.skipped.remove(&pid).unwrap_or_default();
        self.replay_pos = 0;
    }

    /// Read from the sink itself, retrying once after `read_timeout` when the
    /// stream comes up short (a writer may still be flushing).
    fn raw_read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let file = self.file.as_mut().ok_or(Error::Closed)?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            total += n;
            if n == 0 {
                break;
            }
        }
        if total < buf.len() {
            thread::sleep(self.read_timeout);
            let file = self.file.as_mut().ok_or(Error::Closed)?;
            while total < buf.len() {
                let n = file.read(&mut buf[total..])?;
                total += n;
                if n == 0 {
                    return Err(Error::StdioError(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "could not read {} bytes within {:?}",
                            buf.len() - total,
                            self.read_timeout
                        ),
                    )));
                }
            }
        }
        Ok(())
    }

    fn load_next_frame(&mut self) -> Result<(), Error> {
        // Buffered bytes for the active PID replay first.
        if self.replay_pos < self.replay.len() {
            let avail = self.replay.len() - self.replay_pos;
            let take = avail.min(MAX_FRAME_PAYLOAD);
            self.frame.clear();
            self.frame
                .extend_from_slice(&self.replay[self.replay_pos..self.replay_pos + take]);
            self.frame_pos = 0;
            self.replay_pos += take;
            if self.replay_pos >= self.replay.len() {
                self.replay.clear();
                self.replay_pos = 0;
            }
            return Ok(());
        }

        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            self.raw_read(&mut header)?;
            let pid = LittleEndian::read_u32(&header[0..4]);
            let len = LittleEndian::read_u16(&header[4..6]) as usize;

            if len > MAX_FRAME_PAYLOAD {
                return Err(Error::Resource(len));
            }
            if self.active_pid == 0 {
                self.active_pid = pid;
            }

            if pid != self.active_pid {
                let buf = self.skipped.entry(pid).or_default();
                let start = buf.len();
                buf.resize(start + len, 0);
                let mut payload = std::mem::take(buf);
                let res = self.raw_read(&mut payload[start..]);
                *self.skipped.entry(pid).or_default() = payload;
                res?;
                continue;
            }

            self.frame.resize(len, 0);
            let mut frame = std::mem::take(&mut self.frame);
            let res = self.raw_read(&mut frame);
            self.frame = frame;
            self.frame_pos = 0;
            res?;
            return Ok(());
        }
    }

    /// Fill `buf` from the logical (deframed) byte stream of the active PID.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut total = 0;
        while total < buf.len() {
            if self.frame_pos >= self.frame.len() {
                self.load_next_frame()?;
            }
            let avail = self.frame.len() - self.frame_pos;
            let take = avail.min(buf.len() - total);
            buf[total..total + take]
                .copy_from_slice(&self.frame[self.frame_pos..self.frame_pos + take]);
            self.frame_pos += take;
            total += take;
        }
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64, Error> {
        Ok(f64::from_bits(self.read_u64()?))
    }
}
