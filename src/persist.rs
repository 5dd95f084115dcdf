use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::fcntl::{flock, FlockArg};

use crate::encode::{Encoder, SerializeFn};
use crate::frame::FrameWriter;
use crate::queue::{self, Cmd, Word};
use crate::slot::SlotPool;
use crate::value::Value;
use crate::Error;

/// Owner of the sink: an append-mode file held under an exclusive
/// non-blocking advisory lock for the writer's lifetime.
pub struct Persister {
    file: File,
    path: PathBuf,
}

impl Persister {
    pub fn create<P: AsRef<Path>>(path: P, append: bool) -> Result<Persister, Error> {
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = options.open(path.as_ref())?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;
        Ok(Persister {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The producer-facing half returned by [`setup`]: the queue to push into
/// plus the drain thread to join at shutdown.
pub(crate) struct PersisterHandle {
    pub producer: queue::Producer,
    pub bytes_written: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl PersisterHandle {
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.producer.push(queue::cmd_entry(Cmd::Shutdown, 0), None);
            let _ = thread.join();
        }
    }
}

impl Drop for PersisterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Activate a persister: build the SPSC queue and start the drain thread
/// that serializes queue words into buffer slots and frames them to disk.
pub(crate) fn setup(
    persister: Persister,
    serializer: SerializeFn,
    magic_markers: bool,
    verbose: bool,
    queue_capacity: usize,
) -> Result<PersisterHandle, Error> {
    let (producer, consumer) = queue::channel(queue_capacity);
    let bytes_written = Arc::new(AtomicU64::new(0));
    let drained = bytes_written.clone();
    let thread = std::thread::Builder::new()
        .name("objstream-persist".to_string())
        .spawn(move || drain(persister, consumer, serializer, magic_markers, verbose, drained))?;
    Ok(PersisterHandle {
        producer,
        bytes_written,
        thread: Some(thread),
    })
}

/// Sink-facing output: fills pooled slots and frames each sealed slot to the
/// fd. Mid-item overflow rolls to the next free slot transparently.
struct SlotOutput {
    pool: SlotPool,
    framer: FrameWriter,
    bytes_written: Arc<AtomicU64>,
}

impl SlotOutput {
    /// Seal the current slot and hand it to the sink.
    fn submit(&mut self) -> io::Result<()> {
        if self.pool.current().is_empty() {
            return Ok(());
        }
        let written;
        {
            let slot = self.pool.current();
            let borrow = slot.borrow();
            written = borrow.bytes().len();
            self.framer.write(borrow.bytes())?;
        }
        self.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
        self.pool.advance();
        Ok(())
    }
}

impl io::Write for SlotOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            total += self.pool.current().fill(&buf[total..]);
            if self.pool.current().is_full() {
                self.submit()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.submit()
    }
}

fn expect_object(consumer: &queue::Consumer) -> Result<Arc<Value>, Error> {
    match queue::decode(consumer.pop()) {
        Word::Object(value) => Ok(value),
        Word::Command(cmd, _) => Err(Error::StdioError(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected a value word, found command {:?}", cmd),
        ))),
    }
}

fn stack_frames(value: &Value) -> Vec<(Arc<str>, u16)> {
    let items = match value {
        Value::List(items) => items,
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            if let Value::Tuple(pair) = item {
                if let (Some(Value::Str(filename)), Some(Value::Int(line))) =
                    (pair.get(0), pair.get(1))
                {
                    return Some((filename.clone(), *line as u16));
                }
            }
            None
        })
        .collect()
}

fn drain(
    persister: Persister,
    consumer: queue::Consumer,
    serializer: SerializeFn,
    magic_markers: bool,
    verbose: bool,
    bytes_written: Arc<AtomicU64>,
) {
    let mut out = SlotOutput {
        pool: SlotPool::new(2),
        framer: FrameWriter::new(persister.file.as_raw_fd()),
        bytes_written,
    };
    let mut encoder = Encoder::new(serializer, verbose);

    loop {
        match step(&mut out, &mut encoder, &consumer, magic_markers) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                // Reported once; the loop exits and later enqueues never
                // reach the sink.
                error!("persister terminating: {}", err);
                break;
            }
        }
    }
    // `persister` drops here, on the drain thread, releasing the lock.
}

fn step(
    out: &mut SlotOutput,
    encoder: &mut Encoder,
    consumer: &queue::Consumer,
    magic_markers: bool,
) -> Result<bool, Error> {
    match queue::decode(consumer.pop()) {
        Word::Object(value) => {
            // The queue's reference is released here, on the drain thread.
            encoder.write_value(out, &value)?;
        }
        Word::Command(cmd, arg) => match cmd {
            Cmd::MessageBoundary => {
                if magic_markers {
                    encoder.write_magic(out)?;
                }
                out.submit()?;
            }
            Cmd::Flush => out.submit()?,
            Cmd::Shutdown => {
                out.submit()?;
                return Ok(false);
            }
            Cmd::NewHandle => {
                let value = expect_object(consumer)?;
                encoder.write_new_handle(out, &value)?;
            }
            Cmd::HandleRef => encoder.write_handle_ref(out, arg)?,
            Cmd::HandleDelete => encoder.write_handle_delete(out, arg)?,
            Cmd::Bind => {
                let value = expect_object(consumer)?;
                encoder.bind(out, &value)?;
            }
            Cmd::ExtBind => {
                let value = expect_object(consumer)?;
                let typ = expect_object(consumer)?;
                encoder.ext_bind(out, &value, &typ)?;
            }
            Cmd::BindingDelete => {
                let value = expect_object(consumer)?;
                encoder.object_freed(out, &value)?;
            }
            Cmd::ThreadSwitch => {
                let value = expect_object(consumer)?;
                encoder.write_thread_switch(out, &value)?;
            }
            Cmd::Stack => {
                let value = expect_object(consumer)?;
                encoder.write_stack(out, arg as u64, &stack_frames(&value))?;
            }
            Cmd::Dropped => encoder.write_dropped(out, arg)?,
        },
    }
    Ok(true)
}
