#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate log;

mod wire;
pub use wire::*;

mod value;
pub use value::*;

mod queue;

mod slot;

mod frame;
pub use frame::*;

mod encode;
pub use encode::SerializeFn;

mod persist;
pub use persist::*;

mod writer;
pub use writer::*;

mod reader;
pub use reader::*;

mod demux;
pub use demux::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("stdio error")]
    StdioError(#[from] std::io::Error),
    #[error("syscall error")]
    SysError(#[from] nix::Error),
    #[error("utf error")]
    Utf8Error(#[from] std::string::FromUtf8Error),
    #[error("decode error at byte {offset}, message {message}, control {control:#04x}: {reason}")]
    DecodeError {
        offset: u64,
        message: u64,
        control: u8,
        reason: String,
    },
    #[error("protocol error at byte {offset}, message {message}, control {control:#04x}: {reason}")]
    ProtocolError {
        offset: u64,
        message: u64,
        control: u8,
        reason: String,
    },
    #[error("overflow: {0}")]
    Overflow(String),
    #[error("could not allocate {0} bytes")]
    Resource(usize),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("stream closed")]
    Closed,
    #[error("reader unusable after an earlier decode failure")]
    Poisoned,
    #[error("cannot read the next value while a bind is pending")]
    PendingBind,
    #[error("no pending bind to supply")]
    NoPendingBind,
    #[error("bind error: {0}")]
    BindError(String),
}
