pub mod inbox;
pub mod remote;

use crate::{location::Location, message::Message};
use inbox::Inbox;
use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Magic value at the start of every framed message
pub const MAGIC: u32 = 0x5261_793a;
/// magic (u32) + total length (u16), both in network byte order
pub const HEADER_LEN: usize = 6;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("message header is incomplete")]
    ShortHeader,
    #[error("bad magic value {0:#010x}")]
    BadMagic(u32),
    #[error("declared length {0} is smaller than the header")]
    BadLength(u16),
    #[error("payload is truncated, expected {expected} bytes")]
    ShortPayload { expected: usize },
    #[error("message of {0} bytes does not fit into a frame")]
    TooLarge(usize),
    #[error("failed to read message: {0}")]
    Read(#[source] io::Error),
    #[error("failed to encode or decode message payload")]
    Codec(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    /// total size of the message, header included
    pub length: u16,
}

impl Header {
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            magic: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0; HEADER_LEN];
        bytes[..4].copy_from_slice(&self.magic.to_be_bytes());
        bytes[4..].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }
}

/// Encode a message and prepend the header
pub fn frame(message: &Message) -> Result<Vec<u8>, TransportError> {
    let payload = message.encode()?;
    let total = payload.len() + HEADER_LEN;
    let length = u16::try_from(total).map_err(|_| TransportError::TooLarge(total))?;

    let mut buffer = Vec::with_capacity(total);
    buffer.extend_from_slice(&Header { magic: MAGIC, length }.to_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Read one frame, validating the magic and the declared length.
/// Returns the header and the (still encoded) payload.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(Header, Vec<u8>), TransportError> {
    let mut bytes = [0; HEADER_LEN];
    // read_exact retries on EINTR by itself
    reader.read_exact(&mut bytes).map_err(|error| match error.kind() {
        io::ErrorKind::UnexpectedEof => TransportError::ShortHeader,
        _ => TransportError::Read(error),
    })?;

    let header = Header::from_bytes(bytes);
    if header.magic != MAGIC {
        return Err(TransportError::BadMagic(header.magic));
    }
    let expected = usize::from(header.length)
        .checked_sub(HEADER_LEN)
        .ok_or(TransportError::BadLength(header.length))?;

    let mut payload = vec![0; expected];
    reader
        .read_exact(&mut payload)
        .map_err(|error| match error.kind() {
            io::ErrorKind::UnexpectedEof => TransportError::ShortPayload { expected },
            _ => TransportError::Read(error),
        })?;

    Ok((header, payload))
}

/// Read and decode the message stored at `path`, no retries
pub fn read_message(path: &Path) -> Result<Message, TransportError> {
    let mut file = File::open(path).map_err(|source| TransportError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let (_, payload) = read_frame(&mut file)?;

    Ok(Message::decode(&payload)?)
}

/// Write `message` as the result for `step` into the inbox.
///
/// If `reply` names a remote host the file is copied there and the local copy is removed
/// whatever the outcome of the copy, otherwise the file stays in the inbox.
pub fn write_message(
    inbox: &Inbox,
    message: &Message,
    reply: &Location,
    step: i64,
    copy_timeout: Duration,
) -> Result<(), TransportError> {
    let path = inbox.result_path(step);
    let buffer = frame(message)?;

    File::create(&path)
        .and_then(|mut file| file.write_all(&buffer))
        .map_err(|source| TransportError::Write {
            path: path.clone(),
            source,
        })?;
    debug!(path = ?path, step, bytes = buffer.len(), "Wrote result");

    if reply.is_remote() {
        remote::copy(&path, reply, copy_timeout);

        if let Err(error) = fs::remove_file(&path) {
            warn!(path = ?path, error = ?error, "Failed to remove relayed result");
        }
    }

    Ok(())
}
