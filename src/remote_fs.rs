//! File and directory operations on the board's flash filesystem.
//!
//! Every operation is translated into command buffers executed through the
//! [`ControlChannel`]. Tracebacks raised on the board are decoded into
//! [`Error::Remote`] with the matching [`RemoteErrorKind`] and the board's own
//! message.

mod commands;
mod literal;

use std::fmt;

use log::{debug, info, trace, warn};

use crate::{
    control::{ChannelState, CommandResult, ControlChannel},
    entry::{rooted, EntryKind},
    error::{Error, RemoteErrorKind, Result},
    settings::Settings,
    transport::{Connection, Link},
};

pub use literal::{bytes_literal, str_literal};

// =============================================================================
// Public Interface
// =============================================================================

/// A file or directory on the board, as reported by [`RemoteFs::list`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RemoteEntry {
    /// Rooted, `/` separated path.
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes, files only.
    pub size: Option<u64>,
    /// SHA-256 of the content as lowercase hex, when the board has `hashlib`.
    pub digest: Option<String>,
}

/// The board's filesystem, reached through a ready control channel.
pub struct RemoteFs {
    channel: ControlChannel,
    chunk_size: usize,
}
impl RemoteFs {
    /// Open the serial port from `settings` and enter raw mode.
    pub fn connect(settings: &Settings) -> Result<Self> {
        let conn = Connection::open(settings)?;
        RemoteFs::handshake(conn, settings)
    }

    /// Same as [`RemoteFs::connect`] over an already open link.
    pub fn connect_link(link: Box<dyn Link>, settings: &Settings) -> Result<Self> {
        let conn = Connection::with_link(link, settings)?;
        RemoteFs::handshake(conn, settings)
    }

    fn handshake(conn: Connection, settings: &Settings) -> Result<Self> {
        let mut channel = ControlChannel::new(conn, settings);
        if let Err(err) = channel.enter_raw_mode() {
            let _ = channel.close();
            return Err(err);
        }
        Ok(RemoteFs {
            channel,
            chunk_size: settings.chunk_size,
        })
    }

    pub fn port(&self) -> &str {
        self.channel.port()
    }

    /// Create a single directory; its parent must exist.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        debug!("mkdir {}", path);
        self.run(path, &commands::mkdir(path)).map(|_| ())
    }

    /// Write `content` to `path`, replacing any previous file.
    ///
    /// The content goes out in chunks of the configured size, each chunk
    /// written at its own offset through a handle that stays open on the
    /// board until the last one.
    pub fn put_file(&mut self, path: &str, content: &[u8]) -> Result<()> {
        debug!("put {} ({} bytes)", path, content.len());
        self.run(path, &commands::open_for_write(path))?;

        for (index, chunk) in content.chunks(self.chunk_size).enumerate() {
            let offset = index * self.chunk_size;
            trace!("{}: {} bytes at {}", path, chunk.len(), offset);
            if let Err(err) = self.run(path, &commands::write_at(offset, chunk)) {
                self.abandon_handle(path);
                return Err(err);
            }
        }

        self.run(path, &commands::close_handle()).map(|_| ())
    }

    /// Recursive listing of everything below `path` (not including `path`).
    /// `path` is taken from the root, whatever its slashes.
    pub fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = &rooted(path);
        debug!("list {}", path);
        let result = self.run(path, &commands::list(path))?;
        let text = result.output_text();
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            entries.push(parse_entry(line)?);
        }
        Ok(entries)
    }

    /// Remove a file, or an empty directory.
    pub fn remove(&mut self, path: &str, kind: EntryKind) -> Result<()> {
        let path = &rooted(path);
        debug!("remove {} {}", kind, path);
        let command = match kind {
            EntryKind::File => commands::remove_file(path),
            EntryKind::Directory => commands::remove_dir(path),
        };
        self.run(path, &command).map(|_| ())
    }

    /// Bring the control channel back to a ready state after a failure.
    pub fn resync(&mut self) -> Result<()> {
        self.channel.resync()
    }

    /// Leave raw mode and close the connection.
    pub fn close(&mut self) -> Result<()> {
        info!("Closing the session on {}", self.channel.port());
        self.channel.close()
    }

    /// Run one command, turning a traceback into an [`Error::Remote`] about
    /// `path`.
    fn run(&mut self, path: &str, command: &str) -> Result<CommandResult> {
        let result = self.channel.execute(command.as_bytes())?;
        match &result.error {
            None => Ok(result),
            Some(traceback) => {
                let message = last_line(traceback).to_owned();
                let kind = classify(&message);
                debug!("{} failed on the board: {}", path, message);
                Err(Error::Remote {
                    kind,
                    path: path.to_owned(),
                    message,
                })
            }
        }
    }

    /// Best effort to close the handle left open by a failed chunk, so that
    /// the next command starts from a clean slate.
    fn abandon_handle(&mut self, path: &str) {
        if self.channel.state() != ChannelState::Ready {
            return;
        }
        if let Err(err) = self.channel.execute(commands::close_handle().as_bytes()) {
            warn!("Could not close the handle on {}: {}", path, err);
        }
    }
}
impl fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFs")
            .field("channel", &self.channel)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Map a MicroPython exception line onto a [`RemoteErrorKind`].
///
/// `OSError` carries an errno, printed either as `OSError: 2` or as
/// `OSError: [Errno 2] ENOENT` depending on the port.
pub fn classify(message: &str) -> RemoteErrorKind {
    let rest = match message.find("OSError:") {
        Some(pos) => message[pos + "OSError:".len()..].trim(),
        None => return RemoteErrorKind::Other,
    };
    let rest = rest.strip_prefix("[Errno").unwrap_or(rest).trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u32>() {
        Ok(2) => RemoteErrorKind::NotFound,
        Ok(17) => RemoteErrorKind::AlreadyExists,
        Ok(28) => RemoteErrorKind::NoSpace,
        Ok(1) | Ok(13) => RemoteErrorKind::PermissionDenied,
        Ok(5) => RemoteErrorKind::Io,
        _ => RemoteErrorKind::Other,
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn last_line(text: &str) -> &str {
    text.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
}

fn parse_entry(line: &str) -> Result<RemoteEntry> {
    let malformed = || Error::Protocol(format!("unexpected listing line {:?}", line));
    let (tag, rest) = line.split_at(line.find('\t').ok_or_else(malformed)?);
    let rest = &rest[1..];
    match tag {
        "D" => Ok(RemoteEntry {
            path: rest.to_owned(),
            kind: EntryKind::Directory,
            size: None,
            digest: None,
        }),
        "F" => {
            // The path may itself contain tabs, split from the right.
            let mut fields = rest.rsplitn(3, '\t');
            let digest = fields.next().ok_or_else(malformed)?;
            let size = fields.next().ok_or_else(malformed)?;
            let path = fields.next().ok_or_else(malformed)?;
            Ok(RemoteEntry {
                path: path.to_owned(),
                kind: EntryKind::File,
                size: Some(size.parse().map_err(|_| malformed())?),
                digest: if digest == "-" {
                    None
                } else {
                    Some(digest.to_owned())
                },
            })
        }
        _ => Err(malformed()),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
