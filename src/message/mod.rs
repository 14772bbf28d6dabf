// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message codec and addressing.
//!
//! A message is one UTF-8 file: a `key: value` header block between two
//! `---` lines, a blank line, then a Markdown body. Its filename encodes the
//! creation stamp, type, sender, destination and id, so the bus can order and
//! address a message without opening it.

mod codec;
mod filename;
mod types;

pub use codec::{decode, encode, SEPARATOR};
pub use filename::{
    is_terminal_name, mark_terminal, terminal_name, FileStamp, MessageFilename, TerminalState,
    EXTENSION,
};
pub use types::{generate_msg_id, is_valid_ident, Address, Message, MessageType, ValidationIssue};

use std::path::Path;

use crate::error::{BusError, CodecError, Result};

/// Read and decode a message file. Undecodable content, including bytes
/// that are not UTF-8, is a [`CodecError`]; IO failures stay IO errors.
pub fn read_message(path: &Path) -> Result<Message> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(CodecError::NotUtf8.into())
        }
        Err(e) => return Err(e.into()),
    };
    decode(&text).map_err(BusError::from)
}

/// Encode a message and write it into `dir` under its canonical filename.
///
/// The file is written under a dot-prefixed temporary name and renamed into
/// place so that watchers never observe a partially written message.
pub fn write_message(dir: &Path, message: &Message) -> Result<std::path::PathBuf> {
    let name = MessageFilename::for_message(message)?.to_string();
    let path = dir.join(&name);
    let tmp = dir.join(format!(".{}.tmp", name));
    std::fs::write(&tmp, encode(message))?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Whether a directory entry name looks like a live (non-terminal) message file.
pub fn is_live_message_name(name: &str) -> bool {
    name.ends_with(EXTENSION) && !name.starts_with('.') && !is_terminal_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_message() {
        let temp = TempDir::new().unwrap();
        let msg = Message::new(
            MessageType::Task,
            &Address::bare("a"),
            &Address::bare("b"),
            "body\n",
        );
        let path = write_message(temp.path(), &msg).unwrap();
        assert!(is_live_message_name(
            path.file_name().unwrap().to_str().unwrap()
        ));
        assert_eq!(read_message(&path).unwrap(), msg);
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_non_utf8_file_is_a_codec_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("0101000001-task-lead>a-deadbeef.md");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert!(matches!(
            read_message(&path),
            Err(BusError::Codec(CodecError::NotUtf8))
        ));
        assert!(matches!(
            read_message(&temp.path().join("missing.md")),
            Err(BusError::Io(_))
        ));
    }

    #[test]
    fn test_live_message_names() {
        assert!(is_live_message_name("0101000000-task-a>b-1.md"));
        assert!(!is_live_message_name("0101000000-task-a>b-1-done.md"));
        assert!(!is_live_message_name(".0101000000-task-a>b-1.md.tmp"));
        assert!(!is_live_message_name("README.txt"));
    }
}
