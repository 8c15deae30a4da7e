use std::fmt;
use std::fs::OpenOptions;

use bitflags::bitflags;

use crate::error::FileError;

bitflags! {
    /// Access flags decoded from an fopen-style mode string.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeFlags: u8 {
        /// The handle may be read from.
        const READ = 1;
        /// The handle may be written to.
        const WRITE = 1 << 1;
        /// Every write lands at the end of the file.
        const APPEND = 1 << 2;
        /// Create the file when it does not exist.
        const CREATE = 1 << 3;
        /// Truncate the file to zero length on open.
        const TRUNCATE = 1 << 4;
        /// Fail when the file already exists.
        const CREATE_NEW = 1 << 5;
    }
}

/// An fopen-style open mode (`r`, `w`, `a`, `x`, `c`, each optionally with `+`).
///
/// The `b`, `t` and `e` modifiers are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMode {
    raw: String,
    flags: ModeFlags,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<Self, FileError> {
        let mut chars = mode.chars().filter(|c| !matches!(c, 'b' | 't' | 'e'));
        let base = match chars.next() {
            Some('r') => ModeFlags::READ,
            Some('w') => ModeFlags::WRITE | ModeFlags::CREATE | ModeFlags::TRUNCATE,
            Some('a') => ModeFlags::WRITE | ModeFlags::CREATE | ModeFlags::APPEND,
            Some('x') => ModeFlags::WRITE | ModeFlags::CREATE_NEW,
            Some('c') => ModeFlags::WRITE | ModeFlags::CREATE,
            _ => return Err(FileError::InvalidArgument(format!("invalid open mode `{mode}`"))),
        };
        let flags = match (chars.next(), chars.next()) {
            (None, _) => base,
            (Some('+'), None) => base | ModeFlags::READ | ModeFlags::WRITE,
            _ => return Err(FileError::InvalidArgument(format!("invalid open mode `{mode}`"))),
        };
        Ok(Self {
            raw: mode.to_string(),
            flags,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn flags(&self) -> ModeFlags {
        self.flags
    }

    pub fn is_readable(&self) -> bool {
        self.flags.contains(ModeFlags::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(ModeFlags::WRITE)
    }

    pub fn is_append(&self) -> bool {
        self.flags.contains(ModeFlags::APPEND)
    }

    pub(crate) fn to_open_options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.is_readable())
            .write(self.is_writable() && !self.is_append())
            .append(self.is_append())
            .truncate(self.flags.contains(ModeFlags::TRUNCATE))
            .create(self.flags.contains(ModeFlags::CREATE))
            .create_new(self.flags.contains(ModeFlags::CREATE_NEW));
        opts
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
