//! implements a parser for the queue's line protocol.
use std::fmt;

use crate::types::protocol::Command;
use crate::types::serialisable::WireSerialisable;
use crate::types::states::JobState;

/// Longest accepted command line, excluding the trailing CRLF.
pub const MAX_LINE_LEN: usize = 222;

/// Longest accepted queue or job-type name.
pub const MAX_NAME_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl WireSerialisable for ParsingError {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Checks a queue or job-type name: letters, digits and `+/;.$_()-`, not
/// starting with `-`, between 1 and 200 bytes long.
pub fn is_valid_name(name: &[u8]) -> bool {
    fn char_is_name_safe(c: u8, is_first: bool) -> bool {
        match c {
            b'a'..=b'z' => true,
            b'A'..=b'Z' => true,
            b'0'..=b'9' => true,
            b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
            b'-' => !is_first, // - is only name safe outside first position
            _ => false,
        }
    }

    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        match self.next_token() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes a space then a decimal number that must fit in a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        token.iter().try_fold(0u64, |r, v| match v {
            b'0'..=b'9' => r
                .checked_mul(10)
                .and_then(|r| r.checked_add((*v - b'0') as u64))
                .ok_or(ParsingError::BadFormat),
            _ => Err(ParsingError::BadFormat),
        })
    }

    /// Consumes a space then a decimal number that must fit in a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_next_u64()?
            .try_into()
            .map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes a space then a name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        if is_valid_name(token) {
            // Valid names are ASCII, so this never fails.
            String::from_utf8(token.to_vec())
                .map_err(|_| ParsingError::BadFormat)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes a space then either a name or `*`.
    fn expect_next_name_or_any(
        &mut self,
    ) -> Result<Option<String>, ParsingError> {
        if self.from.starts_with(b" *") && self.is_token_end(2) {
            self.from = &self.from[2..];
            return Ok(None);
        }

        self.expect_next_name().map(Some)
    }

    /// Consumes a space then either a job state name or `*`.
    fn expect_next_state_or_any(
        &mut self,
    ) -> Result<Option<JobState>, ParsingError> {
        self.expect_space()?;

        match self.expect_next_token()? {
            b"*" => Ok(None),
            name => JobState::from_name(name)
                .map(Some)
                .ok_or(ParsingError::BadFormat),
        }
    }

    fn is_token_end(&self, at: usize) -> bool {
        matches!(self.from.get(at), None | Some(b' '))
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for Command {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use Command::*;

        if value.len() > MAX_LINE_LEN {
            return Err(ParsingError::BadFormat);
        }

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"stats" => Stats,
            b"quit" => Quit,

            // <cmd> <id>
            b"status" => Status {
                id: ps.expect_next_u64()?,
            },
            b"kill" => Kill {
                id: ps.expect_next_u64()?,
            },

            // <cmd> <queue|*> <state|*> <after> <limit>
            b"list" => List {
                queue: ps.expect_next_name_or_any()?,
                state: ps.expect_next_state_or_any()?,
                after: ps.expect_next_u64()?,
                limit: ps.expect_next_u32()?,
            },

            // <cmd> <queue> <job-type> <delay> <max-attempts> <n_bytes>
            b"enqueue" => Enqueue {
                queue: ps.expect_next_name()?,
                job_type: ps.expect_next_name()?,
                delay: ps.expect_next_u32()?,
                max_attempts: ps.expect_next_u32()?,
                n_bytes: ps.expect_next_u32()?,
            },

            // <cmd> <queue> <job-type> <unix-secs> <max-attempts> <n_bytes>
            b"enqueue-at" => EnqueueAt {
                queue: ps.expect_next_name()?,
                job_type: ps.expect_next_name()?,
                at: ps.expect_next_u64()?,
                max_attempts: ps.expect_next_u32()?,
                n_bytes: ps.expect_next_u32()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
