//! Minimal line editing for in-process terminals.
//!
//! Handles what a user typing into a raw terminal expects: echo, backspace,
//! CR or LF to submit, Ctrl-C/Ctrl-D on an empty line to leave. Escape
//! sequences (arrow keys and friends) are swallowed.

use std::io::{self, Read, Write};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    /// Saw ESC.
    Start,
    /// Inside a CSI or SS3 sequence.
    Sequence,
}

/// Reads lines from a raw terminal.
pub struct LineEditor<R, W> {
    reader: R,
    writer: W,
    echo: bool,
    line: Vec<u8>,
    pending: Vec<u8>,
    /// Unprocessed input is `pending[pos..len]`.
    pos: usize,
    len: usize,
    escape: Escape,
    last_cr: bool,
}

impl<R: Read, W: Write> LineEditor<R, W> {
    /// Creates an editor. With `echo`, input is echoed back to `writer`.
    pub fn new(reader: R, writer: W, echo: bool) -> Self {
        Self {
            reader,
            writer,
            echo,
            line: Vec::new(),
            pending: vec![0; 1024],
            pos: 0,
            len: 0,
            escape: Escape::None,
            last_cr: false,
        }
    }

    /// The output side, for prompts and replies.
    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Reads the next line. `Ok(None)` means end of input.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            while self.pos < self.len {
                let byte = self.pending[self.pos];
                self.pos += 1;
                if let Some(event) = self.feed(byte)? {
                    return Ok(event);
                }
            }

            self.pos = 0;
            self.len = 0;
            self.len = match self.reader.read(&mut self.pending) {
                Ok(0) => {
                    if self.line.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(self.take_line()));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
        }
    }

    /// Processes one byte. Returns `Some` when a line or end of input is ready.
    fn feed(&mut self, byte: u8) -> io::Result<Option<Option<String>>> {
        let after_cr = std::mem::replace(&mut self.last_cr, false);

        match self.escape {
            Escape::Start => {
                self.escape = if byte == b'[' || byte == b'O' {
                    Escape::Sequence
                } else {
                    Escape::None
                };
                return Ok(None);
            }
            Escape::Sequence => {
                if (0x40..=0x7e).contains(&byte) {
                    self.escape = Escape::None;
                }
                return Ok(None);
            }
            Escape::None => {}
        }

        match byte {
            b'\n' if after_cr => Ok(None),
            b'\r' | b'\n' => {
                self.last_cr = byte == b'\r';
                self.echo_bytes(b"\r\n")?;
                Ok(Some(Some(self.take_line())))
            }
            CTRL_C => {
                if self.line.is_empty() {
                    return Ok(Some(None));
                }
                self.line.clear();
                self.echo_bytes(b"^C\r\n")?;
                Ok(None)
            }
            CTRL_D => {
                if self.line.is_empty() {
                    return Ok(Some(None));
                }
                Ok(None)
            }
            BACKSPACE | DEL => {
                if self.pop_char() {
                    self.echo_bytes(b"\x08 \x08")?;
                }
                Ok(None)
            }
            ESC => {
                self.escape = Escape::Start;
                Ok(None)
            }
            b if b < 0x20 => Ok(None),
            b => {
                self.line.push(b);
                self.echo_bytes(&[b])?;
                Ok(None)
            }
        }
    }

    fn pop_char(&mut self) -> bool {
        let Some(mut last) = self.line.pop() else {
            return false;
        };
        // drop UTF-8 continuation bytes along with their lead byte
        while last & 0xc0 == 0x80 {
            match self.line.pop() {
                Some(prev) => last = prev,
                None => break,
            }
        }
        true
    }

    fn take_line(&mut self) -> String {
        let line = std::mem::take(&mut self.line);
        String::from_utf8_lossy(&line).into_owned()
    }

    fn echo_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.echo {
            self.writer.write_all(bytes)?;
            self.writer.flush()?;
        }
        Ok(())
    }
}

/// Turns bare `\n` into `\r\n` for terminals in raw mode.
pub struct CrlfWriter<W> {
    inner: W,
    last: u8,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, last: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        for (idx, &byte) in buf.iter().enumerate() {
            if byte == b'\n' && self.last != b'\r' {
                self.inner.write_all(&buf[start..idx])?;
                self.inner.write_all(b"\r")?;
                start = idx;
            }
            self.last = byte;
        }
        self.inner.write_all(&buf[start..])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
