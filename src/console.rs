//! Console collaborators (spec.md §1): the real implementations live in
//! hardware/VGA/serial driver code outside this crate. `put_buffer` is
//! chunked because the reference kernel's console lock can't be held for an
//! unbounded write — spec.md doesn't name the exact chunk size so this
//! mirrors Pintos' conservative 256-byte choice rounded up to a tidy 300.

pub const CONSOLE_CHUNK: usize = 300;

pub trait ConsoleOutput: Send {
    /// Write `buf` to the console, internally splitting it into
    /// `CONSOLE_CHUNK`-sized writes so no other thread can interleave output
    /// mid-chunk while still allowing interleaving between chunks.
    fn put_buffer(&mut self, buf: &[u8]) {
        for chunk in buf.chunks(CONSOLE_CHUNK) {
            self.put_chunk(chunk);
        }
    }

    /// Write a single chunk, no larger than `CONSOLE_CHUNK` bytes, without
    /// releasing whatever internal lock guards the device.
    fn put_chunk(&mut self, chunk: &[u8]);
}

pub trait InputSource: Send {
    /// Block until a byte is available and return it, or `None` if the
    /// input source has been closed.
    fn read_char(&mut self) -> Option<u8>;
}

/// An in-memory `ConsoleOutput`/`InputSource` pair for tests and demos.
pub struct MemConsole {
    pub written: alloc::vec::Vec<u8>,
    pub chunk_sizes: alloc::vec::Vec<usize>,
    input: alloc::collections::VecDeque<u8>,
}

impl MemConsole {
    pub fn new() -> Self {
        MemConsole {
            written: alloc::vec::Vec::new(),
            chunk_sizes: alloc::vec::Vec::new(),
            input: alloc::collections::VecDeque::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }
}

impl Default for MemConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleOutput for MemConsole {
    fn put_chunk(&mut self, chunk: &[u8]) {
        self.written.extend_from_slice(chunk);
        self.chunk_sizes.push(chunk.len());
    }
}

impl InputSource for MemConsole {
    fn read_char(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_writes_are_chunked() {
        let mut c = MemConsole::new();
        let data = alloc::vec![b'x'; CONSOLE_CHUNK * 2 + 10];
        c.put_buffer(&data);
        assert_eq!(c.written, data);
        assert_eq!(c.chunk_sizes, alloc::vec![CONSOLE_CHUNK, CONSOLE_CHUNK, 10]);
    }

    #[test]
    fn read_char_drains_in_order() {
        let mut c = MemConsole::new();
        c.feed(b"ab");
        assert_eq!(c.read_char(), Some(b'a'));
        assert_eq!(c.read_char(), Some(b'b'));
        assert_eq!(c.read_char(), None);
    }
}
