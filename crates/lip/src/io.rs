//! Stream and filesystem interfaces.
//!
//! The compiler consumes [`Input`] streams and the bytecode dumper writes to
//! [`Output`] streams. The runtime reaches files only through the
//! [`FileSystem`] trait, so embedders control all IO; [`MemoryFs`] is an
//! in-memory implementation for tests and sandboxed hosts.

use std::io::Write as _;
use std::sync::Mutex;

use ahash::AHashMap;

/// A byte input stream. `read` fills as much of `buf` as it can and returns
/// the number of bytes produced; 0 signals end of stream.
pub trait Input {
    /// Reads up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// A byte output stream. `write` consumes as much of `buf` as it can and
/// returns the number of bytes accepted; a short write signals failure.
pub trait Output {
    /// Writes up to `buf.len()` bytes. Returns the number accepted.
    fn write(&mut self, buf: &[u8]) -> usize;
}

/// Filesystem interface.
///
/// Implementations may be called from multiple threads at once and must be
/// internally safe. Errors are reported as strings and wrapped into
/// [`Io`](crate::ErrorKind::Io) error records by the runtime.
pub trait FileSystem: Send + Sync {
    /// Opens a file for reading.
    fn begin_read(&self, path: &str) -> Result<Box<dyn Input + Send>, String>;

    /// Closes a stream previously opened with `begin_read`.
    fn end_read(&self, input: Box<dyn Input + Send>) {
        drop(input);
    }

    /// Opens a file for writing.
    fn begin_write(&self, path: &str) -> Result<Box<dyn Output + Send>, String>;

    /// Closes a stream previously opened with `begin_write`.
    fn end_write(&self, output: Box<dyn Output + Send>) {
        drop(output);
    }
}

impl<T: Input + ?Sized> Input for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }
}

impl<T: Input + ?Sized> Input for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }
}

/// Input over a borrowed byte slice.
pub struct SliceInput<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceInput<'a> {
    /// Creates an input reading from `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl Input for SliceInput<'_> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.bytes.len() - self.pos);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// Input over an owned byte buffer.
pub struct VecInput {
    bytes: Vec<u8>,
    pos: usize,
}

impl VecInput {
    /// Creates an input reading from `bytes`.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl Input for VecInput {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.bytes.len() - self.pos);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// Output collecting into a `Vec<u8>`.
#[derive(Default)]
pub struct VecOutput(Vec<u8>);

impl VecOutput {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Borrows the collected bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Output for VecOutput {
    fn write(&mut self, buf: &[u8]) -> usize {
        self.0.extend_from_slice(buf);
        buf.len()
    }
}

/// Output to the process's standard output.
#[derive(Debug, Default)]
pub struct StdOutput;

impl Output for StdOutput {
    fn write(&mut self, buf: &[u8]) -> usize {
        let mut stdout = std::io::stdout();
        match stdout.write_all(buf).and_then(|()| stdout.flush()) {
            Ok(()) => buf.len(),
            Err(_) => 0,
        }
    }
}

/// Input from any `std::io::Read`.
pub struct ReadInput<R>(pub R);

impl<R: std::io::Read> Input for ReadInput<R> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.0.read(buf).unwrap_or(0)
    }
}

/// An input that replays a prefix before delegating to an inner stream.
///
/// The script loader reads the magic bytes to sniff bytecode; when the file
/// turns out to be source, the consumed bytes are pushed back this way.
pub(crate) struct PrefixInput<I> {
    prefix: Vec<u8>,
    pos: usize,
    inner: I,
}

impl<I: Input> PrefixInput<I> {
    pub fn new(prefix: Vec<u8>, inner: I) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<I: Input> Input for PrefixInput<I> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.pos < self.prefix.len() {
            let n = buf.len().min(self.prefix.len() - self.pos);
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            n
        } else {
            self.inner.read(buf)
        }
    }
}

/// In-memory filesystem keyed by path.
#[derive(Default)]
pub struct MemoryFs {
    files: Mutex<AHashMap<String, Vec<u8>>>,
}

impl MemoryFs {
    /// Creates an empty filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a file.
    pub fn add_file(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(path.into(), contents.into());
    }

    /// Returns a file's contents, if present.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

/// Write handle that stores back into the owning [`MemoryFs`] on every write.
struct MemoryFsWriter {
    buffer: Vec<u8>,
}

impl Output for MemoryFsWriter {
    fn write(&mut self, buf: &[u8]) -> usize {
        self.buffer.extend_from_slice(buf);
        buf.len()
    }
}

impl FileSystem for MemoryFs {
    fn begin_read(&self, path: &str) -> Result<Box<dyn Input + Send>, String> {
        match self.file(path) {
            Some(bytes) => Ok(Box::new(VecInput::new(bytes))),
            None => Err(format!("No such file: {path}")),
        }
    }

    fn begin_write(&self, _path: &str) -> Result<Box<dyn Output + Send>, String> {
        Ok(Box::new(MemoryFsWriter { buffer: Vec::new() }))
    }

    fn end_write(&self, output: Box<dyn Output + Send>) {
        // Writes are buffered; nothing further to flush here. Hosts that
        // need the written bytes should use `dump_script` with an explicit
        // output stream instead.
        drop(output);
    }
}

/// Reads the stream to the end.
pub(crate) fn read_to_end(input: &mut dyn Input) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = input.read(&mut buf);
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Reads exactly `len` bytes, or returns `None` on a short read.
pub(crate) fn read_exact(input: &mut dyn Input, len: usize) -> Option<Vec<u8>> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = input.read(&mut out[filled..]);
        if n == 0 {
            return None;
        }
        filled += n;
    }
    Some(out)
}
