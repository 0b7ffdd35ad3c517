//! Byte-addressable file handles for the simulated file layer.
//!
//! A handle is a cursor over a shared in-memory byte buffer; `reopen`
//! yields an independent cursor over the same bytes, which is what the
//! mapping layer relies on to keep its own file position.

use spin::RwLock;
use std::fmt;
use std::sync::Arc;

pub struct FileHandle {
    data: Arc<RwLock<Vec<u8>>>,
    pos: usize,
}

impl FileHandle {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        FileHandle {
            data: Arc::new(RwLock::new(bytes)),
            pos: 0,
        }
    }

    /// A file of `len` bytes filled with a deterministic non-zero
    /// pattern, so tests and traces can tell loaded bytes from
    /// zero-fill.
    pub fn with_len(len: usize) -> Self {
        let bytes = (0..len).map(|i| (i % 251) as u8).collect();
        Self::from_bytes(bytes)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns the number of
    /// bytes actually read, which is short at end-of-file.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.data.read();
        if self.pos >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - self.pos);
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Write `buf` at the cursor, growing the file if the write runs past
    /// the current end. Returns the number of bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let mut data = self.data.write();
        let end = self.pos + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        buf.len()
    }

    /// A new handle over the same bytes with its own cursor at zero.
    pub fn reopen(&self) -> FileHandle {
        FileHandle {
            data: Arc::clone(&self.data),
            pos: 0,
        }
    }
}

impl Clone for FileHandle {
    /// Cloning shares the bytes and copies the cursor; the two cursors
    /// advance independently afterwards.
    fn clone(&self) -> Self {
        FileHandle {
            data: Arc::clone(&self.data),
            pos: self.pos,
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("len", &self.len())
            .field("pos", &self.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_seek() {
        let mut f = FileHandle::from_bytes(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(buf, [1, 2]);

        f.seek(3);
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(buf, [4, 5]);
    }

    #[test]
    fn test_short_read_at_eof() {
        let mut f = FileHandle::from_bytes(vec![9; 10]);
        f.seek(8);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(f.read(&mut buf), 0);

        f.seek(100);
        assert_eq!(f.read(&mut buf), 0);
    }

    #[test]
    fn test_write_extends() {
        let mut f = FileHandle::from_bytes(vec![0; 4]);
        f.seek(2);
        assert_eq!(f.write(&[7, 8, 9]), 3);
        assert_eq!(f.len(), 5);

        let mut check = f.reopen();
        let mut buf = [0u8; 5];
        assert_eq!(check.read(&mut buf), 5);
        assert_eq!(buf, [0, 0, 7, 8, 9]);
    }

    #[test]
    fn test_reopen_cursor_independence() {
        let mut a = FileHandle::from_bytes((0..20).collect());
        let mut b = a.reopen();

        let mut buf = [0u8; 4];
        a.seek(10);
        a.read(&mut buf);
        assert_eq!(buf, [10, 11, 12, 13]);

        // b's cursor is untouched by a's traffic.
        b.read(&mut buf);
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn test_shared_bytes_visible_through_reopen() {
        let a = FileHandle::from_bytes(vec![0; 8]);
        let mut writer = a.reopen();
        writer.seek(4);
        writer.write(&[0xFF]);

        let mut reader = a.reopen();
        let mut buf = [0u8; 8];
        reader.read(&mut buf);
        assert_eq!(buf[4], 0xFF);
    }

    #[test]
    fn test_pattern_fill() {
        let mut f = FileHandle::with_len(300);
        assert_eq!(f.len(), 300);
        let mut buf = [0u8; 300];
        f.read(&mut buf);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[250], 250);
        assert_eq!(buf[251], 0); // pattern wraps at 251
    }
}
