use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, SpillError};
use crate::record::{RecordHeader, RecordKind, RECORD_HEADER_LEN};

/// A seekable scratch device, opened once per page.
///
/// Every call is synchronous and issued from the thread that owns the page.
pub trait DiskChannel {
    fn seek(&mut self, offset: u64) -> io::Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// Opens a fresh channel for a new page.
pub type ChannelFactory = Box<dyn FnMut() -> io::Result<Box<dyn DiskChannel>>>;

/// Anonymous scratch file; the directory entry is gone as soon as it is
/// created, so nothing is left behind if the process dies mid-page.
#[derive(Debug)]
pub struct FileChannel {
    file: Option<File>,
}

impl FileChannel {
    pub fn create(dir: Option<&Path>) -> io::Result<Self> {
        let file = match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::tempfile_in(dir)?
            }
            None => tempfile::tempfile()?,
        };
        Ok(Self { file: Some(file) })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("scratch file already closed"))
    }
}

impl DiskChannel for FileChannel {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file()?.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        Read::read_exact(self.file()?, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self.file()?, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle releases the unlinked file's blocks.
        self.file.take();
        Ok(())
    }
}

/// Channel backed by a growable in-memory buffer.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    cursor: Cursor<Vec<u8>>,
    closed: bool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::other("memory channel closed"));
        }
        Ok(())
    }
}

impl DiskChannel for MemoryChannel {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.check_open()?;
        self.cursor.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.check_open()?;
        Read::read_exact(&mut self.cursor, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.check_open()?;
        Write::write_all(&mut self.cursor, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// The page's scratch file: lazily opened, append-only except for in-place
/// rewrites of records whose size does not change.
pub(crate) struct SpillFile {
    open: ChannelFactory,
    channel: Option<Box<dyn DiskChannel>>,
    write_cursor: u64,
}

impl SpillFile {
    pub(crate) fn new(open: ChannelFactory) -> Self {
        Self {
            open,
            channel: None,
            write_cursor: 0,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Bytes written so far this page.
    pub(crate) fn len(&self) -> u64 {
        self.write_cursor
    }

    fn writer(&mut self) -> Result<&mut dyn DiskChannel> {
        if self.channel.is_none() {
            let channel = (self.open)()?;
            tracing::debug!(target: "rip.dlspill", "opened display-list scratch channel");
            self.channel = Some(channel);
        }
        self.reader()
    }

    fn reader(&mut self) -> Result<&mut dyn DiskChannel> {
        match self.channel.as_deref_mut() {
            Some(channel) => Ok(channel),
            None => Err(SpillError::ChannelClosed),
        }
    }

    /// Appends a record and returns its offset.
    pub(crate) fn append(&mut self, kind: RecordKind, count: u32, body: &[u8]) -> Result<u64> {
        let offset = self.write_cursor;
        self.write_at(offset, kind, count, body)?;
        self.write_cursor = offset + RECORD_HEADER_LEN as u64 + body.len() as u64;
        Ok(offset)
    }

    /// Rewrites a record in place. The caller guarantees the body length is
    /// the one originally written at `offset`.
    pub(crate) fn overwrite(
        &mut self,
        offset: u64,
        kind: RecordKind,
        count: u32,
        body: &[u8],
    ) -> Result<()> {
        self.write_at(offset, kind, count, body)
    }

    fn write_at(&mut self, offset: u64, kind: RecordKind, count: u32, body: &[u8]) -> Result<()> {
        let len = u32::try_from(body.len()).map_err(|_| SpillError::CorruptRecord {
            offset,
            reason: "record body exceeds u32 length",
        })?;
        let header = RecordHeader { kind, count, len };
        let channel = self.writer()?;
        channel.seek(offset)?;
        channel.write_all(&header.encode())?;
        channel.write_all(body)?;
        Ok(())
    }

    /// Reads the record at `offset` into `body`, checking its header first so
    /// a corrupt length never drives an allocation.
    pub(crate) fn read(
        &mut self,
        offset: u64,
        kind: RecordKind,
        count: u32,
        len: Option<u32>,
        body: &mut Vec<u8>,
    ) -> Result<RecordHeader> {
        if offset >= self.write_cursor {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "offset beyond end of scratch file",
            });
        }
        let limit = self.write_cursor - offset;
        let channel = self.reader()?;
        channel.seek(offset)?;
        let mut header_bytes = [0u8; RECORD_HEADER_LEN];
        channel.read_exact(&mut header_bytes)?;
        let header = RecordHeader::decode(&header_bytes, offset)?;
        header.expect(offset, kind, count, len)?;
        if header.total_len() > limit {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "record runs past end of scratch file",
            });
        }

        body.clear();
        body.resize(header.len as usize, 0);
        channel.read_exact(body)?;
        Ok(header)
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.write_cursor = 0;
        match self.channel.take() {
            Some(mut channel) => {
                channel.close()?;
                tracing::debug!(target: "rip.dlspill", "closed display-list scratch channel");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SpillFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillFile")
            .field("open", &self.is_open())
            .field("write_cursor", &self.write_cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_file() -> SpillFile {
        SpillFile::new(Box::new(|| Ok(Box::new(MemoryChannel::new()) as Box<dyn DiskChannel>)))
    }

    #[test]
    fn append_then_read_back() {
        let mut file = memory_file();
        assert!(!file.is_open());

        let first = file.append(RecordKind::FillPayload, 1, b"abc").unwrap();
        let second = file.append(RecordKind::Aggregate, 2, b"defgh").unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 15);
        assert_eq!(file.len(), 32);

        let mut body = Vec::new();
        let header = file
            .read(second, RecordKind::Aggregate, 2, Some(5), &mut body)
            .unwrap();
        assert_eq!(header.len, 5);
        assert_eq!(body, b"defgh");
    }

    #[test]
    fn overwrite_keeps_neighbours_intact() {
        let mut file = memory_file();
        let first = file.append(RecordKind::GouraudPayload, 1, b"1111").unwrap();
        let second = file.append(RecordKind::GouraudPayload, 1, b"2222").unwrap();

        file.overwrite(first, RecordKind::GouraudPayload, 1, b"3333").unwrap();

        let mut body = Vec::new();
        file.read(first, RecordKind::GouraudPayload, 1, Some(4), &mut body)
            .unwrap();
        assert_eq!(body, b"3333");
        file.read(second, RecordKind::GouraudPayload, 1, Some(4), &mut body)
            .unwrap();
        assert_eq!(body, b"2222");
    }

    #[test]
    fn reads_past_the_write_cursor_are_corrupt() {
        let mut file = memory_file();
        file.append(RecordKind::FillPayload, 1, b"abc").unwrap();
        let mut body = Vec::new();
        let err = file
            .read(64, RecordKind::FillPayload, 1, None, &mut body)
            .unwrap_err();
        assert!(matches!(err, SpillError::CorruptRecord { offset: 64, .. }));
    }

    #[test]
    fn file_channel_round_trips_in_scratch_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        let mut channel = FileChannel::create(Some(&scratch)).unwrap();
        channel.write_all(b"hello world").unwrap();
        channel.seek(6).unwrap();
        let mut buf = [0u8; 5];
        channel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // The scratch file is anonymous.
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);

        channel.close().unwrap();
        assert!(channel.seek(0).is_err());
    }

    #[test]
    fn closing_resets_the_cursor() {
        let mut file = memory_file();
        file.append(RecordKind::FillPayload, 1, b"abc").unwrap();
        file.close().unwrap();
        assert!(!file.is_open());
        assert_eq!(file.len(), 0);

        let mut body = Vec::new();
        assert!(file
            .read(0, RecordKind::FillPayload, 1, None, &mut body)
            .is_err());
    }
}
