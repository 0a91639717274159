// src/payload.rs

//! Package payload archives
//!
//! The payload travels as a CPIO New ASCII (newc) archive. The reader
//! streams entries out of an archive; the writer produces one, used when a
//! package is repackaged before erasure. `Payload` is the in-memory view
//! the file state machine installs from, keyed by root-relative path.

use std::collections::HashMap;
use std::io::{self, Read, Write};

/// CPIO New ASCII Format (newc) header size
const HEADER_SIZE: usize = 110;
/// Magic string for newc format
const MAGIC_NEWC: &[u8] = b"070701";
/// Magic string for CRC format
const MAGIC_CRC: &[u8] = b"070702";
const TRAILER: &str = "TRAILER!!!";

/// Extracted CPIO entry metadata
#[derive(Debug, Clone)]
pub struct CpioEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

/// A reader for CPIO (New ASCII) archives
pub struct CpioReader<R: Read> {
    reader: R,
}

impl<R: Read> CpioReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next entry from the archive
    ///
    /// Returns Ok(None) at the trailer or a clean end of stream.
    pub fn next_entry(&mut self) -> io::Result<Option<(CpioEntry, Vec<u8>)>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut header_buf) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }

        let magic = &header_buf[0..6];
        if magic != MAGIC_NEWC && magic != MAGIC_CRC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid cpio magic: {:?}", String::from_utf8_lossy(magic)),
            ));
        }

        let parse_hex = |start: usize, len: usize| -> io::Result<u32> {
            let s = std::str::from_utf8(&header_buf[start..start + len])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            u32::from_str_radix(s, 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };

        let mode = parse_hex(14, 8)?;
        let uid = parse_hex(22, 8)?;
        let gid = parse_hex(30, 8)?;
        let nlink = parse_hex(38, 8)?;
        let mtime = parse_hex(46, 8)? as u64;
        let filesize = parse_hex(54, 8)? as u64;
        let namesize = parse_hex(94, 8)? as u64;

        let mut name_buf = vec![0u8; namesize as usize];
        self.reader.read_exact(&mut name_buf)?;
        if name_buf.last() == Some(&0) {
            name_buf.pop();
        }
        let name = String::from_utf8_lossy(&name_buf).to_string();

        if name == TRAILER {
            return Ok(None);
        }

        // Align to 4 bytes after name and after content.
        self.skip_pad(HEADER_SIZE + namesize as usize)?;
        let mut content = vec![0u8; filesize as usize];
        self.reader.read_exact(&mut content)?;
        self.skip_pad(filesize as usize)?;

        Ok(Some((
            CpioEntry {
                name,
                size: filesize,
                mode,
                mtime,
                uid,
                gid,
                nlink,
            },
            content,
        )))
    }

    fn skip_pad(&mut self, consumed: usize) -> io::Result<()> {
        let pad = (4 - (consumed % 4)) % 4;
        if pad > 0 {
            let mut skip = [0u8; 3];
            self.reader.read_exact(&mut skip[..pad])?;
        }
        Ok(())
    }
}

/// A writer for CPIO (New ASCII) archives
pub struct CpioWriter<W: Write> {
    writer: W,
    ino: u32,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, ino: 0 }
    }

    /// Append one entry with its content
    pub fn append(&mut self, entry: &CpioEntry, content: &[u8]) -> io::Result<()> {
        self.ino += 1;
        self.write_header(&entry.name, self.ino, entry, content.len() as u32)?;
        self.writer.write_all(content)?;
        self.write_pad(content.len())?;
        Ok(())
    }

    /// Write the trailer and flush
    pub fn finish(mut self) -> io::Result<W> {
        let trailer = CpioEntry {
            name: TRAILER.to_string(),
            size: 0,
            mode: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
        };
        self.write_header(TRAILER, 0, &trailer, 0)?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn write_header(
        &mut self,
        name: &str,
        ino: u32,
        entry: &CpioEntry,
        filesize: u32,
    ) -> io::Result<()> {
        let namesize = name.len() as u32 + 1;
        let mut header = Vec::with_capacity(HEADER_SIZE + namesize as usize);
        header.extend_from_slice(MAGIC_NEWC);
        for field in [
            ino,
            entry.mode,
            entry.uid,
            entry.gid,
            entry.nlink,
            entry.mtime as u32,
            filesize,
            0, // devmajor
            0, // devminor
            0, // rdevmajor
            0, // rdevminor
            namesize,
            0, // checksum (newc: always zero)
        ] {
            header.extend_from_slice(format!("{:08x}", field).as_bytes());
        }
        header.extend_from_slice(name.as_bytes());
        header.push(0);
        self.writer.write_all(&header)?;
        self.write_pad(HEADER_SIZE + namesize as usize)
    }

    fn write_pad(&mut self, consumed: usize) -> io::Result<()> {
        let pad = (4 - (consumed % 4)) % 4;
        if pad > 0 {
            self.writer.write_all(&[0u8; 3][..pad])?;
        }
        Ok(())
    }
}

/// One file's content and metadata within an unpacked payload
#[derive(Debug, Clone)]
pub struct PayloadEntry {
    pub content: Vec<u8>,
    pub mode: u32,
    pub mtime: u64,
}

/// In-memory payload keyed by root-relative path
#[derive(Debug, Default)]
pub struct Payload {
    entries: HashMap<String, PayloadEntry>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack a cpio archive into memory
    pub fn from_cpio<R: Read>(reader: R) -> io::Result<Self> {
        let mut payload = Self::new();
        let mut cpio = CpioReader::new(reader);
        while let Some((entry, content)) = cpio.next_entry()? {
            payload.entries.insert(
                normalize(&entry.name),
                PayloadEntry {
                    content,
                    mode: entry.mode,
                    mtime: entry.mtime,
                },
            );
        }
        Ok(payload)
    }

    /// Insert one file by header path
    pub fn insert(&mut self, path: &str, entry: PayloadEntry) {
        self.entries.insert(normalize(path), entry);
    }

    /// Look an entry up by header path
    pub fn get(&self, path: &str) -> Option<&PayloadEntry> {
        self.entries.get(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical payload key: strip "./" and leading slashes
fn normalize(name: &str) -> String {
    name.trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_entry(name: &str, size: u64) -> CpioEntry {
        CpioEntry {
            name: name.to_string(),
            size,
            mode: 0o100644,
            mtime: 1_700_000_000 & 0xffff_ffff,
            uid: 0,
            gid: 0,
            nlink: 1,
        }
    }

    #[test]
    fn test_writer_reader_round_trip() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .append(&sample_entry("./usr/bin/foo", 5), b"hello")
            .unwrap();
        writer
            .append(&sample_entry("./etc/foo.conf", 3), b"cfg")
            .unwrap();
        let archive = writer.finish().unwrap();

        let mut reader = CpioReader::new(Cursor::new(archive));
        let (e1, c1) = reader.next_entry().unwrap().unwrap();
        assert_eq!(e1.name, "./usr/bin/foo");
        assert_eq!(c1, b"hello");
        let (e2, c2) = reader.next_entry().unwrap().unwrap();
        assert_eq!(e2.name, "./etc/foo.conf");
        assert_eq!(c2, b"cfg");
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut reader = CpioReader::new(Cursor::new(vec![b'X'; HEADER_SIZE]));
        assert!(reader.next_entry().is_err());
    }

    #[test]
    fn test_payload_lookup_by_header_path() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .append(&sample_entry("./usr/bin/foo", 5), b"hello")
            .unwrap();
        let archive = writer.finish().unwrap();

        let payload = Payload::from_cpio(Cursor::new(archive)).unwrap();
        // Header paths are absolute; payload names carry "./".
        let entry = payload.get("/usr/bin/foo").unwrap();
        assert_eq!(entry.content, b"hello");
        assert_eq!(entry.mode, 0o100644);
    }
}
