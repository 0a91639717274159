// src/header.rs

//! Opaque package header store
//!
//! The header is consumed as a tag-indexed key/value store with array-valued
//! fields; the on-disk wire format belongs to the caller. Headers are shared
//! read-only via `Arc` once handed to the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fileinfo::FileFlags;
use crate::nevra::Nevra;

/// Well-known header tags referenced by the engine
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Tag {
    Name,
    Epoch,
    Version,
    Release,
    Arch,
    BaseNames,
    DirNames,
    DirIndexes,
    FileFlags,
    FileModes,
    FileSizes,
    FileDigests,
    FileLinkTos,
    FileLangs,
    FileColors,
    FileRdevs,
    FileMtimes,
    FileStates,
    PackageColor,
    PackageId,
    HeaderId,
    SourceRpm,
    Cookie,
    PayloadFormat,
    Pretrans,
    PretransProg,
    Posttrans,
    PosttransProg,
    Prein,
    PreinProg,
    Postin,
    PostinProg,
    Preun,
    PreunProg,
    Postun,
    PostunProg,
}

/// Tag payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    StrArray(Vec<String>),
    U32(u32),
    U32Array(Vec<u32>),
}

/// Package header: an ordered tag/value map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    tags: BTreeMap<Tag, Value>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: Tag) -> Option<&Value> {
        self.tags.get(&tag)
    }

    pub fn set(&mut self, tag: Tag, value: Value) {
        self.tags.insert(tag, value);
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Value> {
        self.tags.remove(&tag)
    }

    /// Append to an array-valued tag, creating it if absent
    pub fn append_str(&mut self, tag: Tag, value: &str) {
        match self.tags.entry(tag).or_insert_with(|| Value::StrArray(Vec::new())) {
            Value::StrArray(v) => v.push(value.to_string()),
            other => *other = Value::StrArray(vec![value.to_string()]),
        }
    }

    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        match self.tags.get(&tag) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_u32(&self, tag: Tag) -> Option<u32> {
        match self.tags.get(&tag) {
            Some(Value::U32(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_str_array(&self, tag: Tag) -> Option<&[String]> {
        match self.tags.get(&tag) {
            Some(Value::StrArray(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_u32_array(&self, tag: Tag) -> Option<&[u32]> {
        match self.tags.get(&tag) {
            Some(Value::U32Array(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Extract the package identity, failing on a malformed header
    pub fn nevra(&self) -> Result<Nevra> {
        let name = self.get_str(Tag::Name).ok_or(Error::MissingTag("Name"))?;
        let version = self
            .get_str(Tag::Version)
            .ok_or(Error::MissingTag("Version"))?;
        let release = self
            .get_str(Tag::Release)
            .ok_or(Error::MissingTag("Release"))?;
        let mut nevra = Nevra::new(name, version, release);
        if let Some(e) = self.get_u32(Tag::Epoch) {
            nevra = nevra.with_epoch(e);
        }
        if let Some(a) = self.get_str(Tag::Arch) {
            nevra = nevra.with_arch(a);
        }
        Ok(nevra)
    }

    /// Number of files recorded in the header
    pub fn file_count(&self) -> usize {
        self.get_str_array(Tag::BaseNames).map_or(0, |b| b.len())
    }

    /// Package color: union of file colors masked later by the transaction
    pub fn color(&self) -> u32 {
        if let Some(c) = self.get_u32(Tag::PackageColor) {
            return c;
        }
        self.get_u32_array(Tag::FileColors)
            .map_or(0, |colors| colors.iter().fold(0, |acc, c| acc | c))
    }
}

/// Builder for headers, used by callers and heavily by tests
#[derive(Debug, Default)]
pub struct HeaderBuilder {
    header: Header,
    dirs: Vec<String>,
    bases: Vec<String>,
    dir_indexes: Vec<u32>,
    modes: Vec<u32>,
    sizes: Vec<u32>,
    flags: Vec<u32>,
    digests: Vec<String>,
    links: Vec<String>,
    langs: Vec<String>,
    colors: Vec<u32>,
    mtimes: Vec<u32>,
}

impl HeaderBuilder {
    pub fn new(name: &str, version: &str, release: &str) -> Self {
        let mut header = Header::new();
        header.set(Tag::Name, Value::Str(name.to_string()));
        header.set(Tag::Version, Value::Str(version.to_string()));
        header.set(Tag::Release, Value::Str(release.to_string()));
        Self {
            header,
            ..Default::default()
        }
    }

    pub fn epoch(mut self, epoch: u32) -> Self {
        self.header.set(Tag::Epoch, Value::U32(epoch));
        self
    }

    pub fn arch(mut self, arch: &str) -> Self {
        self.header.set(Tag::Arch, Value::Str(arch.to_string()));
        self
    }

    pub fn scriptlet(mut self, tag: Tag, body: &str) -> Self {
        self.header.set(tag, Value::Str(body.to_string()));
        self
    }

    /// Add a file entry; the path is split into directory and basename
    pub fn file(mut self, path: &str, mode: u32, size: u32, flags: FileFlags) -> Self {
        self.push_file(path, mode, size, flags, "", "", "", 0);
        self
    }

    /// Add a file entry with full attribute control
    #[allow(clippy::too_many_arguments)]
    pub fn file_full(
        mut self,
        path: &str,
        mode: u32,
        size: u32,
        flags: FileFlags,
        digest: &str,
        link: &str,
        lang: &str,
        color: u32,
    ) -> Self {
        self.push_file(path, mode, size, flags, digest, link, lang, color);
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn push_file(
        &mut self,
        path: &str,
        mode: u32,
        size: u32,
        flags: FileFlags,
        digest: &str,
        link: &str,
        lang: &str,
        color: u32,
    ) {
        let (dir, base) = split_path(path);
        let dir_ix = match self.dirs.iter().position(|d| d == &dir) {
            Some(ix) => ix as u32,
            None => {
                self.dirs.push(dir);
                (self.dirs.len() - 1) as u32
            }
        };
        self.bases.push(base);
        self.dir_indexes.push(dir_ix);
        self.modes.push(mode);
        self.sizes.push(size);
        self.flags.push(flags.bits());
        self.digests.push(digest.to_string());
        self.links.push(link.to_string());
        self.langs.push(lang.to_string());
        self.colors.push(color);
        self.mtimes.push(0);
    }

    pub fn build(mut self) -> Arc<Header> {
        if !self.bases.is_empty() {
            self.header.set(Tag::BaseNames, Value::StrArray(self.bases));
            self.header.set(Tag::DirNames, Value::StrArray(self.dirs));
            self.header
                .set(Tag::DirIndexes, Value::U32Array(self.dir_indexes));
            self.header.set(Tag::FileModes, Value::U32Array(self.modes));
            self.header.set(Tag::FileSizes, Value::U32Array(self.sizes));
            self.header.set(Tag::FileFlags, Value::U32Array(self.flags));
            self.header
                .set(Tag::FileDigests, Value::StrArray(self.digests));
            self.header
                .set(Tag::FileLinkTos, Value::StrArray(self.links));
            self.header.set(Tag::FileLangs, Value::StrArray(self.langs));
            self.header
                .set(Tag::FileColors, Value::U32Array(self.colors));
            self.header
                .set(Tag::FileMtimes, Value::U32Array(self.mtimes));
        }
        Arc::new(self.header)
    }
}

/// Split an absolute path into (dirname-with-trailing-slash, basename)
pub fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(pos) => (path[..=pos].to_string(), path[pos + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("/usr/bin/foo"),
            ("/usr/bin/".to_string(), "foo".to_string())
        );
        assert_eq!(split_path("/etc"), ("/".to_string(), "etc".to_string()));
    }

    #[test]
    fn test_builder_round_trip() {
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .arch("x86_64")
            .file("/usr/bin/foo", 0o100755, 1234, FileFlags::empty())
            .file("/usr/bin/bar", 0o100755, 10, FileFlags::empty())
            .file("/etc/foo.conf", 0o100644, 99, FileFlags::CONFIG)
            .build();

        assert_eq!(h.file_count(), 3);
        assert_eq!(h.nevra().unwrap().to_string(), "foo-1.0-1.x86_64");
        // Two files share /usr/bin/.
        assert_eq!(h.get_str_array(Tag::DirNames).unwrap().len(), 2);
        assert_eq!(h.get_u32_array(Tag::DirIndexes).unwrap(), &[0, 0, 1]);
    }

    #[test]
    fn test_missing_tag() {
        let h = Header::new();
        assert!(h.nevra().is_err());
    }
}
