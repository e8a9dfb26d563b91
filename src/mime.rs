use std::ffi::OsStr;
use std::fs::File;
use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Suffix keys are compared on at most this many trailing bytes of a path.
pub const SUFFIX_KEY_LEN: usize = 4;

const DEFAULT_SUFFIX_MAP: &[&str] = &[
    "text/html                   .htm html",
    "image/gif                   .gif",
    "image/jpeg                  .jpg jpeg",
    "image/png                   .png",
    "image/tiff                  tiff .tif",
    "text/plain                  .txt .asc",
    "text/css                    .css",
    "text/javascript             .js",
    "application/zip             .zip",
    "application/pdf             .pdf",
    "application/x-gtar          r.gz .tgz",
    "application/x-debian-package .deb",
    "application/java-vm         lass",
    "application/wasm            wasm",
    "application/xml             .xml .xsl",
    "audio/mpeg                  .mp2 .mp3",
    "video/mpeg                  mpeg .mpg",
    "video/quicktime             .mov",
    "video/mp4                   .mp4",
];

/// One immutable row of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct MimeEntry {
    key: [u8; SUFFIX_KEY_LEN],
    key_len: usize,
    mimetype: Arc<str>,
}

impl MimeEntry {
    fn new(suffix: &str, mimetype: &str) -> Option<Self> {
        let mut suffix = suffix.as_bytes().to_vec();
        if suffix.is_empty() {
            return None;
        }
        // "js" means ".js"; "class" keeps its last four bytes, "lass".
        if suffix.len() < SUFFIX_KEY_LEN && suffix[0] != b'.' {
            suffix.insert(0, b'.');
        }
        let tail = &suffix[suffix.len().saturating_sub(SUFFIX_KEY_LEN)..];
        let mut key = [0; SUFFIX_KEY_LEN];
        key[..tail.len()].copy_from_slice(tail);
        Some(Self {
            key,
            key_len: tail.len(),
            mimetype: Arc::from(mimetype),
        })
    }

    pub fn suffix(&self) -> &[u8] {
        &self.key[..self.key_len]
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    fn matches(&self, path: &[u8]) -> bool {
        path.ends_with(self.suffix())
    }
}

/// Suffix-keyed lookup from a filename to its content type.
///
/// Built once before any worker starts and only read afterwards.
#[derive(Debug, Clone)]
pub struct MimeTable {
    entries: Vec<MimeEntry>,
    sloppy: bool,
}

impl MimeTable {
    /// Table without any entries.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            sloppy: false,
        }
    }

    /// When set, unknown suffixes resolve to the first entry of the table.
    pub fn set_sloppy(&mut self, sloppy: bool) {
        self.sloppy = sloppy;
    }

    pub fn is_sloppy(&self) -> bool {
        self.sloppy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add suffix map from a file.
    pub fn parse_suffix_map_file(&mut self, filename: &OsStr) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.to_string_lossy()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read {}", filename.to_string_lossy()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from a suffix map: a content type followed by its suffixes.
    pub fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c: char| c.is_ascii_whitespace())
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for suffix in fields {
            if let Some(entry) = MimeEntry::new(suffix, mimetype) {
                self.entries.push(entry);
            }
        }
    }

    /// Content type for a path, or `None` when no entry matches and the table
    /// is not sloppy.
    ///
    /// Later entries override earlier ones with the same suffix.
    pub fn resolve(&self, path: &[u8]) -> Option<&str> {
        self.find(path).map(MimeEntry::mimetype)
    }

    /// Like [`resolve`](Self::resolve), sharing the table's string.
    pub fn resolve_shared(&self, path: &[u8]) -> Option<Arc<str>> {
        self.find(path).map(|entry| Arc::clone(&entry.mimetype))
    }

    fn find(&self, path: &[u8]) -> Option<&MimeEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.matches(path))
            .or_else(|| self.entries.first().filter(|_| self.sloppy))
    }
}

impl Default for MimeTable {
    /// Create MimeTable using the default suffix map.
    fn default() -> Self {
        let mut table = Self::empty();
        for line in DEFAULT_SUFFIX_MAP {
            table.add_mimetype_line(line);
        }
        table
    }
}
