use std::ffi::OsStr;
use std::fs::{File, Metadata, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

use crate::filter::PathFilter;

/// Permission bits a file must have, and bits it must not have, to be served.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PermissionPolicy {
    pub required: u32,
    pub forbidden: u32,
}

impl Default for PermissionPolicy {
    /// World-readable; not a directory, sticky or executable by anyone.
    fn default() -> Self {
        Self {
            required: libc::S_IROTH as u32,
            forbidden: (libc::S_IFDIR
                | libc::S_ISVTX
                | libc::S_IXOTH
                | libc::S_IXGRP
                | libc::S_IXUSR) as u32,
        }
    }
}

impl PermissionPolicy {
    /// True if `mode` has every required bit and no forbidden one.
    pub fn permits(&self, mode: u32) -> bool {
        mode & self.required == self.required && mode & self.forbidden == 0
    }
}

/// Why a path may not be served locally.
#[derive(Debug)]
pub enum Denial {
    QueryString,
    NotAbsolute,
    Open(std::io::Error),
    Permissions(u32),
    Blacklisted(String),
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryString => write!(f, "path contains a query string"),
            Self::NotAbsolute => write!(f, "path is not absolute"),
            Self::Open(e) => write!(f, "open failed: {}", e),
            Self::Permissions(mode) => write!(f, "mode {:o} not permitted", mode),
            Self::Blacklisted(pattern) => write!(f, "path contains `{}'", pattern),
        }
    }
}

/// A file that passed every check, opened for reading.
#[derive(Debug)]
pub struct Permitted {
    pub file: File,
    pub metadata: Metadata,
}

/// Decide whether the file at `path` may be served.
///
/// `path` is percent-decoded in place. A file opened along the way is closed
/// again when the answer is a denial.
pub fn check(
    path: &mut Vec<u8>,
    filter: &PathFilter,
    policy: &PermissionPolicy,
) -> Result<Permitted, Denial> {
    // Decoding could turn %3F into '?', so look before decoding.
    if path.contains(&b'?') {
        return Err(Denial::QueryString);
    }

    percent_decode(path);

    if !path.starts_with(b"/") {
        return Err(Denial::NotAbsolute);
    }

    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(OsStr::from_bytes(path))
        .map_err(Denial::Open)?;
    let metadata = file.metadata().map_err(Denial::Open)?;

    if !policy.permits(metadata.mode()) {
        return Err(Denial::Permissions(metadata.mode()));
    }

    if let Some(pattern) = filter.find_match(path) {
        return Err(Denial::Blacklisted(
            String::from_utf8_lossy(pattern).into_owned(),
        ));
    }

    Ok(Permitted { file, metadata })
}

/// Convert %XX sequences to the byte they represent, in place.
///
/// Digits outside the hex alphabet are clamped into 0..=15 instead of being
/// rejected, and a truncated sequence at the end of the path decodes its
/// missing digits as zero. The result is never longer than the input.
pub fn percent_decode(path: &mut Vec<u8>) {
    let mut src = match path.iter().position(|&c| c == b'%') {
        Some(src) => src,
        None => return,
    };
    let mut dst = src;
    while src < path.len() {
        if path[src] == b'%' {
            let high = path.get(src + 1).copied().map_or(0, clamped_hex_digit);
            let low = path.get(src + 2).copied().map_or(0, clamped_hex_digit);
            path[dst] = high * 16 + low;
            src += 3;
        } else {
            path[dst] = path[src];
            src += 1;
        }
        dst += 1;
    }
    path.truncate(dst);
}

/// Convert hex digit to integer, clamping anything else into range.
fn clamped_hex_digit(c: u8) -> u8 {
    let c = if c > b'Z' { c - 0x20 } else { c };
    let mut value = i32::from(c) - i32::from(b'0');
    if value < 0 {
        value = 0;
    }
    if value > 9 {
        value -= 7;
    }
    if value > 15 {
        value = 15;
    }
    value as u8
}
