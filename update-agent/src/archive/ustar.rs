//! Minimal POSIX ustar reader.
//!
//! Works on a fully decompressed buffer with explicit offsets. Only regular
//! files are returned; directories, links and device nodes are skipped by
//! stepping over their (padded) data region. An all-zero header, a truncated
//! block or an unparsable size field ends the archive.
//!
//! Release tarballs usually wrap the payload in a top-level folder such as
//! `project-1.2.0/app/...`. The first path segment literally named `app`
//! defines the strip prefix; when no such segment exists, a hyphenated first
//! segment (`name-version/`) is dropped instead.

pub const BLOCK_SIZE: usize = 512;

const NAME: std::ops::Range<usize> = 0..100;
const MODE: std::ops::Range<usize> = 100..108;
const SIZE: std::ops::Range<usize> = 124..136;
const MTIME: std::ops::Range<usize> = 136..148;
const TYPEFLAG: usize = 156;
const MAGIC: std::ops::Range<usize> = 257..263;
const PREFIX: std::ops::Range<usize> = 345..500;

const APP_SEGMENT: &str = "app";

/// A regular file taken from the archive, path relative to the payload root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry<'a> {
    pub path: String,
    pub data: &'a [u8],
    pub mode: u32,
    pub mtime: u64,
}

/// Header plus data slice, before any prefix handling
#[derive(Debug, Clone)]
struct RawEntry<'a> {
    name: String,
    typeflag: u8,
    mode: u32,
    mtime: u64,
    data: &'a [u8],
}

impl RawEntry<'_> {
    fn is_regular_file(&self) -> bool {
        matches!(self.typeflag, b'0' | 0)
    }
}

/// Walks header blocks sequentially.
///
/// pax extended headers (`x`) and GNU long names (`L`) carry the real path of
/// the following entry; both are folded in here so callers only see the final
/// name. Global pax headers (`g`, written by `git archive`) are skipped.
struct RawEntries<'a> {
    buf: &'a [u8],
    offset: usize,
    pending_name: Option<String>,
    done: bool,
}

impl<'a> RawEntries<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            pending_name: None,
            done: false,
        }
    }
}

impl<'a> Iterator for RawEntries<'a> {
    type Item = RawEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let header_end = self.offset + BLOCK_SIZE;
            if header_end > self.buf.len() {
                self.done = true;
                break;
            }

            let header = &self.buf[self.offset..header_end];
            if header.iter().all(|&b| b == 0) {
                self.done = true;
                break;
            }

            let Some(size) = parse_octal(&header[SIZE]) else {
                self.done = true;
                break;
            };
            let size = size as usize;

            let data_end = header_end.saturating_add(size);
            if data_end > self.buf.len() {
                self.done = true;
                break;
            }
            let data = &self.buf[header_end..data_end];
            self.offset = header_end + padded(size);

            let typeflag = header[TYPEFLAG];
            match typeflag {
                b'x' => {
                    if let Some(path) = pax_path(data) {
                        self.pending_name = Some(path);
                    }
                    continue;
                }
                b'L' => {
                    self.pending_name = Some(c_string(data));
                    continue;
                }
                b'g' => continue,
                _ => {}
            }

            let name = match self.pending_name.take() {
                Some(name) => name,
                None => header_name(header),
            };

            return Some(RawEntry {
                name: normalize(&name),
                typeflag,
                mode: parse_octal(&header[MODE]).unwrap_or(0o644) as u32,
                mtime: parse_octal(&header[MTIME]).unwrap_or(0),
                data,
            });
        }
        None
    }
}

/// Extract every regular file from an uncompressed ustar buffer.
pub fn unpack(tar: &[u8]) -> Vec<TarEntry<'_>> {
    let prefix = detect_prefix(tar);

    RawEntries::new(tar)
        .filter(RawEntry::is_regular_file)
        .filter_map(|entry| {
            let path = relative_path(&entry.name, prefix.as_deref())?;
            Some(TarEntry {
                path,
                data: entry.data,
                mode: entry.mode,
                mtime: entry.mtime,
            })
        })
        .collect()
}

/// First pass: path up to and including the first `app` segment, with a
/// trailing slash (`project-1.2.0/app/`).
pub fn detect_prefix(tar: &[u8]) -> Option<String> {
    RawEntries::new(tar).find_map(|entry| {
        let segments: Vec<&str> = entry.name.split('/').collect();
        let idx = segments.iter().position(|s| *s == APP_SEGMENT)?;
        Some(format!("{}/", segments[..=idx].join("/")))
    })
}

fn relative_path(name: &str, prefix: Option<&str>) -> Option<String> {
    let relative = match prefix {
        Some(prefix) => name.strip_prefix(prefix)?,
        None => match name.split_once('/') {
            Some((first, rest)) if first.contains('-') => rest,
            _ => name,
        },
    };

    if relative.is_empty() || relative.starts_with('.') || relative.starts_with('/') {
        return None;
    }
    if relative.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(relative.to_string())
}

fn header_name(header: &[u8]) -> String {
    let name = c_string(&header[NAME]);
    // Only POSIX ustar puts a path prefix here; old GNU headers store times
    if &header[MAGIC] == b"ustar\0" {
        let prefix = c_string(&header[PREFIX]);
        if !prefix.is_empty() {
            return format!("{}/{}", prefix, name);
        }
    }
    name
}

fn normalize(name: &str) -> String {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.to_string()
}

fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Octal ASCII, terminated by NUL or space. An empty field reads as 0.
fn parse_octal(field: &[u8]) -> Option<u64> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let text = std::str::from_utf8(&field[..end]).ok()?.trim();
    if text.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(text, 8).ok()
}

/// pax records look like `"<len> <key>=<value>\n"`
fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    let mut path = None;

    while !rest.is_empty() {
        let space = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space || len > rest.len() {
            break;
        }

        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            path = Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[len..];
    }

    path
}

fn padded(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}
