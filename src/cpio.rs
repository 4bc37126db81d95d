// Copyright 2022 The buildworld Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reproducible in-memory SVR4 "newc" cpio archives, the format the Linux
//! kernel unpacks for an initramfs.
//! https://www.kernel.org/doc/Documentation/early-userspace/buffer-format.txt
//!
//! Every field that does not affect the unpacked tree (inode, mtime,
//! nlink, device numbers of the containing filesystem) is pinned to zero
//! so the same input always produces the same bytes.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::process::Command;
use std::str::FromStr;

const S_IFDIR: u32 = 0o40000;
const S_IFCHR: u32 = 0o20000;
const S_IFBLK: u32 = 0o60000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

const HEADER_LEN: usize = 110;

// The kernel requires CRC32; the dictionary is kept small so early boot
// can decompress in limited memory.
const XZ_ARGS: &[&str] = &[
    "--check=crc32",
    "--lzma2=dict=256KiB",
    "--threads=0",
    "--stdout",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Block,
    Char,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Block => "b",
            DeviceType::Char => "c",
        }
    }

    fn mode_bits(&self) -> u32 {
        match self {
            DeviceType::Block => S_IFBLK,
            DeviceType::Char => S_IFCHR,
        }
    }
}

impl FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "b" => Ok(DeviceType::Block),
            "c" => Ok(DeviceType::Char),
            other => bail!("bad device type {:?} (expected \"b\" or \"c\")", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    mode: u32,
    uid: u32,
    gid: u32,
    rmajor: u32,
    rminor: u32,
    data: Vec<u8>,
}

/// An archive under construction: normalized path -> entry, emitted in
/// sorted order.
#[derive(Debug, Default)]
pub struct CpioArchive {
    entries: BTreeMap<String, Entry>,
}

impl CpioArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse duplicate slashes and strip leading ones.  A trailing
    /// slash is the caller asserting the path is a directory.
    fn normalize(path: &str) -> (String, bool) {
        let is_dir = path.ends_with('/');
        let cleaned = path
            .split('/')
            .filter(|seg| !seg.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        (cleaned, is_dir)
    }

    /// OR in the regular-file type when no dir/char/block/symlink type
    /// bit is present.
    fn with_file_type(mode: u32) -> u32 {
        if mode & (S_IFDIR | S_IFBLK | S_IFCHR | S_IFLNK) == 0 {
            mode | S_IFREG
        } else {
            mode
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let (path, _) = Self::normalize(path);
        self.entries
            .get(&path)
            .map(|e| e.mode & S_IFDIR != 0)
            .unwrap_or(false)
    }

    /// Create a directory and all of its ancestors.  Idempotent.
    pub fn mkdir(&mut self, path: &str) {
        self.mkdir_mode(path, 0o777);
    }

    pub fn mkdir_mode(&mut self, path: &str, mode: u32) {
        let (path, _) = Self::normalize(path);
        let mut so_far = String::with_capacity(path.len());
        for seg in path.split('/') {
            if seg.is_empty() {
                continue;
            }
            if !so_far.is_empty() {
                so_far.push('/');
            }
            so_far.push_str(seg);
            self.entries.entry(so_far.clone()).or_insert(Entry {
                mode: mode | S_IFDIR,
                uid: 0,
                gid: 0,
                rmajor: 0,
                rminor: 0,
                data: Vec::new(),
            });
        }
    }

    /// Add a regular file (or any explicit mode).  Parent directories are
    /// materialized.  The last write to a path wins, which is also how
    /// the kernel treats duplicate members.
    pub fn add(&mut self, path: &str, data: Vec<u8>, mode: u32) {
        let (path, _) = Self::normalize(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir(parent);
        }
        if self.entries.contains_key(&path) {
            eprintln!("{path}: destination already exists");
        }
        self.entries.insert(
            path,
            Entry {
                mode: Self::with_file_type(mode),
                uid: 0,
                gid: 0,
                rmajor: 0,
                rminor: 0,
                data,
            },
        );
    }

    pub fn symlink(&mut self, path: &str, target: &str) {
        let (path, _) = Self::normalize(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir(parent);
        }
        self.entries.insert(
            path,
            Entry {
                mode: 0o777 | S_IFLNK,
                uid: 0,
                gid: 0,
                rmajor: 0,
                rminor: 0,
                data: target.as_bytes().to_vec(),
            },
        );
    }

    pub fn mknod(&mut self, path: &str, devtype: DeviceType, major: u32, minor: u32) {
        let (path, _) = Self::normalize(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir(parent);
        }
        self.entries.insert(
            path,
            Entry {
                mode: 0o666 | devtype.mode_bits(),
                uid: 0,
                gid: 0,
                rmajor: major,
                rminor: minor,
                data: Vec::new(),
            },
        );
    }

    fn push_hex(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(format!("{value:08x}").as_bytes());
    }

    fn align(out: &mut Vec<u8>, block: usize) {
        let rem = out.len() % block;
        if rem != 0 {
            out.resize(out.len() + block - rem, 0);
        }
    }

    /// One header + name + payload.  The caller 4-aligns the image before
    /// each entry, so padding the buffer to 4 here also lands the payload
    /// on the required boundary after the 110-byte header and the
    /// NUL-terminated name.
    fn emit_entry(out: &mut Vec<u8>, name: &str, entry: &Entry) {
        let start = out.len();
        out.extend_from_slice(b"070701");
        Self::push_hex(out, 0); // ino
        Self::push_hex(out, entry.mode);
        Self::push_hex(out, entry.uid);
        Self::push_hex(out, entry.gid);
        Self::push_hex(out, 0); // nlink
        Self::push_hex(out, 0); // mtime
        Self::push_hex(out, entry.data.len() as u32);
        Self::push_hex(out, 0); // maj
        Self::push_hex(out, 0); // min
        Self::push_hex(out, entry.rmajor);
        Self::push_hex(out, entry.rminor);
        Self::push_hex(out, name.len() as u32 + 1); // namesize includes NUL
        Self::push_hex(out, 0); // chksum
        debug_assert_eq!(out.len() - start, HEADER_LEN);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        Self::align(out, 4);
        out.extend_from_slice(&entry.data);
    }

    fn raw_bytes(&self) -> Vec<u8> {
        let mut image = Vec::new();
        for (name, entry) in &self.entries {
            Self::align(&mut image, 4);
            Self::emit_entry(&mut image, name, entry);
        }
        Self::align(&mut image, 4);
        // the trailer keeps its literal zero mode
        let trailer = Entry {
            mode: 0,
            uid: 0,
            gid: 0,
            rmajor: 0,
            rminor: 0,
            data: Vec::new(),
        };
        Self::emit_entry(&mut image, "TRAILER!!!", &trailer);
        image
    }

    /// The finished archive, zero-padded to a 512-byte boundary so it can
    /// be concatenated with other initrd images.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut image = self.raw_bytes();
        Self::align(&mut image, 512);
        image
    }

    /// The finished archive compressed through the external xz tool, then
    /// padded to the 512-byte boundary.
    pub fn to_xz_bytes(&self) -> Result<Vec<u8>> {
        let mut tmp =
            tempfile::NamedTempFile::new().context("creating temporary archive for xz")?;
        tmp.write_all(&self.raw_bytes())
            .context("writing temporary archive for xz")?;
        let mut cmd = Command::new("xz");
        cmd.args(XZ_ARGS).arg(tmp.path());
        let output = cmd
            .output()
            .with_context(|| format!("running {:#?}", cmd))?;
        if !output.status.success() {
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
            bail!("{:#?} failed with {}", cmd, output.status);
        }
        let mut image = output.stdout;
        Self::align(&mut image, 512);
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn field(image: &[u8], entry_offset: usize, index: usize) -> &str {
        // field 0 is ino; the 6-byte magic precedes it
        let start = entry_offset + 6 + index * 8;
        std::str::from_utf8(&image[start..start + 8]).unwrap()
    }

    #[test]
    fn test_single_entry_layout() {
        let mut archive = CpioArchive::new();
        archive.add("/hello", b"world".to_vec(), 0o700);
        let image = archive.to_bytes();

        assert_eq!(image.len(), 512);
        assert_eq!(&image[0..6], b"070701");
        assert_eq!(field(&image, 0, 0), "00000000"); // ino
        assert_eq!(field(&image, 0, 1), "000081c0"); // mode: S_IFREG | 0700
        assert_eq!(field(&image, 0, 4), "00000000"); // nlink
        assert_eq!(field(&image, 0, 6), "00000005"); // filesize
        assert_eq!(field(&image, 0, 11), "00000006"); // namesize incl NUL
        assert_eq!(&image[110..116], b"hello\0");
        // name padding keeps the payload 4-aligned: 110 + 6 = 116
        assert_eq!(&image[116..121], b"world");

        // trailer starts on the next 4-byte boundary
        assert_eq!(&image[124..130], b"070701");
        assert_eq!(field(&image, 124, 1), "00000000"); // trailer keeps mode 0
        assert_eq!(&image[124 + 110..124 + 121], b"TRAILER!!!\0");
        // everything past the trailer is zero padding
        assert!(image[124 + 124..].iter().all(|b| *b == 0));

        // byte-identical on a second emission
        assert_eq!(image, archive.to_bytes());
    }

    #[test]
    fn test_alignment() {
        // name lengths chosen so neither name end nor payload end is
        // naturally aligned
        let mut archive = CpioArchive::new();
        archive.add("a", b"xyz".to_vec(), 0o644);
        archive.add("longer-name", b"1".to_vec(), 0o644);
        let image = archive.to_bytes();
        assert_eq!(image.len() % 512, 0);
        // decode with an independent reader to prove the offsets line up
        let mut reader: Box<dyn Read> = Box::new(&image[..]);
        let mut names = Vec::new();
        loop {
            let entry_reader = ::cpio::NewcReader::new(reader).unwrap();
            if entry_reader.entry().is_trailer() {
                break;
            }
            names.push(entry_reader.entry().name().to_string());
            reader = entry_reader.finish().unwrap();
        }
        assert_eq!(names, ["a", "longer-name"]);
    }

    #[test]
    fn test_roundtrip() {
        let mut archive = CpioArchive::new();
        archive.mkdir("/bin");
        archive.add("/bin/sh", b"#!/bin/busybox\n".to_vec(), 0o755);
        archive.symlink("/lib64", "lib");
        archive.mknod("/dev/console", DeviceType::Char, 5, 1);
        let image = archive.to_bytes();

        let mut seen = Vec::new();
        let mut reader: Box<dyn Read> = Box::new(&image[..]);
        loop {
            let mut entry_reader = ::cpio::NewcReader::new(reader).unwrap();
            let entry = entry_reader.entry();
            if entry.is_trailer() {
                break;
            }
            let name = entry.name().to_string();
            let mode = entry.mode();
            let mut data = Vec::new();
            entry_reader.read_to_end(&mut data).unwrap();
            seen.push((name, mode, data));
            reader = entry_reader.finish().unwrap();
        }

        // lexicographic emission order
        assert_eq!(
            seen.iter().map(|(n, _, _)| n.as_str()).collect::<Vec<_>>(),
            ["bin", "bin/sh", "dev", "dev/console", "lib64"]
        );
        let by_name: std::collections::BTreeMap<String, (u32, Vec<u8>)> =
            seen.into_iter().map(|(n, m, d)| (n, (m, d))).collect();
        assert_eq!(
            by_name,
            maplit::btreemap! {
                "bin".to_string() => (0o40777, vec![]),
                "bin/sh".to_string() => (0o100755, b"#!/bin/busybox\n".to_vec()),
                "dev".to_string() => (0o40777, vec![]),
                "dev/console".to_string() => (0o20666, vec![]),
                "lib64".to_string() => (0o120777, b"lib".to_vec()),
            }
        );
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            CpioArchive::normalize("//foo///bar"),
            ("foo/bar".to_string(), false)
        );
        assert_eq!(CpioArchive::normalize("dir/"), ("dir".to_string(), true));
        let mut archive = CpioArchive::new();
        archive.add("///deep//path/file", b"x".to_vec(), 0o600);
        assert!(archive.is_dir("/deep"));
        assert!(archive.is_dir("deep/path/"));
        assert!(!archive.is_dir("deep/path/file"));
        assert!(archive.entries.contains_key("deep/path/file"));
    }

    #[test]
    fn test_mkdir_idempotent() {
        let mut archive = CpioArchive::new();
        archive.mkdir("/a/b/c");
        archive.mkdir("/a/b");
        archive.mkdir("a/b/c/");
        assert_eq!(archive.entries.len(), 3);
    }

    #[test]
    fn test_forced_regular_bit() {
        assert_eq!(CpioArchive::with_file_type(0o700), 0o100700);
        assert_eq!(CpioArchive::with_file_type(0o100644), 0o100644);
        assert_eq!(CpioArchive::with_file_type(0o40777), 0o40777);
        assert_eq!(CpioArchive::with_file_type(0o120777), 0o120777);
        assert_eq!(CpioArchive::with_file_type(0o20666), 0o20666);
        assert_eq!(CpioArchive::with_file_type(0o60666), 0o60666);
    }

    #[test]
    fn test_device_type() {
        assert_eq!("b".parse::<DeviceType>().unwrap(), DeviceType::Block);
        assert_eq!("c".parse::<DeviceType>().unwrap(), DeviceType::Char);
        assert!("x".parse::<DeviceType>().is_err());
        assert_eq!(DeviceType::Char.as_str(), "c");
    }
}
