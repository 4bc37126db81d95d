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

//! SHA-256 helpers and the Merkle `extend` combinator that keys every
//! artifact directory in the build tree.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

/// Initial value of every hash chain.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const BUFFER_SIZE: usize = 256 * 1024;

/// SHA-256 of `data` as 64 lowercase hex characters.
pub fn sha256hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Fold `items` into the running digest `h`.
///
/// Each item is hashed on its own and the hex strings are concatenated
/// before rehashing, so the intermediate encoding is part of the chain.
/// Existing build trees are keyed by the first 16 characters of these
/// digests; the folding must stay bit-exact.
pub fn extend<I>(h: &str, items: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut h = if h.is_empty() {
        ZERO_HASH.to_string()
    } else {
        h.to_string()
    };
    for item in items {
        let mut step = String::with_capacity(2 * h.len());
        step.push_str(&h);
        step.push_str(&sha256hex(item));
        h = sha256hex(step);
    }
    h
}

/// `extend` with a single item.
pub fn extend_one(h: &str, item: impl AsRef<[u8]>) -> String {
    extend(h, [item.as_ref()])
}

/// SHA-256 of a file, streamed in large chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let count = f
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    #[test]
    fn test_sha256hex() {
        // well-known digests
        assert_eq!(
            sha256hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_extend_empty() {
        let empty: [&[u8]; 0] = [];
        assert_eq!(extend("", empty), ZERO_HASH);
        assert_eq!(extend(ZERO_HASH, empty), ZERO_HASH);
        // a declared tarball hash passes through unchanged
        let tarhash = "0c98a3f1732ff6ca4ea690552079da9c597872d30e96ec28414ee23c95558a7f";
        assert_eq!(extend(tarhash, empty), tarhash);
    }

    #[test]
    fn test_extend_folds_hex_strings() {
        let tarhash = "0c98a3f1732ff6ca4ea690552079da9c597872d30e96ec28414ee23c95558a7f";
        let patch = "diff --git a/x b/x\n";
        let expected = sha256hex(format!("{}{}", tarhash, sha256hex(patch)));
        assert_eq!(extend_one(tarhash, patch), expected);
    }

    #[test]
    fn test_extend_left_associative() {
        let ab = extend(ZERO_HASH, ["a", "b"]);
        assert_eq!(ab, extend_one(&extend_one(ZERO_HASH, "a"), "b"));
        assert_ne!(ab, extend(ZERO_HASH, ["b", "a"]));
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(sha256_file(&dir.path().join("missing")).is_err());
    }
}
