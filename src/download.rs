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

//! HTTP client plumbing and verified tarball downloads.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use crate::cmdline::FetchRetries;
use crate::hash::sha256hex;
use crate::util::{display_path, with_suffix, write_atomically};

const HTTP_COMPLETION_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Customize and build a new HTTP client.
pub fn new_http_client() -> Result<blocking::Client> {
    blocking::ClientBuilder::new()
        .timeout(HTTP_COMPLETION_TIMEOUT)
        .build()
        .context("building HTTP client")
}

/// Wrapper around Client::get() with error handling based on HTTP return
/// code and optionally basic exponential backoff retries for transient
/// errors.
pub fn http_get(
    client: blocking::Client,
    url: &str,
    retries: FetchRetries,
) -> Result<blocking::Response> {
    // this matches `curl --retry` semantics -- see list in `curl(1)`
    const RETRY_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

    let mut delay = 1;
    let (infinite, mut tries) = match retries {
        FetchRetries::Infinite => (true, 0),
        FetchRetries::Finite(n) => (false, n.get() + 1),
        FetchRetries::None => (false, 1),
    };

    loop {
        let err: anyhow::Error = match client.get(url).send() {
            Err(err) => err.into(),
            Ok(resp) => match resp.status().as_u16() {
                code if RETRY_STATUS_CODES.contains(&code) => anyhow!(
                    "HTTP {} {}",
                    code,
                    resp.status().canonical_reason().unwrap_or("")
                ),
                _ => {
                    return resp
                        .error_for_status()
                        .with_context(|| format!("fetching '{url}'"));
                }
            },
        };

        if !infinite {
            tries -= 1;
            if tries == 0 {
                return Err(err).with_context(|| format!("fetching '{url}'"));
            }
        }

        eprintln!("Error fetching '{url}': {err}");
        eprintln!("Sleeping {delay}s and retrying...");
        sleep(Duration::from_secs(delay));
        delay = std::cmp::min(delay * 2, 10 * 60); // cap to 10 mins; matches curl
    }
}

/// Download `url` to `dest`, verifying the content against an expected
/// SHA-256 when one is declared.  Mismatched content is kept next to the
/// destination as `<name>.bad` for forensics.  The verified content lands
/// atomically at its final location.
pub fn fetch_tarball(
    client: &blocking::Client,
    url: &str,
    dest: &Path,
    expected_hash: Option<&str>,
    retries: FetchRetries,
) -> Result<()> {
    let resp = http_get(client.clone(), url, retries)?;
    let data = resp
        .bytes()
        .with_context(|| format!("reading '{url}'"))?;
    if let Some(expected) = expected_hash {
        let actual = sha256hex(&data);
        if actual != expected {
            let bad = with_suffix(dest, ".bad");
            write_atomically(&bad, &data)?;
            bail!(
                "{}: bad hash {} (expected {}); content saved to {}",
                display_path(dest),
                actual,
                expected,
                display_path(&bad)
            );
        }
    }
    write_atomically(dest, &data)
}
