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

//! Content-addressed artifact cache.
//!
//! An install tree packs into `<fullname>-<out_hash16>.tar.gz`; a cache
//! server is just an HTTP directory of those tarballs.  The consumer
//! trusts the filename: the hash is not re-derivable from the tarball
//! contents.

use anyhow::{anyhow, Context, Result};
use std::process::Command;

use crate::download::http_get;
use crate::submodule::{BuildContext, Submodule};
use crate::util::{display_path, mkdir_p, run, write_atomically};

pub fn artifact_name(module: &Submodule) -> String {
    format!("{}-{}.tar.gz", module.fullname, &module.out_hash[..16])
}

/// Pack the module's install tree into the local cache directory for
/// later publishing.
pub fn create(ctx: &BuildContext, module: &Submodule) -> Result<()> {
    let cache_dir = ctx.layout.cache_dir();
    mkdir_p(&cache_dir)?;
    let tar_path = cache_dir.join(artifact_name(module));
    eprintln!("CACHE   {}: {}", module.fullname, display_path(&tar_path));
    let install_dir = module
        .install_dir
        .clone()
        .ok_or_else(|| anyhow!("{}: install directory not computed", module.fullname))?;
    let mut cmd = Command::new("tar");
    cmd.arg("-zcf").arg(&tar_path).arg("-C").arg(&install_dir).arg(".");
    run(&mut cmd)
}

/// Try to satisfy an install from the configured cache server.  Any miss
/// (HTTP error included) falls back to a local build; only local
/// filesystem and subprocess trouble is fatal.
pub fn fetch(ctx: &BuildContext, module: &Submodule) -> Result<bool> {
    let server = match &ctx.cache_server {
        Some(server) => server.trim_end_matches('/'),
        None => return Ok(false),
    };
    let name = artifact_name(module);
    let url = format!("{server}/{name}");
    let resp = match http_get(ctx.client.clone(), &url, ctx.retries) {
        Ok(resp) => resp,
        Err(_) => return Ok(false),
    };
    let data = resp
        .bytes()
        .with_context(|| format!("reading '{url}'"))?;

    let cache_dir = ctx.layout.cache_dir();
    mkdir_p(&cache_dir)?;
    let tar_path = cache_dir.join(&name);
    write_atomically(&tar_path, &data)?;

    let install_dir = module
        .install_dir
        .clone()
        .ok_or_else(|| anyhow!("{}: install directory not computed", module.fullname))?;
    mkdir_p(&install_dir)?;
    eprintln!("CACHED  {}: {}", module.fullname, url);
    let mut cmd = Command::new("tar");
    cmd.arg("-zxf").arg(&tar_path).arg("-C").arg(&install_dir);
    run(&mut cmd)?;
    Ok(true)
}
