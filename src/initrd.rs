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

//! The initrd module variant.
//!
//! An initrd module has no source of its own.  Its build step assembles a
//! cpio archive from its dependencies' declared binaries and libraries,
//! plus explicitly listed files, symlinks, and device nodes, and records a
//! `path: sha256` manifest both inside the image (`/hashes`) and as a
//! sidecar next to it.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cpio::{CpioArchive, DeviceType};
use crate::hash::{extend, sha256hex, ZERO_HASH};
use crate::submodule::{Dependency, Submodule};
use crate::util::{display_path, mkdir_p, with_suffix};

#[derive(Debug, Clone)]
pub struct FileList {
    pub dir: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Symlink {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub path: String,
    pub devtype: DeviceType,
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone)]
pub struct InitrdSpec {
    pub filename: String,
    pub dirs: Vec<String>,
    pub files: Vec<FileList>,
    pub symlinks: Vec<Symlink>,
    pub devices: Vec<DeviceNode>,
    pub add_hashes: bool,
}

impl InitrdSpec {
    /// Fold the directory, file, symlink, and device lists into the seed
    /// of the configuration hash, so editing any of them re-keys the
    /// output directory.
    pub fn config_seed(&self) -> String {
        let dirs_hash = extend(ZERO_HASH, &self.dirs);

        let mut files_hash = ZERO_HASH.to_string();
        for list in &self.files {
            let mut items = vec![list.dir.clone()];
            items.extend(list.entries.iter().cloned());
            files_hash = extend(&files_hash, items);
        }

        let mut symlink_hash = ZERO_HASH.to_string();
        for link in &self.symlinks {
            symlink_hash = extend(&symlink_hash, [&link.path, &link.target]);
        }

        let mut devices_hash = ZERO_HASH.to_string();
        for dev in &self.devices {
            let items = [
                dev.path.clone(),
                dev.devtype.as_str().to_string(),
                dev.major.to_string(),
                dev.minor.to_string(),
            ];
            devices_hash = extend(&devices_hash, items);
        }

        extend(
            ZERO_HASH,
            [&dirs_hash, &files_hash, &symlink_hash, &devices_hash],
        )
    }
}

/// Assemble the image.  Called from the shared build step once the
/// canary and dep-file checks have decided a rebuild is needed.
pub(crate) fn build_image(module: &mut Submodule, spec: &InitrdSpec) -> Result<()> {
    let mut archive = CpioArchive::new();
    for dir in &spec.dirs {
        archive.mkdir(dir);
    }

    let mut hashes: Vec<String> = Vec::new();
    let mut missing = 0usize;
    let mut visited = BTreeSet::new();
    add_deps(
        &mut archive,
        &mut hashes,
        &mut missing,
        &mut visited,
        &module.depends,
    )?;

    for list in &spec.files {
        archive.mkdir(&list.dir);
        for entry in &list.entries {
            let path = PathBuf::from(module.expand(entry)?);
            record(
                &mut archive,
                &mut hashes,
                &mut missing,
                &list.dir,
                &path,
                &module.name,
            );
        }
    }

    for link in &spec.symlinks {
        archive.symlink(&link.path, &link.target);
    }
    for dev in &spec.devices {
        archive.mknod(&dev.path, dev.devtype, dev.major, dev.minor);
    }

    let mut hash_list = String::new();
    for line in &hashes {
        hash_list.push_str(line);
        hash_list.push('\n');
    }
    if spec.add_hashes {
        archive.add("/hashes", hash_list.clone().into_bytes(), 0o700);
    }

    if missing > 0 {
        bail!("{}: {} initrd files not found", module.fullname, missing);
    }

    let install_dir = module
        .install_dir
        .clone()
        .ok_or_else(|| anyhow!("{}: install directory not computed", module.fullname))?;
    mkdir_p(&install_dir)?;
    let initrd_file = install_dir.join(&spec.filename);
    eprintln!("BUILD   {}: {}", module.fullname, display_path(&initrd_file));

    let image = if spec.filename.ends_with(".xz") {
        archive.to_xz_bytes()?
    } else {
        archive.to_bytes()
    };
    fs::write(&initrd_file, &image)
        .with_context(|| format!("writing {}", initrd_file.display()))?;
    let sidecar = with_suffix(&initrd_file, ".hashes");
    fs::write(&sidecar, &hash_list)
        .with_context(|| format!("writing {}", sidecar.display()))?;

    eprintln!("INSTALL {}: {}", module.fullname, sha256hex(&image));
    Ok(())
}

/// Depth-first walk of the dependency graph, copying every declared
/// binary into /bin and every declared library into /lib.
fn add_deps(
    archive: &mut CpioArchive,
    hashes: &mut Vec<String>,
    missing: &mut usize,
    visited: &mut BTreeSet<String>,
    deps: &[Dependency],
) -> Result<()> {
    for dep in deps {
        let handle = dep.handle()?;
        let dep = handle.lock().unwrap();
        if !visited.insert(dep.fullname.clone()) {
            continue;
        }
        for path in &dep.bins {
            record(archive, hashes, missing, "/bin", path, &dep.name);
        }
        for path in &dep.libs {
            record(archive, hashes, missing, "/lib", path, &dep.name);
        }
        add_deps(archive, hashes, missing, visited, &dep.depends)?;
    }
    Ok(())
}

fn record(
    archive: &mut CpioArchive,
    hashes: &mut Vec<String>,
    missing: &mut usize,
    dir: &str,
    path: &Path,
    owner: &str,
) {
    match add_file(archive, dir, path, owner) {
        Some(hash) => hashes.push(format!("{}: {}", display_path(path), hash)),
        None => {
            *missing += 1;
            hashes.push(format!("{}: MISSING", display_path(path)));
        }
    }
}

fn add_file(archive: &mut CpioArchive, dir: &str, src: &Path, owner: &str) -> Option<String> {
    let name = match src.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => {
            eprintln!("FAIL    {owner}: bad file path {}", display_path(src));
            return None;
        }
    };
    let data = match fs::read(src) {
        Ok(data) => data,
        Err(_) => {
            eprintln!("FAIL    {owner}: file not found {}", display_path(src));
            return None;
        }
    };
    let hash = sha256hex(&data);
    // modes are not copied from disk; everything in the image is root-only
    archive.add(&format!("{dir}/{name}"), data, 0o700);
    Some(hash)
}
