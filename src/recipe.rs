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

//! TOML recipe manifests.
//!
//! A manifest declares `[[module]]` and `[[initrd]]` tables; the loader
//! turns them into registered submodules.  Recipes are data: everything
//! they can say is an input to the hash pass, and nothing here runs any
//! command.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cpio::DeviceType;
use crate::initrd::{DeviceNode, FileList, InitrdSpec, Symlink};
use crate::submodule::{Dependency, ModuleKind, Registry, Submodule};

/// One phase written either as a single command vector or as a list of
/// them; `make = ["make"]` and `make = [["make"], ["make", "install"]]`
/// both parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Commands {
    Single(Vec<String>),
    Many(Vec<Vec<String>>),
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Many(Vec::new())
    }
}

impl Commands {
    fn into_vectors(self) -> Vec<Vec<String>> {
        match self {
            Commands::Single(argv) => {
                if argv.is_empty() {
                    Vec::new()
                } else {
                    vec![argv]
                }
            }
            Commands::Many(vectors) => vectors,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleRecipe>,
    #[serde(default, rename = "initrd")]
    pub initrds: Vec<InitrdRecipe>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleRecipe {
    pub name: String,
    pub version: Option<String>,
    pub url: Option<String>,
    pub tarhash: Option<String>,
    #[serde(default)]
    pub patches: Vec<String>,
    #[serde(default = "default_patch_level")]
    pub patch_level: u32,
    #[serde(default = "default_strip_components")]
    pub strip_components: u32,
    #[serde(default)]
    pub tar_options: Vec<String>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub report_hashes: bool,
    #[serde(default)]
    pub config_files: Vec<PathBuf>,
    #[serde(default)]
    pub config_append: Vec<String>,
    #[serde(default = "default_kconfig_file")]
    pub kconfig_file: String,
    #[serde(default)]
    pub configure: Commands,
    #[serde(default)]
    pub make: Commands,
    #[serde(default)]
    pub install: Commands,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub dep_files: Vec<String>,
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,
    #[serde(default = "default_lib_dir")]
    pub lib_dir: String,
    #[serde(default = "default_inc_dir")]
    pub inc_dir: String,
    #[serde(default)]
    pub bins: Vec<String>,
    #[serde(default)]
    pub libs: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitrdRecipe {
    pub name: String,
    #[serde(default = "default_initrd_version")]
    pub version: String,
    #[serde(default = "default_initrd_filename")]
    pub filename: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileListRecipe>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkRecipe>,
    #[serde(default)]
    pub devices: Vec<DeviceRecipe>,
    #[serde(default = "default_true")]
    pub add_hashes: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileListRecipe {
    pub dir: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymlinkRecipe {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceRecipe {
    pub path: String,
    #[serde(rename = "type")]
    pub devtype: String,
    pub major: u32,
    pub minor: u32,
}

fn default_patch_level() -> u32 {
    1
}

fn default_strip_components() -> u32 {
    1
}

fn default_kconfig_file() -> String {
    ".config".to_string()
}

fn default_bin_dir() -> String {
    "bin".to_string()
}

fn default_lib_dir() -> String {
    "lib".to_string()
}

fn default_inc_dir() -> String {
    "include".to_string()
}

fn default_initrd_version() -> String {
    "0.0.1".to_string()
}

fn default_initrd_filename() -> String {
    "initrd.cpio".to_string()
}

fn default_true() -> bool {
    true
}

impl ModuleRecipe {
    fn into_submodule(self) -> Submodule {
        let mut module = Submodule::new(&self.name, self.version.as_deref());
        module.url = self.url;
        module.tarhash = self.tarhash;
        module.patch_files = self.patches;
        module.patch_level = self.patch_level;
        module.strip_components = self.strip_components;
        module.tar_options = self.tar_options;
        module.dirty = self.dirty;
        module.cacheable = self.cacheable;
        module.report_hashes = self.report_hashes;
        module.config_files = self.config_files;
        module.config_append = self.config_append;
        module.kconfig_file = self.kconfig_file;
        module.configure_commands = self.configure.into_vectors();
        module.make_commands = self.make.into_vectors();
        module.install_commands = self.install.into_vectors();
        module.depends = self.depends.into_iter().map(Dependency::Name).collect();
        module.dep_files = self.dep_files;
        module.bin_subdir = self.bin_dir;
        module.lib_subdir = self.lib_dir;
        module.inc_subdir = self.inc_dir;
        module.declared_bins = self.bins;
        module.declared_libs = self.libs;
        module.refresh_vars();
        module
    }
}

impl InitrdRecipe {
    fn into_submodule(self) -> Result<Submodule> {
        let mut module = Submodule::new(&format!("initrd-{}", self.name), Some(&self.version));
        module.depends = self.depends.into_iter().map(Dependency::Name).collect();
        let files: Vec<FileList> = self
            .files
            .into_iter()
            .map(|list| FileList {
                dir: list.dir,
                entries: list.entries,
            })
            .collect();
        // the image must be rebuilt when any listed file changes
        for list in &files {
            module.dep_files.extend(list.entries.iter().cloned());
        }
        let mut devices = Vec::new();
        for dev in self.devices {
            devices.push(DeviceNode {
                devtype: dev
                    .devtype
                    .parse::<DeviceType>()
                    .with_context(|| format!("initrd-{}: device {}", self.name, dev.path))?,
                path: dev.path,
                major: dev.major,
                minor: dev.minor,
            });
        }
        module.kind = ModuleKind::Initrd(InitrdSpec {
            filename: self.filename,
            dirs: self.dirs,
            files,
            symlinks: self
                .symlinks
                .into_iter()
                .map(|link| Symlink {
                    path: link.path,
                    target: link.target,
                })
                .collect(),
            devices,
            add_hashes: self.add_hashes,
        });
        module.refresh_vars();
        Ok(module)
    }
}

/// Load one manifest file, or every `*.toml` in a directory, into a
/// fresh registry.
pub fn load_manifests(path: &Path) -> Result<Registry> {
    let mut files = Vec::new();
    if path.is_dir() {
        for entry in
            fs::read_dir(path).with_context(|| format!("reading {}", path.display()))?
        {
            let entry = entry.with_context(|| format!("reading {}", path.display()))?;
            let file = entry.path();
            if file.extension().map(|ext| ext == "toml").unwrap_or(false) {
                files.push(file);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }
    if files.is_empty() {
        bail!("{}: no manifests found", path.display());
    }

    let mut registry = Registry::default();
    for file in &files {
        let text =
            fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        let manifest: Manifest =
            toml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
        for recipe in manifest.modules {
            registry
                .insert(recipe.into_submodule())
                .with_context(|| format!("loading {}", file.display()))?;
        }
        for recipe in manifest.initrds {
            registry
                .insert(recipe.into_submodule()?)
                .with_context(|| format!("loading {}", file.display()))?;
        }
    }
    Ok(registry)
}
