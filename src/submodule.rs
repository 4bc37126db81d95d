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

//! The submodule state machine.
//!
//! A submodule is one buildable unit: fetch, unpack, patch, configure,
//! build, install.  Its `src_hash` covers the tarball and patches; its
//! `out_hash` additionally covers configuration, every command vector,
//! the declared outputs, and each dependency's `out_hash`, so any change
//! anywhere in the input closure lands the outputs in a fresh directory.
//! Each transition is idempotent through an on-disk canary, which is also
//! what makes a rerun of the whole world cheap.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache;
use crate::cmdline::FetchRetries;
use crate::download;
use crate::expand::VarMap;
use crate::hash::{extend, extend_one, sha256_file, sha256hex, ZERO_HASH};
use crate::initrd::{self, InitrdSpec};
use crate::util::{display_path, mkdir_p, read_bytes, run, run_logged, write_canary};

/// Where everything lives under the build tree root.
#[derive(Debug, Clone)]
pub struct Layout {
    build_dir: PathBuf,
}

impl Layout {
    pub fn new(build_dir: impl AsRef<Path>) -> Result<Self> {
        let build_dir = build_dir.as_ref();
        let build_dir = if build_dir.is_absolute() {
            build_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .context("getting current directory")?
                .join(build_dir)
        };
        Ok(Layout { build_dir })
    }

    pub fn top_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn ftp_dir(&self) -> PathBuf {
        self.build_dir.join("ftp")
    }

    pub fn src_root(&self) -> PathBuf {
        self.build_dir.join("src")
    }

    pub fn out_root(&self) -> PathBuf {
        self.build_dir.join("out")
    }

    pub fn install_root(&self) -> PathBuf {
        self.build_dir.join("install")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.build_dir.join("cache")
    }
}

/// Everything a worker needs besides the module itself.  Cheap to clone;
/// the HTTP client shares its connection pool across clones.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub layout: Layout,
    pub client: blocking::Client,
    pub cache_server: Option<String>,
    pub retries: FetchRetries,
}

impl BuildContext {
    pub fn new(
        layout: Layout,
        cache_server: Option<String>,
        retries: FetchRetries,
    ) -> Result<Self> {
        Ok(BuildContext {
            layout,
            client: download::new_http_client()?,
            cache_server,
            retries,
        })
    }
}

pub type ModRef = Arc<Mutex<Submodule>>;

/// A dependency declared by name resolves to a handle during the
/// scheduler's check pass; recipes constructed programmatically may hand
/// over the handle directly.
#[derive(Debug, Clone)]
pub enum Dependency {
    Name(String),
    Handle(ModRef),
}

impl Dependency {
    pub fn handle(&self) -> Result<&ModRef> {
        match self {
            Dependency::Handle(handle) => Ok(handle),
            Dependency::Name(name) => Err(anyhow!("{name}: dependency not resolved")),
        }
    }
}

/// All modules known to the process, keyed by both `name` and `fullname`.
/// Built while loading recipes and frozen before the scheduler runs.
#[derive(Debug, Default)]
pub struct Registry {
    mods: BTreeMap<String, ModRef>,
}

impl Registry {
    pub fn insert(&mut self, module: Submodule) -> Result<ModRef> {
        let name = module.name.clone();
        let fullname = module.fullname.clone();
        if self.mods.contains_key(&fullname) {
            bail!("{fullname}: already exists in the module registry");
        }
        let handle: ModRef = Arc::new(Mutex::new(module));
        if name != fullname {
            if self.mods.contains_key(&name) {
                eprintln!("{name}: short name already registered; keeping the first");
            } else {
                self.mods.insert(name, handle.clone());
            }
        }
        self.mods.insert(fullname, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<ModRef> {
        self.mods.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }
}

/// Package modules run recipe commands; initrd modules assemble a cpio
/// archive from their dependencies' outputs.
#[derive(Debug, Clone)]
pub enum ModuleKind {
    Package,
    Initrd(InitrdSpec),
}

#[derive(Debug)]
pub struct Submodule {
    // identity
    pub name: String,
    pub version: String,
    pub fullname: String,

    // source inputs
    pub url: Option<String>,
    pub tarhash: Option<String>,
    pub patch_files: Vec<String>,
    pub patch_level: u32,
    pub strip_components: u32,
    pub tar_options: Vec<String>,

    // build inputs
    pub config_files: Vec<PathBuf>,
    pub config_append: Vec<String>,
    pub kconfig_file: String,
    pub configure_commands: Vec<Vec<String>>,
    pub make_commands: Vec<Vec<String>>,
    pub install_commands: Vec<Vec<String>>,

    // declared outputs, relative to the install tree
    pub bin_subdir: String,
    pub lib_subdir: String,
    pub inc_subdir: String,
    pub declared_bins: Vec<String>,
    pub declared_libs: Vec<String>,

    pub dirty: bool,
    pub cacheable: bool,
    pub report_hashes: bool,

    pub depends: Vec<Dependency>,
    pub dep_files: Vec<String>,

    pub kind: ModuleKind,

    // computed identity
    pub src_hash: String,
    pub out_hash: String,
    pub tar_file: Option<PathBuf>,
    pub src_dir: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub rout_dir: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub lib_dir: Option<PathBuf>,
    pub inc_dir: Option<PathBuf>,
    pub top_dir: Option<PathBuf>,
    pub bins: Vec<PathBuf>,
    pub libs: Vec<PathBuf>,
    pub last_logfile: Option<PathBuf>,

    patches: Vec<(String, Vec<u8>)>,
    configs: Vec<Vec<u8>>,
    vars: VarMap,

    // lifecycle; monotonic, never un-set
    pub fetched: bool,
    pub unpacked: bool,
    pub patched: bool,
    pub configured: bool,
    pub built: bool,
    pub installed: bool,
}

impl Submodule {
    pub fn new(name: &str, version: Option<&str>) -> Submodule {
        let version = version.unwrap_or("NOVERSION").to_string();
        // a name that already carries its version is not suffixed again
        let fullname = if name.ends_with(&format!("-{version}")) {
            name.to_string()
        } else {
            format!("{name}-{version}")
        };
        let mut module = Submodule {
            name: name.to_string(),
            version,
            fullname,
            url: None,
            tarhash: None,
            patch_files: Vec::new(),
            patch_level: 1,
            strip_components: 1,
            tar_options: Vec::new(),
            config_files: Vec::new(),
            config_append: Vec::new(),
            kconfig_file: ".config".to_string(),
            configure_commands: Vec::new(),
            make_commands: Vec::new(),
            install_commands: Vec::new(),
            bin_subdir: "bin".to_string(),
            lib_subdir: "lib".to_string(),
            inc_subdir: "include".to_string(),
            declared_bins: Vec::new(),
            declared_libs: Vec::new(),
            dirty: false,
            cacheable: false,
            report_hashes: false,
            depends: Vec::new(),
            dep_files: Vec::new(),
            kind: ModuleKind::Package,
            src_hash: ZERO_HASH.to_string(),
            out_hash: ZERO_HASH.to_string(),
            tar_file: None,
            src_dir: None,
            out_dir: None,
            rout_dir: None,
            install_dir: None,
            bin_dir: None,
            lib_dir: None,
            inc_dir: None,
            top_dir: None,
            bins: Vec::new(),
            libs: Vec::new(),
            last_logfile: None,
            patches: Vec::new(),
            configs: Vec::new(),
            vars: VarMap::new(),
            fetched: false,
            unpacked: false,
            patched: false,
            configured: false,
            built: false,
            installed: false,
        };
        module.refresh_vars();
        module
    }

    pub fn state(&self) -> &'static str {
        if self.installed {
            "INSTALLED"
        } else if self.built {
            "BUILT    "
        } else if self.configured {
            "CONFIGED "
        } else if self.patched {
            "PATCHED  "
        } else if self.unpacked {
            "UNPACKED "
        } else if self.fetched {
            "FETCHED  "
        } else {
            "NOSTATE  "
        }
    }

    pub fn vars(&self) -> &VarMap {
        &self.vars
    }

    pub fn expand(&self, template: &str) -> Result<String> {
        Ok(self.vars.expand(&self.fullname, template)?)
    }

    /// Rebuild the interpolation map from the current state, including
    /// every transitive dependency's direct keys as `depname.key`.
    pub fn refresh_vars(&mut self) {
        let mut vars = VarMap::new();
        vars.set("version", self.version.as_str());
        vars.set("name", self.name.as_str());
        let mut parts = self.version.split('.');
        if let Some(major) = parts.next() {
            vars.set("major", major);
        }
        vars.set_opt("minor", parts.next().map(str::to_string));
        vars.set_opt("patch", parts.next().map(str::to_string));
        vars.set("src_hash", &self.src_hash[..16]);
        vars.set("out_hash", &self.out_hash[..16]);
        let display = |path: &Option<PathBuf>| path.as_ref().map(|p| p.display().to_string());
        vars.set_opt("src_dir", display(&self.src_dir));
        vars.set_opt("out_dir", display(&self.out_dir));
        vars.set_opt("rout_dir", display(&self.rout_dir));
        vars.set_opt("install_dir", display(&self.install_dir));
        vars.set_opt("bin_dir", display(&self.bin_dir));
        vars.set_opt("lib_dir", display(&self.lib_dir));
        vars.set_opt("inc_dir", display(&self.inc_dir));
        vars.set_opt("top_dir", display(&self.top_dir));
        vars.set_opt("tar_file", display(&self.tar_file));
        let mut seen = BTreeSet::new();
        Self::merge_dep_vars(&mut vars, &self.depends, &mut seen);
        self.vars = vars;
    }

    fn merge_dep_vars(vars: &mut VarMap, deps: &[Dependency], seen: &mut BTreeSet<String>) {
        for dep in deps {
            // unresolved names are deferred until the check pass
            if let Dependency::Handle(handle) = dep {
                let dep = handle.lock().unwrap();
                if !seen.insert(dep.fullname.clone()) {
                    continue;
                }
                vars.merge_prefixed(&dep.name, &dep.vars);
                Self::merge_dep_vars(vars, &dep.depends, seen);
            }
        }
    }

    /// Compute `src_hash` and `out_hash` and fill in every derived path.
    /// Runs in the scheduler's pre-pass in topological order, so each
    /// dependency's `out_hash` is already final, and again at configure
    /// time, where any difference from the first run aborts: a recipe
    /// whose hashes drift between runs cannot be trusted to be
    /// reproducible.
    pub fn update_hashes(&mut self, ctx: &BuildContext) -> Result<()> {
        self.compute_src_hash()?;
        let seed = match &self.kind {
            ModuleKind::Package => ZERO_HASH.to_string(),
            ModuleKind::Initrd(spec) => spec.config_seed(),
        };
        self.compute_out_hash(ctx, &seed)
    }

    fn compute_src_hash(&mut self) -> Result<()> {
        if let ModuleKind::Initrd(spec) = &self.kind {
            let identity = format!("{}-{}", spec.filename, self.version);
            self.patches.clear();
            self.src_hash = sha256hex(identity);
            return Ok(());
        }
        let mut h = self
            .tarhash
            .clone()
            .unwrap_or_else(|| ZERO_HASH.to_string());
        self.patches.clear();
        let patterns = self.patch_files.clone();
        for pattern in &patterns {
            let expanded = self.expand(pattern)?;
            let mut matches = Vec::new();
            for entry in glob::glob(&expanded)
                .with_context(|| format!("{}: bad patch glob {:?}", self.fullname, expanded))?
            {
                matches.push(entry.with_context(|| {
                    format!("{}: walking patch glob {:?}", self.fullname, expanded)
                })?);
            }
            matches.sort();
            if matches.is_empty() {
                // silently hashing nothing would leave the patch out of
                // the chain
                bail!(
                    "{}: no patches match {:?} (originally {:?})",
                    self.fullname,
                    expanded,
                    pattern
                );
            }
            for path in matches {
                let bytes = read_bytes(&path)?;
                h = extend_one(&h, &bytes);
                self.patches.push((display_path(&path), bytes));
            }
        }
        self.src_hash = h;
        Ok(())
    }

    fn compute_out_hash(&mut self, ctx: &BuildContext, config_seed: &str) -> Result<()> {
        // config fragments, then the unexpanded append lines
        self.configs.clear();
        let mut config_file_hash = config_seed.to_string();
        let config_files = self.config_files.clone();
        for path in &config_files {
            let bytes = read_bytes(path)?;
            config_file_hash = extend_one(&config_file_hash, &bytes);
            self.configs.push(bytes);
        }
        for append in &self.config_append {
            config_file_hash = extend_one(&config_file_hash, append);
        }

        // command vectors, then the layout choices and declared outputs
        let mut config_cmd_hash = command_list_hash(&self.configure_commands);
        let mut extras: Vec<&str> = vec![
            &self.inc_subdir,
            &self.lib_subdir,
            &self.bin_subdir,
            if self.dirty { "dirty-tree" } else { "clean-tree" },
        ];
        extras.extend(self.dep_files.iter().map(String::as_str));
        extras.extend(self.declared_bins.iter().map(String::as_str));
        extras.extend(self.declared_libs.iter().map(String::as_str));
        config_cmd_hash = extend(&config_cmd_hash, extras);

        let make_cmd_hash = command_list_hash(&self.make_commands);
        let install_cmd_hash = command_list_hash(&self.install_commands);

        let mut new_out_hash = extend(
            &self.src_hash,
            [
                &config_file_hash,
                &config_cmd_hash,
                &make_cmd_hash,
                &install_cmd_hash,
            ],
        );
        for dep in &self.depends {
            let dep_hash = dep
                .handle()
                .with_context(|| format!("{}: hashing dependencies", self.fullname))?
                .lock()
                .unwrap()
                .out_hash
                .clone();
            new_out_hash = extend_one(&new_out_hash, &dep_hash);
        }

        if self.out_hash != ZERO_HASH && self.out_hash != new_out_hash {
            bail!(
                "{}: hash changed from {} to {}",
                self.fullname,
                self.out_hash,
                new_out_hash
            );
        }
        self.out_hash = new_out_hash;

        let out_subdir = Path::new(&self.fullname).join(&self.out_hash[..16]);
        self.out_dir = Some(ctx.layout.out_root().join(&out_subdir));
        self.rout_dir = Some(Path::new("../../../out").join(&out_subdir));
        let install_dir = ctx.layout.install_root().join(&out_subdir);
        self.bin_dir = Some(install_dir.join(&self.bin_subdir));
        self.lib_dir = Some(install_dir.join(&self.lib_subdir));
        self.inc_dir = Some(install_dir.join(&self.inc_subdir));
        self.install_dir = Some(install_dir);
        self.top_dir = Some(ctx.layout.top_dir().to_path_buf());
        // dirty builds write into their sources, so the tree is keyed by
        // out_hash and unpacked fresh per output
        self.src_dir = Some(if self.dirty {
            ctx.layout.out_root().join(&out_subdir)
        } else {
            ctx.layout
                .src_root()
                .join(Path::new(&self.fullname).join(&self.src_hash[..16]))
        });

        self.refresh_vars();

        let declared = self.declared_bins.clone();
        self.bins = declared
            .iter()
            .map(|f| self.expand(&format!("%(bin_dir)s/{f}")).map(PathBuf::from))
            .collect::<Result<_>>()?;
        let declared = self.declared_libs.clone();
        self.libs = declared
            .iter()
            .map(|f| self.expand(&format!("%(lib_dir)s/{f}")).map(PathBuf::from))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Download the source tarball into `build/ftp/` if it is not already
    /// there.  Returns false when check mode stopped before the tarball
    /// was available; later phases cannot even compute their paths then.
    pub fn fetch(&mut self, ctx: &BuildContext, force: bool, check: bool) -> Result<bool> {
        self.refresh_vars();
        let url = match &self.url {
            // a source-less module exists only to run commands against
            // its dependencies' trees
            None => {
                self.fetched = true;
                return Ok(true);
            }
            Some(url) => url.clone(),
        };
        let url = self.expand(&url)?;
        let tar = Url::parse(&url)
            .with_context(|| format!("{}: parsing {:?}", self.fullname, url))?
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow!("{}: cannot derive a tar filename from {:?}", self.fullname, url)
            })?;
        let dest = ctx.layout.ftp_dir().join(&tar);
        self.tar_file = Some(dest.clone());
        self.refresh_vars();
        if dest.exists() && !force {
            self.fetched = true;
            return Ok(true);
        }
        if check {
            return Ok(false);
        }
        mkdir_p(&ctx.layout.ftp_dir())?;
        eprintln!("FETCH   {}: {}", self.fullname, url);
        download::fetch_tarball(&ctx.client, &url, &dest, self.tarhash.as_deref(), ctx.retries)?;
        self.fetched = true;
        Ok(true)
    }

    pub fn unpack(&mut self, ctx: &BuildContext, check: bool) -> Result<bool> {
        if self.url.is_none() {
            self.unpacked = true;
            return Ok(true);
        }
        if !self.fetch(ctx, false, check)? {
            return Ok(false);
        }
        let src_dir = self.src_dir()?;
        let canary = src_dir.join(".unpacked");
        if canary.exists() {
            self.unpacked = true;
            return Ok(true);
        }
        if check {
            return Ok(true);
        }
        if self.dirty && src_dir.exists() {
            eprintln!("CLEANUP {}", self.fullname);
            fs::remove_dir_all(&src_dir)
                .with_context(|| format!("removing {}", src_dir.display()))?;
        }
        mkdir_p(&src_dir)?;
        let tar_file = self
            .tar_file
            .clone()
            .ok_or_else(|| anyhow!("{}: no tarball recorded", self.fullname))?;
        eprintln!(
            "UNPACK  {}: {} -> {}",
            self.fullname,
            display_path(&tar_file),
            display_path(&src_dir)
        );
        let mut cmd = Command::new("tar");
        cmd.arg("-xf")
            .arg(&tar_file)
            .arg("-C")
            .arg(&src_dir)
            .arg("--strip-components")
            .arg(self.strip_components.to_string())
            .args(&self.tar_options);
        run(&mut cmd)?;
        write_canary(&canary)?;
        self.unpacked = true;
        Ok(true)
    }

    pub fn patch(&mut self, ctx: &BuildContext, check: bool) -> Result<bool> {
        if self.url.is_none() {
            self.patched = true;
            return Ok(true);
        }
        if !self.unpack(ctx, check)? {
            return Ok(false);
        }
        let src_dir = self.src_dir()?;
        let canary = src_dir.join(".patched");
        if canary.exists() {
            self.patched = true;
            return Ok(true);
        }
        if check {
            return Ok(true);
        }
        let out_dir = self.out_dir()?;
        mkdir_p(&out_dir)?;
        let patches = std::mem::take(&mut self.patches);
        for (name, bytes) in &patches {
            eprintln!("PATCH   {}: {}", self.fullname, name);
            let mut tmp =
                tempfile::NamedTempFile::new().context("creating temporary patch file")?;
            tmp.write_all(bytes).context("writing temporary patch file")?;
            let mut cmd = Command::new("patch");
            cmd.arg("--input")
                .arg(tmp.path())
                .arg("--directory")
                .arg(&src_dir)
                .arg(format!("-p{}", self.patch_level));
            run_logged(&mut cmd, &src_dir, &out_dir.join("patch-log"))?;
        }
        self.patches = patches;
        write_canary(&canary)?;
        self.patched = true;
        Ok(true)
    }

    pub fn configure(&mut self, ctx: &BuildContext, check: bool) -> Result<bool> {
        if !self.patch(ctx, check)? {
            return Ok(false);
        }
        self.update_hashes(ctx)?;
        let out_dir = self.out_dir()?;
        let canary = out_dir.join(".configured");
        if canary.exists() {
            self.configured = true;
            return Ok(true);
        }
        if check {
            return Ok(true);
        }
        mkdir_p(&out_dir)?;
        // the kconfig file is the fragments joined by newlines, followed
        // by the append lines expanded now
        let mut fragments = self.configs.clone();
        let appends = self.config_append.clone();
        for append in &appends {
            fragments.push(self.expand(append)?.into_bytes());
        }
        let kconfig = out_dir.join(&self.kconfig_file);
        fs::write(&kconfig, fragments.join(&b"\n"[..]))
            .with_context(|| format!("writing {}", kconfig.display()))?;
        if !self.configure_commands.is_empty() {
            eprintln!("CONFIG  {}", self.fullname);
            self.run_phase("configure-log", self.configure_commands.clone())?;
        }
        write_canary(&canary)?;
        self.configured = true;
        Ok(true)
    }

    /// Decide whether the build step can be skipped.  The canary mtime is
    /// compared against every declared `dep_files` input, and every
    /// dependency must already be installed.
    fn build_required(&mut self, force: bool, canary: &Path) -> Result<bool> {
        let out_dir = self.out_dir()?;
        mkdir_p(&out_dir)?;
        // timestamp for external GC of stale build trees
        write_canary(&out_dir.join(".build-checked"))?;
        self.built = false;
        if force || !canary.exists() {
            return Ok(true);
        }
        let canary_time = fs::metadata(canary)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("statting {}", canary.display()))?;
        let dep_files = self.dep_files.clone();
        for dep_file in &dep_files {
            let path = PathBuf::from(self.expand(dep_file)?);
            match fs::metadata(&path).and_then(|meta| meta.modified()) {
                // a missing input will fail the build loudly; rebuild
                Err(_) => return Ok(true),
                Ok(modified) => {
                    if modified > canary_time {
                        return Ok(true);
                    }
                }
            }
        }
        for dep in &self.depends {
            if !dep.handle()?.lock().unwrap().installed {
                return Ok(true);
            }
        }
        self.built = true;
        Ok(false)
    }

    pub fn build(&mut self, ctx: &BuildContext, force: bool, check: bool) -> Result<bool> {
        if !self.configure(ctx, check)? {
            return Ok(false);
        }
        let canary = self.out_dir()?.join(format!(".built-{}", self.name));
        if !self.build_required(force, &canary)? {
            return Ok(true);
        }
        if check {
            return Ok(false);
        }
        match self.kind.clone() {
            ModuleKind::Package => {
                if !self.make_commands.is_empty() {
                    eprintln!("BUILD   {}", self.fullname);
                    self.run_phase("make-log", self.make_commands.clone())?;
                }
            }
            ModuleKind::Initrd(spec) => initrd::build_image(self, &spec)?,
        }
        write_canary(&canary)?;
        self.built = true;
        Ok(true)
    }

    pub fn install(&mut self, ctx: &BuildContext, force: bool, check: bool) -> Result<bool> {
        let install_dir = self.install_dir()?;
        let cache_canary = install_dir.join(format!(".cache-{}", self.name));
        if cache_canary.exists() && !force {
            println!(
                "{}: cached build available in {}",
                self.name,
                display_path(&install_dir)
            );
            self.installed = true;
            return Ok(true);
        }
        if self.cacheable && ctx.cache_server.is_some() && !check && cache::fetch(ctx, self)? {
            write_canary(&install_dir.join(format!(".install-{}", self.name)))?;
            write_canary(&cache_canary)?;
            self.installed = true;
            return Ok(true);
        }
        if !self.build(ctx, force, check)? {
            return Ok(false);
        }
        let canary = install_dir.join(format!(".install-{}", self.name));
        if canary.exists() && !force {
            self.installed = true;
            return Ok(true);
        }
        if check {
            return Ok(true);
        }
        mkdir_p(&install_dir)?;
        if !self.install_commands.is_empty() {
            eprintln!("INSTALL {}: {}", self.fullname, display_path(&install_dir));
            self.run_phase("install-log", self.install_commands.clone())?;
        }
        if self.report_hashes {
            for path in self.bins.iter().chain(self.libs.iter()) {
                println!("{}: {}", display_path(path), sha256_file(path)?);
            }
        }
        write_canary(&canary)?;
        self.installed = true;
        if self.cacheable {
            write_canary(&cache_canary)?;
        }
        Ok(true)
    }

    fn run_phase(&mut self, log_name: &str, commands: Vec<Vec<String>>) -> Result<()> {
        let out_dir = self.out_dir()?;
        let log = out_dir.join(log_name);
        self.last_logfile = Some(log.clone());
        for argv in &commands {
            let expanded = argv
                .iter()
                .map(|arg| self.expand(arg))
                .collect::<Result<Vec<_>>>()?;
            let (program, args) = expanded
                .split_first()
                .ok_or_else(|| anyhow!("{}: empty command", self.fullname))?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            run_logged(&mut cmd, &out_dir, &log)?;
        }
        Ok(())
    }

    fn src_dir(&self) -> Result<PathBuf> {
        self.src_dir
            .clone()
            .ok_or_else(|| anyhow!("{}: source directory not computed", self.fullname))
    }

    fn out_dir(&self) -> Result<PathBuf> {
        self.out_dir
            .clone()
            .ok_or_else(|| anyhow!("{}: output directory not computed", self.fullname))
    }

    fn install_dir(&self) -> Result<PathBuf> {
        self.install_dir
            .clone()
            .ok_or_else(|| anyhow!("{}: install directory not computed", self.fullname))
    }
}

/// Fold a list of command vectors: each vector hashed on its own from the
/// zero hash, then folded into the accumulator.
fn command_list_hash(commands: &[Vec<String>]) -> String {
    let mut h = ZERO_HASH.to_string();
    for argv in commands {
        let cmd_hash = extend(ZERO_HASH, argv);
        h = extend_one(&h, &cmd_hash);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> BuildContext {
        BuildContext::new(
            Layout::new(dir.path().join("build")).unwrap(),
            None,
            FetchRetries::None,
        )
        .unwrap()
    }

    fn plain_module(name: &str, version: &str) -> Submodule {
        let mut module = Submodule::new(name, Some(version));
        module.make_commands = vec![vec!["make".to_string()]];
        module
    }

    #[test]
    fn test_fullname() {
        assert_eq!(Submodule::new("zlib", Some("1.2.11")).fullname, "zlib-1.2.11");
        assert_eq!(Submodule::new("linux-5.4", None).fullname, "linux-5.4-NOVERSION");
        // a name already carrying the version is not suffixed again
        assert_eq!(Submodule::new("linux-5.4", Some("5.4")).fullname, "linux-5.4");
    }

    #[test]
    fn test_registry() {
        let mut registry = Registry::default();
        registry.insert(Submodule::new("zlib", Some("1.2.11"))).unwrap();
        assert!(registry.get("zlib").is_some());
        assert!(registry.get("zlib-1.2.11").is_some());
        assert!(registry.get("openssl").is_none());
        // duplicate fullname is a hard error
        registry
            .insert(Submodule::new("zlib", Some("1.2.11")))
            .unwrap_err();
        // another version shares the short name; the first wins
        registry.insert(Submodule::new("zlib", Some("1.3"))).unwrap();
        let first = registry.get("zlib").unwrap();
        assert_eq!(first.lock().unwrap().fullname, "zlib-1.2.11");
    }

    #[test]
    fn test_hashes_are_stable() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("zlib", "1.2.11");
        module.update_hashes(&ctx).unwrap();
        let first = module.out_hash.clone();
        module.update_hashes(&ctx).unwrap();
        assert_eq!(module.out_hash, first);

        // same inputs in a second module give the same hashes
        let mut again = plain_module("zlib", "1.2.11");
        again.update_hashes(&ctx).unwrap();
        assert_eq!(again.out_hash, first);
    }

    #[test]
    fn test_hash_drift_aborts() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("zlib", "1.2.11");
        module.update_hashes(&ctx).unwrap();
        module.make_commands.push(vec!["make".into(), "install".into()]);
        let err = module.update_hashes(&ctx).unwrap_err();
        assert!(err.to_string().contains("hash changed"));
    }

    #[test]
    fn test_out_hash_covers_inputs() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut base = plain_module("busybox", "1.35.0");
        base.update_hashes(&ctx).unwrap();

        // each mutated copy must key a different output directory
        let mutations: Vec<Box<dyn Fn(&mut Submodule)>> = vec![
            Box::new(|m| m.make_commands[0].push("V=1".into())),
            Box::new(|m| m.configure_commands.push(vec!["true".into()])),
            Box::new(|m| m.install_commands.push(vec!["make".into(), "install".into()])),
            Box::new(|m| m.config_append.push("CONFIG_STATIC=y".into())),
            Box::new(|m| m.dep_files.push("%(out_dir)s/.config".into())),
            Box::new(|m| m.declared_bins.push("busybox".into())),
            Box::new(|m| m.declared_libs.push("libbb.so".into())),
            Box::new(|m| m.dirty = true),
            Box::new(|m| m.bin_subdir = "sbin".into()),
        ];
        for mutate in mutations {
            let mut module = plain_module("busybox", "1.35.0");
            mutate(&mut module);
            module.update_hashes(&ctx).unwrap();
            assert_ne!(module.out_hash, base.out_hash);
        }
    }

    #[test]
    fn test_out_hash_covers_dependencies() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut dep = plain_module("musl", "1.2.2");
        dep.update_hashes(&ctx).unwrap();
        let dep = Arc::new(Mutex::new(dep));

        let mut module = plain_module("busybox", "1.35.0");
        module.depends.push(Dependency::Handle(dep.clone()));
        module.update_hashes(&ctx).unwrap();
        let with_dep = module.out_hash.clone();

        let mut without = plain_module("busybox", "1.35.0");
        without.update_hashes(&ctx).unwrap();
        assert_ne!(with_dep, without.out_hash);

        // a change anywhere in the dependency ripples up
        let mut dep2 = plain_module("musl", "1.2.2");
        dep2.config_append.push("CC=gcc".into());
        dep2.update_hashes(&ctx).unwrap();
        let mut module2 = plain_module("busybox", "1.35.0");
        module2
            .depends
            .push(Dependency::Handle(Arc::new(Mutex::new(dep2))));
        module2.update_hashes(&ctx).unwrap();
        assert_ne!(module2.out_hash, with_dep);
    }

    #[test]
    fn test_directory_naming() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("zlib", "1.2.11");
        module.update_hashes(&ctx).unwrap();
        let out16 = &module.out_hash[..16];
        assert_eq!(
            module.install_dir.as_ref().unwrap(),
            &dir.path()
                .join("build/install/zlib-1.2.11")
                .join(out16)
        );
        assert_eq!(
            module.out_dir.as_ref().unwrap(),
            &dir.path().join("build/out/zlib-1.2.11").join(out16)
        );
        assert_eq!(
            module.rout_dir.as_ref().unwrap(),
            &PathBuf::from("../../../out/zlib-1.2.11").join(out16)
        );
        // clean sources are keyed by src_hash
        assert_eq!(
            module.src_dir.as_ref().unwrap(),
            &dir.path()
                .join("build/src/zlib-1.2.11")
                .join(&module.src_hash[..16])
        );
        assert_eq!(
            module.bin_dir.as_ref().unwrap(),
            &module.install_dir.as_ref().unwrap().join("bin")
        );
    }

    #[test]
    fn test_dirty_src_dir_keyed_by_out_hash() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("gcc", "11.2.0");
        module.dirty = true;
        module.update_hashes(&ctx).unwrap();
        assert_eq!(
            module.src_dir.as_ref().unwrap(),
            &dir.path()
                .join("build/out/gcc-11.2.0")
                .join(&module.out_hash[..16])
        );

        // a config change moves the dirty source tree as well
        let mut other = plain_module("gcc", "11.2.0");
        other.dirty = true;
        other.config_append.push("--disable-nls".into());
        other.update_hashes(&ctx).unwrap();
        assert_ne!(other.src_dir, module.src_dir);
    }

    #[test]
    fn test_sourceless_walks_to_installed() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = Submodule::new("tools", Some("0.1"));
        module.update_hashes(&ctx).unwrap();
        assert!(module.install(&ctx, false, false).unwrap());
        assert!(module.installed);
        let out_dir = module.out_dir.clone().unwrap();
        assert!(out_dir.join(".configured").exists());
        assert!(out_dir.join(".built-tools").exists());
        assert!(out_dir.join(".config").exists());
        assert!(module
            .install_dir
            .clone()
            .unwrap()
            .join(".install-tools")
            .exists());
        // no cache canary for a non-cacheable module
        assert!(!module
            .install_dir
            .clone()
            .unwrap()
            .join(".cache-tools")
            .exists());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = Submodule::new("tools", Some("0.1"));
        module.update_hashes(&ctx).unwrap();
        module.install(&ctx, false, false).unwrap();
        let canary = module.out_dir.clone().unwrap().join(".built-tools");
        let before = fs::metadata(&canary).unwrap().modified().unwrap();

        let mut again = Submodule::new("tools", Some("0.1"));
        again.update_hashes(&ctx).unwrap();
        again.install(&ctx, false, false).unwrap();
        assert!(again.installed);
        // the canary was not rewritten
        let after = fs::metadata(&canary).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_check_mode_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("zlib", "1.2.11");
        module.url = Some("https://example.com/%(name)s-%(version)s.tar.xz".into());
        module.update_hashes(&ctx).unwrap();
        module.install(&ctx, false, true).unwrap();
        assert!(!module.installed);
        assert_eq!(module.state(), "NOSTATE  ");
        assert!(!dir.path().join("build").exists());
    }

    #[test]
    fn test_check_classifies_installed() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = Submodule::new("tools", Some("0.1"));
        module.update_hashes(&ctx).unwrap();
        module.install(&ctx, false, false).unwrap();

        let mut fresh = Submodule::new("tools", Some("0.1"));
        fresh.update_hashes(&ctx).unwrap();
        fresh.install(&ctx, false, true).unwrap();
        assert!(fresh.installed);
        assert_eq!(fresh.state(), "INSTALLED");
    }

    #[test]
    fn test_cache_canary_short_circuits() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("zlib", "1.2.11");
        // a build would fail loudly if it ran
        module.make_commands = vec![vec!["false".to_string()]];
        module.cacheable = true;
        module.update_hashes(&ctx).unwrap();
        let install_dir = module.install_dir.clone().unwrap();
        mkdir_p(&install_dir).unwrap();
        write_canary(&install_dir.join(".cache-zlib")).unwrap();

        assert!(module.install(&ctx, false, false).unwrap());
        assert!(module.installed);
        // nothing was built
        assert!(!module.out_dir.clone().unwrap().exists());
    }

    #[test]
    fn test_missing_patch_glob_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut module = plain_module("zlib", "1.2.11");
        module.patch_files = vec![dir
            .path()
            .join("patches/*.patch")
            .display()
            .to_string()];
        let err = module.update_hashes(&ctx).unwrap_err();
        assert!(err.to_string().contains("no patches match"));
    }

    #[test]
    fn test_patches_feed_src_hash() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let patches = dir.path().join("patches");
        mkdir_p(&patches).unwrap();
        fs::write(patches.join("01-fix.patch"), "diff --git a/x b/x\n").unwrap();

        let tarhash = "0c98a3f1732ff6ca4ea690552079da9c597872d30e96ec28414ee23c95558a7f";
        let mut module = plain_module("mpfr", "4.1.0");
        module.tarhash = Some(tarhash.to_string());
        module.patch_files = vec![patches.join("*.patch").display().to_string()];
        module.update_hashes(&ctx).unwrap();
        assert_eq!(
            module.src_hash,
            extend_one(tarhash, "diff --git a/x b/x\n")
        );

        // without patches the tarball hash passes through
        let mut bare = plain_module("mpfr", "4.1.0");
        bare.tarhash = Some(tarhash.to_string());
        bare.update_hashes(&ctx).unwrap();
        assert_eq!(bare.src_hash, tarhash);
    }

    #[test]
    fn test_dependency_vars_exposed() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut dep = plain_module("musl", "1.2.2");
        dep.update_hashes(&ctx).unwrap();
        let dep_bin = dep.bin_dir.clone().unwrap();
        let dep = Arc::new(Mutex::new(dep));

        let mut module = plain_module("busybox", "1.35.0");
        module.depends.push(Dependency::Handle(dep));
        module.update_hashes(&ctx).unwrap();
        assert_eq!(
            module.expand("%(musl.bin_dir)s").unwrap(),
            dep_bin.display().to_string()
        );
        // missing keys carry the owner in the diagnostic
        let err = module.expand("%(musl.nope)s").unwrap_err();
        assert!(err.to_string().contains("busybox-1.35.0"));
    }

    #[test]
    fn test_command_list_hash() {
        assert_eq!(command_list_hash(&[]), ZERO_HASH);
        let one = command_list_hash(&[vec!["make".to_string()]]);
        let expected = extend_one(ZERO_HASH, extend(ZERO_HASH, ["make"]));
        assert_eq!(one, expected);
        // vector boundaries matter
        let split = command_list_hash(&[vec!["make".to_string()], vec!["install".to_string()]]);
        let joined = command_list_hash(&[vec!["make".to_string(), "install".to_string()]]);
        assert_ne!(split, joined);
    }
}
