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

//! Dependency resolution, topological ordering, and the parallel build
//! scheduler, plus the drivers behind the CLI subcommands.
//!
//! The hash pre-pass and the check walk run on the coordinator thread in
//! topological order.  Workers only ever touch their own module (and read
//! their already-installed dependencies), and report completion over a
//! channel; after any failure no new work is launched and the running
//! workers drain.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::cache;
use crate::cmdline::{BuildConfig, CacheConfig, CheckConfig, FetchRetries};
use crate::recipe;
use crate::submodule::{BuildContext, Dependency, Layout, ModRef, Registry};
use crate::util::{display_path, tail_lines};

const LAUNCH_PAUSE: Duration = Duration::from_millis(100);
const DRAIN_PAUSE: Duration = Duration::from_secs(1);
const LOG_TAIL_LINES: usize = 20;

pub struct Builder {
    targets: Vec<String>,
    jobs: usize,
    order: Vec<ModRef>,
    dep_names: BTreeMap<String, Vec<String>>,
    waiting: BTreeMap<String, ModRef>,
    installed: BTreeMap<String, ModRef>,
    failed: BTreeMap<String, ModRef>,
}

impl Builder {
    pub fn new(targets: Vec<String>, jobs: usize) -> Builder {
        Builder {
            targets,
            jobs: jobs.max(1),
            order: Vec::new(),
            dep_names: BTreeMap::new(),
            waiting: BTreeMap::new(),
            installed: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Resolve string references, sort the transitive closure, run the
    /// hash pre-pass in dependency order, and classify every module by
    /// walking its state machine without side effects.
    pub fn check(&mut self, registry: &Registry, ctx: &BuildContext) -> Result<()> {
        self.order.clear();
        self.dep_names.clear();
        self.waiting.clear();
        self.installed.clear();
        self.failed.clear();

        let mut roots = Vec::new();
        for target in &self.targets {
            roots.push(registry.get(target).ok_or_else(|| {
                anyhow!("{target}: not found in the module registry")
            })?);
        }
        let mut done = BTreeSet::new();
        let mut in_progress = BTreeSet::new();
        for root in &roots {
            visit(root, registry, &mut self.order, &mut done, &mut in_progress)?;
        }
        let names: Vec<String> = self
            .order
            .iter()
            .map(|handle| handle.lock().unwrap().fullname.clone())
            .collect();
        println!("order: {}", names.join(" "));

        for handle in &self.order {
            let mut module = handle.lock().unwrap();
            module.update_hashes(ctx)?;
            module.install(ctx, false, true)?;
            let fullname = module.fullname.clone();
            let deps = module
                .depends
                .iter()
                .filter_map(|dep| match dep {
                    Dependency::Handle(handle) => {
                        Some(handle.lock().unwrap().fullname.clone())
                    }
                    Dependency::Name(_) => None,
                })
                .collect();
            self.dep_names.insert(fullname.clone(), deps);
            println!(
                "{} {}: {}",
                module.state(),
                fullname,
                module
                    .out_dir
                    .as_ref()
                    .map(|path| display_path(path))
                    .unwrap_or_default()
            );
            if module.installed {
                self.installed.insert(fullname, handle.clone());
            } else {
                self.waiting.insert(fullname, handle.clone());
            }
        }
        self.report(&BTreeMap::new());
        Ok(())
    }

    /// Drive every target to the installed state.  Returns whether all of
    /// them made it.
    pub fn build_all(&mut self, registry: &Registry, ctx: &BuildContext) -> Result<bool> {
        if self.order.is_empty() {
            self.check(registry, ctx)?;
        }
        let (tx, rx) = mpsc::channel();
        let mut building: BTreeMap<String, ModRef> = BTreeMap::new();
        loop {
            if self.waiting.is_empty() || !self.failed.is_empty() {
                if building.is_empty() {
                    break;
                }
                // a failure stops new launches; the running workers drain
                match rx.recv_timeout(DRAIN_PAUSE) {
                    Ok(message) => self.finish(message, &mut building),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => bail!("all workers disappeared"),
                }
                continue;
            }

            // launch every waiting module whose dependencies are all
            // installed, up to the job limit
            let ready: Vec<(String, ModRef)> = self
                .waiting
                .iter()
                .filter(|(name, _)| {
                    self.dep_names
                        .get(*name)
                        .map(|deps| deps.iter().all(|dep| self.installed.contains_key(dep)))
                        .unwrap_or(false)
                })
                .map(|(name, handle)| (name.clone(), handle.clone()))
                .collect();
            for (name, handle) in ready {
                if building.len() >= self.jobs {
                    break;
                }
                self.waiting.remove(&name);
                let worker = handle.clone();
                building.insert(name.clone(), handle);
                let tx = tx.clone();
                let ctx = ctx.clone();
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || {
                        let result = worker
                            .lock()
                            .unwrap()
                            .install(&ctx, false, false)
                            .map(|_| ());
                        // if the coordinator went away there is no one to
                        // tell
                        let _ = tx.send((name, result));
                    })
                    .context("spawning build worker")?;
            }

            match rx.recv_timeout(LAUNCH_PAUSE) {
                Ok(message) => self.finish(message, &mut building),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("all workers disappeared"),
            }
        }
        Ok(self.report(&building))
    }

    fn finish(&mut self, message: (String, Result<()>), building: &mut BTreeMap<String, ModRef>) {
        let (name, result) = message;
        let handle = match building.remove(&name) {
            Some(handle) => handle,
            None => return,
        };
        match result {
            Ok(()) => {
                println!("DONE    {name}");
                self.installed.insert(name, handle);
            }
            Err(err) => {
                {
                    let module = handle.lock().unwrap();
                    match &module.out_dir {
                        Some(out_dir) => eprintln!(
                            "FAILED! {name}: {err:#}; logs are in {}",
                            display_path(out_dir)
                        ),
                        None => eprintln!("FAILED! {name}: {err:#}"),
                    }
                    if let Some(log) = &module.last_logfile {
                        if let Ok(tail) = tail_lines(log, LOG_TAIL_LINES) {
                            eprintln!("----- last lines of {} -----", display_path(log));
                            eprintln!("{tail}");
                        }
                    }
                }
                self.failed.insert(name, handle);
            }
        }
    }

    fn report(&self, building: &BTreeMap<String, ModRef>) -> bool {
        let join = |set: &BTreeMap<String, ModRef>| {
            set.keys().cloned().collect::<Vec<_>>().join(",")
        };
        println!(
            "building=[{}] waiting=[{}] installed=[{}]",
            join(building),
            join(&self.waiting),
            join(&self.installed)
        );
        if !self.failed.is_empty() {
            eprintln!("failed={}", join(&self.failed));
            return false;
        }
        true
    }
}

/// Depth-first postorder visit: dependencies land in the order before
/// their dependents, ties broken by declared order and then discovery.
/// String references resolve against the registry here.
fn visit(
    handle: &ModRef,
    registry: &Registry,
    order: &mut Vec<ModRef>,
    done: &mut BTreeSet<String>,
    in_progress: &mut BTreeSet<String>,
) -> Result<()> {
    let (fullname, deps) = {
        let mut module = handle.lock().unwrap();
        let fullname = module.fullname.clone();
        if done.contains(&fullname) {
            return Ok(());
        }
        if in_progress.contains(&fullname) {
            bail!("{fullname}: dependency cycle detected");
        }
        for dep in module.depends.iter_mut() {
            if let Dependency::Name(name) = dep {
                let resolved = registry
                    .get(name)
                    .ok_or_else(|| anyhow!("{name}: not found? referenced by {fullname}"))?;
                *dep = Dependency::Handle(resolved);
            }
        }
        let deps: Vec<ModRef> = module
            .depends
            .iter()
            .filter_map(|dep| match dep {
                Dependency::Handle(handle) => Some(handle.clone()),
                Dependency::Name(_) => None,
            })
            .collect();
        (fullname, deps)
    };
    in_progress.insert(fullname.clone());
    for dep in &deps {
        visit(dep, registry, order, done, in_progress)?;
    }
    in_progress.remove(&fullname);
    done.insert(fullname);
    order.push(handle.clone());
    Ok(())
}

fn jobs_from(config_jobs: Option<NonZeroU32>) -> usize {
    if std::env::var_os("SINGLE_THREAD").is_some() {
        return 1;
    }
    match config_jobs {
        Some(jobs) => jobs.get() as usize,
        None => thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1),
    }
}

fn cache_server_from(config: Option<String>) -> Option<String> {
    config.or_else(|| std::env::var("CACHE_SERVER").ok())
}

pub fn run_build(config: BuildConfig) -> Result<()> {
    let registry = recipe::load_manifests(Path::new(&config.manifest))?;
    let ctx = BuildContext::new(
        Layout::new(&config.build_dir)?,
        cache_server_from(config.cache_server),
        config.fetch_retries,
    )?;
    let mut builder = Builder::new(config.targets, jobs_from(config.jobs));
    if builder.build_all(&registry, &ctx)? {
        Ok(())
    } else {
        bail!("some modules failed to build");
    }
}

pub fn run_check(config: CheckConfig) -> Result<()> {
    let registry = recipe::load_manifests(Path::new(&config.manifest))?;
    let ctx = BuildContext::new(Layout::new(&config.build_dir)?, None, FetchRetries::None)?;
    let mut builder = Builder::new(config.targets, 1);
    builder.check(&registry, &ctx)
}

pub fn run_cache(config: CacheConfig) -> Result<()> {
    let registry = recipe::load_manifests(Path::new(&config.manifest))?;
    let ctx = BuildContext::new(Layout::new(&config.build_dir)?, None, FetchRetries::None)?;
    let mut builder = Builder::new(config.targets, 1);
    builder.check(&registry, &ctx)?;
    for handle in &builder.order {
        let module = handle.lock().unwrap();
        if module.cacheable && module.installed {
            cache::create(&ctx, &module)?;
        }
    }
    Ok(())
}
