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

use anyhow::{anyhow, Error};
use clap::{AppSettings, Parser};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

// Args are listed in --help in the order declared in these structs.
// Please keep the entire help text to 80 columns.

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(help_expected = true)]
pub enum Cmd {
    /// Build targets and everything they depend on
    Build(BuildConfig),
    /// Resolve, hash, and classify targets without doing any work
    Check(CheckConfig),
    /// Pack installed cacheable artifacts for publishing
    Cache(CacheConfig),
}

#[derive(Debug, Parser)]
pub struct BuildConfig {
    /// Recipe manifest file or directory
    #[clap(short, long, value_name = "PATH", default_value = "recipes")]
    pub manifest: String,
    /// Root of the build tree
    #[clap(long, value_name = "DIR", default_value = "build")]
    pub build_dir: String,
    /// Maximum number of concurrently building modules
    ///
    /// Defaults to the number of available CPUs.  The SINGLE_THREAD
    /// environment variable forces serial execution.
    #[clap(short, long, value_name = "N")]
    pub jobs: Option<NonZeroU32>,
    /// Base URL of a remote artifact cache
    ///
    /// Defaults to the CACHE_SERVER environment variable.
    #[clap(long, value_name = "URL")]
    pub cache_server: Option<String>,
    /// Fetch retries, or "infinite"
    #[clap(long, value_name = "N", default_value = "0")]
    pub fetch_retries: FetchRetries,
    /// Modules to build
    #[clap(required = true, value_name = "TARGET")]
    pub targets: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct CheckConfig {
    /// Recipe manifest file or directory
    #[clap(short, long, value_name = "PATH", default_value = "recipes")]
    pub manifest: String,
    /// Root of the build tree
    #[clap(long, value_name = "DIR", default_value = "build")]
    pub build_dir: String,
    /// Modules to check
    #[clap(required = true, value_name = "TARGET")]
    pub targets: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct CacheConfig {
    /// Recipe manifest file or directory
    #[clap(short, long, value_name = "PATH", default_value = "recipes")]
    pub manifest: String,
    /// Root of the build tree
    #[clap(long, value_name = "DIR", default_value = "build")]
    pub build_dir: String,
    /// Modules whose install trees should be packed
    #[clap(required = true, value_name = "TARGET")]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRetries {
    Infinite,
    Finite(NonZeroU32),
    None,
}

impl FromStr for FetchRetries {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infinite" => Ok(Self::Infinite),
            num => num
                .parse::<u32>()
                .map(|num| NonZeroU32::new(num).map(Self::Finite).unwrap_or(Self::None))
                .map_err(|e| anyhow!(e)),
        }
    }
}

impl fmt::Display for FetchRetries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "0"),
            Self::Finite(n) => write!(f, "{n}"),
            Self::Infinite => write!(f, "infinite"),
        }
    }
}

impl Default for FetchRetries {
    fn default() -> Self {
        Self::None
    }
}
