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

use anyhow::Result;
use clap::Parser;

use libbuildworld::builder;
use libbuildworld::cmdline::Cmd;

fn main() -> Result<()> {
    match Cmd::parse() {
        Cmd::Build(config) => builder::run_build(config),
        Cmd::Check(config) => builder::run_check(config),
        Cmd::Cache(config) => builder::run_cache(config),
    }
}
