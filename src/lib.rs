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

//! Reproducible, content-addressed build orchestration.
//!
//! A world is a set of submodules (toolchain, kernel, userspace,
//! firmware) whose outputs live in directories keyed by a Merkle hash
//! over everything that can affect them.  Unchanged inputs mean no work;
//! changed inputs regenerate exactly the affected outputs.

pub mod builder;
pub mod cache;
pub mod cmdline;
pub mod commands;
pub mod cpio;
pub mod download;
pub mod expand;
pub mod hash;
pub mod initrd;
pub mod recipe;
pub mod submodule;
pub mod util;
