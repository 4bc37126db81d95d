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

//! `%(key)s` interpolation over a per-module variable map.
//!
//! Every command string, URL template, and config-append line in a recipe
//! may reference the owning module's keys, or any transitive dependency's
//! keys as `depname.key`.  Expansion is pure: it never consults the
//! environment, only the map.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("{module}: unknown variable %({key})s; have: {available}")]
    MissingKey {
        module: String,
        key: String,
        available: String,
    },
    #[error("{module}: malformed placeholder at byte {offset} of {template:?}")]
    Malformed {
        module: String,
        template: String,
        offset: usize,
    },
}

/// Flat string-to-string map rebuilt whenever a module's paths change.
#[derive(Debug, Clone, Default)]
pub struct VarMap {
    vars: BTreeMap<String, String>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }

    /// Insert the key if the value is known, otherwise make sure it is
    /// absent so a reference to it fails instead of expanding to junk.
    pub fn set_opt(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.vars.insert(key.to_string(), value);
            }
            None => {
                self.vars.remove(key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Merge another module's direct keys under `prefix.`.  Keys that are
    /// themselves prefixed (already contain a dot) are not re-exported,
    /// so only the single-dot form ever appears.
    pub fn merge_prefixed(&mut self, prefix: &str, other: &VarMap) {
        for (key, value) in &other.vars {
            if key.contains('.') {
                continue;
            }
            self.vars.insert(format!("{prefix}.{key}"), value.clone());
        }
    }

    /// Substitute every `%(key)s` in `template`.  `%%` is a literal
    /// percent; anything else after `%` is malformed.  `module` names the
    /// owner in diagnostics.
    pub fn expand(&self, module: &str, template: &str) -> Result<String, ExpandError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let offset = template.len() - rest.len() + pos;
            let malformed = || ExpandError::Malformed {
                module: module.to_string(),
                template: template.to_string(),
                offset,
            };
            let after = &rest[pos + 1..];
            if let Some(tail) = after.strip_prefix('%') {
                out.push('%');
                rest = tail;
            } else if let Some(body) = after.strip_prefix('(') {
                let end = body.find(')').ok_or_else(malformed)?;
                let key = &body[..end];
                let tail = body[end + 1..].strip_prefix('s').ok_or_else(malformed)?;
                let value = self.vars.get(key).ok_or_else(|| ExpandError::MissingKey {
                    module: module.to_string(),
                    key: key.to_string(),
                    available: self.dump(),
                })?;
                out.push_str(value);
                rest = tail;
            } else {
                return Err(malformed());
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// All known keys, for the diagnostic dump on a failed lookup.
    fn dump(&self) -> String {
        self.vars
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
