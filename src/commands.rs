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

//! Command templates shared by recipes built on kbuild or autoconf.
//!
//! These are plain `%(key)s` strings; recipes and library users expand
//! them against a module's variable map.

/// Deterministic out-of-tree kbuild invocation.  Host name, user, build
/// time, and version strings all leak into kernel and coreboot images;
/// pinning them to the module hashes and the epoch keeps the output
/// byte-stable.
pub const KBUILD_MAKE: &[&str] = &[
    "make",
    "-C%(src_dir)s",
    "O=%(rout_dir)s",
    "KBUILD_HOST=builder",
    "KBUILD_USER=%(out_hash)s",
    "KBUILD_BUILD_TIMESTAMP=1970-01-01",
    "KBUILD_BUILD_VERSION=%(src_hash)s",
];

/// Out-of-tree autoconf configure.
pub const CONFIGURE_CMD: &str = "%(src_dir)s/configure";

/// Compiler flags that strip absolute paths and toolchain chatter out of
/// the produced objects.
pub const PREFIX_MAP: &str = "-gno-record-gcc-switches \
    -Wl,--build-id=none \
    -ffile-prefix-map=%(top_dir)s/out=/build \
    -ffile-prefix-map=%(top_dir)s/src=/src \
    -ffile-prefix-map=%(install_dir)s=/";

/// Some broken configure scripts ignore `--disable-rpath`; this rewrites
/// their libtool in place to avoid it.
pub const FIX_LIBTOOL: &[&str] = &[
    "sed",
    "-i",
    "s/^hardcode_libdir_flag_spec=.*$/hardcode_libdir_flag_spec=\"-D__LIBTOOL_IS_A_FOOL__\"/",
    "%(src_dir)s/configure",
];

/// Drop libtool archives from an install tree.
pub const DELETE_LA: &[&str] = &[
    "find",
    "%(install_dir)s",
    "-name",
    "*.la",
    "-exec",
    "rm",
    "{}",
    ";",
];

/// Strip installed shared libraries.
pub const STRIP_LIBS: &[&str] = &[
    "find",
    "%(lib_dir)s",
    "-name",
    "*.so",
    "-a",
    "-type",
    "f",
    "-exec",
    "strip",
    "{}",
    ";",
];

/// A template as an owned command vector, ready for a recipe.
pub fn to_command(template: &[&str]) -> Vec<String> {
    template.iter().map(|arg| arg.to_string()).collect()
}
