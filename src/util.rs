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

//! Filesystem and subprocess helpers shared by the build phases.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Runs the provided Command object, discarding its output streams.
/// Errors are prefixed with the full command.  File descriptors are
/// inherited so an outer make job server keeps talking to inner makes.
pub fn run(cmd: &mut Command) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !status.success() {
        bail!("{:#?} failed with {}", cmd, status);
    }
    Ok(())
}

/// Runs the provided Command object with cwd set to `cwd` and both output
/// streams appended to `log`, preceded by a header recording the working
/// directory and the command line.
pub fn run_logged(cmd: &mut Command, cwd: &Path, log: &Path) -> Result<()> {
    let mut logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .with_context(|| format!("opening {}", log.display()))?;
    writeln!(logfile, "-----")
        .and_then(|_| writeln!(logfile, "cd {}", cwd.display()))
        .and_then(|_| writeln!(logfile, "{:?}", cmd))
        .with_context(|| format!("writing {}", log.display()))?;
    let stdout = logfile
        .try_clone()
        .with_context(|| format!("duplicating {}", log.display()))?;
    cmd.current_dir(cwd)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(logfile));
    run(cmd)
}

/// Create a directory and all its ancestors.
pub fn mkdir_p(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

/// Write a zero-byte marker recording a completed phase.
pub fn write_canary(path: &Path) -> Result<()> {
    fs::write(path, b"").with_context(|| format!("writing {}", path.display()))
}

/// Write `data` to `path` through a temporary file in the same directory,
/// so a crash mid-write can never leave a truncated file at the final
/// location.
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("writing temporary file in {}", dir.display()))?;
    tmp.persist(path)
        .with_context(|| format!("persisting {}", path.display()))?;
    Ok(())
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Return the last `limit` lines of a log file for failure reporting.
pub fn tail_lines(path: &Path, limit: usize) -> Result<String> {
    let data = read_bytes(path)?;
    let text = String::from_utf8_lossy(&data);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(limit);
    Ok(lines[start..].join("\n"))
}

/// Shorten a path for status output by stripping the current directory.
pub fn display_path(path: &Path) -> String {
    let shortened = match std::env::current_dir() {
        Ok(cwd) => path.strip_prefix(&cwd).unwrap_or(path),
        Err(_) => path,
    };
    shortened.display().to_string()
}

/// `path` with `suffix` appended to its final component.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run() {
        run(&mut Command::new("true")).unwrap();
        run(Command::new("false").arg("x")).unwrap_err();
        run(&mut Command::new("/nonexistent-program")).unwrap_err();
    }

    #[test]
    fn test_run_logged() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("phase-log");
        run_logged(Command::new("echo").arg("hello"), dir.path(), &log).unwrap();
        run_logged(
            Command::new("sh").args(["-c", "echo oops >&2; exit 3"]),
            dir.path(),
            &log,
        )
        .unwrap_err();
        let text = fs::read_to_string(&log).unwrap();
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
        assert!(text.contains(&format!("cd {}", dir.path().display())));
        // both invocations were framed
        assert_eq!(text.matches("-----").count(), 2);
    }

    #[test]
    fn test_write_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        write_atomically(&path, b"one").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"one");
        write_atomically(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn test_tail_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let lines: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
        fs::write(&path, lines.join("\n")).unwrap();
        let tail = tail_lines(&path, 20).unwrap();
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
        assert_eq!(tail_lines(&path, 100).unwrap().lines().count(), 30);
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/a/b/c.tar"), ".bad"),
            PathBuf::from("/a/b/c.tar.bad")
        );
    }
}
