//! Small path-joining helpers used throughout the engine.
//!
//! Staging paths and sidecar paths are built by appending suffixes to an
//! existing path rather than formatting a fresh `String`, which avoids an
//! extra allocation on the hot path of planning a download.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Extension to the standard [`PathBuf`], mainly to ease joining and raw
/// appending without reallocating a new path each time.
pub trait PathBufExt {
    /// Return this path joined with another one.
    fn joined<P: AsRef<Path>>(self, path: P) -> Self;

    /// Return this path appended with another string, without adding any
    /// path separator (e.g. `dest.part`, not `dest/part`).
    fn appended<S: AsRef<OsStr>>(self, s: S) -> Self;
}

impl PathBufExt for PathBuf {
    #[inline]
    fn joined<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.push(path);
        self
    }

    #[inline]
    fn appended<S: AsRef<OsStr>>(mut self, s: S) -> Self {
        self.as_mut_os_string().push(s);
        self
    }
}
