//! # Arbitration policy.
//!
//! Decides, for every libstdc++.so.6 candidate the loader proposes, whether
//! to let it load or to substitute the copy shipped next to the executable.
//!
//! The policy lives in an explicit [`Arbiter`] context object:
//!
//! - [`Arbiter::initialize`] runs once at process start. It finds the
//!   shipped library through the executable's `DT_RUNPATH` (then
//!   `DT_RPATH`), opens it, and records its version and path as the
//!   baseline.
//! - [`Arbiter::arbitrate`] runs once per candidate and returns a
//!   [`Decision`].
//! - [`Arbiter::release`] drops the baseline; later queries pass everything
//!   through, as if never initialized.
//!
//! Every failure on the initialization path is advisory: it leaves the
//! arbiter without a baseline, and an arbiter without a baseline accepts
//! whatever the loader proposes. Version arbitration failing open is
//! deliberate; it must never be the reason a process fails to start.

use std::fs::File;
use std::path::{Path, PathBuf};

use common::PackedVersion;
use searchpath::{read_search_paths, resolve_candidate, ElfPhdr};

/// Where the loader found the candidate path it is proposing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrigin {
    /// The name exactly as recorded in the requesting object.
    Original,
    /// An `LD_LIBRARY_PATH` directory.
    LdLibraryPath,
    /// A `DT_RUNPATH`/`DT_RPATH` directory.
    Runpath,
    /// The system default directories (or ld.so.cache).
    Default,
    /// An `/etc/ld.so.conf` directory.
    Config,
    /// A secure-mode directory.
    Secure,
}

/// The three-way outcome of one arbitration query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Defer to the candidate exactly as proposed.
    Accept,
    /// Load this path instead of the candidate.
    Substitute(PathBuf),
    /// The target library is not to be found at this candidate; the loader
    /// should move on.
    Reject,
}

/// Inputs the host process supplies for baseline initialization, straight
/// from its auxiliary vector.
pub struct ProcessEnv {
    pub phdr: *const ElfPhdr,
    pub phnum: usize,
    /// The executable's own filesystem path (`AT_EXECFN`).
    pub exec_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("executable path {0:?} has no usable parent directory")]
    BadOrigin(PathBuf),

    #[error(transparent)]
    DynSection(#[from] searchpath::DynSectionError),

    #[error("no libstdc++.so.6 on DT_RUNPATH or DT_RPATH")]
    NotFound,

    #[error("cannot read shipped library version: {0}")]
    Extract(#[from] verdef::ExtractError),
}

/// The shipped library the process was built against.
#[derive(Debug)]
struct Baseline {
    version: PackedVersion,
    path: String,
}

/// Context object holding the baseline state across queries.
///
/// `baseline == None` is the explicit invalid sentinel: not yet
/// initialized, initialization failed, or already released. All three
/// degrade to pass-through.
#[derive(Debug)]
pub struct Arbiter {
    baseline: Option<Baseline>,
}

impl Arbiter {
    /// An arbiter with no baseline; every query passes through.
    pub const fn uninitialized() -> Arbiter {
        Arbiter { baseline: None }
    }

    /// An arbiter with a known baseline. Used by tests and by hosts that
    /// located the shipped library themselves.
    pub fn with_baseline(version: PackedVersion, path: impl Into<String>) -> Arbiter {
        Arbiter {
            baseline: Some(Baseline {
                version,
                path: path.into(),
            }),
        }
    }

    /// Establishes the baseline from the running process's own metadata.
    ///
    /// Tries `DT_RUNPATH` first and `DT_RPATH` only if that produced
    /// nothing, probing each candidate by opening it; the opened file is
    /// then version-extracted. Any failure is reported to stderr and
    /// yields an uninitialized (pass-through) arbiter.
    ///
    /// # Safety
    ///
    /// Same contract as [`read_search_paths`]: `env.phdr`/`env.phnum` must
    /// describe the running executable's program headers.
    pub unsafe fn initialize(env: &ProcessEnv) -> Arbiter {
        match Self::try_initialize(env) {
            Ok(arbiter) => arbiter,
            Err(e) => {
                eprintln!(
                    "stdcxx-audit: cannot establish shipped libstdc++ baseline: {e}; \
                     runtime link errors may occur"
                );
                Arbiter::uninitialized()
            }
        }
    }

    unsafe fn try_initialize(env: &ProcessEnv) -> Result<Arbiter, InitError> {
        let origin = match env.exec_path.parent().and_then(Path::to_str) {
            // A bare relative filename lives in the current directory.
            Some("") => ".",
            Some(dir) => dir,
            None => return Err(InitError::BadOrigin(env.exec_path.clone())),
        };
        common::trace!("origin {origin}");

        let paths = read_search_paths(env.phdr, env.phnum)?;

        let mut opened: Option<File> = None;
        let mut probe = |path: &str| match File::open(path) {
            Ok(file) => {
                opened = Some(file);
                true
            }
            Err(_) => false,
        };

        let mut found = None;
        if let Some(runpath) = paths.runpath.as_deref() {
            found = resolve_candidate(runpath, origin, &mut probe);
        }
        if found.is_none() {
            if let Some(rpath) = paths.rpath.as_deref() {
                found = resolve_candidate(rpath, origin, &mut probe);
            }
        }

        let path = found.ok_or(InitError::NotFound)?;
        let file = opened.ok_or(InitError::NotFound)?;
        let version = verdef::max_glibcxx_version_of(&file)?;
        common::trace!("shipped {path} is {version}");

        Ok(Arbiter {
            baseline: Some(Baseline { version, path }),
        })
    }

    pub fn is_baselined(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn baseline_version(&self) -> Option<PackedVersion> {
        self.baseline.as_ref().map(|b| b.version)
    }

    pub fn baseline_path(&self) -> Option<&str> {
        self.baseline.as_ref().map(|b| b.path.as_str())
    }

    /// Arbitrates one candidate path the loader is considering.
    ///
    /// Candidates whose filename is not the target library, and all
    /// candidates while no baseline is held, pass through untouched.
    /// `Runpath` candidates are rejected outright: the RUNPATH entries were
    /// already arbitrated when the baseline was established. Otherwise the
    /// candidate's version is extracted (an unreadable version counts as 0)
    /// and compared: strictly older than the baseline means the baseline
    /// path is substituted; anything else is accepted and raises the
    /// baseline version floor. The floor only ever rises, and the recorded
    /// path never changes.
    pub fn arbitrate(&mut self, candidate: &str, origin: SearchOrigin) -> Decision {
        if !candidate.ends_with(common::TARGET_REL_PATH) {
            return Decision::Accept;
        }
        let Some(baseline) = self.baseline.as_mut() else {
            return Decision::Accept;
        };
        if origin == SearchOrigin::Runpath {
            return Decision::Reject;
        }

        // Candidate not present (or unreadable): let the loader find that
        // out for itself.
        let file = match File::open(candidate) {
            Ok(file) => file,
            Err(_) => return Decision::Accept,
        };

        let version = match verdef::max_glibcxx_version_of(&file) {
            Ok(version) => version,
            Err(e) => {
                eprintln!("stdcxx-audit: cannot read GLIBCXX version of {candidate}: {e}");
                PackedVersion::ZERO
            }
        };
        common::trace!(
            "candidate {candidate} is {version}, baseline {} is {}",
            baseline.path,
            baseline.version
        );

        if version < baseline.version {
            return Decision::Substitute(PathBuf::from(baseline.path.clone()));
        }
        baseline.version = version;
        Decision::Accept
    }

    /// Drops the baseline. Subsequent queries behave as if uninitialized.
    pub fn release(&mut self) {
        self.baseline = None;
    }
}
