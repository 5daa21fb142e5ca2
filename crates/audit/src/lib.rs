//! # `LD_AUDIT` boundary.
//!
//! The glibc loader interface to the arbitration policy. Preload with
//! `LD_AUDIT=libstdcxx_audit.so` and the loader calls:
//!
//! - [`la_version`] once, before anything else: establish the baseline.
//! - [`la_objsearch`] once per candidate path while resolving each
//!   dependency: arbitrate.
//! - [`la_activity`] when link maps reach a consistent state: tear down.
//!
//! This crate holds the one piece of process-global state in the workspace.
//! The callback ABI leaves nowhere else to put it; a `Mutex` guards it in
//! case the host performs concurrent `dlopen` resolution. No policy logic
//! lives here, only the mapping between C pointers and [`Decision`].

use std::ffi::{c_char, c_uint, CStr, CString};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use arbiter::{Arbiter, Decision, ProcessEnv, SearchOrigin};
use searchpath::ElfPhdr;

/// Audit interface version this library is written against (`LAV_CURRENT`
/// in `<link.h>`).
const LAV_CURRENT: c_uint = 2;

// la_objsearch `flag` values from <link.h>.
const LA_SER_ORIG: c_uint = 0x01;
const LA_SER_LIBPATH: c_uint = 0x02;
const LA_SER_RUNPATH: c_uint = 0x04;
const LA_SER_CONFIG: c_uint = 0x08;
const LA_SER_SECURE: c_uint = 0x80;

// la_activity `flag` values from <link.h>.
const LA_ACT_CONSISTENT: c_uint = 0;

struct AuditState {
    arbiter: Arbiter,
    /// C copy of the baseline path handed back on `Substitute`. Lives here,
    /// pinned, so the pointer stays valid from init until teardown.
    exported_path: Option<CString>,
}

static STATE: Mutex<AuditState> = Mutex::new(AuditState {
    arbiter: Arbiter::uninitialized(),
    exported_path: None,
});

fn state() -> MutexGuard<'static, AuditState> {
    match STATE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn origin_from_flag(flag: c_uint) -> SearchOrigin {
    match flag {
        LA_SER_ORIG => SearchOrigin::Original,
        LA_SER_LIBPATH => SearchOrigin::LdLibraryPath,
        LA_SER_RUNPATH => SearchOrigin::Runpath,
        LA_SER_CONFIG => SearchOrigin::Config,
        LA_SER_SECURE => SearchOrigin::Secure,
        _ => SearchOrigin::Default,
    }
}

/// Called exactly once by the loader before any other audit callback.
/// Establishes the shipped-library baseline from the auxiliary vector.
#[no_mangle]
pub extern "C" fn la_version(version: c_uint) -> c_uint {
    common::trace!("la_version: loader speaks {version}, replying {LAV_CURRENT}");

    // SAFETY: getauxval reads the process's own auxiliary vector.
    let exec = unsafe { libc::getauxval(libc::AT_EXECFN) } as *const c_char;
    let phdr = unsafe { libc::getauxval(libc::AT_PHDR) } as *const ElfPhdr;
    let phnum = unsafe { libc::getauxval(libc::AT_PHNUM) } as usize;

    if exec.is_null() || phdr.is_null() || phnum == 0 {
        eprintln!(
            "stdcxx-audit: auxiliary vector is missing executable metadata; \
             runtime link errors may occur"
        );
        return LAV_CURRENT;
    }

    // SAFETY: AT_EXECFN is a NUL-terminated path installed by the kernel.
    let exec_path = PathBuf::from(
        unsafe { CStr::from_ptr(exec) }
            .to_string_lossy()
            .into_owned(),
    );
    let env = ProcessEnv {
        phdr,
        phnum,
        exec_path,
    };

    // SAFETY: phdr/phnum come straight from the auxiliary vector and
    // describe this very process.
    let arbiter = unsafe { Arbiter::initialize(&env) };

    let mut state = state();
    state.exported_path = arbiter
        .baseline_path()
        .and_then(|path| CString::new(path).ok());
    state.arbiter = arbiter;
    LAV_CURRENT
}

/// Called by the loader for every path it considers while resolving a
/// library. Returns the path to use: `name` itself, the baseline path, or
/// NULL for "nothing to load here".
///
/// # Safety
///
/// `name` must be NULL or a NUL-terminated string, as the loader provides.
#[no_mangle]
pub unsafe extern "C" fn la_objsearch(
    name: *const c_char,
    _cookie: *mut usize,
    flag: c_uint,
) -> *mut c_char {
    if name.is_null() {
        return std::ptr::null_mut();
    }
    let Ok(candidate) = CStr::from_ptr(name).to_str() else {
        // Not a path this policy can reason about; leave it to the loader.
        return name.cast_mut();
    };

    let mut state = state();
    match state.arbiter.arbitrate(candidate, origin_from_flag(flag)) {
        Decision::Accept => name.cast_mut(),
        Decision::Reject => std::ptr::null_mut(),
        Decision::Substitute(path) => match state.exported_path.as_ref() {
            Some(exported) => {
                common::trace!("substituting {} for {candidate}", path.display());
                exported.as_ptr().cast_mut()
            }
            // No pinned C copy of the baseline path; fail open.
            None => name.cast_mut(),
        },
    }
}

/// Called by the loader on link-map activity. The first consistent state
/// after startup means resolution is done: drop the baseline and the
/// exported path.
#[no_mangle]
pub extern "C" fn la_activity(_cookie: *mut usize, flag: c_uint) {
    common::trace!("la_activity: flag {flag}");
    if flag == LA_ACT_CONSISTENT {
        let mut state = state();
        state.arbiter.release();
        state.exported_path = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_mapping() {
        assert_eq!(origin_from_flag(LA_SER_ORIG), SearchOrigin::Original);
        assert_eq!(origin_from_flag(LA_SER_LIBPATH), SearchOrigin::LdLibraryPath);
        assert_eq!(origin_from_flag(LA_SER_RUNPATH), SearchOrigin::Runpath);
        assert_eq!(origin_from_flag(LA_SER_CONFIG), SearchOrigin::Config);
        assert_eq!(origin_from_flag(LA_SER_SECURE), SearchOrigin::Secure);
        // LA_SER_DEFAULT is 0x40; unknown flags also land on Default.
        assert_eq!(origin_from_flag(0x40), SearchOrigin::Default);
        assert_eq!(origin_from_flag(0xdead), SearchOrigin::Default);
    }

    #[test]
    fn test_objsearch_null_name_rejects() {
        let result = unsafe { la_objsearch(std::ptr::null(), std::ptr::null_mut(), LA_SER_ORIG) };
        assert!(result.is_null());
    }

    #[test]
    fn test_objsearch_passes_unrelated_name_through_uninitialized() {
        let name = CString::new("/usr/lib/libm.so.6").unwrap();
        let result =
            unsafe { la_objsearch(name.as_ptr(), std::ptr::null_mut(), LA_SER_ORIG) };
        assert_eq!(result as *const c_char, name.as_ptr());
    }

    #[test]
    fn test_activity_teardown_is_idempotent() {
        la_activity(std::ptr::null_mut(), LA_ACT_CONSISTENT);
        la_activity(std::ptr::null_mut(), LA_ACT_CONSISTENT);
        assert!(state().exported_path.is_none());
    }
}
