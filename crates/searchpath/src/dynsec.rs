//! Dynamic-section reader.
//!
//! Given the running executable's program headers (as handed out by the
//! kernel through the auxiliary vector), locates `PT_DYNAMIC` and extracts
//! the `DT_RUNPATH` and `DT_RPATH` search-path strings.
//!
//! This is the one module that reads live process memory instead of a
//! mapped file, so its entry point is `unsafe`: the caller vouches for the
//! header pointer. The walk itself trusts the loader-maintained dynamic
//! section the same way the dynamic linker does.

use std::ffi::CStr;
use std::os::raw::c_char;

pub const PT_DYNAMIC: u32 = 2;
pub const PT_PHDR: u32 = 6;

pub const DT_NULL: isize = 0;
pub const DT_STRTAB: isize = 5;
pub const DT_RPATH: isize = 15;
pub const DT_RUNPATH: isize = 29;

/// Native-class program header.
#[cfg(target_pointer_width = "64")]
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ElfPhdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: usize,
    pub p_vaddr: usize,
    pub p_paddr: usize,
    pub p_filesz: usize,
    pub p_memsz: usize,
    pub p_align: usize,
}

/// Native-class program header.
#[cfg(target_pointer_width = "32")]
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ElfPhdr {
    pub p_type: u32,
    pub p_offset: usize,
    pub p_vaddr: usize,
    pub p_paddr: usize,
    pub p_filesz: usize,
    pub p_memsz: usize,
    pub p_flags: u32,
    pub p_align: usize,
}

/// Native-class dynamic-section entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ElfDyn {
    pub d_tag: isize,
    pub d_val: usize,
}

/// The search paths an executable declares. Either, both, or neither may
/// be present; absence is not an error.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SearchPaths {
    pub runpath: Option<String>,
    pub rpath: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DynSectionError {
    /// A dynamic segment exists but names no string table, so path offsets
    /// cannot be resolved.
    #[error("dynamic segment carries no DT_STRTAB entry")]
    NoStringTable,
}

/// Reads `DT_RUNPATH` and `DT_RPATH` from the executable's dynamic section.
///
/// The load base is the header array's runtime address minus the virtual
/// address the `PT_PHDR` entry says it loads at; `PT_DYNAMIC` is then found
/// at `base + p_vaddr`. `DT_STRTAB` has already been relocated by the
/// loader to an absolute address, so it is used as-is. Path strings are
/// copied out (lossily for non-UTF-8; such a path can only fail a later
/// existence probe).
///
/// An executable without a dynamic segment yields empty [`SearchPaths`].
///
/// # Safety
///
/// `phdr` must point to `phnum` program headers of the running executable,
/// and the dynamic section plus string table they reference must be mapped,
/// as they are for any live process whose loader provided these values.
pub unsafe fn read_search_paths(
    phdr: *const ElfPhdr,
    phnum: usize,
) -> Result<SearchPaths, DynSectionError> {
    let headers = std::slice::from_raw_parts(phdr, phnum);

    let mut base = 0usize;
    for header in headers {
        if header.p_type == PT_PHDR {
            base = (phdr as usize).wrapping_sub(header.p_vaddr);
            break;
        }
    }
    common::trace!("load base {base:#x}");

    for header in headers {
        if header.p_type != PT_DYNAMIC {
            continue;
        }
        let dynamic = base.wrapping_add(header.p_vaddr) as *const ElfDyn;

        // First pass: the string table the path entries index into.
        let mut strtab: *const c_char = std::ptr::null();
        let mut entry = dynamic;
        while (*entry).d_tag != DT_NULL {
            if (*entry).d_tag == DT_STRTAB {
                strtab = (*entry).d_val as *const c_char;
            }
            entry = entry.add(1);
        }
        if strtab.is_null() {
            return Err(DynSectionError::NoStringTable);
        }

        // Second pass: resolve the path entries against it.
        let mut paths = SearchPaths::default();
        let mut entry = dynamic;
        while (*entry).d_tag != DT_NULL {
            match (*entry).d_tag {
                DT_RUNPATH => {
                    let path = CStr::from_ptr(strtab.add((*entry).d_val))
                        .to_string_lossy()
                        .into_owned();
                    common::trace!("DT_RUNPATH {path}");
                    paths.runpath = Some(path);
                }
                DT_RPATH => {
                    let path = CStr::from_ptr(strtab.add((*entry).d_val))
                        .to_string_lossy()
                        .into_owned();
                    common::trace!("DT_RPATH {path}");
                    paths.rpath = Some(path);
                }
                _ => {}
            }
            entry = entry.add(1);
        }
        return Ok(paths);
    }

    // No dynamic segment: a static executable declares no search paths.
    Ok(SearchPaths::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: isize, val: usize) -> ElfDyn {
        ElfDyn { d_tag: tag, d_val: val }
    }

    /// Program headers describing an in-memory dynamic section. With
    /// `PT_PHDR.p_vaddr == 0` the computed base is the header array's own
    /// address, so `PT_DYNAMIC.p_vaddr` is the dynamic array's distance
    /// from it (wrapping).
    fn fake_headers(dyns: &[ElfDyn]) -> Vec<ElfPhdr> {
        let mut phdrs = vec![
            ElfPhdr {
                p_type: PT_PHDR,
                ..Default::default()
            },
            ElfPhdr {
                p_type: PT_DYNAMIC,
                ..Default::default()
            },
        ];
        phdrs[1].p_vaddr = (dyns.as_ptr() as usize).wrapping_sub(phdrs.as_ptr() as usize);
        phdrs
    }

    #[test]
    fn test_runpath_and_rpath_extracted() {
        let strtab = b"\0$ORIGIN/../lib\0/opt/fallback\0".to_vec();
        let dyns = vec![
            entry(DT_STRTAB, strtab.as_ptr() as usize),
            entry(DT_RUNPATH, 1),
            entry(DT_RPATH, 16),
            entry(DT_NULL, 0),
        ];
        let phdrs = fake_headers(&dyns);

        let paths = unsafe { read_search_paths(phdrs.as_ptr(), phdrs.len()) }.unwrap();
        assert_eq!(paths.runpath.as_deref(), Some("$ORIGIN/../lib"));
        assert_eq!(paths.rpath.as_deref(), Some("/opt/fallback"));
    }

    #[test]
    fn test_absent_paths_are_none() {
        let strtab = b"\0".to_vec();
        let dyns = vec![
            entry(DT_STRTAB, strtab.as_ptr() as usize),
            entry(DT_NULL, 0),
        ];
        let phdrs = fake_headers(&dyns);

        let paths = unsafe { read_search_paths(phdrs.as_ptr(), phdrs.len()) }.unwrap();
        assert_eq!(paths, SearchPaths::default());
    }

    #[test]
    fn test_runpath_only() {
        let strtab = b"\0/usr/local/lib\0".to_vec();
        let dyns = vec![
            entry(DT_STRTAB, strtab.as_ptr() as usize),
            entry(DT_RUNPATH, 1),
            entry(DT_NULL, 0),
        ];
        let phdrs = fake_headers(&dyns);

        let paths = unsafe { read_search_paths(phdrs.as_ptr(), phdrs.len()) }.unwrap();
        assert_eq!(paths.runpath.as_deref(), Some("/usr/local/lib"));
        assert_eq!(paths.rpath, None);
    }

    #[test]
    fn test_missing_string_table_is_fatal() {
        let dyns = vec![entry(DT_RUNPATH, 1), entry(DT_NULL, 0)];
        let phdrs = fake_headers(&dyns);

        let err = unsafe { read_search_paths(phdrs.as_ptr(), phdrs.len()) }.unwrap_err();
        assert!(matches!(err, DynSectionError::NoStringTable));
    }

    #[test]
    fn test_no_dynamic_segment_yields_empty_paths() {
        let phdrs = vec![ElfPhdr {
            p_type: PT_PHDR,
            ..Default::default()
        }];

        let paths = unsafe { read_search_paths(phdrs.as_ptr(), phdrs.len()) }.unwrap();
        assert_eq!(paths, SearchPaths::default());
    }
}
