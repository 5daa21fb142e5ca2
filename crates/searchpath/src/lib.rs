//! # Locating the shipped libstdc++.
//!
//! Two halves of the same question, "where is the copy of libstdc++.so.6
//! this executable was shipped with?":
//!
//! - [`dynsec`] reads the running executable's dynamic section (reached
//!   through its program headers) and pulls out the `DT_RUNPATH` and
//!   `DT_RPATH` search-path strings.
//! - [`candidates`] expands one of those colon-separated directory lists,
//!   substituting `$ORIGIN`, into candidate file paths and probes each in
//!   order.

pub mod candidates;
pub mod dynsec;

pub use candidates::{resolve_candidate, ORIGIN_TOKEN};
pub use dynsec::{read_search_paths, DynSectionError, ElfDyn, ElfPhdr, SearchPaths};
