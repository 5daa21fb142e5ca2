use clap::{Parser, Subcommand};
use std::ffi::CStr;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "stdcxx-audit")]
#[command(about = "Inspect libstdc++.so.6 ABI versions and loader state", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the maximum GLIBCXX version of a shared library as 8 hex digits.
    Version {
        /// Path to a libstdc++.so.6 (or any shared object with version definitions).
        path: PathBuf,
    },
    /// List the shared objects loaded in this process.
    Loaded,
    /// Print the absolute path the loader resolves for libstdc++.so.6.
    Locate,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version { path } => cmd_version(path),
        Commands::Loaded => cmd_loaded(),
        Commands::Locate => cmd_locate(),
    }
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Exit codes: 0 on success, 2 for a well-formed library of the wrong word
/// size, 1 for everything fatal.
fn cmd_version(path: &Path) -> anyhow::Result<()> {
    match verdef::max_glibcxx_version(path) {
        Ok(version) => {
            common::trace!("{} declares GLIBCXX {version}", path.display());
            println!("{:08x}", version.as_u32());
            Ok(())
        }
        Err(e) if e.is_class_mismatch() => {
            eprintln!(
                "stdcxx-audit: {}: {} (not introspectable from this process)",
                path.display(),
                e
            );
            std::process::exit(2);
        }
        Err(e) => Err(anyhow::anyhow!("{}: {}", path.display(), e)),
    }
}

// ---------------------------------------------------------------------------
// loaded
// ---------------------------------------------------------------------------

fn cmd_loaded() -> anyhow::Result<()> {
    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let objects = &mut *(data as *mut Vec<(u64, String)>);
        let info = &*info;
        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };
        objects.push((info.dlpi_addr as u64, name));
        0
    }

    let mut objects: Vec<(u64, String)> = Vec::new();
    // SAFETY: the callback only reads the entry it is handed and writes
    // into the Vec passed through `data`.
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut objects as *mut _ as *mut libc::c_void);
    }

    for (addr, name) in &objects {
        // The main executable reports an empty name.
        let display = if name.is_empty() { "[executable]" } else { name };
        println!("{addr:#014x}  {display}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// locate
// ---------------------------------------------------------------------------

/// Fields of glibc's `struct link_map` this command reads.
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const libc::c_char,
    l_ld: *mut libc::c_void,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

const RTLD_DI_LINKMAP: libc::c_int = 2;

fn cmd_locate() -> anyhow::Result<()> {
    // SAFETY: plain dlopen of a well-known soname.
    let library = unsafe { libloading::Library::new("libstdc++.so.6") }
        .map_err(|e| anyhow::anyhow!("loading libstdc++.so.6: {e}"))?;

    // The handle is deliberately not closed: the process exits right after,
    // and dlinfo needs it live.
    let handle = libloading::os::unix::Library::from(library).into_raw();

    let mut map: *mut LinkMap = std::ptr::null_mut();
    // SAFETY: RTLD_DI_LINKMAP fills `map` with the handle's link-map entry.
    let rc = unsafe {
        libc::dlinfo(
            handle.cast(),
            RTLD_DI_LINKMAP,
            &mut map as *mut *mut LinkMap as *mut libc::c_void,
        )
    };
    if rc != 0 || map.is_null() {
        anyhow::bail!("dlinfo gave no link map for libstdc++.so.6");
    }

    // SAFETY: l_name on a live link-map entry is a NUL-terminated path.
    let name = unsafe { (*map).l_name };
    if name.is_null() {
        anyhow::bail!("link map entry for libstdc++.so.6 carries no name");
    }
    let path = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    if path.is_empty() {
        anyhow::bail!("link map entry for libstdc++.so.6 carries no name");
    }
    println!("{path}");
    Ok(())
}
