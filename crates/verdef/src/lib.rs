//! # ELF version-definition extractor.
//!
//! **Role**: reads the `.gnu.version_d` section of a shared object and
//! returns the maximum `GLIBCXX_*` version it declares, packed as a
//! [`PackedVersion`].
//!
//! **Design**:
//! - The whole file is mapped read-only with `memmap2` and treated as an
//!   immutable byte arena. The version-definition chain is walked by
//!   computing and validating byte indices into that arena; no raw
//!   pointers are materialized.
//! - The source format is assumed hostile. Every offset, index and count
//!   taken from the image is bounds-checked before use, and a violation is
//!   a fatal [`ExtractError::Malformed`]. The one non-fatal outcome is
//!   [`ExtractError::ClassMismatch`]: a well-formed library compiled for
//!   the other word size, which callers may skip rather than report as
//!   corruption.
//! - A chain whose `vd_next` leaves the section is corrupt in a way the
//!   walk can survive: traversal stops at the section boundary and keeps
//!   whatever maximum it has folded so far.

use std::fs::File;
use std::path::Path;

use common::PackedVersion;
use memmap2::Mmap;

/// Errors produced while extracting a version from a shared object.
///
/// The three-way signal every caller sees: success, the non-fatal
/// [`ClassMismatch`](Self::ClassMismatch), or a fatal variant.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Could not stat, open or map the file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The image does not carry the ELF magic bytes.
    #[error("not an ELF image")]
    NotElf,

    /// Well-formed ELF for the other word size; parsing cannot continue
    /// because none of the offsets would align.
    #[error("ELF class does not match this process word size")]
    ClassMismatch,

    /// Structurally inconsistent image (out-of-bounds offset, index or
    /// count).
    #[error("malformed ELF: {0}")]
    Malformed(&'static str),

    /// The image parses but declares no GLIBCXX version anywhere.
    #[error("no GLIBCXX version definitions present")]
    NoVersionInfo,
}

impl ExtractError {
    /// `true` for the non-fatal wrong-word-size outcome.
    pub fn is_class_mismatch(&self) -> bool {
        matches!(self, ExtractError::ClassMismatch)
    }
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;

// Native-class ELF header and section-header field offsets. Only the class
// this binary was compiled for is parsed; the other class is reported as
// `ClassMismatch` before any of these offsets are used.
#[cfg(target_pointer_width = "64")]
mod layout {
    pub const NATIVE_CLASS: u8 = 2; // ELFCLASS64
    pub const EHDR_LEN: usize = 64;
    pub const E_SHOFF: usize = 40;
    pub const E_SHNUM: usize = 60;
    pub const E_SHSTRNDX: usize = 62;
    pub const SHDR_LEN: usize = 64;
    pub const SH_NAME: usize = 0;
    pub const SH_OFFSET: usize = 24;
    pub const SH_SIZE: usize = 32;
    pub const SH_LINK: usize = 40;
}
#[cfg(target_pointer_width = "32")]
mod layout {
    pub const NATIVE_CLASS: u8 = 1; // ELFCLASS32
    pub const EHDR_LEN: usize = 52;
    pub const E_SHOFF: usize = 32;
    pub const E_SHNUM: usize = 48;
    pub const E_SHSTRNDX: usize = 50;
    pub const SHDR_LEN: usize = 40;
    pub const SH_NAME: usize = 0;
    pub const SH_OFFSET: usize = 16;
    pub const SH_SIZE: usize = 20;
    pub const SH_LINK: usize = 24;
}

// Version-definition record fields (identical for both classes).
const VD_CNT: usize = 6;
const VD_AUX: usize = 12;
const VD_NEXT: usize = 16;
const VERDEF_LEN: usize = 20;
const VDA_NAME: usize = 0;
const VDA_NEXT: usize = 4;
const VERDAUX_LEN: usize = 8;

/// Opens `path` and returns the maximum GLIBCXX version it declares.
pub fn max_glibcxx_version(path: &Path) -> Result<PackedVersion, ExtractError> {
    max_glibcxx_version_of(&File::open(path)?)
}

/// Maps an already-open file and returns the maximum GLIBCXX version it
/// declares. The mapping is scoped to this call and released on every exit
/// path.
pub fn max_glibcxx_version_of(file: &File) -> Result<PackedVersion, ExtractError> {
    // SAFETY: the mapping is read-only and dropped before this function
    // returns; the file handle outlives it.
    let image = unsafe { Mmap::map(file)? };
    scan_image(&image)
}

/// Mapping-free core: scans an in-memory image.
pub fn scan_image(image: &[u8]) -> Result<PackedVersion, ExtractError> {
    if image.len() < ELF_MAGIC.len() || image[..ELF_MAGIC.len()] != ELF_MAGIC {
        return Err(ExtractError::NotElf);
    }
    let header = image
        .get(..layout::EHDR_LEN)
        .ok_or(ExtractError::Malformed("truncated ELF header"))?;
    if header[EI_CLASS] != layout::NATIVE_CLASS {
        return Err(ExtractError::ClassMismatch);
    }

    let shoff = read_word(image, layout::E_SHOFF)? as usize;
    let shnum = read_u16(image, layout::E_SHNUM)? as usize;
    let shstrndx = read_u16(image, layout::E_SHSTRNDX)? as usize;

    if shoff >= image.len() {
        return Err(ExtractError::Malformed("section header table offset out of bounds"));
    }
    let table_len = shnum
        .checked_mul(layout::SHDR_LEN)
        .ok_or(ExtractError::Malformed("section count overflow"))?;
    if shoff.checked_add(table_len).map_or(true, |end| end > image.len()) {
        return Err(ExtractError::Malformed("section header table extends past end of image"));
    }
    if shstrndx >= shnum {
        return Err(ExtractError::Malformed("section name table index out of range"));
    }

    let names = section(image, shoff, shstrndx)?;
    if names.offset >= image.len() {
        return Err(ExtractError::Malformed("section name table offset out of bounds"));
    }
    let names_end = names
        .offset
        .checked_add(names.size)
        .filter(|&end| end <= image.len())
        .ok_or(ExtractError::Malformed("section name table extends past end of image"))?;
    let shstrtab = &image[names.offset..names_end];

    let mut max: Option<PackedVersion> = None;
    for index in 0..shnum {
        let sec = section(image, shoff, index)?;
        if sec.name >= shstrtab.len() {
            return Err(ExtractError::Malformed("section name offset out of range"));
        }
        if cstr(&shstrtab[sec.name..]) != common::VERDEF_SECTION_NAME {
            continue;
        }
        walk_definitions(image, shoff, shnum, &sec, &mut max)?;
    }

    max.ok_or(ExtractError::NoVersionInfo)
}

/// The section-header fields this extractor consumes.
struct Section {
    name: usize,
    offset: usize,
    size: usize,
    link: usize,
}

fn section(image: &[u8], shoff: usize, index: usize) -> Result<Section, ExtractError> {
    let base = shoff
        .checked_add(
            index
                .checked_mul(layout::SHDR_LEN)
                .ok_or(ExtractError::Malformed("section index overflow"))?,
        )
        .ok_or(ExtractError::Malformed("section index overflow"))?;
    Ok(Section {
        name: read_u32(image, base + layout::SH_NAME)? as usize,
        offset: read_word(image, base + layout::SH_OFFSET)? as usize,
        size: read_word(image, base + layout::SH_SIZE)? as usize,
        link: read_u32(image, base + layout::SH_LINK)? as usize,
    })
}

/// Walks one version-definition section, folding every `GLIBCXX_*` name
/// into `max`.
fn walk_definitions(
    image: &[u8],
    shoff: usize,
    shnum: usize,
    sec: &Section,
    max: &mut Option<PackedVersion>,
) -> Result<(), ExtractError> {
    if sec.offset >= image.len() {
        return Err(ExtractError::Malformed("version section offset out of bounds"));
    }
    if sec.offset.checked_add(sec.size).map_or(true, |end| end > image.len()) {
        return Err(ExtractError::Malformed("version section extends past end of image"));
    }
    if sec.link >= shnum {
        return Err(ExtractError::Malformed("version string table link out of range"));
    }
    let strings = section(image, shoff, sec.link)?;
    if strings.offset >= image.len() {
        return Err(ExtractError::Malformed("version string table offset out of bounds"));
    }

    // Byte index of the current definition record, relative to the section
    // start. Never walks behind 0: `vd_next` is unsigned and the advance is
    // checked addition.
    let mut def = 0usize;
    loop {
        if def.checked_add(VERDEF_LEN).map_or(true, |end| end > sec.size) {
            // Truncated trailing record: the chain has left the section.
            break;
        }
        let rec = sec.offset + def;
        let aux_count = read_u16(image, rec + VD_CNT)? as usize;
        let aux_offset = read_u32(image, rec + VD_AUX)? as usize;
        let next = read_u32(image, rec + VD_NEXT)? as usize;

        let mut aux = rec
            .checked_add(aux_offset)
            .ok_or(ExtractError::Malformed("auxiliary offset overflow"))?;
        for _ in 0..aux_count {
            if aux.checked_add(VERDAUX_LEN).map_or(true, |end| end > image.len()) {
                return Err(ExtractError::Malformed("auxiliary record out of bounds"));
            }
            let name_offset = read_u32(image, aux + VDA_NAME)? as usize;
            let name_at = strings
                .offset
                .checked_add(name_offset)
                .filter(|&at| at < image.len())
                .ok_or(ExtractError::Malformed("version name out of bounds"))?;
            let name = cstr(&image[name_at..]);
            if let Some(suffix) = name.strip_prefix(common::VERSION_PREFIX) {
                let version = PackedVersion::encode(suffix);
                *max = Some(max.map_or(version, |m| m.max(version)));
            }
            let advance = read_u32(image, aux + VDA_NEXT)? as usize;
            aux = aux
                .checked_add(advance)
                .ok_or(ExtractError::Malformed("auxiliary chain overflow"))?;
        }

        if next == 0 {
            break;
        }
        // A next index that leaves the section bounds the walk against
        // cyclic or corrupt chains: stop, keep the partial maximum.
        match def.checked_add(next) {
            Some(n) if n < sec.size => def = n,
            _ => break,
        }
    }
    Ok(())
}

/// Bytes of the NUL-terminated string at the head of `bytes`, bounded by
/// the end of the slice if no terminator is present.
fn cstr(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

fn out_of_bounds() -> ExtractError {
    ExtractError::Malformed("read past end of image")
}

fn read_u16(image: &[u8], offset: usize) -> Result<u16, ExtractError> {
    let end = offset.checked_add(2).ok_or_else(out_of_bounds)?;
    let bytes = image.get(offset..end).ok_or_else(out_of_bounds)?;
    Ok(u16::from_ne_bytes(bytes.try_into().map_err(|_| out_of_bounds())?))
}

fn read_u32(image: &[u8], offset: usize) -> Result<u32, ExtractError> {
    let end = offset.checked_add(4).ok_or_else(out_of_bounds)?;
    let bytes = image.get(offset..end).ok_or_else(out_of_bounds)?;
    Ok(u32::from_ne_bytes(bytes.try_into().map_err(|_| out_of_bounds())?))
}

#[cfg(target_pointer_width = "64")]
fn read_word(image: &[u8], offset: usize) -> Result<u64, ExtractError> {
    let end = offset.checked_add(8).ok_or_else(out_of_bounds)?;
    let bytes = image.get(offset..end).ok_or_else(out_of_bounds)?;
    Ok(u64::from_ne_bytes(bytes.try_into().map_err(|_| out_of_bounds())?))
}

#[cfg(target_pointer_width = "32")]
fn read_word(image: &[u8], offset: usize) -> Result<u64, ExtractError> {
    Ok(u64::from(read_u32(image, offset)?))
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Synthetic shared-object images for exercising the extractor (and its
    //! dependents) without shipping binary fixtures.
    //!
    //! The builder emits a minimal native-class image: a null section, the
    //! section name table, one `.gnu.version_d` section with one auxiliary
    //! record per version name, and the string table those names live in.

    use super::layout;

    /// A built image plus the offsets tests need to corrupt it.
    pub struct SyntheticImage {
        pub bytes: Vec<u8>,
        /// File offset of the version-definition section.
        pub verdef_offset: usize,
        /// Declared size of the version-definition section.
        pub verdef_size: usize,
    }

    /// Byte stride from one definition record to the next (one definition
    /// plus its single auxiliary record).
    pub const DEF_STRIDE: usize = 28;
    /// Offset of `vd_aux` within a definition record.
    pub const VD_AUX_FIELD: usize = 12;
    /// Offset of `vd_next` within a definition record.
    pub const VD_NEXT_FIELD: usize = 16;

    /// Builds an image declaring exactly `version_names`, in order.
    pub fn shared_object(version_names: &[&str]) -> SyntheticImage {
        let shstrtab: &[u8] = b"\0.shstrtab\0.gnu.version_d\0.dynstr\0";
        let (name_shstrtab, name_verdef, name_dynstr) = (1u32, 11u32, 26u32);

        let mut dynstr: Vec<u8> = vec![0];
        let mut name_offsets = Vec::with_capacity(version_names.len());
        for name in version_names {
            name_offsets.push(dynstr.len() as u32);
            dynstr.extend_from_slice(name.as_bytes());
            dynstr.push(0);
        }

        let mut verdef = Vec::new();
        for (index, &name_offset) in name_offsets.iter().enumerate() {
            let last = index + 1 == name_offsets.len();
            let mut record = [0u8; DEF_STRIDE];
            put_u16(&mut record, 0, 1); // vd_version
            put_u16(&mut record, 4, index as u16 + 1); // vd_ndx
            put_u16(&mut record, 6, 1); // vd_cnt
            put_u32(&mut record, 12, 20); // vd_aux
            put_u32(&mut record, 16, if last { 0 } else { DEF_STRIDE as u32 }); // vd_next
            put_u32(&mut record, 20, name_offset); // vda_name
            verdef.extend_from_slice(&record);
        }

        let shstrtab_offset = layout::EHDR_LEN;
        let dynstr_offset = shstrtab_offset + shstrtab.len();
        let verdef_offset = dynstr_offset + dynstr.len();
        let shdr_offset = verdef_offset + verdef.len();
        let total = shdr_offset + 4 * layout::SHDR_LEN;

        let mut bytes = vec![0u8; total];
        bytes[..4].copy_from_slice(&super::ELF_MAGIC);
        bytes[super::EI_CLASS] = layout::NATIVE_CLASS;
        bytes[5] = 1; // EI_DATA
        bytes[6] = 1; // EI_VERSION
        put_word(&mut bytes, layout::E_SHOFF, shdr_offset as u64);
        put_u16(&mut bytes, layout::E_SHNUM, 4);
        put_u16(&mut bytes, layout::E_SHSTRNDX, 1);

        bytes[shstrtab_offset..shstrtab_offset + shstrtab.len()].copy_from_slice(shstrtab);
        bytes[dynstr_offset..dynstr_offset + dynstr.len()].copy_from_slice(&dynstr);
        bytes[verdef_offset..verdef_offset + verdef.len()].copy_from_slice(&verdef);

        // Section 0 stays all-zero (the null section).
        put_section(&mut bytes, shdr_offset, 1, name_shstrtab, shstrtab_offset, shstrtab.len(), 0);
        put_section(&mut bytes, shdr_offset, 2, name_verdef, verdef_offset, verdef.len(), 3);
        put_section(&mut bytes, shdr_offset, 3, name_dynstr, dynstr_offset, dynstr.len(), 0);

        SyntheticImage {
            bytes,
            verdef_offset,
            verdef_size: verdef.len(),
        }
    }

    fn put_section(
        bytes: &mut [u8],
        shdr_offset: usize,
        index: usize,
        name: u32,
        offset: usize,
        size: usize,
        link: u32,
    ) {
        let base = shdr_offset + index * layout::SHDR_LEN;
        put_u32(bytes, base + layout::SH_NAME, name);
        put_word(bytes, base + layout::SH_OFFSET, offset as u64);
        put_word(bytes, base + layout::SH_SIZE, size as u64);
        put_u32(bytes, base + layout::SH_LINK, link);
    }

    pub fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    #[cfg(target_pointer_width = "64")]
    pub fn put_word(bytes: &mut [u8], offset: usize, value: u64) {
        bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    #[cfg(target_pointer_width = "32")]
    pub fn put_word(bytes: &mut [u8], offset: usize, value: u64) {
        put_u32(bytes, offset, value as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{shared_object, put_u16, put_u32, DEF_STRIDE, VD_AUX_FIELD, VD_NEXT_FIELD};
    use super::*;
    use std::fs;

    #[test]
    fn test_max_of_multiple_versions() {
        let image = shared_object(&["GLIBCXX_3.4.9", "GLIBCXX_3.4.21"]);
        let max = scan_image(&image.bytes).unwrap();
        assert_eq!(max, PackedVersion::encode(b"3.4.21"));
    }

    #[test]
    fn test_order_does_not_matter() {
        let image = shared_object(&["GLIBCXX_3.4.21", "GLIBCXX_3.4.9", "GLIBCXX_3.4"]);
        let max = scan_image(&image.bytes).unwrap();
        assert_eq!(max, PackedVersion::from_parts(3, 4, 21));
    }

    #[test]
    fn test_non_matching_names_are_ignored() {
        let image = shared_object(&["CXXABI_1.3", "GLIBCXX_3.4.9", "GCC_4.2.0"]);
        let max = scan_image(&image.bytes).unwrap();
        assert_eq!(max, PackedVersion::from_parts(3, 4, 9));
    }

    #[test]
    fn test_no_matching_names_is_fatal() {
        let image = shared_object(&["CXXABI_1.3", "GCC_4.2.0"]);
        let err = scan_image(&image.bytes).unwrap_err();
        assert!(matches!(err, ExtractError::NoVersionInfo));
    }

    #[test]
    fn test_not_elf() {
        assert!(matches!(scan_image(b"not an elf"), Err(ExtractError::NotElf)));
        assert!(matches!(scan_image(b""), Err(ExtractError::NotElf)));
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let mut image = shared_object(&["GLIBCXX_3.4.9"]);
        image.bytes.truncate(10);
        assert!(matches!(
            scan_image(&image.bytes),
            Err(ExtractError::Malformed(_))
        ));
    }

    #[test]
    fn test_class_mismatch_is_distinct() {
        let mut image = shared_object(&["GLIBCXX_3.4.9"]);
        // Flip to the class this binary was not compiled for.
        image.bytes[EI_CLASS] = if layout::NATIVE_CLASS == 2 { 1 } else { 2 };
        let err = scan_image(&image.bytes).unwrap_err();
        assert!(err.is_class_mismatch());
        assert!(matches!(err, ExtractError::ClassMismatch));
    }

    #[test]
    fn test_section_table_out_of_bounds_is_malformed() {
        let mut image = shared_object(&["GLIBCXX_3.4.9"]);
        put_u16(&mut image.bytes, layout::E_SHNUM, 4000);
        assert!(matches!(
            scan_image(&image.bytes),
            Err(ExtractError::Malformed(_))
        ));
    }

    #[test]
    fn test_shstrndx_out_of_range_is_malformed() {
        let mut image = shared_object(&["GLIBCXX_3.4.9"]);
        put_u16(&mut image.bytes, layout::E_SHSTRNDX, 7);
        assert!(matches!(
            scan_image(&image.bytes),
            Err(ExtractError::Malformed(_))
        ));
    }

    #[test]
    fn test_chain_escaping_section_stops_cleanly() {
        let mut image = shared_object(&["GLIBCXX_3.4.9", "GLIBCXX_3.4.21"]);
        // Point the first record's vd_next far outside the section; the walk
        // must stop there with only the first name folded in.
        put_u32(
            &mut image.bytes,
            image.verdef_offset + VD_NEXT_FIELD,
            0x4000,
        );
        let max = scan_image(&image.bytes).unwrap();
        assert_eq!(max, PackedVersion::encode(b"3.4.9"));
    }

    #[test]
    fn test_backward_next_cannot_loop() {
        let mut image = shared_object(&["GLIBCXX_3.4.9", "GLIBCXX_3.4.21"]);
        // vd_next is unsigned; the closest a corrupt chain can get to
        // "backwards" is an advance past the section end. Both records, then
        // a bogus advance from the second.
        put_u32(
            &mut image.bytes,
            image.verdef_offset + DEF_STRIDE + VD_NEXT_FIELD,
            u32::MAX,
        );
        let max = scan_image(&image.bytes).unwrap();
        assert_eq!(max, PackedVersion::encode(b"3.4.21"));
    }

    #[test]
    fn test_aux_pointer_out_of_bounds_is_malformed() {
        let mut image = shared_object(&["GLIBCXX_3.4.9"]);
        put_u32(
            &mut image.bytes,
            image.verdef_offset + VD_AUX_FIELD,
            0x0100_0000,
        );
        assert!(matches!(
            scan_image(&image.bytes),
            Err(ExtractError::Malformed(_))
        ));
    }

    #[test]
    fn test_extract_from_file() {
        let dir = std::env::temp_dir().join("test_verdef_from_file");
        fs::create_dir_all(&dir).ok();
        let path = dir.join("libstdc++.so.6");

        let image = shared_object(&["GLIBCXX_3.4.9", "GLIBCXX_3.4.30"]);
        fs::write(&path, &image.bytes).unwrap();

        let max = max_glibcxx_version(&path).unwrap();
        assert_eq!(max, PackedVersion::from_parts(3, 4, 30));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = max_glibcxx_version(Path::new("/no/such/libstdc++.so.6")).unwrap_err();
        assert!(matches!(err, ExtractError::Io(_)));
    }
}
