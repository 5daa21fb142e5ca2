//! Search-path expansion with an injected existence probe.

/// Substitution token meaning "directory containing the running
/// executable". Matched only as a literal prefix of a segment.
pub const ORIGIN_TOKEN: &str = "$ORIGIN";

/// Expands `search_path` (a colon-separated directory list, as found in
/// `DT_RUNPATH`/`DT_RPATH`) into candidate libstdc++.so.6 paths and probes
/// each in order.
///
/// Per non-empty segment: a leading [`ORIGIN_TOKEN`] is replaced with
/// `origin`, the rest of the segment is kept, and
/// [`common::TARGET_REL_PATH`] is appended. Empty segments (consecutive or
/// trailing colons) are skipped, not treated as the current directory.
///
/// One buffer is reused across segments, cleared but never shrunk, so a
/// long list costs at most a handful of allocations. The first segment for
/// which `probe` returns `true` wins and the buffer moves to the caller;
/// exhausting the list drops it.
///
/// The probe is injected so production code can open (and keep) the file it
/// tests for, and so the expansion order is observable in tests without
/// touching a filesystem.
pub fn resolve_candidate<F>(search_path: &str, origin: &str, mut probe: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    let mut candidate = String::new();
    for segment in search_path.split(':') {
        if segment.is_empty() {
            continue;
        }
        candidate.clear();
        match segment.strip_prefix(ORIGIN_TOKEN) {
            Some(rest) => {
                candidate.push_str(origin);
                candidate.push_str(rest);
            }
            None => candidate.push_str(segment),
        }
        candidate.push_str(common::TARGET_REL_PATH);

        common::trace!("probing {candidate}");
        if probe(&candidate) {
            return Some(candidate);
        }
    }
    None
}
