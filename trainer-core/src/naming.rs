//! Kubernetes resource name sanitization.

/// Maximum length of an RFC 1123 DNS label.
pub const DNS_1123_LABEL_MAX_LENGTH: usize = 63;

/// Prefix used when the caller's prefix is not itself a usable label.
const FALLBACK_PREFIX: &str = "job";

/// Lowercase, collapse runs outside `[a-z0-9-]` into one dash, trim dashes.
fn slugify(value: &str) -> String {
    let lowered = value.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut in_invalid_run = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            slug.push(c);
            in_invalid_run = false;
        } else if !in_invalid_run {
            slug.push('-');
            in_invalid_run = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Convert an arbitrary identifier into an RFC 1123 compliant label.
///
/// Runs of characters outside `[a-z0-9-]` collapse into a single dash, leading
/// and trailing dashes are dropped, and `prefix-` is prepended when the result
/// does not start with a letter. The output is truncated to 63 characters.
/// `prefix` goes through the same slugging and falls back to `job` if it
/// does not start with a letter.
/// Never fails: an input that sanitizes to nothing yields the prefix.
pub fn sanitize_k8s_name(value: &str, prefix: &str) -> String {
    let mut prefix = slugify(prefix);
    if !prefix.starts_with(|c: char| c.is_ascii_lowercase()) {
        prefix = FALLBACK_PREFIX.to_string();
    }
    prefix.truncate(DNS_1123_LABEL_MAX_LENGTH);
    let prefix = prefix.trim_end_matches('-').to_string();

    let mut slug = slugify(value);
    if slug.is_empty() {
        slug = prefix.clone();
    }
    if !slug.starts_with(|c: char| c.is_ascii_lowercase()) {
        slug = format!("{prefix}-{slug}");
    }
    // Only ASCII remains, so byte truncation is on a char boundary.
    if slug.len() > DNS_1123_LABEL_MAX_LENGTH {
        slug.truncate(DNS_1123_LABEL_MAX_LENGTH);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        slug = prefix;
    }
    slug
}

/// [`sanitize_k8s_name`] with the default `job` prefix.
pub fn sanitize_job_name(value: &str) -> String {
    sanitize_k8s_name(value, "job")
}
