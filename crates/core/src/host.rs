/// Derives the storage/domain slug for a clinic name.
///
/// The slug keeps ASCII letters and digits only, lowercased. An empty return
/// value means the name cannot be used to provision a tenant.
pub fn derive_slug(clinic_name: &str) -> String {
    clinic_name
        .trim()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Builds the tenant domain for a slug under the configured suffix.
pub fn tenant_domain(slug: &str, suffix: &str) -> String {
    let suffix = suffix.trim().trim_matches('.').to_ascii_lowercase();
    if suffix.is_empty() {
        slug.to_string()
    } else {
        format!("{slug}.{suffix}")
    }
}

/// Normalises a `Host` header value: lowercase, without port or trailing dot.
///
/// Returns `None` for empty values.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // bracketed IPv6 literal, optionally followed by :port
        rest.split(']').next().unwrap_or(rest)
    } else {
        match raw.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => raw,
        }
    };

    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
