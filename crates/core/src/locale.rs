/// Locale hints carried by a single request, in priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocaleCandidates<'a> {
    /// Explicit `culture` request parameter.
    pub requested: Option<&'a str>,
    /// Locale persisted in the client cookie.
    pub cookie: Option<&'a str>,
    /// Raw `Accept-Language` header.
    pub accept_language: Option<&'a str>,
}

/// Picks the locale for a request.
///
/// Candidates are tried in order (requested, cookie, then `Accept-Language`
/// entries sorted by quality). The first candidate whose primary subtag is in
/// `supported` wins. Without a match, `default` is used when supported, else
/// the first supported locale. With an empty `supported` list the default is
/// returned as-is.
pub fn negotiate_locale(
    candidates: LocaleCandidates<'_>,
    supported: &[String],
    default: &str,
) -> String {
    if supported.is_empty() {
        return default.to_string();
    }

    let explicit = [candidates.requested, candidates.cookie];
    let from_header = candidates
        .accept_language
        .map(parse_accept_language)
        .unwrap_or_default();

    explicit
        .into_iter()
        .flatten()
        .map(str::to_string)
        .chain(from_header)
        .find_map(|candidate| match_supported(&candidate, supported))
        .or_else(|| match_supported(default, supported))
        .unwrap_or_else(|| supported[0].clone())
}

fn match_supported(candidate: &str, supported: &[String]) -> Option<String> {
    let primary = primary_subtag(candidate)?;
    supported
        .iter()
        .find(|locale| primary_subtag(locale).as_deref() == Some(primary.as_str()))
        .cloned()
}

fn primary_subtag(value: &str) -> Option<String> {
    let primary = value
        .trim()
        .split(['-', '_'])
        .next()?
        .to_ascii_lowercase();
    if primary.is_empty() || primary == "*" || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        None
    } else {
        Some(primary)
    }
}

fn parse_accept_language(header: &str) -> Vec<String> {
    let mut weighted: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let tag = parts.next()?.trim();
            if tag.is_empty() {
                return None;
            }
            let quality = parts
                .find_map(|param| param.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then(|| (tag.to_string(), quality))
        })
        .collect();

    // stable sort keeps header order for equal weights
    weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    weighted.into_iter().map(|(tag, _)| tag).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn explicit_request_wins_over_cookie_and_header() {
        let locale = negotiate_locale(
            LocaleCandidates {
                requested: Some("ar"),
                cookie: Some("fr"),
                accept_language: Some("en-US,en;q=0.9"),
            },
            &supported(&["en", "ar", "fr"]),
            "en",
        );
        assert_eq!(locale, "ar");
    }

    #[test]
    fn unsupported_candidates_are_skipped() {
        let locale = negotiate_locale(
            LocaleCandidates {
                requested: Some("de"),
                cookie: None,
                accept_language: Some("ja, fr-CA;q=0.8, en;q=0.5"),
            },
            &supported(&["en", "fr"]),
            "en",
        );
        assert_eq!(locale, "fr");
    }

    #[test]
    fn header_quality_is_respected() {
        let locale = negotiate_locale(
            LocaleCandidates {
                accept_language: Some("en;q=0.2, ar;q=0.9"),
                ..LocaleCandidates::default()
            },
            &supported(&["en", "ar"]),
            "en",
        );
        assert_eq!(locale, "ar");
    }

    #[test]
    fn falls_back_to_default_then_first_supported() {
        let none = LocaleCandidates::default();
        assert_eq!(negotiate_locale(none, &supported(&["ar", "en"]), "en"), "en");
        assert_eq!(negotiate_locale(none, &supported(&["ar", "fr"]), "en"), "ar");
        assert_eq!(negotiate_locale(none, &[], "en"), "en");
    }

    #[test]
    fn zero_quality_and_wildcards_are_ignored() {
        let locale = negotiate_locale(
            LocaleCandidates {
                accept_language: Some("fr;q=0, *"),
                ..LocaleCandidates::default()
            },
            &supported(&["en", "fr"]),
            "en",
        );
        assert_eq!(locale, "en");
    }
}
