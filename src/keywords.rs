//! Keyword normalization and advisory validation of generated metadata.
//!
//! Pure and deterministic, no I/O. Normalization is idempotent:
//! `normalize(normalize(k)) == normalize(k)`.

use crate::client::ImageMetadata;
use crate::config::ValidationRules;

/// Lowercase, trim, drop empties, and dedupe keywords preserving
/// first-seen order.
pub fn normalize(raw: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(raw.len());

    for keyword in raw {
        let cleaned = keyword.trim().to_lowercase();
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.clone()) {
            out.push(cleaned);
        }
    }

    out
}

/// Enforce the closed keyword count range.
pub fn validate_count(keywords: &[String], rules: &ValidationRules) -> Result<(), String> {
    let count = keywords.len();
    if count < rules.keywords_min {
        return Err(format!(
            "too few keywords: {} (minimum {})",
            count, rules.keywords_min
        ));
    }
    if count > rules.keywords_max {
        return Err(format!(
            "too many keywords: {} (maximum {})",
            count, rules.keywords_max
        ));
    }
    Ok(())
}

/// Check a normalized metadata triple against the rule set. Returns the
/// list of issues; violations are advisory and never reject the row.
pub fn advisory_issues(metadata: &ImageMetadata, rules: &ValidationRules) -> Vec<String> {
    let mut issues = Vec::new();

    let title_len = metadata.title.chars().count();
    if title_len < rules.title_min || title_len > rules.title_max {
        issues.push(format!(
            "title length {} outside {}-{}",
            title_len, rules.title_min, rules.title_max
        ));
    }

    let description_len = metadata.description.chars().count();
    if description_len < rules.description_min || description_len > rules.description_max {
        issues.push(format!(
            "description length {} outside {}-{}",
            description_len, rules.description_min, rules.description_max
        ));
    }

    if let Err(reason) = validate_count(&metadata.keywords, rules) {
        issues.push(reason);
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_normalize_lowercases_and_trims() {
        let keywords = raw(&["  Sunset ", "MOUNTAIN", "lake"]);
        assert_eq!(normalize(&keywords), raw(&["sunset", "mountain", "lake"]));
    }

    #[test]
    fn test_normalize_dedupes_case_insensitive_first_seen() {
        let keywords = raw(&["Sky", "sky", " SKY ", "cloud", "sky"]);
        assert_eq!(normalize(&keywords), raw(&["sky", "cloud"]));
    }

    #[test]
    fn test_normalize_drops_empty_entries() {
        let keywords = raw(&["", "   ", "tree"]);
        assert_eq!(normalize(&keywords), raw(&["tree"]));
    }

    #[test]
    fn test_normalize_idempotent() {
        let keywords = raw(&["  Alpha ", "beta", "ALPHA", "", "gamma"]);
        let once = normalize(&keywords);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_validate_count_range() {
        let rules = ValidationRules::default();
        let few: Vec<String> = (0..10).map(|i| format!("kw{}", i)).collect();
        assert!(validate_count(&few, &rules).is_err());

        let ok: Vec<String> = (0..30).map(|i| format!("kw{}", i)).collect();
        assert!(validate_count(&ok, &rules).is_ok());

        let many: Vec<String> = (0..60).map(|i| format!("kw{}", i)).collect();
        assert!(validate_count(&many, &rules).is_err());
    }

    #[test]
    fn test_advisory_issues_flag_short_title() {
        let rules = ValidationRules::default();
        let metadata = ImageMetadata {
            title: "Short".to_string(),
            description: "d".repeat(150),
            keywords: (0..30).map(|i| format!("kw{}", i)).collect(),
        };
        let issues = advisory_issues(&metadata, &rules);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("title"));
    }

    #[test]
    fn test_advisory_issues_clean_triple() {
        let rules = ValidationRules::default();
        let metadata = ImageMetadata {
            title: "Sunset Over Mountain Lake".to_string(),
            description: "d".repeat(150),
            keywords: (0..30).map(|i| format!("kw{}", i)).collect(),
        };
        assert!(advisory_issues(&metadata, &rules).is_empty());
    }
}
