//! Prometheus name and label sanitisation, ported from the platform's
//! `util.SanitisePrometheusName`/`SanitisePrometheusLabels`.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

static INVALID_CHAR: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-zA-Z0-9_:]").unwrap());
static MULTIPLE_UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new("__+").unwrap());
static BEGINS_WITH_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9]").unwrap());

/// Sanitise a metric or label name: replace invalid characters with `_`,
/// collapse repeated `_`, trim leading/trailing `_`, lowercase, and prefix
/// with `_` if the result starts with a digit.
pub fn sanitise_name(name: &str) -> String {
    let name = INVALID_CHAR.replace_all(name, "_");
    let name = name.trim_matches('_');
    let name = MULTIPLE_UNDERSCORES.replace_all(name, "_");
    let name = name.to_lowercase();

    if BEGINS_WITH_NUMBER.is_match(&name) {
        format!("_{name}")
    } else {
        name
    }
}

/// Sanitise a tag map into Prometheus const labels: drop excluded keys,
/// sanitise the remaining keys, and prefix any key colliding with a
/// reserved label with an extra `_`.
pub fn sanitise_labels(
    labels: &BTreeMap<String, String>,
    reserved: &[&str],
    excluded: &[&str],
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in labels {
        let mut name = sanitise_name(name);

        if excluded.contains(&name.as_str()) {
            continue;
        }

        if reserved.contains(&name.as_str()) {
            name = format!("_{name}");
        }

        out.insert(name, value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_invalid_characters() {
        assert_eq!(sanitise_name("cpu.percent"), "cpu_percent");
    }

    #[test]
    fn collapses_runs_of_underscore() {
        assert_eq!(sanitise_name("a___b"), "a_b");
    }

    #[test]
    fn trims_leading_and_trailing_underscore() {
        assert_eq!(sanitise_name("_cpu_"), "cpu");
    }

    #[test]
    fn lowercases() {
        assert_eq!(sanitise_name("CPU"), "cpu");
    }

    #[test]
    fn prefixes_names_beginning_with_digit() {
        assert_eq!(sanitise_name("1cpu"), "_1cpu");
    }

    #[test]
    fn drops_excluded_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("deployment".to_string(), "cf-abc".to_string());
        labels.insert("unit".to_string(), "percent".to_string());
        let out = sanitise_labels(&labels, &["guid", "service", "space", "organisation"], &[
            "deployment",
            "index",
            "ip",
            "job",
            "origin",
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("unit"), Some(&"percent".to_string()));
    }

    #[test]
    fn prefixes_reserved_label_collisions() {
        let mut labels = BTreeMap::new();
        labels.insert("guid".to_string(), "some-source-guid".to_string());
        let out = sanitise_labels(&labels, &["guid", "service", "space", "organisation"], &[]);
        assert_eq!(out.get("_guid"), Some(&"some-source-guid".to_string()));
    }
}
