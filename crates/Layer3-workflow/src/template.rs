//! Prompt templates
//!
//! `{{name}}` is replaced by the workflow variable `name`; `{{id.output}}` by
//! an `@<path>` reference to agent `id`'s output file, which the agent CLIs
//! read themselves. Placeholders without a value stay as written.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const OUTPUT_SUFFIX: &str = ".output";

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Names referenced by `template`, first occurrence order, no duplicates
pub fn extract_variables(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// The `@` reference agents use to read a file
pub fn output_reference(path: &Path) -> String {
    format!("@{}", path.display())
}

/// Substitute variables and handoff references
pub fn resolve(
    template: &str,
    variables: &HashMap<String, String>,
    outputs: &HashMap<String, PathBuf>,
) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            if let Some(value) = variables.get(name) {
                return value.clone();
            }
            if let Some(path) = name
                .strip_suffix(OUTPUT_SUFFIX)
                .and_then(|agent| outputs.get(agent))
            {
                return output_reference(path);
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Substitute variables only
pub fn resolve_variables(template: &str, variables: &HashMap<String, String>) -> String {
    resolve(template, variables, &HashMap::new())
}

/// Whether a resolved condition lets its agent run. Leftover
/// placeholders count as false.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty()
        || placeholder().is_match(value)
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("off")
        || value == "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_variable() {
        let resolved = resolve_variables("Hello {{name}}", &vars(&[("name", "Bob")]));
        assert_eq!(resolved, "Hello Bob");
    }

    #[test]
    fn test_unresolved_placeholder_stays() {
        let resolved = resolve_variables("Hello {{ who }} and {{name}}", &vars(&[("name", "Bob")]));
        assert_eq!(resolved, "Hello {{ who }} and Bob");
    }

    #[test]
    fn test_handoff_reference() {
        let outputs = HashMap::from([("agent1".to_string(), PathBuf::from("/tmp/run/plan.md"))]);
        let resolved = resolve("Use {{agent1.output}} and {{agent2.output}}", &HashMap::new(), &outputs);
        assert_eq!(resolved, "Use @/tmp/run/plan.md and {{agent2.output}}");
    }

    #[test]
    fn test_extract_variables_dedupes() {
        let names = extract_variables("{{a}} {{ b }} {{a}} {{x.output}} {not}");
        assert_eq!(names, vec!["a", "b", "x.output"]);
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy("yes"));
        assert!(is_truthy("1"));
        assert!(!is_truthy(" False "));
        assert!(!is_truthy(""));
        assert!(!is_truthy("{{unset}}"));
    }
}
