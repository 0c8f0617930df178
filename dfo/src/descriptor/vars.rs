//! `%{NAME}` variable reference validation and expansion.
//!
//! Shell-style `$X` / `${X}` references are never touched here; only the `%{...}` form is
//! recognised, and only a name matching `[A-Za-z_][A-Za-z0-9_]*` is a valid reference.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref VAR_REF: Regex = Regex::new(r"%\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Names referenced by `%{...}` in `s`, in order of first appearance, possibly with duplicates.
pub(crate) fn references(s: &str) -> Vec<String> {
    VAR_REF
        .captures_iter(s)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute every `%{NAME}` in `s` with its value from `vars`. Callers must have already
/// validated that every reference has an entry; any reference that's still missing is left
/// untouched (this only happens if validation was skipped, which is itself a programming error).
pub(crate) fn expand(s: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_REF
        .replace_all(s, |caps: &regex::Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_percent_brace_references_only() {
        let refs = references("echo %{V} $PATH ${OTHER} %{V}");
        assert_eq!(refs, vec!["V".to_string(), "V".to_string()]);
    }

    #[test]
    fn expand_leaves_shell_variables_untouched() {
        let mut vars = BTreeMap::new();
        vars.insert("V".to_string(), "1.2.3".to_string());
        assert_eq!(expand("echo %{V} $PATH", &vars), "echo 1.2.3 $PATH");
    }
}
