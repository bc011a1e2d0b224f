//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}`: required, error if unset
//! - `${VAR:-default}`: default when unset or empty
//! - `${VAR-default}`: default only when unset
//! - `$$`: literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<default>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Interpolated text plus every problem found along the way.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate against the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate against an arbitrary variable source.
///
/// Errors are accumulated so a config with several missing variables reports
/// all of them at once.
pub fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if caps.name("escape").is_some() {
                return "$".to_string();
            }

            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return whole.to_string();
            };
            let name = name.as_str();
            let op = caps.name("op").map(|m| m.as_str());
            let default = caps.name("default").map(|m| m.as_str());

            match lookup(name) {
                Some(value) if value.contains(['\n', '\r']) => {
                    errors.push(format!(
                        "environment variable '{name}' contains newlines, which is not allowed"
                    ));
                    whole.to_string()
                }
                Some(value) if value.is_empty() && op == Some(":-") => {
                    default.unwrap_or_default().to_string()
                }
                Some(value) => value,
                None => match default {
                    Some(default) => default.to_string(),
                    None => {
                        errors.push(format!("environment variable '{name}' is not set"));
                        whole.to_string()
                    }
                },
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(input: &str, vars: &[(&str, &str)]) -> InterpolationResult {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        interpolate_with(input, |name| vars.get(name).cloned())
    }

    #[test]
    fn test_bare_and_braced() {
        let result = run("url: $BUCKET/${PREFIX}", &[("BUCKET", "gs://b"), ("PREFIX", "raw")]);
        assert!(result.is_ok());
        assert_eq!(result.text, "url: gs://b/raw");
    }

    #[test]
    fn test_colon_default_covers_empty() {
        let result = run("tz: ${TZ_NAME:-UTC}", &[("TZ_NAME", "")]);
        assert_eq!(result.text, "tz: UTC");
    }

    #[test]
    fn test_dash_default_keeps_empty() {
        let result = run("tz: '${TZ_NAME-UTC}'", &[("TZ_NAME", "")]);
        assert_eq!(result.text, "tz: ''");

        let unset = run("tz: ${TZ_NAME-UTC}", &[]);
        assert_eq!(unset.text, "tz: UTC");
    }

    #[test]
    fn test_escape() {
        let result = run("cost: $$5", &[]);
        assert!(result.is_ok());
        assert_eq!(result.text, "cost: $5");
    }

    #[test]
    fn test_missing_variables_all_reported() {
        let result = run("a: $ONE\nb: ${TWO}", &[]);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("ONE"));
        assert!(result.errors[1].contains("TWO"));
        assert_eq!(result.text, "a: $ONE\nb: ${TWO}");
    }

    #[test]
    fn test_newline_injection_rejected() {
        let result = run("key: $SECRET", &[("SECRET", "a\nb: c")]);
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("newlines"));
    }
}
