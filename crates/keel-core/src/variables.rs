//! `${name}` reference resolution for property values.

use crate::{Error, Result};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("reference pattern is valid"));

/// Replace every `${name}` in `value` with `lookup(name)`.
///
/// Unknown names and unterminated references fail with
/// [`Error::UnresolvedVariable`]; nothing is ever left verbatim.
/// `property` names the property being resolved and is only used for the
/// error.
pub fn resolve_references<'a, F>(property: &str, value: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut resolved = String::with_capacity(value.len());
    let mut last = 0;

    for caps in REFERENCE.captures_iter(value) {
        let (whole, name) = span(&caps);
        resolved.push_str(&value[last..whole.0]);
        let replacement = lookup(name.trim()).ok_or_else(|| Error::UnresolvedVariable {
            property: property.to_string(),
            variable: name.to_string(),
        })?;
        resolved.push_str(replacement);
        last = whole.1;
    }

    let tail = &value[last..];
    if let Some(start) = tail.find("${") {
        return Err(Error::UnresolvedVariable {
            property: property.to_string(),
            variable: tail[start + 2..].to_string(),
        });
    }
    resolved.push_str(tail);

    Ok(resolved)
}

/// True if `value` contains at least one `${...}` reference.
pub fn has_references(value: &str) -> bool {
    value.contains("${")
}

fn span<'t>(caps: &Captures<'t>) -> ((usize, usize), &'t str) {
    let whole = caps.get(0).map_or((0, 0), |m| (m.start(), m.end()));
    let name = caps.get(1).map_or("", |m| m.as_str());
    (whole, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("HOME", "/home/build"), ("TOOL", "ant")])
    }

    #[test]
    fn test_resolves_known_references() {
        let vars = vars();
        let out = resolve_references("P", "${HOME}/bin/${TOOL}", |n| vars.get(n).copied()).unwrap();
        assert_eq!(out, "/home/build/bin/ant");
    }

    #[test]
    fn test_plain_values_pass_through() {
        let out = resolve_references("P", "no refs $HOME here", |_| None).unwrap();
        assert_eq!(out, "no refs $HOME here");
    }

    #[test]
    fn test_unknown_reference_is_error() {
        let vars = vars();
        let err = resolve_references("PATHX", "${MISSING}/bin", |n| vars.get(n).copied())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedVariable { ref property, ref variable }
                if property == "PATHX" && variable == "MISSING"
        ));
    }

    #[test]
    fn test_unterminated_reference_is_error() {
        let vars = vars();
        assert!(resolve_references("P", "${HOME}/${TOOL", |n| vars.get(n).copied()).is_err());
    }
}
