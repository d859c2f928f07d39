//! `${NAME}` and `${NAME:-fallback}` expansion for raw config text.

/// Expand placeholders from the process environment.
///
/// Unknown names without a fallback are kept verbatim so validation can
/// point at them.
pub fn substitute_env(input: &str) -> String {
    expand(input, |name| std::env::var(name).ok())
}

fn expand(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated, copy the tail literally.
            out.push_str(&rest[start..]);
            return out;
        };
        let placeholder = &after[..end];
        let (name, fallback) = match placeholder.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (placeholder, None),
        };
        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "ORDERS_DIR" => Some("/var/spool/orders".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            expand("uri = \"file://${ORDERS_DIR}\"", env),
            "uri = \"file:///var/spool/orders\""
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            expand("${SWITCHYARD_NONEXISTENT_XYZ}", env),
            "${SWITCHYARD_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn fallback_applies_only_when_unset() {
        assert_eq!(expand("${QUEUE:-inbox}", env), "inbox");
        assert_eq!(expand("${ORDERS_DIR:-/tmp}", env), "/var/spool/orders");
        assert_eq!(expand("[${EMPTY:-x}]", env), "[]");
    }

    #[test]
    fn malformed_placeholders_are_literal() {
        assert_eq!(expand("a ${OPEN", env), "a ${OPEN");
        assert_eq!(expand("${} and ${ORDERS_DIR}", env), "${} and /var/spool/orders");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain $ text {}"), "plain $ text {}");
    }
}
