//! Configuration validation engine.
//!
//! Validates TOML configuration files against the known schema, detects
//! unknown/misspelled fields, and checks adapter addressing, polling and
//! scheduler settings.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use url::Url;

use crate::schema::{AdapterConfig, AdapterDirection, BusConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "uri", "channel",
    /// "polling", "retry", "scheduler", "activator", "telemetry"
    pub category: &'static str,
    /// Dotted path, e.g. "adapters[0].uri"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn error(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} [{}]: {}", self.severity, self.category, self.message)
        } else {
            write!(f, "{} [{}] {}: {}", self.severity, self.category, self.path, self.message)
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Represents the expected shape of the configuration schema.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// A map with dynamic keys whose values have a known shape.
    Map(Box<KnownKeys>),
    /// An array of typed items.
    Array(Box<KnownKeys>),
    /// Scalar value, stop recursion.
    Leaf,
}

/// Schemes the built-in adapter factories handle, with the directions each
/// supports.
const BUILTIN_SCHEMES: &[(&str, &[AdapterDirection])] = &[
    ("memory", &[AdapterDirection::In, AdapterDirection::Out]),
    ("file", &[AdapterDirection::In, AdapterDirection::Out]),
    ("log", &[AdapterDirection::Out]),
    ("channel", &[AdapterDirection::Out]),
];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Build the full schema map mirroring every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    let telemetry = Struct(HashMap::from([
        ("level", Leaf),
        ("json", Leaf),
        (
            "metrics",
            Struct(HashMap::from([("enabled", Leaf), ("labels", Map(Box::new(Leaf)))])),
        ),
    ]));

    let adapter = Struct(HashMap::from([
        ("name", Leaf),
        ("uri", Leaf),
        ("direction", Leaf),
        ("channel", Leaf),
        (
            "polling",
            Struct(HashMap::from([
                ("interval_secs", Leaf),
                ("concurrency", Leaf),
                ("frequency_secs", Leaf),
            ])),
        ),
        (
            "retry",
            Struct(HashMap::from([
                ("max_retries", Leaf),
                ("wait_interval_secs", Leaf),
                ("failure_delivery_address", Leaf),
            ])),
        ),
        ("pipeline", Leaf),
    ]));

    let activator = Struct(HashMap::from([
        ("input_channel", Leaf),
        ("endpoint", Leaf),
        ("method", Leaf),
        ("output_channel", Leaf),
        ("style", Leaf),
    ]));

    let scheduler = Struct(HashMap::from([
        ("enabled", Leaf),
        ("initial_delay_ms", Leaf),
        (
            "items",
            Array(Box::new(Struct(HashMap::from([
                ("name", Leaf),
                ("endpoint", Leaf),
                ("method", Leaf),
                ("frequency_secs", Leaf),
                ("output_channel", Leaf),
            ])))),
        ),
    ]));

    Struct(HashMap::from([
        ("telemetry", telemetry),
        ("channels", Leaf),
        ("adapters", Array(Box::new(adapter))),
        ("activators", Array(Box::new(activator))),
        ("scheduler", scheduler),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Find the best match for `needle` among `candidates` using Levenshtein
/// distance. Returns `Some(best)` if the distance is <= `max_distance`.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|ext| ext == "toml");

    let mut result = match std::fs::read_to_string(actual_path) {
        Ok(content) if is_toml => validate_toml_str(&crate::env_subst::substitute_env(&content)),
        Ok(content) => {
            let raw = crate::env_subst::substitute_env(&content);
            match crate::loader::parse_config(&raw, actual_path) {
                Ok(config) => ValidationResult {
                    diagnostics: check_config(&config),
                    config_path: None,
                },
                Err(e) => ValidationResult {
                    diagnostics: vec![Diagnostic::error("syntax", "", format!("parse error: {e}"))],
                    config_path: None,
                },
            }
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::error(
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path.clone());
    result
}

/// Validate a TOML string without file-system side effects.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::error("syntax", "", format!("TOML syntax error: {e}")));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown fields
    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    // 3. Type check, then semantic checks on the parsed config
    match toml::from_str::<BusConfig>(toml_str) {
        Ok(config) => diagnostics.extend(check_config(&config)),
        Err(e) => diagnostics.push(Diagnostic::error("type-error", "", format!("type error: {e}"))),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Walk the TOML value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = join(key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let level = if prefix.is_empty() {
                        "at top level "
                    } else {
                        ""
                    };
                    let msg = match suggest(key, &known_keys, 3) {
                        Some(s) => format!("unknown field {level}(did you mean \"{s}\"?)"),
                        None => format!("unknown field {level}"),
                    };
                    diagnostics.push(Diagnostic::error("unknown-field", path, msg.trim()));
                }
            }
        },
        (toml::Value::Table(table), KnownKeys::Map(value_schema)) => {
            for (key, child_value) in table {
                check_unknown_fields(child_value, value_schema, &join(key), diagnostics);
            }
        },
        (toml::Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                check_unknown_fields(item, item_schema, &path, diagnostics);
            }
        },
        // Leaf or type mismatch, type errors are caught later
        _ => {},
    }
}

/// Semantic checks on a parsed configuration. Also run by the bus before it
/// builds anything from `config`.
#[must_use]
pub fn check_config(config: &BusConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let level = config.telemetry.level.trim();
    let bare_level = !level.contains(['=', ',']);
    if bare_level && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        let hint = suggest(&level.to_ascii_lowercase(), LOG_LEVELS, 2)
            .map(|s| format!(" (did you mean \"{s}\"?)"))
            .unwrap_or_default();
        diagnostics.push(Diagnostic::warning(
            "telemetry",
            "telemetry.level",
            format!("unrecognised log level \"{level}\"{hint}"),
        ));
    }

    for (i, channel) in config.channels.iter().enumerate() {
        if channel.trim().is_empty() {
            diagnostics.push(Diagnostic::error("channel", format!("channels[{i}]"), "channel name is empty"));
        }
    }

    let mut names = HashSet::new();
    for (i, adapter) in config.adapters.iter().enumerate() {
        let path = format!("adapters[{i}]");
        if adapter.name.trim().is_empty() {
            diagnostics.push(Diagnostic::error("uri", format!("{path}.name"), "adapter name is empty"));
        } else if !names.insert(adapter.name.to_ascii_lowercase()) {
            diagnostics.push(Diagnostic::error(
                "uri",
                format!("{path}.name"),
                format!("duplicate adapter name \"{}\"", adapter.name),
            ));
        }
        check_adapter(adapter, &path, &mut diagnostics);
    }

    for (i, activator) in config.activators.iter().enumerate() {
        let path = format!("activators[{i}]");
        if activator.input_channel.trim().is_empty() {
            diagnostics.push(Diagnostic::error(
                "activator",
                format!("{path}.input_channel"),
                "input channel is empty",
            ));
        }
        if activator.endpoint.trim().is_empty() {
            diagnostics.push(Diagnostic::error("activator", format!("{path}.endpoint"), "endpoint key is empty"));
        }
    }

    for (i, item) in config.scheduler.items.iter().enumerate() {
        let path = format!("scheduler.items[{i}]");
        if item.endpoint.trim().is_empty() || item.method.trim().is_empty() {
            diagnostics.push(Diagnostic::error(
                "scheduler",
                path.clone(),
                "scheduled item needs an endpoint and a method",
            ));
        }
        if item.frequency_secs == 0 {
            diagnostics.push(Diagnostic::error(
                "scheduler",
                format!("{path}.frequency_secs"),
                "frequency must be greater than zero",
            ));
        }
    }

    diagnostics
}

fn check_adapter(adapter: &AdapterConfig, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    match Url::parse(&adapter.uri) {
        Ok(uri) => check_scheme(&uri, adapter.direction, &format!("{path}.uri"), diagnostics),
        Err(e) => diagnostics.push(Diagnostic::error(
            "uri",
            format!("{path}.uri"),
            format!("invalid uri \"{}\": {e}", adapter.uri),
        )),
    }

    match adapter.channel.as_deref().map(str::trim) {
        Some("") => diagnostics.push(Diagnostic::error("channel", format!("{path}.channel"), "channel name is empty")),
        None if adapter.direction == AdapterDirection::In => diagnostics.push(Diagnostic::error(
            "channel",
            format!("{path}.channel"),
            "input adapters need a channel to publish to",
        )),
        None => diagnostics.push(Diagnostic::warning(
            "channel",
            format!("{path}.channel"),
            "output adapter has no channel and only delivers explicit sends",
        )),
        Some(_) => {},
    }

    let polling = &adapter.polling;
    let zero = |field: &str, value: Option<u64>, diagnostics: &mut Vec<Diagnostic>| {
        if value == Some(0) {
            diagnostics.push(Diagnostic::error(
                "polling",
                format!("{path}.polling.{field}"),
                "must be greater than zero",
            ));
        }
    };
    zero("interval_secs", polling.interval_secs, diagnostics);
    zero("frequency_secs", polling.frequency_secs, diagnostics);
    zero("concurrency", polling.concurrency.map(|c| c as u64), diagnostics);
    if polling.interval_secs.is_some() && polling.is_concurrent() {
        diagnostics.push(Diagnostic::warning(
            "polling",
            format!("{path}.polling"),
            "interval_secs is ignored when concurrency is set",
        ));
    }

    if let Some(address) = &adapter.retry.failure_delivery_address {
        let retry_path = format!("{path}.retry.failure_delivery_address");
        if adapter.direction == AdapterDirection::In {
            diagnostics.push(Diagnostic::warning(
                "retry",
                retry_path.clone(),
                "input adapters never forward failures",
            ));
        }
        match Url::parse(address) {
            Ok(uri) => check_scheme(&uri, AdapterDirection::Out, &retry_path, diagnostics),
            Err(e) => diagnostics.push(Diagnostic::error(
                "retry",
                retry_path,
                format!("invalid failure delivery address \"{address}\": {e}"),
            )),
        }
    }
}

fn check_scheme(uri: &Url, direction: AdapterDirection, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let scheme = uri.scheme();
    let Some((_, directions)) = BUILTIN_SCHEMES.iter().find(|(name, _)| *name == scheme) else {
        let known: Vec<&str> = BUILTIN_SCHEMES.iter().map(|(name, _)| *name).collect();
        let hint = suggest(scheme, &known, 2)
            .map(|s| format!(" (did you mean \"{s}\"?)"))
            .unwrap_or_else(|| " (custom factories are valid, but check for typos)".into());
        diagnostics.push(Diagnostic::warning("uri", path, format!("unknown scheme \"{scheme}\"{hint}")));
        return;
    };
    if !directions.contains(&direction) {
        diagnostics.push(Diagnostic::error(
            "uri",
            path,
            format!("scheme \"{scheme}\" cannot be used for {direction:?} adapters").to_lowercase(),
        ));
    }
    let host = uri.host_str().unwrap_or_default();
    if host.is_empty() && uri.path().trim_matches('/').is_empty() {
        diagnostics.push(Diagnostic::error(
            "uri",
            path,
            format!("\"{uri}\" does not name a target"),
        ));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn find<'a>(result: &'a ValidationResult, category: &str, path: &str) -> Option<&'a Diagnostic> {
        result
            .diagnostics
            .iter()
            .find(|d| d.category == category && d.path == path)
    }

    #[test]
    fn levenshtein_edits() {
        assert_eq!(levenshtein("adapters", "adapters"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("adapter", "adapters"), 1);
        assert_eq!(levenshtein("memroy", "memory"), 2);
    }

    #[test]
    fn valid_config_has_no_errors() {
        let result = validate_toml_str(
            r#"
channels = ["orders"]

[telemetry]
level = "debug"

[[adapters]]
name = "orders-in"
uri = "memory://orders"
channel = "orders"

[[adapters]]
name = "orders-out"
uri = "file:///tmp/out"
direction = "out"
channel = "echoed"
retry = { max_retries = 3, failure_delivery_address = "log://dead-letters?level=error" }

[[scheduler.items]]
endpoint = "clock"
method = "tick"
frequency_secs = 10
"#,
        );
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0, "{:?}", result.diagnostics);
    }

    #[test]
    fn unknown_top_level_key_with_suggestion() {
        let result = validate_toml_str("adapter = []\n");
        let d = find(&result, "unknown-field", "adapter").unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert!(d.message.contains("adapters"), "{}", d.message);
    }

    #[test]
    fn unknown_field_inside_adapter_entry() {
        let result = validate_toml_str(
            "[[adapters]]\nname = \"a\"\nuri = \"memory://q\"\nchanel = \"q\"\n",
        );
        let d = find(&result, "unknown-field", "adapters[0].chanel").unwrap();
        assert!(d.message.contains("channel"));
    }

    #[test]
    fn syntax_and_type_errors() {
        assert!(find(&validate_toml_str("channels = ["), "syntax", "").is_some());
        assert!(find(&validate_toml_str("channels = 5"), "type-error", "").is_some());
    }

    #[test]
    fn adapter_addressing_problems() {
        let result = validate_toml_str(
            r#"
[[adapters]]
name = "a"
uri = "log://audit"
channel = "x"

[[adapters]]
name = "A"
uri = "not a uri"
direction = "out"
channel = "x"

[[adapters]]
name = "c"
uri = "memroy://q"
channel = "x"

[[adapters]]
name = "d"
uri = "memory://"
channel = " "
"#,
        );
        assert!(find(&result, "uri", "adapters[0].uri").unwrap().message.contains("cannot be used for in"));
        assert!(find(&result, "uri", "adapters[1].name").unwrap().message.contains("duplicate"));
        assert_eq!(find(&result, "uri", "adapters[1].uri").unwrap().severity, Severity::Error);
        let unknown = find(&result, "uri", "adapters[2].uri").unwrap();
        assert_eq!(unknown.severity, Severity::Warning);
        assert!(unknown.message.contains("memory"));
        assert!(find(&result, "uri", "adapters[3].uri").unwrap().message.contains("target"));
        assert!(find(&result, "channel", "adapters[3].channel").is_some());
    }

    #[test]
    fn input_adapter_needs_channel() {
        let result = validate_toml_str("[[adapters]]\nname = \"a\"\nuri = \"file:///in\"\n");
        assert_eq!(find(&result, "channel", "adapters[0].channel").unwrap().severity, Severity::Error);
    }

    #[test]
    fn polling_and_retry_problems() {
        let result = validate_toml_str(
            r#"
[[adapters]]
name = "a"
uri = "memory://q"
direction = "out"
channel = "q"
polling = { interval_secs = 0, concurrency = 2, frequency_secs = 1 }
retry = { max_retries = 2, failure_delivery_address = "::" }
"#,
        );
        assert!(find(&result, "polling", "adapters[0].polling.interval_secs").is_some());
        assert_eq!(find(&result, "polling", "adapters[0].polling").unwrap().severity, Severity::Warning);
        assert_eq!(
            find(&result, "retry", "adapters[0].retry.failure_delivery_address").unwrap().severity,
            Severity::Error
        );
    }

    #[test]
    fn scheduler_and_activator_problems() {
        let result = validate_toml_str(
            r#"
[[activators]]
input_channel = ""
endpoint = "echo"

[[scheduler.items]]
endpoint = "clock"
method = ""
frequency_secs = 0
"#,
        );
        assert!(find(&result, "activator", "activators[0].input_channel").is_some());
        assert!(find(&result, "scheduler", "scheduler.items[0]").is_some());
        assert!(find(&result, "scheduler", "scheduler.items[0].frequency_secs").is_some());
    }

    #[test]
    fn odd_log_level_warns_but_directives_pass() {
        let mut config = BusConfig::default();
        config.telemetry.level = "inf".into();
        let diagnostics = check_config(&config);
        assert!(diagnostics[0].message.contains("info"));

        config.telemetry.level = "switchyard=debug,info".into();
        assert!(check_config(&config).is_empty());
    }

    #[test]
    fn validates_yaml_files_through_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.yaml");
        std::fs::write(&path, "adapters:\n  - name: a\n    uri: \"memory://q\"\n").unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(result.has_errors());
        assert!(find(&result, "channel", "adapters[0].channel").is_some());
    }
}
