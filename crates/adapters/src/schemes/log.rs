//! Log sink addressed as `log://<target>?level=debug|info|warn|error|fatal`.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    switchyard_common::{Envelope, Error, Result},
    tracing::{debug, error, info, warn},
    url::Url,
};

use {super::target, crate::transport::MessageSink};

/// Level a log sink writes at. `Fatal` is written as an error tagged
/// `fatal = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(Error::message(format!("unknown log level: {other}"))),
        }
    }
}

/// `log-out`
#[derive(Debug, Clone)]
pub struct LogSink {
    target: String,
    level: LogLevel,
}

impl LogSink {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn from_uri(uri: &Url) -> Result<Self> {
        let level = uri
            .query_pairs()
            .find(|(key, _)| key == "level")
            .map(|(_, value)| value.parse::<LogLevel>())
            .transpose()
            .map_err(|e| Error::adapter(uri.as_str(), e))?
            .unwrap_or_default();
        Ok(Self::new(target(uri)?, level))
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn render(envelope: &Envelope) -> String {
        match envelope.body().as_text() {
            Some(text) => text.to_string(),
            None => format!("{:?}", envelope.body()),
        }
    }
}

#[async_trait]
impl MessageSink for LogSink {
    fn describe(&self) -> String {
        format!("log://{}", self.target)
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let log_target = self.target.as_str();
        let message_id = envelope.header.message_id();
        let correlation_id = envelope.header.correlation_id.as_deref().unwrap_or_default();
        let payload = Self::render(envelope);
        match self.level {
            LogLevel::Debug => debug!(log_target, message_id, correlation_id, payload = %payload, "envelope"),
            LogLevel::Info => info!(log_target, message_id, correlation_id, payload = %payload, "envelope"),
            LogLevel::Warn => warn!(log_target, message_id, correlation_id, payload = %payload, "envelope"),
            LogLevel::Error => error!(log_target, message_id, correlation_id, payload = %payload, "envelope"),
            LogLevel::Fatal => {
                error!(log_target, message_id, correlation_id, payload = %payload, fatal = true, "envelope")
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("log://audit", LogLevel::Info)]
    #[case("log://audit?level=debug", LogLevel::Debug)]
    #[case("log://audit?level=WARN", LogLevel::Warn)]
    #[case("log://audit?level=fatal", LogLevel::Fatal)]
    fn level_from_query(#[case] uri: &str, #[case] expected: LogLevel) {
        let sink = LogSink::from_uri(&Url::parse(uri).unwrap()).unwrap();
        assert_eq!(sink.level(), expected);
        assert_eq!(sink.target(), "audit");
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!(LogSink::from_uri(&Url::parse("log://audit?level=loud").unwrap()).is_err());
    }

    #[tokio::test]
    async fn delivery_always_succeeds() {
        let sink = LogSink::new("dead-letters", LogLevel::Fatal);
        sink.deliver(&Envelope::new(42u32)).await.unwrap();
        sink.deliver(&Envelope::new("text".to_string())).await.unwrap();
    }
}
