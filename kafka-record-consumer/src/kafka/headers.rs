//! Header propagation from broker records onto exchanges.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::ConfigError;

/// Headers under this prefix carry consumer metadata and are not propagated
pub const DEFAULT_HEADER_FILTER_PATTERN: &str = r"(?i)^kafka\.";

/// A propagated header value after deserialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bytes(Vec<u8>),
    Text(String),
}

impl HeaderValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HeaderValue::Bytes(bytes) => bytes,
            HeaderValue::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            HeaderValue::Text(text) => Some(text),
        }
    }
}

/// Decides which broker headers are copied onto the exchange
pub trait HeaderFilterStrategy: Send + Sync {
    /// True means the header is dropped
    fn should_filter(&self, name: &str, value: &[u8]) -> bool;
}

pub struct RegexHeaderFilterStrategy {
    pattern: Regex,
}

impl RegexHeaderFilterStrategy {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Filter on [`DEFAULT_HEADER_FILTER_PATTERN`]
    pub fn kafka_metadata() -> Result<Self, ConfigError> {
        Self::new(DEFAULT_HEADER_FILTER_PATTERN)
    }
}

impl HeaderFilterStrategy for RegexHeaderFilterStrategy {
    fn should_filter(&self, name: &str, _value: &[u8]) -> bool {
        self.pattern.is_match(name)
    }
}

/// Propagates every header
pub struct NoopHeaderFilterStrategy;

impl HeaderFilterStrategy for NoopHeaderFilterStrategy {
    fn should_filter(&self, _name: &str, _value: &[u8]) -> bool {
        false
    }
}

/// Turns the raw bytes of a propagated header into its exchange value
pub trait HeaderDeserializer: Send + Sync {
    fn deserialize(&self, name: &str, value: &[u8]) -> HeaderValue;
}

pub struct RawHeaderDeserializer;

impl HeaderDeserializer for RawHeaderDeserializer {
    fn deserialize(&self, _name: &str, value: &[u8]) -> HeaderValue {
        HeaderValue::Bytes(value.to_vec())
    }
}

/// Decodes UTF-8 text, keeping anything else as bytes
pub struct Utf8HeaderDeserializer;

impl HeaderDeserializer for Utf8HeaderDeserializer {
    fn deserialize(&self, _name: &str, value: &[u8]) -> HeaderValue {
        match std::str::from_utf8(value) {
            Ok(text) => HeaderValue::Text(text.to_owned()),
            Err(_) => HeaderValue::Bytes(value.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderDeserializerKind {
    #[default]
    Raw,
    Utf8,
}

impl HeaderDeserializerKind {
    pub fn build(self) -> Box<dyn HeaderDeserializer> {
        match self {
            HeaderDeserializerKind::Raw => Box::new(RawHeaderDeserializer),
            HeaderDeserializerKind::Utf8 => Box::new(Utf8HeaderDeserializer),
        }
    }
}

impl FromStr for HeaderDeserializerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "bytes" => Ok(HeaderDeserializerKind::Raw),
            "utf8" | "utf-8" | "string" => Ok(HeaderDeserializerKind::Utf8),
            _ => Err(ConfigError::unsupported("header deserializer", s)),
        }
    }
}

impl fmt::Display for HeaderDeserializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderDeserializerKind::Raw => write!(f, "raw"),
            HeaderDeserializerKind::Utf8 => write!(f, "utf8"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("kafka.TOPIC", true; "metadata prefix")]
    #[test_case("KAFKA.OFFSET", true; "case insensitive")]
    #[test_case("trace-id", false; "user header")]
    #[test_case("my.kafka.header", false; "prefix only")]
    fn test_default_filter(name: &str, filtered: bool) {
        let filter = RegexHeaderFilterStrategy::kafka_metadata().unwrap();
        assert_eq!(filter.should_filter(name, b""), filtered);
    }

    #[test]
    fn test_custom_filter_pattern() {
        let filter = RegexHeaderFilterStrategy::new("^internal-").unwrap();
        assert!(filter.should_filter("internal-id", b"1"));
        assert!(!filter.should_filter("kafka.TOPIC", b"t"));

        assert!(matches!(
            RegexHeaderFilterStrategy::new("("),
            Err(ConfigError::InvalidHeaderPattern(_))
        ));
    }

    #[test]
    fn test_noop_filter_keeps_everything() {
        assert!(!NoopHeaderFilterStrategy.should_filter("kafka.TOPIC", b""));
    }

    #[test]
    fn test_utf8_deserializer_falls_back_to_bytes() {
        let deserializer = Utf8HeaderDeserializer;
        assert_eq!(
            deserializer.deserialize("h", b"hello"),
            HeaderValue::Text("hello".to_string())
        );
        assert_eq!(
            deserializer.deserialize("h", &[0xff, 0xfe]),
            HeaderValue::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test_case("raw", Some(HeaderDeserializerKind::Raw))]
    #[test_case("UTF8", Some(HeaderDeserializerKind::Utf8))]
    #[test_case("string", Some(HeaderDeserializerKind::Utf8))]
    #[test_case("avro", None)]
    fn test_deserializer_kind_from_str(input: &str, expected: Option<HeaderDeserializerKind>) {
        assert_eq!(input.parse::<HeaderDeserializerKind>().ok(), expected);
    }
}
