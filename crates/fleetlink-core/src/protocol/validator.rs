//! Defensive validation of raw inbound frames.
//!
//! Every frame that arrives from the gateway passes through
//! [`MessageValidator::process`] before anything else looks at it.  The
//! validator never fails: a bad frame is turned into a
//! [`ValidationOutcome::Rejected`] with a reason, the caller logs and drops
//! it, and the connection carries on.
//!
//! # Checks, in order
//!
//! 1. **Rate limit** – a sliding window (default 100 frames per 1000 ms).
//!    Excess frames are rejected without being parsed.
//! 2. **Emptiness / encoding** – empty frames and non-UTF-8 bytes.
//! 3. **Size** – frames above `max_frame_size` (default 500 000 bytes) are
//!    rejected, unless a cheap probe of the first bytes finds one of the
//!    streaming whitelist names.  Whitelisted frames may grow up to
//!    `max_streaming_frame_size`.
//! 4. **JSON parse**.
//! 5. **Structure** – a JSON object with a string `type` of at most 50
//!    characters, and a string `messageId` when one is present.
//! 6. **Re-serialization** – the parsed value must serialize back to text.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::trace;

/// How many leading bytes the streaming probe inspects.
const STREAMING_PROBE_LEN: usize = 1024;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Limits applied by [`MessageValidator`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorConfig {
    /// Largest accepted frame in bytes for ordinary traffic.
    pub max_frame_size: usize,
    /// Largest accepted frame in bytes for whitelisted streaming traffic.
    pub max_streaming_frame_size: usize,
    /// Frames allowed per window.
    pub rate_limit_messages: usize,
    /// Length of the sliding rate-limit window.
    pub rate_limit_window: Duration,
    /// Longest accepted `type` string, in characters.
    pub max_type_length: usize,
    /// Substrings that mark a frame as streaming data.
    pub streaming_whitelist: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 500_000,
            max_streaming_frame_size: 16 * 1024 * 1024,
            rate_limit_messages: 100,
            rate_limit_window: Duration::from_millis(1000),
            max_type_length: 50,
            streaming_whitelist: default_streaming_whitelist(),
        }
    }
}

/// Event names whose frames carry bulk media payloads.
pub fn default_streaming_whitelist() -> Vec<String> {
    [
        "livestream video data",
        "livestream audio data",
        "download video data",
        "download audio data",
        "talkback audio data",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Outcome types ─────────────────────────────────────────────────────────────

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    RateLimited,
    Empty,
    NotUtf8,
    TooLarge { size: usize, limit: usize },
    InvalidJson(String),
    NotAnObject,
    MissingType,
    TypeTooLong { length: usize, limit: usize },
    InvalidMessageId,
    NotSerializable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::RateLimited => write!(f, "Rate limit exceeded"),
            RejectReason::Empty => write!(f, "Empty message"),
            RejectReason::NotUtf8 => write!(f, "Message is not valid UTF-8 text"),
            RejectReason::TooLarge { size, limit } => {
                write!(f, "Message too large: {size} bytes exceeds {limit}")
            }
            RejectReason::InvalidJson(e) => write!(f, "Invalid JSON: {e}"),
            RejectReason::NotAnObject => write!(f, "Message must be a JSON object"),
            RejectReason::MissingType => write!(f, "Missing or non-string type field"),
            RejectReason::TypeTooLong { length, limit } => {
                write!(f, "Type field too long: {length} characters exceeds {limit}")
            }
            RejectReason::InvalidMessageId => write!(f, "messageId must be a string"),
            RejectReason::NotSerializable(e) => write!(f, "Payload cannot be re-serialized: {e}"),
        }
    }
}

/// Result of [`MessageValidator::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The frame is a well-formed JSON object.
    Accepted(Value),
    /// The frame must be dropped.
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted(_))
    }
}

/// Counters kept by the validator.
///
/// `processed` counts accepted frames, `rejected` counts frames dropped for
/// any reason other than the rate limit, and `rate_limited` counts the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    pub processed: u64,
    pub rejected: u64,
    pub rate_limited: u64,
}

// ── Validator ─────────────────────────────────────────────────────────────────

/// Sanitizes raw inbound frames.  See the module docs for the check order.
#[derive(Debug)]
pub struct MessageValidator {
    config: ValidatorConfig,
    window: VecDeque<Instant>,
    stats: ValidatorStats,
}

impl MessageValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            stats: ValidatorStats::default(),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validates one raw frame received now.
    pub fn process(&mut self, raw: &[u8]) -> ValidationOutcome {
        self.process_at(raw, Instant::now())
    }

    /// Validates one raw frame as if it arrived at `now`.
    ///
    /// Exposed so tests can drive the rate-limit window without sleeping.
    pub fn process_at(&mut self, raw: &[u8], now: Instant) -> ValidationOutcome {
        if !self.admit(now) {
            self.stats.rate_limited += 1;
            return ValidationOutcome::Rejected(RejectReason::RateLimited);
        }

        match self.check(raw) {
            Ok(value) => {
                self.stats.processed += 1;
                ValidationOutcome::Accepted(value)
            }
            Err(reason) => {
                self.stats.rejected += 1;
                ValidationOutcome::Rejected(reason)
            }
        }
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    /// Zeroes all counters.  The rate-limit window is left as is.
    pub fn reset_stats(&mut self) {
        self.stats = ValidatorStats::default();
    }

    /// Records an arrival in the sliding window, or refuses it when full.
    fn admit(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.window.front() {
            if now.saturating_duration_since(oldest) >= self.config.rate_limit_window {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if self.window.len() >= self.config.rate_limit_messages {
            return false;
        }
        self.window.push_back(now);
        true
    }

    fn check(&self, raw: &[u8]) -> Result<Value, RejectReason> {
        if raw.is_empty() {
            return Err(RejectReason::Empty);
        }
        let text = std::str::from_utf8(raw).map_err(|_| RejectReason::NotUtf8)?;
        if text.trim().is_empty() {
            return Err(RejectReason::Empty);
        }

        self.check_size(raw)?;

        let value: Value =
            serde_json::from_str(text).map_err(|e| RejectReason::InvalidJson(e.to_string()))?;

        let object = value.as_object().ok_or(RejectReason::NotAnObject)?;

        let frame_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(RejectReason::MissingType)?;
        let type_len = frame_type.chars().count();
        if type_len > self.config.max_type_length {
            return Err(RejectReason::TypeTooLong {
                length: type_len,
                limit: self.config.max_type_length,
            });
        }

        if let Some(id) = object.get("messageId") {
            if !id.is_string() {
                return Err(RejectReason::InvalidMessageId);
            }
        }

        serde_json::to_string(&value).map_err(|e| RejectReason::NotSerializable(e.to_string()))?;

        Ok(value)
    }

    fn check_size(&self, raw: &[u8]) -> Result<(), RejectReason> {
        let size = raw.len();
        if size <= self.config.max_frame_size {
            return Ok(());
        }

        let limit = if self.is_streaming(raw) {
            trace!(size, "oversized frame probed as streaming data");
            self.config.max_streaming_frame_size
        } else {
            self.config.max_frame_size
        };

        if size > limit {
            Err(RejectReason::TooLarge { size, limit })
        } else {
            Ok(())
        }
    }

    /// Looks for a whitelisted name in the first bytes without parsing.
    fn is_streaming(&self, raw: &[u8]) -> bool {
        let probe = &raw[..raw.len().min(STREAMING_PROBE_LEN)];
        let probe = String::from_utf8_lossy(probe);
        self.config
            .streaming_whitelist
            .iter()
            .any(|name| probe.contains(name.as_str()))
    }
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Builds an event frame of exactly `size` bytes for the given event name.
    fn event_frame_of_size(event_name: &str, size: usize) -> Vec<u8> {
        let prefix = format!(
            r#"{{"type":"event","event":{{"source":"device","event":"{event_name}","serialNumber":"T1","data":""#
        );
        let suffix = r#""}}"#;
        let padding = size - prefix.len() - suffix.len();
        let mut frame = prefix.into_bytes();
        frame.extend(std::iter::repeat(b'a').take(padding));
        frame.extend_from_slice(suffix.as_bytes());
        assert_eq!(frame.len(), size);
        frame
    }

    fn rejected(outcome: ValidationOutcome) -> RejectReason {
        match outcome {
            ValidationOutcome::Rejected(reason) => reason,
            ValidationOutcome::Accepted(v) => panic!("expected rejection, got {v}"),
        }
    }

    #[test]
    fn test_accepts_well_formed_result_frame() {
        // Arrange
        let mut validator = MessageValidator::default();
        let raw = br#"{"type":"result","messageId":"m1","success":true}"#;

        // Act
        let outcome = validator.process(raw);

        // Assert
        assert_eq!(
            outcome,
            ValidationOutcome::Accepted(json!({"type": "result", "messageId": "m1", "success": true}))
        );
        assert_eq!(validator.stats().processed, 1);
    }

    #[test]
    fn test_rejects_empty_and_whitespace_frames() {
        let mut validator = MessageValidator::default();
        assert_eq!(rejected(validator.process(b"")), RejectReason::Empty);
        assert_eq!(rejected(validator.process(b"   \n")), RejectReason::Empty);
    }

    #[test]
    fn test_rejects_non_utf8_bytes() {
        let mut validator = MessageValidator::default();
        assert_eq!(rejected(validator.process(&[0xff, 0xfe, 0x00])), RejectReason::NotUtf8);
    }

    #[test]
    fn test_rejects_invalid_json() {
        let mut validator = MessageValidator::default();
        let reason = rejected(validator.process(b"{not json"));
        assert!(matches!(reason, RejectReason::InvalidJson(_)));
        assert!(reason.to_string().starts_with("Invalid JSON"));
    }

    #[test]
    fn test_rejects_non_object_json() {
        let mut validator = MessageValidator::default();
        assert_eq!(rejected(validator.process(b"[1,2,3]")), RejectReason::NotAnObject);
        assert_eq!(rejected(validator.process(b"\"text\"")), RejectReason::NotAnObject);
    }

    #[test]
    fn test_rejects_missing_or_non_string_type() {
        let mut validator = MessageValidator::default();
        assert_eq!(rejected(validator.process(br#"{"messageId":"x"}"#)), RejectReason::MissingType);
        assert_eq!(rejected(validator.process(br#"{"type":7}"#)), RejectReason::MissingType);
    }

    #[test]
    fn test_type_length_limit_is_fifty_characters() {
        let mut validator = MessageValidator::default();
        let ok = format!(r#"{{"type":"{}"}}"#, "t".repeat(50));
        let too_long = format!(r#"{{"type":"{}"}}"#, "t".repeat(51));

        assert!(validator.process(ok.as_bytes()).is_accepted());
        assert_eq!(
            rejected(validator.process(too_long.as_bytes())),
            RejectReason::TypeTooLong { length: 51, limit: 50 }
        );
    }

    #[test]
    fn test_rejects_non_string_message_id() {
        let mut validator = MessageValidator::default();
        let reason = rejected(validator.process(br#"{"type":"result","messageId":42}"#));
        assert_eq!(reason, RejectReason::InvalidMessageId);
    }

    #[test]
    fn test_streaming_frame_above_limit_is_accepted() {
        // Arrange
        let mut validator = MessageValidator::default();
        let frame = event_frame_of_size("livestream video data", 600_000);

        // Act
        let outcome = validator.process(&frame);

        // Assert
        assert!(outcome.is_accepted(), "streaming frame must bypass the size limit");
    }

    #[test]
    fn test_ordinary_frame_of_same_size_is_too_large() {
        // Arrange
        let mut validator = MessageValidator::default();
        let frame = event_frame_of_size("property changed", 600_000);

        // Act
        let reason = rejected(validator.process(&frame));

        // Assert
        assert_eq!(reason, RejectReason::TooLarge { size: 600_000, limit: 500_000 });
        assert!(reason.to_string().starts_with("Message too large"));
    }

    #[test]
    fn test_streaming_frame_above_streaming_ceiling_is_rejected() {
        let mut validator = MessageValidator::new(ValidatorConfig {
            max_streaming_frame_size: 550_000,
            ..ValidatorConfig::default()
        });
        let frame = event_frame_of_size("download video data", 600_000);

        let reason = rejected(validator.process(&frame));

        assert_eq!(reason, RejectReason::TooLarge { size: 600_000, limit: 550_000 });
    }

    #[test]
    fn test_rate_limit_rejects_excess_within_window() {
        // Arrange
        let mut validator = MessageValidator::new(ValidatorConfig {
            rate_limit_messages: 3,
            ..ValidatorConfig::default()
        });
        let start = Instant::now();
        let raw = br#"{"type":"event"}"#;

        // Act
        for i in 0..3 {
            assert!(validator.process_at(raw, start + Duration::from_millis(i)).is_accepted());
        }
        let fourth = validator.process_at(raw, start + Duration::from_millis(10));

        // Assert
        assert_eq!(fourth, ValidationOutcome::Rejected(RejectReason::RateLimited));
        assert_eq!(validator.stats().rate_limited, 1);
        assert_eq!(validator.stats().rejected, 0);
    }

    #[test]
    fn test_rate_limit_window_slides() {
        let mut validator = MessageValidator::new(ValidatorConfig {
            rate_limit_messages: 2,
            ..ValidatorConfig::default()
        });
        let start = Instant::now();
        let raw = br#"{"type":"event"}"#;

        assert!(validator.process_at(raw, start).is_accepted());
        assert!(validator.process_at(raw, start + Duration::from_millis(500)).is_accepted());
        assert!(!validator.process_at(raw, start + Duration::from_millis(900)).is_accepted());

        // The first arrival has left the window at t=1000ms.
        assert!(validator.process_at(raw, start + Duration::from_millis(1000)).is_accepted());
    }

    #[test]
    fn test_rate_limited_frames_are_not_parsed() {
        let mut validator = MessageValidator::new(ValidatorConfig {
            rate_limit_messages: 1,
            ..ValidatorConfig::default()
        });
        let now = Instant::now();
        validator.process_at(br#"{"type":"event"}"#, now);

        // Garbage would be InvalidJson if it were parsed.
        let outcome = validator.process_at(b"{garbage", now);

        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::RateLimited));
    }

    #[test]
    fn test_stats_count_and_reset() {
        let mut validator = MessageValidator::default();
        validator.process(br#"{"type":"event"}"#);
        validator.process(b"nope");

        assert_eq!(
            validator.stats(),
            ValidatorStats { processed: 1, rejected: 1, rate_limited: 0 }
        );

        validator.reset_stats();
        assert_eq!(validator.stats(), ValidatorStats::default());
    }
}
