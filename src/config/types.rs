use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::{Regex, RegexBuilder};
use serde::de::{Unexpected, Visitor};
use serde::{Deserialize, Deserializer};

/// A duration written as whole seconds or as `"[<d>d] [<h>h] [<m>m] [<s>s]"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const fn from_secs(seconds: u64) -> Self {
        Self(std::time::Duration::from_secs(seconds))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseDurationError {
    Malformed,
    TooLarge,
}

impl Display for ParseDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "expected a duration like `1h 30m` or `45s`"),
            Self::TooLarge => write!(f, "the duration is too large"),
        }
    }
}

impl std::error::Error for ParseDurationError {}

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static REGEXP: OnceLock<Regex> = OnceLock::new();

        let regexp = REGEXP.get_or_init(|| {
            RegexBuilder::new(
                r"
                ^
                (?:(?<days>    \d+)d)? \s*
                (?:(?<hours>   \d+)h)? \s*
                (?:(?<minutes> \d+)m)? \s*
                (?:(?<seconds> \d+)s)?
                $",
            )
            .ignore_whitespace(true)
            .build()
            .unwrap()
        });

        let s = s.trim();

        if let Ok(seconds) = s.parse::<u64>() {
            return Ok(Self::from_secs(seconds));
        }

        let captures = regexp.captures(s).ok_or(ParseDurationError::Malformed)?;

        let parse = |name: &str| -> Result<Option<u64>, ParseDurationError> {
            captures
                .name(name)
                .map(|m| m.as_str().parse::<u64>())
                .transpose()
                .map_err(|_| ParseDurationError::TooLarge)
        };

        let days = parse("days")?;
        let hours = parse("hours")?;
        let minutes = parse("minutes")?;
        let seconds = parse("seconds")?;

        if days.is_none() && hours.is_none() && minutes.is_none() && seconds.is_none() {
            return Err(ParseDurationError::Malformed);
        }

        days.unwrap_or(0)
            .checked_mul(24)
            .and_then(|h| h.checked_add(hours.unwrap_or(0)))
            .and_then(|h| h.checked_mul(60))
            .and_then(|m| m.checked_add(minutes.unwrap_or(0)))
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(seconds.unwrap_or(0)))
            .map(Duration::from_secs)
            .ok_or(ParseDurationError::TooLarge)
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();

        if total == 0 {
            return write!(f, "0s");
        }

        let parts = [
            (total / 86400, "d"),
            (total / 3600 % 24, "h"),
            (total / 60 % 60, "m"),
            (total % 60, "s"),
        ];
        let mut sep = "";

        for (value, unit) in parts {
            if value > 0 {
                write!(f, "{sep}{value}{unit}")?;
                sep = " ";
            }
        }

        Ok(())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a duration")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_u64(v.try_into().map_err(E::custom)?)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse::<Duration>().map_err(|e| match e {
                    ParseDurationError::Malformed => {
                        E::invalid_value(Unexpected::Str(v), &"a duration")
                    }

                    ParseDurationError::TooLarge => {
                        E::custom(format!("duration `{v}` is too large"))
                    }
                })
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        duration.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!("45s".parse(), Ok(Duration::from_secs(45)));
        assert_eq!("1h 30m".parse(), Ok(Duration::from_secs(5400)));
        assert_eq!("2d".parse(), Ok(Duration::from_secs(2 * 86400)));
        assert_eq!("1d2h3m4s".parse(), Ok(Duration::from_secs(93784)));
        assert_eq!("  90 ".parse(), Ok(Duration::from_secs(90)));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!("".parse::<Duration>(), Err(ParseDurationError::Malformed));
        assert_eq!("5 minutes".parse::<Duration>(), Err(ParseDurationError::Malformed));
        assert_eq!("1m 1h".parse::<Duration>(), Err(ParseDurationError::Malformed));
        assert_eq!(
            "99999999999999999999d".parse::<Duration>(),
            Err(ParseDurationError::TooLarge)
        );
    }

    #[test]
    fn displays_in_the_parsed_syntax() {
        assert_eq!(Duration::from_secs(0).to_string(), "0s");
        assert_eq!(Duration::from_secs(60).to_string(), "1m");
        assert_eq!(Duration::from_secs(93784).to_string(), "1d 2h 3m 4s");
        assert_eq!(Duration::from_secs(3605).to_string(), "1h 5s");
    }
}
