use std::fmt::{self, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("invalid level `{0}`")]
    InvalidLevel(String),
    #[error("wildcards are not allowed in topic name `{0}`")]
    WildcardInName(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    /// A first level starting with `$`, e.g. `$SYS`.
    Metadata(String),
    Blank,
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    fn parse(s: &str, first: bool) -> Result<Level, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#', '\0']) => Err(TopicError::InvalidLevel(s.into())),
            _ if first && s.starts_with('$') => Ok(Level::Metadata(s.into())),
            _ => Ok(Level::Normal(s.into())),
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(self, Level::Metadata(_))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) | Level::Metadata(s) => f.write_str(s),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A parsed topic filter or topic name.
///
/// `FromStr` parses a filter; [`Topic::parse_name`] additionally rejects wildcards.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    pub fn parse_name(s: &str) -> Result<Topic, TopicError> {
        let topic = Topic::from_str(s)?;
        if topic.has_wildcard() {
            return Err(TopicError::WildcardInName(s.into()));
        }
        Ok(topic)
    }

    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        self.0.first().map(Level::is_metadata).unwrap_or(false)
    }

    /// Whether the topic name `name` is matched by this filter.
    pub fn matches_str(&self, name: &str) -> bool {
        let dollar = name.starts_with('$');
        let mut names = name.split('/');
        for (depth, level) in self.0.iter().enumerate() {
            match level {
                Level::MultiWildcard => return !(depth == 0 && dollar),
                Level::SingleWildcard => match names.next() {
                    Some(_) if depth == 0 && dollar => return false,
                    Some(_) => {}
                    None => return false,
                },
                Level::Blank => {
                    if names.next() != Some("") {
                        return false;
                    }
                }
                Level::Normal(s) | Level::Metadata(s) => {
                    if names.next() != Some(s.as_str()) {
                        return false;
                    }
                }
            }
        }
        names.next().is_none()
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic(s.into()));
        }
        let levels = s
            .split('/')
            .enumerate()
            .map(|(i, l)| Level::parse(l, i == 0))
            .collect::<Result<Vec<_>, TopicError>>()?;
        if let Some(pos) = levels.iter().position(|l| matches!(l, Level::MultiWildcard)) {
            if pos != levels.len() - 1 {
                return Err(TopicError::InvalidTopic(s.into()));
            }
        }
        Ok(Topic(levels))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> Topic {
        s.parse().unwrap()
    }

    #[test]
    fn parse_filters() {
        assert_eq!(
            filter("sport/+/player1").levels(),
            &[Level::Normal("sport".into()), Level::SingleWildcard, Level::Normal("player1".into())]
        );
        assert_eq!(filter("/finance").levels(), &[Level::Blank, Level::Normal("finance".into())]);
        assert!(filter("$SYS/#").is_metadata());
        assert!(!filter("sport/$SYS").is_metadata());
        assert_eq!(filter("a/b/#").to_string(), "a/b/#");

        assert!("".parse::<Topic>().is_err());
        assert!("sport/tennis#".parse::<Topic>().is_err());
        assert!("sport/tennis/#/ranking".parse::<Topic>().is_err());
        assert!("sport+".parse::<Topic>().is_err());
        assert!("#/a".parse::<Topic>().is_err());
    }

    #[test]
    fn parse_names() {
        assert!(Topic::parse_name("sensors/room1/temp").is_ok());
        assert!(matches!(Topic::parse_name("sensors/+/temp"), Err(TopicError::WildcardInName(_))));
        assert!(Topic::parse_name("a/#").is_err());
        assert!(Topic::parse_name("").is_err());
    }

    #[test]
    fn wildcard_semantics() {
        let t = filter("sport/tennis/player1/#");
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(t.matches_str("sport/tennis/player1/ranking"));
        assert!(t.matches_str("sport/tennis/player1/score/wimbledon"));
        assert!(!t.matches_str("sport/tennis/player2"));

        let t = filter("sport/tennis/+");
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(!t.matches_str("sport/tennis/player1/ranking"));
        assert!(!t.matches_str("sport/tennis"));

        assert!(!filter("sport/+").matches_str("sport"));
        assert!(filter("sport/+").matches_str("sport/"));
        assert!(filter("+/+").matches_str("/finance"));
        assert!(filter("/+").matches_str("/finance"));
        assert!(!filter("+").matches_str("/finance"));
        assert!(filter("#").matches_str("a/b/c"));
    }

    #[test]
    fn dollar_topics_skip_leading_wildcards() {
        assert!(!filter("#").matches_str("$SYS"));
        assert!(!filter("#").matches_str("$SYS/broker/uptime"));
        assert!(!filter("+/monitor/Clients").matches_str("$SYS/monitor/Clients"));
        assert!(filter("$SYS/#").matches_str("$SYS/"));
        assert!(filter("$SYS/#").matches_str("$SYS"));
        assert!(filter("$SYS/monitor/+").matches_str("$SYS/monitor/Clients"));
        assert!(filter("a/+").matches_str("a/$b"));
    }
}
