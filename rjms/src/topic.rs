use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

pub const LEVEL_SEPARATOR: char = '.';

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TopicError {
    InvalidTopic(String),
    InvalidLevel(String),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::InvalidTopic(s) => {
                write!(f, "InvalidTopic({})", s)
            }
            TopicError::InvalidLevel(s) => {
                write!(f, "InvalidLevel({})", s)
            }
        }
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    SingleWildcard, // *
    MultiWildcard,  // **
}

impl Level {
    pub fn parse<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        Level::from_str(s.as_ref())
    }

    pub fn normal<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        let s = s.as_ref();
        if s.is_empty() {
            return Err(TopicError::InvalidLevel("empty level".into()));
        }
        if s.contains('*') {
            return Err(TopicError::InvalidLevel(format!("invalid normal level `{}` contains *", s)));
        }
        Ok(Level::Normal(String::from(s)))
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(*self, Level::Normal(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        !self.is_normal()
    }

    #[inline]
    fn match_str(&self, s: &str) -> bool {
        match *self {
            Level::Normal(ref lhs) => lhs == s,
            Level::SingleWildcard | Level::MultiWildcard => true,
        }
    }
}

/// A parsed topic name or pattern.
///
/// Levels are separated by `.`; `*` matches exactly one level and `**`
/// matches one or more trailing levels.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .iter()
                .enumerate()
                .all(|(pos, level)| !matches!(level, Level::MultiWildcard) || pos == self.0.len() - 1)
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    /// Whether this pattern matches the concrete topic `name`.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, name: &S) -> bool {
        let mut names = name.as_ref().split(LEVEL_SEPARATOR);
        for level in self.0.iter() {
            match names.next() {
                Some(_) if *level == Level::MultiWildcard => return true,
                Some(n) if level.match_str(n) => continue,
                _ => return false,
            }
        }
        names.next().is_none()
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        !topic.has_wildcard() && self.matches_str(&topic.to_string())
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! topic {
    ($s:expr) => {
        $s.parse::<$crate::topic::Topic>()
    };
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "*" => Ok(Level::SingleWildcard),
            "**" => Ok(Level::MultiWildcard),
            _ => Level::normal(s),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        s.split(LEVEL_SEPARATOR)
            .map(Level::from_str)
            .collect::<Result<Vec<_>, TopicError>>()
            .map(Topic)
            .and_then(|topic| {
                if topic.is_valid() {
                    Ok(topic)
                } else {
                    Err(TopicError::InvalidTopic(format!("invalid topic `{}`", s)))
                }
            })
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) => f.write_str(s.as_str()),
            Level::SingleWildcard => f.write_char('*'),
            Level::MultiWildcard => f.write_str("**"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char(LEVEL_SEPARATOR)?;
            }

            level.fmt(f)?;
        }

        Ok(())
    }
}
