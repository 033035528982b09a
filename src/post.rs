use serde::{Deserialize, Serialize};
use std::fmt;

/// A single feed item eligible for a reply.
///
/// Identity is `id`; the other fields are informational once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default = "default_author")]
    pub author: String,
    pub text: String,
}

fn default_author() -> String {
    "unknown".to_string()
}

impl Post {
    pub fn new(id: impl Into<String>, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            text: text.into(),
        }
    }

    /// First `max` characters of the text, for log lines.
    pub fn preview(&self, max: usize) -> String {
        let mut preview: String = self.text.chars().take(max).collect();
        if self.text.chars().count() > max {
            preview.push_str("...");
        }
        preview
    }
}

impl fmt::Display for Post {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by @{}", self.id, self.author)
    }
}
