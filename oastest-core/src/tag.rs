//! `<meqa …>` tag extraction from description fields.
//!
//! Descriptions may embed one `<meqa Class[.Property[.Operation]]
//! [flags…]>` tag. The tag nearest a construct wins; parents are only
//! consulted when the inner construct has none. Absent or malformed tags
//! yield `None`; the parser never fails a run.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Flag words recognized inside a tag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TagFlags {
    pub success: bool,
    pub fail: bool,
    pub weak: bool,
}

/// Metadata extracted from a `<meqa …>` marker.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MeqaTag {
    pub class: String,
    pub property: Option<String>,
    pub operation: Option<String>,
    pub flags: TagFlags,
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<meqa +([^>]*)>").expect("tag pattern compiles"))
}

impl MeqaTag {
    pub fn new(class: impl Into<String>) -> Self {
        MeqaTag {
            class: class.into(),
            property: None,
            operation: None,
            flags: TagFlags::default(),
        }
    }

    /// Extracts the first tag from a description, if any.
    ///
    /// Unknown words inside the marker are ignored; more than three dotted
    /// name segments makes the whole tag invalid.
    pub fn parse(description: &str) -> Option<MeqaTag> {
        if description.is_empty() {
            return None;
        }
        let captures = tag_pattern().captures(description)?;
        let inner = captures.get(1)?.as_str().trim();

        let mut flags = TagFlags::default();
        let mut dotted = "";
        for word in inner.split_whitespace() {
            match word {
                "success" => flags.success = true,
                "fail" => flags.fail = true,
                "weak" => flags.weak = true,
                other => dotted = other,
            }
        }
        if dotted.is_empty() {
            log::warn!("meqa tag without a class in description: {description}");
            return None;
        }

        let mut segments = dotted.split('.');
        let class = segments.next().unwrap_or_default().to_string();
        let property = segments.next().map(str::to_string);
        let operation = segments.next().map(str::to_string);
        if segments.next().is_some() {
            log::warn!("invalid meqa tag in description: {description}");
            return None;
        }
        Some(MeqaTag {
            class,
            property,
            operation,
            flags,
        })
    }

    /// The operation override carried by the tag, when present and non-empty.
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref().filter(|op| !op.is_empty())
    }

    /// The property the tag binds to, when present and non-empty.
    pub fn property(&self) -> Option<&str> {
        self.property.as_deref().filter(|prop| !prop.is_empty())
    }
}

impl fmt::Display for MeqaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<meqa {}", self.class)?;
        if let Some(property) = self.property() {
            write!(f, ".{property}")?;
        }
        if let Some(operation) = self.operation() {
            write!(f, ".{operation}")?;
        }
        write!(f, ">")
    }
}
