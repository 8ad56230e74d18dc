//! Language version floor checks
//!
//! Each syntax rule carries the language version that introduced it. A
//! project declares the oldest version it must run on; any rule newer than
//! that floor is a finding.

use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

/// `major.minor` language version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses `7`, `7.4` or `7.4.33` (patch ignored)
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid version '{}'", s))?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| format!("invalid version '{}'", s))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Php,
}

impl Language {
    fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "php" => Ok(Language::Php),
            other => Err(format!("no compatibility rules for language '{}'", other)),
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            Language::Php => &["php", "phtml", "inc"],
        }
    }

    fn rules(&self) -> &'static [SyntaxRule] {
        match self {
            Language::Php => &PHP_RULES,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Php => write!(f, "PHP"),
        }
    }
}

/// One piece of syntax and the version that introduced it
pub struct SyntaxRule {
    pub since: Version,
    pub name: &'static str,
    pattern: Regex,
}

impl SyntaxRule {
    fn new(major: u32, minor: u32, name: &'static str, pattern: &str) -> Self {
        Self {
            since: Version::new(major, minor),
            name,
            pattern: Regex::new(pattern).unwrap(),
        }
    }
}

static PHP_RULES: LazyLock<Vec<SyntaxRule>> = LazyLock::new(|| {
    vec![
        SyntaxRule::new(5, 3, "namespace declaration", r"^\s*namespace\s+[\w\\]+"),
        SyntaxRule::new(5, 3, "short ternary `?:`", r"\?\s*:"),
        SyntaxRule::new(5, 4, "trait declaration", r"^\s*trait\s+\w+"),
        SyntaxRule::new(5, 4, "short array syntax", r"(?:=|=>|return|\(|,)\s*\[\s*(?:\]|['\x22$\d\[])"),
        SyntaxRule::new(5, 5, "finally block", r"\bfinally\s*\{"),
        SyntaxRule::new(5, 5, "`::class` constant", r"::class\b"),
        SyntaxRule::new(5, 6, "variadic parameter", r"\.\.\.\s*\$\w+"),
        SyntaxRule::new(5, 6, "`use function` import", r"^\s*use\s+(?:function|const)\s+"),
        SyntaxRule::new(7, 0, "null coalescing operator `??`", r"\?\?"),
        SyntaxRule::new(7, 0, "spaceship operator `<=>`", r"<=>"),
        SyntaxRule::new(7, 0, "return type declaration", r"\bfunction\s*&?\s*\w*\s*\([^)]*\)\s*:\s*\??\\?\w+"),
        SyntaxRule::new(7, 0, "generator delegation `yield from`", r"(?i)\byield\s+from\b"),
        SyntaxRule::new(7, 0, "strict_types declaration", r"declare\s*\(\s*strict_types"),
        SyntaxRule::new(7, 0, "anonymous class", r"\bnew\s+class\b"),
        SyntaxRule::new(7, 1, "nullable type", r"(?:\(|,)\s*\?\w+\s+&?\$"),
        SyntaxRule::new(7, 1, "class constant visibility", r"\b(?:public|protected|private)\s+const\b"),
        SyntaxRule::new(7, 1, "multi-catch", r"\bcatch\s*\(\s*[\w\\]+\s*\|"),
        SyntaxRule::new(7, 4, "arrow function", r"\bfn\s*\("),
        SyntaxRule::new(7, 4, "null coalescing assignment `??=`", r"\?\?="),
        SyntaxRule::new(7, 4, "typed property", r"\b(?:public|protected|private)\s+(?:static\s+)?\??[\w\\]+\s+\$\w+"),
        SyntaxRule::new(8, 0, "nullsafe operator `?->`", r"\?->"),
        SyntaxRule::new(8, 0, "match expression", r"\bmatch\s*\("),
        SyntaxRule::new(8, 0, "attribute", r"^\s*#\["),
        SyntaxRule::new(8, 0, "constructor property promotion", r"__construct\s*\([^)]*\b(?:public|protected|private)\s"),
        SyntaxRule::new(8, 1, "enum declaration", r"^\s*enum\s+\w+"),
        SyntaxRule::new(8, 1, "readonly property", r"\breadonly\s+(?:public|protected|private|[\w\\]+\s+\$)"),
        SyntaxRule::new(8, 2, "readonly class", r"\breadonly\s+(?:final\s+)?class\b"),
        SyntaxRule::new(8, 3, "typed class constant", r"\bconst\s+[\w\\]+\s+\w+\s*="),
    ]
});

/// A project's language and the oldest version it must run on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTarget {
    pub language: Language,
    pub floor: Version,
}

impl LanguageTarget {
    pub fn parse(language: &str, version: &str) -> Result<Self, String> {
        Ok(Self {
            language: Language::parse(language)?,
            floor: Version::parse(version)?,
        })
    }

    pub fn applies_to(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.language
                    .extensions()
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    /// Rules on `line` that need a newer version than the floor
    pub fn violations<'a>(&'a self, line: &'a str) -> impl Iterator<Item = &'static SyntaxRule> + 'a {
        self.language.rules().iter().filter(move |rule| {
            rule.since.cmp(&self.floor) == Ordering::Greater && rule.pattern.is_match(line)
        })
    }
}

impl fmt::Display for LanguageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.language, self.floor)
    }
}
