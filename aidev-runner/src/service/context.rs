//! Codebase context for AI calls
//!
//! The providers cannot see the checkout, so planning and coding calls
//! carry a bounded text package: a file tree, the project README, and the
//! contents of files the issue mentions.

use aidev_core::domain::issue::IssueRef;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "__pycache__",
    ".idea",
    ".vscode",
    "dist",
    "build",
    ".cache",
];

const CODE_EXTENSIONS: &[&str] = &[
    "php", "html", "htm", "css", "js", "ts", "py", "rs", "go", "json", "xml", "yml", "yaml",
    "toml", "sql", "sh", "bash", "md", "txt", "conf", "cfg", "ini",
];

const TREE_NAMES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    ".gitignore",
    ".htaccess",
    "composer.json",
    "package.json",
];

static MENTIONED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w./\\-]+\.\w{1,5}").unwrap());

/// Builds the context package for one issue
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    pub max_depth: usize,
    pub max_tree_lines: usize,
    /// Total characters of context
    pub max_context: usize,
    /// Files larger than this are listed but not read
    pub max_file_bytes: u64,
    pub max_mentioned: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_tree_lines: 100,
            max_context: 30_000,
            max_file_bytes: 50_000,
            max_mentioned: 10,
        }
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

fn is_listed(entry: &DirEntry) -> bool {
    if entry.file_type().is_dir() {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if TREE_NAMES.contains(&name.as_ref()) {
        return true;
    }
    entry
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn fence_language(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("php") => "php",
        Some("js") => "javascript",
        Some("css") => "css",
        Some("html") => "html",
        Some("py") => "python",
        Some("sql") => "sql",
        Some("json") => "json",
        Some("yml") | Some("yaml") => "yaml",
        Some("sh") | Some("bash") => "bash",
        Some("xml") => "xml",
        _ => "",
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl ContextBuilder {
    pub fn build(&self, root: &Path, issue: &IssueRef) -> String {
        let mut sections = vec![format!("## Project Structure\n```\n{}\n```", self.file_tree(root))];

        if let Some(summary) = self.summary(root) {
            sections.push(format!("## Project Summary\n{}", summary));
        }

        let mentioned = self.mentioned_files(root, &format!("{}\n{}", issue.title, issue.body));
        if !mentioned.is_empty() {
            sections.push(format!("## Related Files\n{}", self.read_files(root, &mentioned)));
        }

        let context = sections.join("\n\n");
        debug!(
            "Built context for {}: {} chars, {} sections",
            issue,
            context.len(),
            sections.len()
        );

        if context.chars().count() > self.max_context {
            format!(
                "{}\n\n... (context truncated)",
                truncate_chars(&context, self.max_context)
            )
        } else {
            context
        }
    }

    /// Indented tree of directories and source files, capped in length
    pub fn file_tree(&self, root: &Path) -> String {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let mut lines = vec![format!("{}/", name)];

        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(self.max_depth)
            .sort_by(|a, b| {
                b.file_type()
                    .is_dir()
                    .cmp(&a.file_type().is_dir())
                    .then_with(|| {
                        a.file_name()
                            .to_ascii_lowercase()
                            .cmp(&b.file_name().to_ascii_lowercase())
                    })
            })
            .into_iter()
            .filter_entry(|e| !is_skipped(e));

        for entry in walker.filter_map(|e| e.ok()).filter(is_listed) {
            if lines.len() >= self.max_tree_lines {
                lines.push("...".to_string());
                break;
            }
            let indent = "  ".repeat(entry.depth());
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                lines.push(format!("{}{}/", indent, name));
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                lines.push(format!("{}{} ({})", indent, name, format_size(size)));
            }
        }

        lines.join("\n")
    }

    fn summary(&self, root: &Path) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(readme) = ["README.md", "README.txt", "readme.md"]
            .iter()
            .map(|n| root.join(n))
            .find(|p| p.is_file())
        {
            if let Ok(text) = std::fs::read_to_string(&readme) {
                parts.push(truncate_chars(&text, 2_000).to_string());
            }
        }

        for meta in ["composer.json", "package.json"] {
            if let Ok(text) = std::fs::read_to_string(root.join(meta)) {
                parts.push(format!(
                    "**{}:**\n```json\n{}\n```",
                    meta,
                    truncate_chars(&text, 1_000)
                ));
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Paths named in `text` that exist as files inside the checkout
    pub fn mentioned_files(&self, root: &Path, text: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for m in MENTIONED_PATH.find_iter(text) {
            let candidate = m.as_str().replace('\\', "/");
            let candidate = candidate.trim_start_matches("./").to_string();
            if candidate.split('/').any(|part| part == "..") || candidate.starts_with('/') {
                continue;
            }
            if root.join(&candidate).is_file() && !found.contains(&candidate) {
                found.push(candidate);
            }
            if found.len() >= self.max_mentioned {
                break;
            }
        }
        found
    }

    fn read_files(&self, root: &Path, paths: &[String]) -> String {
        let mut parts = Vec::new();
        let mut total = 0usize;

        for rel in paths {
            if total > self.max_context / 2 {
                parts.push("... (remaining files skipped to save context space)".to_string());
                break;
            }
            let full = root.join(rel);
            let content = match std::fs::metadata(&full) {
                Ok(meta) if meta.len() > self.max_file_bytes => {
                    format!("[File too large: {} ({})]", rel, format_size(meta.len()))
                }
                Ok(_) => std::fs::read(&full)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_else(|e| format!("[Error reading {}: {}]", rel, e)),
                Err(_) => format!("[File not found: {}]", rel),
            };
            total += content.len();
            parts.push(format!(
                "### `{}`\n```{}\n{}\n```",
                rel,
                fence_language(rel),
                content
            ));
        }

        parts.join("\n\n")
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
