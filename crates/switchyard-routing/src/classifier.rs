use serde::{Deserialize, Serialize};
use std::str::FromStr;
use switchyard_core::{Request, SwitchyardError};

/// Classified purpose of a request.
///
/// Variant order is the tie-break priority: when two intents match the same
/// number of keywords, the one declared first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Fix an error, crash or bug.
    FixError,
    /// Restructure existing code.
    Refactor,
    /// Write tests.
    GenerateTests,
    /// Explain what code does.
    Explain,
    /// Improve performance.
    Optimize,
    /// Write documentation or comments.
    Document,
    /// Review code.
    Review,
    /// Create new code.
    Generate,
    /// No keyword matched.
    Unknown,
}

impl Intent {
    /// All classifiable intents in priority order (excludes `Unknown`).
    pub const RANKED: [Intent; 8] = [
        Intent::FixError,
        Intent::Refactor,
        Intent::GenerateTests,
        Intent::Explain,
        Intent::Optimize,
        Intent::Document,
        Intent::Review,
        Intent::Generate,
    ];

    /// Snake-case label used in rules and results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FixError => "fix_error",
            Intent::Refactor => "refactor",
            Intent::GenerateTests => "generate_tests",
            Intent::Explain => "explain",
            Intent::Optimize => "optimize",
            Intent::Document => "document",
            Intent::Review => "review",
            Intent::Generate => "generate",
            Intent::Unknown => "unknown",
        }
    }

    fn rank(&self) -> usize {
        Intent::RANKED
            .iter()
            .position(|i| i == self)
            .unwrap_or(Intent::RANKED.len())
    }

    fn default_keywords(&self) -> &'static [&'static str] {
        match self {
            Intent::FixError => &[
                "fix",
                "error",
                "bug",
                "exception",
                "crash",
                "broken",
                "null reference",
                "not working",
                "fails",
                "failing",
                "issue",
            ],
            Intent::Refactor => &[
                "refactor",
                "restructure",
                "clean up",
                "cleanup",
                "simplify",
                "rename",
                "extract",
                "reorganize",
                "readability",
            ],
            Intent::GenerateTests => &["test", "tests", "unit test", "coverage", "mock", "assert"],
            Intent::Explain => &[
                "explain",
                "what does",
                "how does",
                "why",
                "understand",
                "describe",
                "meaning",
            ],
            Intent::Optimize => &[
                "optimize",
                "performance",
                "faster",
                "speed up",
                "slow",
                "efficient",
                "memory usage",
            ],
            Intent::Document => &[
                "document",
                "documentation",
                "docs",
                "comment",
                "comments",
                "docstring",
                "readme",
            ],
            Intent::Review => &[
                "review", "check", "validate", "analyze", "analyse", "inspect", "audit", "lint",
            ],
            Intent::Generate => &[
                "create",
                "generate",
                "implement",
                "write",
                "add",
                "build",
                "scaffold",
            ],
            Intent::Unknown => &[],
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        if needle == "unknown" {
            return Ok(Intent::Unknown);
        }
        Intent::RANKED
            .iter()
            .copied()
            .find(|i| i.as_str() == needle)
            .ok_or_else(|| SwitchyardError::Config(format!("Unknown intent label '{s}'")))
    }
}

/// Programming language detected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// `.cs`, `.csx`
    CSharp,
    /// `.js`, `.jsx`, `.mjs`, `.cjs`
    JavaScript,
    /// `.ts`, `.tsx`
    TypeScript,
    /// `.py`, `.pyw`
    Python,
    /// `.rs`
    Rust,
    /// `.java`
    Java,
    /// `.go`
    Go,
    /// `.cpp`, `.cc`, `.cxx`, `.hpp`, `.hh`
    Cpp,
    /// `.c`, `.h`
    C,
    /// `.rb`
    Ruby,
    /// `.php`
    Php,
    /// `.sql`
    Sql,
    /// `.xaml`
    Xaml,
    /// Not detected.
    Unknown,
}

impl Language {
    /// Lowercase label used in rules and results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::CSharp => "csharp",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::Go => "go",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Sql => "sql",
            Language::Xaml => "xaml",
            Language::Unknown => "unknown",
        }
    }

    /// Map a lower-case file extension to a language.
    pub fn from_extension(ext: &str) -> Option<Language> {
        let lang = match ext {
            "cs" | "csx" => Language::CSharp,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "py" | "pyw" => Language::Python,
            "rs" => Language::Rust,
            "java" => Language::Java,
            "go" => Language::Go,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "c" | "h" => Language::C,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "sql" => Language::Sql,
            "xaml" => Language::Xaml,
            _ => return None,
        };
        Some(lang)
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intent that matched but did not win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAlternative {
    /// The competing intent.
    pub intent: Intent,
    /// Confidence it would have had.
    pub confidence: f64,
    /// Keywords it matched.
    pub matched: usize,
}

/// Result of classifying a request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Winning intent.
    pub intent: Intent,
    /// In `[0, 1]`; `UNKNOWN_CONFIDENCE` when nothing matched.
    pub confidence: f64,
    /// Detected language.
    pub language: Language,
    /// Matched keywords, winning intent's first.
    pub keywords: Vec<String>,
    /// Other matching intents, strongest first.
    pub alternatives: Vec<IntentAlternative>,
}

/// Confidence assigned when nothing matched.
pub const UNKNOWN_CONFIDENCE: f64 = 0.3;

/// Keyword-based intent classifier.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    table: Vec<(Intent, Vec<String>)>,
}

impl IntentClassifier {
    /// Classifier with the built-in keyword table.
    pub fn new() -> Self {
        let table = Intent::RANKED
            .iter()
            .map(|intent| {
                let words = intent
                    .default_keywords()
                    .iter()
                    .map(|k| normalize(k))
                    .collect();
                (*intent, words)
            })
            .collect();
        Self { table }
    }

    /// Add extra keywords for an intent.
    pub fn with_keywords(mut self, intent: Intent, keywords: &[&str]) -> Self {
        if let Some((_, words)) = self.table.iter_mut().find(|(i, _)| *i == intent) {
            for k in keywords {
                let k = normalize(k);
                if !k.is_empty() && !words.contains(&k) {
                    words.push(k);
                }
            }
        }
        self
    }

    /// Classify a request. Pure function of the request.
    pub fn classify(&self, request: &Request) -> Classification {
        let text = padded(&normalize(&request.prompt));

        let mut matches: Vec<(Intent, Vec<String>)> = self
            .table
            .iter()
            .filter_map(|(intent, words)| {
                let hits: Vec<String> = words
                    .iter()
                    .filter(|w| text.contains(&padded(w)))
                    .cloned()
                    .collect();
                (!hits.is_empty()).then_some((*intent, hits))
            })
            .collect();

        // Most matches first; ties go to the intent declared first.
        matches.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.rank().cmp(&b.0.rank())));

        let total: usize = matches.iter().map(|(_, hits)| hits.len()).sum();
        let language = detect_language(request);

        let Some((winner, winner_hits)) = matches.first() else {
            return Classification {
                intent: Intent::Unknown,
                confidence: UNKNOWN_CONFIDENCE,
                language,
                keywords: Vec::new(),
                alternatives: Vec::new(),
            };
        };

        let mut keywords = winner_hits.clone();
        for (_, hits) in matches.iter().skip(1) {
            for hit in hits {
                if !keywords.contains(hit) {
                    keywords.push(hit.clone());
                }
            }
        }

        let alternatives = matches
            .iter()
            .skip(1)
            .map(|(intent, hits)| IntentAlternative {
                intent: *intent,
                confidence: confidence_for(hits.len(), total),
                matched: hits.len(),
            })
            .collect();

        Classification {
            intent: *winner,
            confidence: confidence_for(winner_hits.len(), total),
            language,
            keywords,
            alternatives,
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Confidence from match count (strength) and the share of all matches the
/// intent holds (specificity), clipped to [0, 1].
fn confidence_for(matched: usize, total: usize) -> f64 {
    if matched == 0 || total == 0 {
        return UNKNOWN_CONFIDENCE;
    }
    let strength = (0.4 + 0.15 * matched as f64).min(0.95);
    let specificity = matched as f64 / total as f64;
    (strength * (0.6 + 0.4 * specificity)).clamp(0.0, 1.0)
}

/// Lower-case, punctuation to spaces, whitespace collapsed.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn padded(text: &str) -> String {
    format!(" {text} ")
}

/// Detect the language from the file extension, then prompt mentions, then code shape.
pub fn detect_language(request: &Request) -> Language {
    if let Some(lang) = request
        .file_extension()
        .as_deref()
        .and_then(Language::from_extension)
    {
        return lang;
    }
    if let Some(lang) = language_from_prompt(&request.prompt) {
        return lang;
    }
    request
        .code
        .as_deref()
        .and_then(language_from_code)
        .unwrap_or(Language::Unknown)
}

fn language_from_prompt(prompt: &str) -> Option<Language> {
    let raw = prompt.to_lowercase();
    let words = padded(&normalize(prompt));
    let has_word = |w: &str| words.contains(&padded(w));

    if raw.contains("c#") || has_word("csharp") || raw.contains(".net") || has_word("dotnet") {
        Some(Language::CSharp)
    } else if has_word("typescript") {
        Some(Language::TypeScript)
    } else if has_word("javascript") || raw.contains("node.js") || has_word("nodejs") {
        Some(Language::JavaScript)
    } else if has_word("python") {
        Some(Language::Python)
    } else if has_word("rust") || has_word("cargo") {
        Some(Language::Rust)
    } else if has_word("java") {
        Some(Language::Java)
    } else if has_word("golang") {
        Some(Language::Go)
    } else if raw.contains("c++") || has_word("cpp") {
        Some(Language::Cpp)
    } else if has_word("ruby") || has_word("rails") {
        Some(Language::Ruby)
    } else if has_word("php") {
        Some(Language::Php)
    } else if has_word("sql") {
        Some(Language::Sql)
    } else if has_word("xaml") {
        Some(Language::Xaml)
    } else {
        None
    }
}

fn language_from_code(code: &str) -> Option<Language> {
    let upper = code.to_uppercase();
    if code.contains("using System") || (code.contains("namespace ") && code.contains("public class")) {
        Some(Language::CSharp)
    } else if code.contains("<?php") {
        Some(Language::Php)
    } else if code.contains("package main") {
        Some(Language::Go)
    } else if code.contains("#include") {
        Some(Language::Cpp)
    } else if code.contains("fn ") && (code.contains("let ") || code.contains("->")) {
        Some(Language::Rust)
    } else if code.contains("def ") && code.contains(':') {
        Some(Language::Python)
    } else if code.contains("function ") || code.contains("=>") || code.contains("const ") {
        Some(Language::JavaScript)
    } else if upper.contains("SELECT ") && upper.contains(" FROM ") {
        Some(Language::Sql)
    } else {
        None
    }
}
