use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source roots owned by this crate. Nothing else in the checkout is scanned.
const SOURCE_ROOTS: &[&str] = &["classify", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// One source-hygiene rule: a line regex plus a filter that decides whether a
/// matching line is really a violation.
struct Rule {
    name: &'static str,
    pattern: String,
    accept: fn(&str) -> bool,
    advice: &'static str,
}

// Collects every violating line of a single file for one rule.
struct RuleCollector<'r> {
    rule: &'r Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'r> RuleCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.name,
            self.file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(error_msg)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_pure_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

// The text after the comment marker, if the line carries a comment at all.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(idx) = line.find("//") {
        return Some(line[idx + 2..].trim_start_matches('!').trim());
    }
    let idx = line.find("/*")?;
    let body = &line[idx + 2..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

fn underscore_outside_strings(line: &str) -> bool {
    if is_pure_comment(line) {
        return false;
    }
    // Odd-numbered pieces between quotes are string contents.
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn shouting_comment(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn always(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: underscore_outside_strings,
            advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
        },
        Rule {
            name: "forbidden comment words",
            pattern: format!(r"(//|/\*|///).*(?:{FORBIDDEN_WORDS})"),
            accept: always,
            advice: "Comments narrating edits (FIX, NEW, UPDATE and similar) are not allowed. Remove them.",
        },
        Rule {
            name: "'**' in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            accept: stars_outside_doc_comment,
            advice: "The '**' pattern is only allowed in /// doc comments.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"(//|/\*|///).*".to_string(),
            accept: shouting_comment,
            advice: "Comments whose letters are all uppercase are not allowed. Delete the comment.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: always,
            advice: "Either use the code or remove it. Silencing dead_code is not allowed.",
        },
    ]
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in rules() {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        for path in rust_sources() {
            let mut collector = RuleCollector::new(&rule, &path);
            searcher.search_path(&matcher, &path, &mut collector)?;
            if let Some(error_message) = collector.check_and_get_error_message() {
                return Err(error_message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    if let Err(e) = scan_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
