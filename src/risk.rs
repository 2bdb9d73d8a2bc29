//! Static risk analysis of untrusted source code.
//!
//! The analyzer reads source text line by line and looks for constructs in
//! four categories. Nothing is ever executed, imported, or modified.
//!
//! | Category | Examples | Level |
//! |----------|----------|-------|
//! | Dynamic evaluation | `eval(`, `exec(`, `new Function(`, `vm.runInNewContext` | CRITICAL |
//! | Subprocess | `subprocess.`, `child_process`, `os.system(`, `Command::new(` | HIGH |
//! | Network egress | `requests.`, `fetch(`, `axios`, `socket.socket(` | MODERATE |
//! | Filesystem write | `writeFile(`, `shutil.rmtree(`, `open(.., 'w')` | MODERATE |
//!
//! The highest severity among all matches wins. Input with no files and no
//! manifest is reported as UNKNOWN.

use std::collections::HashSet;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::models::{RiskCategory, RiskFinding, RiskLevel};

/// A source file handed to the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
        }
    }
}

/// Result of one analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskReport {
    pub level: RiskLevel,
    pub analyzed: bool,
    pub findings: Vec<RiskFinding>,
}

#[derive(Clone, Copy)]
enum MatchKind {
    /// Plain substring.
    Substring,
    /// Function call that must not be a method or part of a longer name.
    BareCall,
}

struct Rule {
    category: RiskCategory,
    pattern: &'static str,
    kind: MatchKind,
}

const fn rule(category: RiskCategory, pattern: &'static str, kind: MatchKind) -> Rule {
    Rule {
        category,
        pattern,
        kind,
    }
}

use MatchKind::{BareCall, Substring};
use RiskCategory::{DynamicEval, FilesystemWrite, Network, Subprocess};

const RULES: &[Rule] = &[
    // dynamic evaluation
    rule(DynamicEval, "eval(", BareCall),
    rule(DynamicEval, "exec(", BareCall),
    rule(DynamicEval, "execfile(", BareCall),
    rule(DynamicEval, "compile(", BareCall),
    rule(DynamicEval, "__import__(", BareCall),
    rule(DynamicEval, "new Function(", Substring),
    rule(DynamicEval, "vm.runInNewContext", Substring),
    rule(DynamicEval, "vm.runInThisContext", Substring),
    rule(DynamicEval, "vm.runInContext", Substring),
    rule(DynamicEval, "pickle.loads(", Substring),
    rule(DynamicEval, "marshal.loads(", Substring),
    // subprocess
    rule(Subprocess, "subprocess.", Substring),
    rule(Subprocess, "os.system(", Substring),
    rule(Subprocess, "os.popen(", Substring),
    rule(Subprocess, "os.exec", Substring),
    rule(Subprocess, "os.spawn", Substring),
    rule(Subprocess, "child_process", Substring),
    rule(Subprocess, "execSync(", Substring),
    rule(Subprocess, "spawnSync(", Substring),
    rule(Subprocess, "execFile(", Substring),
    rule(Subprocess, "Command::new(", Substring),
    rule(Subprocess, "Deno.run(", Substring),
    rule(Subprocess, "Deno.Command(", Substring),
    rule(Subprocess, "Bun.spawn(", Substring),
    rule(Subprocess, "create_subprocess_", Substring),
    rule(Subprocess, "shell=True", Substring),
    // network egress
    rule(Network, "requests.", Substring),
    rule(Network, "urllib.request", Substring),
    rule(Network, "urllib3", Substring),
    rule(Network, "http.client", Substring),
    rule(Network, "httpx.", Substring),
    rule(Network, "aiohttp.", Substring),
    rule(Network, "socket.socket(", Substring),
    rule(Network, "socket.create_connection(", Substring),
    rule(Network, "fetch(", BareCall),
    rule(Network, "axios", Substring),
    rule(Network, "XMLHttpRequest", Substring),
    rule(Network, "net.connect(", Substring),
    rule(Network, "net.createConnection(", Substring),
    rule(Network, "new WebSocket(", Substring),
    rule(Network, "reqwest::", Substring),
    rule(Network, "TcpStream::connect(", Substring),
    // filesystem writes
    rule(FilesystemWrite, "writeFile(", Substring),
    rule(FilesystemWrite, "writeFileSync(", Substring),
    rule(FilesystemWrite, "appendFile", Substring),
    rule(FilesystemWrite, "createWriteStream(", Substring),
    rule(FilesystemWrite, "unlinkSync(", Substring),
    rule(FilesystemWrite, "rmSync(", Substring),
    rule(FilesystemWrite, "fs.rm(", Substring),
    rule(FilesystemWrite, "fs.unlink(", Substring),
    rule(FilesystemWrite, "shutil.rmtree(", Substring),
    rule(FilesystemWrite, "shutil.move(", Substring),
    rule(FilesystemWrite, "shutil.copy", Substring),
    rule(FilesystemWrite, "os.remove(", Substring),
    rule(FilesystemWrite, "os.unlink(", Substring),
    rule(FilesystemWrite, "os.rmdir(", Substring),
    rule(FilesystemWrite, ".write_text(", Substring),
    rule(FilesystemWrite, ".write_bytes(", Substring),
    rule(FilesystemWrite, "fs::write(", Substring),
    rule(FilesystemWrite, "File::create(", Substring),
    rule(FilesystemWrite, "remove_file(", Substring),
    rule(FilesystemWrite, "remove_dir_all(", Substring),
];

/// Label used for findings located in the package manifest.
pub const MANIFEST_LABEL: &str = "<manifest>";

/// Analyze source files and manifest text without executing anything.
pub fn analyze(files: &[SourceFile], manifest: Option<&str>) -> RiskReport {
    let manifest = manifest.filter(|m| !m.trim().is_empty());
    if files.is_empty() && manifest.is_none() {
        return RiskReport {
            level: RiskLevel::Unknown,
            analyzed: false,
            findings: Vec::new(),
        };
    }

    let mut findings = Vec::new();
    let mut seen: HashSet<(RiskCategory, &'static str, String)> = HashSet::new();

    let inputs = files
        .iter()
        .map(|f| (f.path.as_str(), f.content.as_str()))
        .chain(manifest.map(|m| (MANIFEST_LABEL, m)));

    for (path, content) in inputs {
        let style = CommentStyle::for_path(path);
        for (idx, line) in content.lines().enumerate() {
            if style.is_comment_line(line) {
                continue;
            }
            for found in scan_line(line) {
                if seen.insert((found.category, found.pattern, path.to_string())) {
                    findings.push(RiskFinding {
                        category: found.category,
                        pattern: found.pattern.to_string(),
                        file: path.to_string(),
                        line: idx + 1,
                    });
                }
            }
        }
    }

    findings.sort_by(|a, b| (&a.file, a.line, a.category).cmp(&(&b.file, b.line, b.category)));
    let level = RiskLevel::from_findings(true, &findings);

    RiskReport {
        level,
        analyzed: true,
        findings,
    }
}

/// Convenience wrapper returning only the classification.
pub fn classify(files: &[SourceFile], manifest: Option<&str>) -> RiskLevel {
    analyze(files, manifest).level
}

struct LineMatch {
    category: RiskCategory,
    pattern: &'static str,
}

fn scan_line(line: &str) -> Vec<LineMatch> {
    let mut matches = Vec::new();
    for r in RULES {
        let hit = match r.kind {
            Substring => line.contains(r.pattern),
            BareCall => contains_bare_call(line, r.pattern),
        };
        if hit {
            matches.push(LineMatch {
                category: r.category,
                pattern: r.pattern,
            });
        }
    }
    if is_write_open(line) {
        matches.push(LineMatch {
            category: FilesystemWrite,
            pattern: "open(w)",
        });
    }
    matches
}

/// True if `pattern` occurs as a standalone call (not `obj.pattern` or
/// `longer_pattern`). Whitespace between the name and `(` still counts.
fn contains_bare_call(line: &str, pattern: &str) -> bool {
    let name = pattern.trim_end_matches('(');
    let mut start = 0;
    while let Some(pos) = line[start..].find(name) {
        let abs = start + pos;
        let bare = match line[..abs].chars().next_back() {
            None => true,
            Some(c) => !(c.is_alphanumeric() || c == '_' || c == '.' || c == '$'),
        };
        let called = line[abs + name.len()..].trim_start().starts_with('(');
        if bare && called {
            return true;
        }
        start = abs + name.len();
    }
    false
}

/// Python-style `open(path, 'w')` or `mode="a"` writes.
fn is_write_open(line: &str) -> bool {
    if !contains_bare_call(line, "open(") {
        return false;
    }
    const MODES: &[&str] = &[
        ", 'w", ", \"w", ", 'a", ", \"a", ",'w", ",\"w", ",'a", ",\"a", "mode='w", "mode=\"w",
        "mode='a", "mode=\"a", ", 'x", ", \"x",
    ];
    MODES.iter().any(|m| line.contains(m))
}

/// Which full-line comment markers a file uses, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentStyle {
    /// `#` only: Python, shell, TOML, YAML.
    Hash,
    /// `//`, `/* */` and ` * ` block continuations: JS, TS, Rust, Go.
    Slash,
    /// Anything else, including the manifest: `#`, `//` and `/* */`.
    Mixed,
}

impl CommentStyle {
    fn for_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map_or("", |(_, ext)| ext);
        match ext.to_ascii_lowercase().as_str() {
            "py" | "pyw" | "pyi" | "sh" | "bash" | "rb" | "toml" | "yaml" | "yml" | "cfg" => {
                CommentStyle::Hash
            }
            "js" | "mjs" | "cjs" | "jsx" | "ts" | "mts" | "cts" | "tsx" | "rs" | "go" | "java"
            | "kt" | "c" | "cc" | "cpp" | "h" | "cs" | "swift" => CommentStyle::Slash,
            _ => CommentStyle::Mixed,
        }
    }

    /// True only if the whole line is comment text.
    fn is_comment_line(self, line: &str) -> bool {
        let t = line.trim_start();
        let hash = t.starts_with('#');
        let slash = t.starts_with("//") || (t.starts_with("/*") && block_comment_only(t));
        let star = t.starts_with('*') && block_comment_only(t);
        match self {
            CommentStyle::Hash => hash,
            CommentStyle::Slash => slash || star,
            CommentStyle::Mixed => hash || slash,
        }
    }
}

/// A line opening or continuing a block comment hides nothing after `*/`.
fn block_comment_only(line: &str) -> bool {
    match line.find("*/") {
        Some(end) => line[end + 2..].trim().is_empty(),
        None => true,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Source file selection
// ═══════════════════════════════════════════════════════════════════════

/// Decides which repository paths are worth analyzing.
pub struct SourceSelector {
    include: GlobSet,
    exclude: GlobSet,
}

impl SourceSelector {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self, globset::Error> {
        let mut default_excludes = vec![
            "**/node_modules/**".to_string(),
            "**/.git/**".to_string(),
            "**/dist/**".to_string(),
            "**/vendor/**".to_string(),
        ];
        default_excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(&default_excludes)?,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        !self.exclude.is_match(path) && self.include.is_match(path)
    }
}

/// Paths that indicate an automated test suite.
pub fn looks_like_test_path(path: &str) -> bool {
    let p = path.to_lowercase();
    p.starts_with("test/")
        || p.starts_with("tests/")
        || p.contains("/test/")
        || p.contains("/tests/")
        || p.contains("__tests__")
        || p.contains(".test.")
        || p.contains(".spec.")
        || p.rsplit('/').next().is_some_and(|f| f.starts_with("test_"))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(content: &str) -> Vec<SourceFile> {
        vec![SourceFile::new("server.py", content)]
    }

    #[test]
    fn test_no_input_is_unknown() {
        let report = analyze(&[], None);
        assert_eq!(report.level, RiskLevel::Unknown);
        assert!(!report.analyzed);
        assert_eq!(analyze(&[], Some("   ")).level, RiskLevel::Unknown);
    }

    #[test]
    fn test_clean_code_is_safe() {
        let code = "def add(a, b):\n    return a + b\n";
        assert_eq!(classify(&file(code), None), RiskLevel::Safe);
    }

    #[test]
    fn test_eval_is_critical_regardless_of_others() {
        let code = "import subprocess\nsubprocess.run(['ls'])\nrequests.get(u)\nresult = eval(user_input)\n";
        let report = analyze(&file(code), None);
        assert_eq!(report.level, RiskLevel::Critical);
        let cats: HashSet<_> = report.findings.iter().map(|f| f.category).collect();
        assert!(cats.contains(&DynamicEval));
        assert!(cats.contains(&Subprocess));
        assert!(cats.contains(&Network));
    }

    #[test]
    fn test_subprocess_without_eval_is_high() {
        let code = "const { spawn } = require('child_process');\n";
        let files = vec![SourceFile::new("index.js", code)];
        assert_eq!(classify(&files, None), RiskLevel::High);
    }

    #[test]
    fn test_network_or_fs_only_is_moderate() {
        assert_eq!(
            classify(&file("r = requests.get(url)\n"), None),
            RiskLevel::Moderate
        );
        assert_eq!(
            classify(&file("with open(path, 'w') as f:\n    f.write(x)\n"), None),
            RiskLevel::Moderate
        );
        assert_eq!(
            classify(&file("with open(path) as f:\n    data = f.read()\n"), None),
            RiskLevel::Safe
        );
    }

    #[test]
    fn test_bare_call_boundaries() {
        assert!(contains_bare_call("x = eval(y)", "eval("));
        assert!(contains_bare_call("eval(y)", "eval("));
        assert!(!contains_bare_call("x = retrieval(y)", "eval("));
        assert!(!contains_bare_call("pattern.exec(text)", "exec("));
        assert!(!contains_bare_call("re.compile(r'x')", "compile("));
        assert!(contains_bare_call("await fetch(url)", "fetch("));
        assert!(!contains_bare_call("await prefetch(url)", "fetch("));
        assert!(contains_bare_call("x = eval (y)", "eval("));
        assert!(contains_bare_call("exec\t(code)", "exec("));
        assert!(!contains_bare_call("evaluate(y)", "eval("));
        assert!(!contains_bare_call("eval = 3", "eval("));
    }

    #[test]
    fn test_comment_lines_ignored() {
        let code = "# eval(x) is dangerous, we never do it\nprint('ok')\n";
        assert_eq!(classify(&file(code), None), RiskLevel::Safe);

        let js = "// exec(y)\n/* eval(z) */\n/**\n * eval(a) is banned\n */\nconsole.log(1)\n";
        let files = vec![SourceFile::new("index.js", js)];
        assert_eq!(classify(&files, None), RiskLevel::Safe);
    }

    #[test]
    fn test_code_after_comment_markers_is_scanned() {
        let cases = [
            ("index.js", "/* x */ eval(payload)"),
            ("index.js", " * doc */ eval(payload)"),
            ("server.py", "result = eval (payload)"),
            ("server.py", "exec (code)"),
            ("server.py", "*rest, = eval(p)"),
        ];
        for (path, line) in cases {
            let files = vec![SourceFile::new(path, line)];
            assert_eq!(classify(&files, None), RiskLevel::Critical, "{}: {}", path, line);
        }
    }

    #[test]
    fn test_comment_style_by_extension() {
        assert_eq!(CommentStyle::for_path("pkg/server.py"), CommentStyle::Hash);
        assert_eq!(CommentStyle::for_path("src/index.TS"), CommentStyle::Slash);
        assert_eq!(CommentStyle::for_path(MANIFEST_LABEL), CommentStyle::Mixed);
        assert!(!CommentStyle::Hash.is_comment_line("// not a python comment"));
        assert!(!CommentStyle::Slash.is_comment_line("#private = 1"));
        assert!(CommentStyle::Mixed.is_comment_line("  # note"));
    }

    #[test]
    fn test_manifest_eval_is_critical() {
        let manifest = r#"{"scripts": {"postinstall": "node -e \"eval(process.env.PAYLOAD)\""}}"#;
        let report = analyze(&[], Some(manifest));
        assert!(report.analyzed);
        assert_eq!(report.level, RiskLevel::Critical);
        assert_eq!(report.findings[0].file, MANIFEST_LABEL);
    }

    #[test]
    fn test_findings_deduplicated_per_file() {
        let code = "fetch(a)\nfetch(b)\nfetch(c)\n";
        let report = analyze(&file(code), None);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].line, 1);
    }

    #[test]
    fn test_deterministic() {
        let code = "import os\nos.system('rm -rf /tmp/x')\nrequests.post(u)\n";
        assert_eq!(analyze(&file(code), None), analyze(&file(code), None));
    }

    #[test]
    fn test_source_selector() {
        let sel = SourceSelector::new(
            &["**/*.py".to_string(), "**/*.ts".to_string()],
            &["**/docs/**".to_string()],
        )
        .unwrap();
        assert!(sel.is_match("src/server.py"));
        assert!(sel.is_match("index.ts"));
        assert!(!sel.is_match("node_modules/pkg/index.ts"));
        assert!(!sel.is_match("docs/example.py"));
        assert!(!sel.is_match("README.md"));
    }

    #[test]
    fn test_looks_like_test_path() {
        assert!(looks_like_test_path("tests/test_server.py"));
        assert!(looks_like_test_path("src/__tests__/a.ts"));
        assert!(looks_like_test_path("src/index.test.ts"));
        assert!(looks_like_test_path("test_main.py"));
        assert!(!looks_like_test_path("src/server.py"));
    }
}
