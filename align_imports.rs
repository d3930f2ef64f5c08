#!/usr/bin/env rust-script
//! ```cargo
//! [dependencies]
//! anyhow = "1.0"
//! clap = { version = "4.5", features = ["derive"] }
//! figment = { version = "0.10.19", features = ["toml", "env"] }
//! serde = { version = "1.0", features = ["derive"] }
//! serde_json = "1.0"
//! thiserror = "2.0.12"
//! tracing = "0.1.41"
//! tracing-subscriber = "0.3.19"
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, Level};

use classify::Category;
use config::{Settings, TrailingComments};
use host::{Aligner, Document, FileDocument, Language, Outcome};
use sort::SortBy;
use unused::{CommandProvider, JsonReport, UnusedSymbols};

#[derive(Parser, Debug)]
#[command(name = "align-imports")]
#[command(about = "Group and sort the leading import block of JS/TS files", long_about = None)]
struct Cli {
    /// Files to align; defaults to the files changed in the last git commit
    files: Vec<PathBuf>,

    /// Report files whose imports would change without writing them
    #[arg(long)]
    check: bool,

    /// Run the save hook (format, then save) instead of the explicit command
    #[arg(long)]
    on_save: bool,

    /// Settings file (defaults to the nearest .align-imports.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Group order, e.g. "package,scoped,relative"
    #[arg(long, value_enum, value_delimiter = ',')]
    order: Option<Vec<Category>>,

    /// Sort key used inside each group
    #[arg(long, value_enum)]
    sort_by: Option<SortBy>,

    /// Wrap single-line brace imports longer than this
    #[arg(long)]
    max_line_length: Option<usize>,

    /// Do not separate groups with a blank line
    #[arg(long)]
    no_group_spacing: bool,

    /// Never re-wrap long imports
    #[arg(long)]
    no_wrap: bool,

    /// Keep scoped packages in the package group
    #[arg(long)]
    no_scope_group: bool,

    /// What to do with comments after the last import
    #[arg(long, value_enum)]
    trailing_comments: Option<TrailingComments>,

    /// Rewrite the whole file instead of the import region only
    #[arg(long)]
    whole_document: bool,

    /// Drop imports whose bindings are all reported unused
    #[arg(long)]
    remove_unused: bool,

    /// JSON file listing unused symbols
    #[arg(long, conflicts_with = "unused_cmd")]
    unused_report: Option<PathBuf>,

    /// Command printing unused symbols as JSON; the file path is appended
    #[arg(long)]
    unused_cmd: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(order) = &self.order {
            settings.import_order = order.clone();
        }
        if let Some(sort_by) = self.sort_by {
            settings.sort_by = sort_by;
        }
        if let Some(max_line_length) = self.max_line_length {
            settings.max_line_length = max_line_length;
        }
        if let Some(trailing_comments) = self.trailing_comments {
            settings.trailing_comments = trailing_comments;
        }
        if self.no_group_spacing {
            settings.empty_line_between_groups = false;
        }
        if self.no_wrap {
            settings.wrap_multiline_imports = false;
        }
        if self.no_scope_group {
            settings.group_by_scope = false;
        }
        if self.whole_document {
            settings.whole_document = true;
        }
        if self.remove_unused || self.unused_report.is_some() || self.unused_cmd.is_some() {
            settings.remove_unused = true;
        }
    }

    fn unused_provider(&self) -> Option<Box<dyn UnusedSymbols>> {
        if let Some(path) = &self.unused_report {
            return Some(Box::new(JsonReport::new(path)));
        }
        self.unused_cmd
            .as_deref()
            .map(|command| Box::new(CommandProvider::new(command)) as Box<dyn UnusedSymbols>)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }?;
    cli.apply_overrides(&mut settings);
    settings.validate()?;
    debug!("Effective settings: {settings:?}");

    // Get files to process
    let files_to_process = if cli.files.is_empty() {
        let Some(git_root) = git_toplevel()? else {
            bail!("No files given and not in a git repository");
        };
        println!("Git root: {}", git_root.display());

        let changed = get_changed_files(&git_root)?;
        if changed.is_empty() {
            println!("No JS/TS files changed in current commit");
            return Ok(());
        }
        changed
    } else {
        classify_files(&cli.files)
    };

    if files_to_process.is_empty() {
        println!("No JS/TS files to align");
        return Ok(());
    }

    let aligner = Aligner::new(settings, cli.unused_provider());
    let mut misaligned = Vec::new();

    for (file_path, language) in &files_to_process {
        info!("Aligning {} ({})", file_path.display(), language.id());

        let mut document = FileDocument::new(file_path);
        if cli.check {
            document = document.dry_run();
        }

        let outcome = if cli.on_save {
            aligner.on_did_save(&mut document)?
        } else {
            let outcome = aligner.align(&mut document)?;
            if outcome == Outcome::Edited {
                document.save()?;
            }
            outcome
        };

        match outcome {
            Outcome::Edited if cli.check => {
                println!("Imports out of order: {}", file_path.display());
                misaligned.push(file_path.clone());
            }
            Outcome::Edited => println!("Aligned imports in {}", file_path.display()),
            Outcome::Cancelled => println!("Skipped {}: file changed meanwhile", file_path.display()),
            Outcome::NoImports | Outcome::Unchanged | Outcome::Skipped => {
                debug!("{}: {outcome:?}", file_path.display());
            }
        }
    }

    if !misaligned.is_empty() {
        bail!("{} file(s) need their imports aligned", misaligned.len());
    }

    println!("✓ All imports aligned!");
    Ok(())
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, _) => Level::DEBUG,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Root of the enclosing work tree, `None` outside of git.
fn git_toplevel() -> anyhow::Result<Option<PathBuf>> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .context("Failed to run git")?;

    if !output.status.success() {
        return Ok(None);
    }

    let root = String::from_utf8(output.stdout)?;
    Ok(Some(PathBuf::from(root.trim())))
}

fn get_changed_files(git_root: &Path) -> anyhow::Result<Vec<(PathBuf, Language)>> {
    // Deleted files are excluded; renames show up under their new name
    let output = Command::new("git")
        .args(["diff", "--diff-filter=d", "--name-only", "HEAD~1"])
        .current_dir(git_root)
        .output()
        .context("Failed to get changed files")?;

    if !output.status.success() {
        bail!("Failed to get changed files");
    }

    let paths: Vec<PathBuf> = String::from_utf8(output.stdout)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| git_root.join(line))
        .collect();

    Ok(classify_files(&paths))
}

fn classify_files(paths: &[PathBuf]) -> Vec<(PathBuf, Language)> {
    let mut result = Vec::new();

    for path in paths {
        match Language::from_path(path) {
            Some(language) => result.push((path.clone(), language)),
            None => debug!("Ignoring {}: not a JS/TS source", path.display()),
        }
    }

    result
}

mod config {
    use crate::classify::Category;
    use crate::sort::SortBy;
    use figment::{
        providers::{Env, Format, Serialized, Toml},
        Figment,
    };
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};
    use thiserror::Error;
    use tracing::debug;

    pub const CONFIG_FILE: &str = ".align-imports.toml";
    pub const ENV_PREFIX: &str = "ALIGN_IMPORTS_";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
    #[serde(rename_all = "lowercase")]
    pub enum TrailingComments {
        /// Emit them after the last group
        Keep,
        Discard,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Serialization order of the groups
        pub import_order: Vec<Category>,

        pub sort_by: SortBy,

        /// Drop imports the unused-symbol provider reports as unused
        pub remove_unused: bool,

        pub empty_line_between_groups: bool,

        /// Wrap threshold for single-line brace imports
        pub max_line_length: usize,

        /// Keep `@scope/...` packages in their own group
        pub group_by_scope: bool,

        /// Keep comments found above the first import
        pub preserve_leading_comments: bool,

        pub wrap_multiline_imports: bool,

        /// Comments after the last import with nothing to attach to
        pub trailing_comments: TrailingComments,

        /// Rewrite the whole file instead of the import region only
        pub whole_document: bool,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                import_order: vec![Category::Package, Category::Scoped, Category::Relative],
                sort_by: SortBy::Alphabetical,
                remove_unused: false,
                empty_line_between_groups: true,
                max_line_length: 80,
                group_by_scope: true,
                preserve_leading_comments: true,
                wrap_multiline_imports: true,
                trailing_comments: TrailingComments::Keep,
                whole_document: false,
            }
        }
    }

    #[derive(Error, Debug)]
    pub enum ConfigError {
        #[error("Failed to load settings: {0}")]
        Load(#[from] Box<figment::Error>),

        #[error("Settings file '{}' does not exist", .path.display())]
        Missing { path: PathBuf },

        #[error("import_order must list package, scoped and relative exactly once, got {order:?}")]
        ImportOrder { order: Vec<Category> },

        #[error("max_line_length must be greater than zero")]
        MaxLineLength,
    }

    impl Settings {
        /// Load settings from defaults, the nearest settings file and the environment.
        pub fn load() -> Result<Self, ConfigError> {
            let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));

            if let Some(path) = Self::find_config_file() {
                debug!("Using settings from {}", path.display());
                figment = figment.merge(Toml::file(path));
            }

            Self::extract(figment)
        }

        /// Load settings from a specific file.
        pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
            let path = path.as_ref();
            if !path.is_file() {
                return Err(ConfigError::Missing {
                    path: path.to_path_buf(),
                });
            }

            Self::extract(
                Figment::new()
                    .merge(Serialized::defaults(Settings::default()))
                    .merge(Toml::file(path)),
            )
        }

        fn extract(figment: Figment) -> Result<Self, ConfigError> {
            // ALIGN_IMPORTS_MAX_LINE_LENGTH=100 sets max_line_length
            let settings: Settings = figment
                .merge(Env::prefixed(ENV_PREFIX))
                .extract()
                .map_err(Box::new)?;
            settings.validate()?;
            Ok(settings)
        }

        /// Walks up from the current directory looking for the settings file
        fn find_config_file() -> Option<PathBuf> {
            let current = std::env::current_dir().ok()?;

            current
                .ancestors()
                .map(|dir| dir.join(CONFIG_FILE))
                .find(|candidate| candidate.is_file())
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            let is_permutation = self.import_order.len() == 3
                && [Category::Package, Category::Scoped, Category::Relative]
                    .iter()
                    .all(|category| self.import_order.contains(category));
            if !is_permutation {
                return Err(ConfigError::ImportOrder {
                    order: self.import_order.clone(),
                });
            }

            if self.max_line_length == 0 {
                return Err(ConfigError::MaxLineLength);
            }

            Ok(())
        }
    }

}

mod scanner {
    //! Finds the contiguous import block at the top of a source file.
    //!
    //! The scan is a small line-oriented state machine: plain code, inside a
    //! block comment, or inside an import statement whose braces have not
    //! balanced yet.

    /// Byte span of the leading import block.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ImportRegion {
        /// Offset of the first import line
        pub start: usize,
        /// Offset just past the last import statement, line break excluded
        pub end: usize,
        pub text: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ScanState {
        Code,
        BlockComment,
        Import { depth: i32 },
    }

    pub fn find_region(text: &str) -> Option<ImportRegion> {
        let mut state = ScanState::Code;
        let mut start = None;
        let mut end = 0;
        let mut offset = 0;

        for (index, line) in text.split_inclusive('\n').enumerate() {
            let line_start = offset;
            offset += line.len();
            let content = line.trim_end_matches(['\n', '\r']);
            let line_end = line_start + content.len();
            let trimmed = content.trim();

            state = match state {
                ScanState::BlockComment => match trimmed.split_once("*/") {
                    Some((_, rest)) if !is_blank_or_comment(rest.trim()) => break,
                    Some(_) => ScanState::Code,
                    None => ScanState::BlockComment,
                },
                ScanState::Import { depth } => {
                    end = line_end;
                    statement_state(depth + brace_delta(trimmed), trimmed)
                }
                ScanState::Code if is_blank_or_comment(trimmed) => {
                    if opens_block_comment(trimmed) {
                        ScanState::BlockComment
                    } else {
                        ScanState::Code
                    }
                }
                ScanState::Code if is_import_line(trimmed) => {
                    start.get_or_insert(line_start);
                    end = line_end;
                    statement_state(brace_delta(trimmed), trimmed)
                }
                ScanState::Code if start.is_none() && is_prologue_line(index, trimmed) => {
                    ScanState::Code
                }
                ScanState::Code => break,
            };
        }

        let start = start?;
        Some(ImportRegion {
            start,
            end,
            text: text[start..end].to_string(),
        })
    }

    fn statement_state(depth: i32, trimmed: &str) -> ScanState {
        if closes_statement(depth, trimmed) {
            ScanState::Code
        } else {
            ScanState::Import { depth }
        }
    }

    /// `import` followed by a clause, a specifier or nothing. Dynamic
    /// `import(...)` calls are code.
    pub fn is_import_line(trimmed: &str) -> bool {
        trimmed.strip_prefix("import").is_some_and(|rest| {
            rest.is_empty()
                || rest.starts_with(|c: char| c.is_whitespace() || matches!(c, '{' | '*' | '"' | '\''))
        })
    }

    pub fn opens_block_comment(trimmed: &str) -> bool {
        trimmed.starts_with("/*") && !trimmed[2..].contains("*/")
    }

    /// A line holding only comments. `/* note */ const x = 1;` is code.
    pub fn is_comment_line(trimmed: &str) -> bool {
        if trimmed.starts_with("//") {
            return true;
        }
        match trimmed.strip_prefix("/*") {
            Some(body) => match body.split_once("*/") {
                Some((_, rest)) => is_blank_or_comment(rest.trim()),
                None => true,
            },
            None => false,
        }
    }

    fn is_blank_or_comment(trimmed: &str) -> bool {
        trimmed.is_empty() || is_comment_line(trimmed)
    }

    /// End of the comment lines directly below the import region, up to the
    /// first blank or code line. Returns `end` when there are none.
    pub fn trailing_comments_end(text: &str, end: usize) -> usize {
        // Skip the line break closing the last import
        let Some(first) = text[end..].find('\n').map(|index| end + index + 1) else {
            return end;
        };

        let mut tail = end;
        let mut in_block_comment = false;
        let mut offset = first;

        for line in text[first..].split_inclusive('\n') {
            let line_start = offset;
            offset += line.len();
            let content = line.trim_end_matches(['\n', '\r']);
            let trimmed = content.trim();

            if in_block_comment {
                match trimmed.split_once("*/") {
                    Some((_, rest)) if !is_blank_or_comment(rest.trim()) => break,
                    Some(_) => in_block_comment = false,
                    None => {}
                }
            } else if is_comment_line(trimmed) {
                in_block_comment = opens_block_comment(trimmed);
            } else {
                break;
            }

            if !in_block_comment {
                tail = line_start + content.len();
            }
        }

        tail
    }

    /// Net `{` minus `}` outside string literals and trailing comments.
    pub fn brace_delta(line: &str) -> i32 {
        let mut quote = None;
        let mut depth = 0;

        for c in code_part(line).chars() {
            match quote {
                Some(open) => {
                    if c == open {
                        quote = None;
                    }
                }
                None => match c {
                    '"' | '\'' | '`' => quote = Some(c),
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                },
            }
        }

        depth
    }

    /// Semicolons are optional, so a line ending in the module specifier
    /// terminates the statement as well.
    pub fn closes_statement(depth: i32, line: &str) -> bool {
        let code = code_part(line);
        depth <= 0 && (code.contains(';') || code.ends_with(['"', '\'', '`']))
    }

    fn code_part(line: &str) -> &str {
        let mut quote = None;
        let mut previous = '\0';

        for (index, c) in line.char_indices() {
            match quote {
                Some(open) if c == open => quote = None,
                Some(_) => {}
                None if matches!(c, '"' | '\'' | '`') => quote = Some(c),
                None if c == '/' && previous == '/' => return line[..index - 1].trim_end(),
                None => {}
            }
            previous = c;
        }

        line
    }

    fn is_prologue_line(index: usize, trimmed: &str) -> bool {
        (index == 0 && trimmed.starts_with("#!")) || is_directive(trimmed)
    }

    fn is_directive(trimmed: &str) -> bool {
        let body = trimmed.trim_end_matches(';').trim_end();
        body.len() >= 2
            && ['"', '\''].into_iter().any(|quote| {
                body.starts_with(quote)
                    && body.ends_with(quote)
                    && !body[1..body.len() - 1].contains(quote)
            })
    }

}

mod parser {
    use crate::scanner;

    /// One logical import statement, possibly spanning several lines.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ImportRecord {
        /// Source lines exactly as written
        pub raw_lines: Vec<String>,
        /// Whitespace-collapsed single-line form, only used for comparison
        pub normalized: String,
        pub leading_comments: Vec<String>,
        /// First and last line, 0-based and inclusive
        pub span: (usize, usize),
    }

    impl ImportRecord {
        pub fn raw_text(&self) -> String {
            self.raw_lines.join("\n")
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum HeaderLine {
        Comment(String),
        /// Shebang, directive or other code ahead of the first import
        Code(String),
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ParsedImports {
        pub preamble: Vec<HeaderLine>,
        pub records: Vec<ImportRecord>,
        /// Comments after the last import
        pub trailing_comments: Vec<String>,
    }

    struct Statement {
        start: usize,
        lines: Vec<String>,
        pieces: Vec<String>,
        depth: i32,
        closed: bool,
        comments: Vec<String>,
    }

    impl Statement {
        fn open(start: usize, line: &str, comments: Vec<String>) -> Self {
            let mut statement = Statement {
                start,
                lines: Vec::new(),
                pieces: Vec::new(),
                depth: 0,
                closed: false,
                comments,
            };
            statement.push(line);
            statement
        }

        fn push(&mut self, line: &str) {
            let trimmed = line.trim();
            self.depth += scanner::brace_delta(trimmed);
            self.closed = scanner::closes_statement(self.depth, trimmed);
            self.lines.push(line.to_string());
            if !trimmed.is_empty() {
                self.pieces.push(trimmed.to_string());
            }
        }

        fn finish(self) -> ImportRecord {
            let end = self.start + self.lines.len() - 1;
            ImportRecord {
                normalized: normalize(&self.pieces.join(" ")),
                raw_lines: self.lines,
                leading_comments: self.comments,
                span: (self.start, end),
            }
        }
    }

    pub fn parse(text: &str) -> ParsedImports {
        let mut parsed = ParsedImports::default();
        let mut pending_comments = Vec::new();
        let mut current: Option<Statement> = None;
        let mut in_block_comment = false;

        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();

            if let Some(mut statement) = current.take() {
                statement.push(line);
                if statement.closed {
                    parsed.records.push(statement.finish());
                } else {
                    current = Some(statement);
                }
                continue;
            }

            if in_block_comment {
                pending_comments.push(line.to_string());
                in_block_comment = !trimmed.contains("*/");
                continue;
            }

            if trimmed.is_empty() {
                continue;
            }

            if scanner::is_comment_line(trimmed) {
                in_block_comment = scanner::opens_block_comment(trimmed);
                pending_comments.push(line.to_string());
                continue;
            }

            if scanner::is_import_line(trimmed) {
                let mut comments = std::mem::take(&mut pending_comments);
                if parsed.records.is_empty() {
                    // Comments above the first import float with the file header
                    parsed
                        .preamble
                        .extend(comments.drain(..).map(HeaderLine::Comment));
                }

                let statement = Statement::open(index, line, comments);
                if statement.closed {
                    parsed.records.push(statement.finish());
                } else {
                    current = Some(statement);
                }
                continue;
            }

            if !parsed.records.is_empty() {
                break;
            }
            parsed
                .preamble
                .extend(pending_comments.drain(..).map(HeaderLine::Comment));
            parsed.preamble.push(HeaderLine::Code(line.to_string()));
        }

        // An unbalanced statement at end of input is kept as written
        if let Some(statement) = current {
            parsed.records.push(statement.finish());
        }

        if parsed.records.is_empty() {
            parsed
                .preamble
                .extend(pending_comments.into_iter().map(HeaderLine::Comment));
        } else {
            parsed.trailing_comments = pending_comments;
        }

        parsed
    }

    /// Collapses whitespace and canonicalises spacing around braces and
    /// commas, so a wrapped statement compares equal to its one-line form.
    pub fn normalize(statement: &str) -> String {
        let mut out = String::with_capacity(statement.len());
        let mut quote: Option<char> = None;

        for c in statement.chars() {
            if let Some(open) = quote {
                out.push(c);
                if c == open {
                    quote = None;
                }
                continue;
            }

            match c {
                c if c.is_whitespace() => {
                    if !out.is_empty() && !out.ends_with(' ') {
                        out.push(' ');
                    }
                }
                ',' => {
                    trim_trailing_space(&mut out);
                    out.push(',');
                }
                '}' => {
                    trim_trailing_space(&mut out);
                    if out.ends_with(',') {
                        out.pop();
                    }
                    out.push_str(" }");
                }
                _ => {
                    if out.ends_with(['{', ',', '}']) {
                        out.push(' ');
                    }
                    if matches!(c, '"' | '\'' | '`') {
                        quote = Some(c);
                    }
                    out.push(c);
                }
            }
        }

        trim_trailing_space(&mut out);
        out
    }

    fn trim_trailing_space(text: &mut String) {
        while text.ends_with(' ') {
            text.pop();
        }
    }

}

mod classify {
    use crate::parser::ImportRecord;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        clap::ValueEnum,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum Category {
        /// Bare module specifiers
        Package,
        /// `@scope/name`
        Scoped,
        /// `./` and `../`
        Relative,
    }

    /// The quoted module specifier of a normalized statement.
    pub fn specifier(normalized: &str) -> Option<&str> {
        let tail = match normalized.rfind(" from ") {
            Some(index) => &normalized[index + " from ".len()..],
            None => normalized.strip_prefix("import")?,
        }
        .trim_start();

        let quote = tail.chars().next().filter(|c| matches!(c, '"' | '\'' | '`'))?;
        let body = &tail[1..];
        body.find(quote).map(|end| &body[..end])
    }

    pub fn classify(normalized: &str) -> Category {
        // Falls back to the whole statement when no specifier can be found
        let target = specifier(normalized).unwrap_or(normalized);

        if target.contains('@') {
            Category::Scoped
        } else if target.contains("./") || target.contains("../") {
            Category::Relative
        } else {
            Category::Package
        }
    }

    /// Splits records into buckets. Without `group_by_scope`, scoped
    /// packages share the package bucket.
    pub fn partition(
        records: Vec<ImportRecord>,
        group_by_scope: bool,
    ) -> BTreeMap<Category, Vec<ImportRecord>> {
        let mut buckets: BTreeMap<Category, Vec<ImportRecord>> = BTreeMap::new();

        for record in records {
            let category = match classify(&record.normalized) {
                Category::Scoped if !group_by_scope => Category::Package,
                category => category,
            };
            buckets.entry(category).or_default().push(record);
        }

        buckets
    }

}

mod sort {
    use crate::parser::ImportRecord;
    use serde::{Deserialize, Serialize};
    use std::cmp::Reverse;

    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
    )]
    #[serde(rename_all = "kebab-case")]
    pub enum SortBy {
        #[default]
        Alphabetical,
        LengthAsc,
        LengthDesc,
    }

    /// Stable: records with equal keys keep their input order.
    pub fn sort_bucket(records: &mut [ImportRecord], sort_by: SortBy) {
        match sort_by {
            // Case-insensitive first, then case breaks the tie
            SortBy::Alphabetical => records
                .sort_by_cached_key(|record| (record.normalized.to_lowercase(), record.normalized.clone())),
            SortBy::LengthAsc => records.sort_by_key(|record| record.normalized.chars().count()),
            SortBy::LengthDesc => {
                records.sort_by_key(|record| Reverse(record.normalized.chars().count()))
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse;

        fn sorted(input: &str, sort_by: SortBy) -> Vec<String> {
            let mut records = parse(input).records;
            sort_bucket(&mut records, sort_by);
            records.iter().map(ImportRecord::raw_text).collect()
        }

        #[test]
        fn test_alphabetical() {
            let result = sorted(
                r#"import z from "z";
import Beta from "beta";
import alpha from "alpha";"#,
                SortBy::Alphabetical,
            );

            assert_eq!(
                result,
                vec![
                    r#"import alpha from "alpha";"#,
                    r#"import Beta from "beta";"#,
                    r#"import z from "z";"#,
                ]
            );
        }

        #[test]
        fn test_length_ascending_is_stable() {
            let result = sorted(
                r#"import b from "b";
import long from "long";
import a from "a";"#,
                SortBy::LengthAsc,
            );

            assert_eq!(
                result,
                vec![
                    r#"import b from "b";"#,
                    r#"import a from "a";"#,
                    r#"import long from "long";"#,
                ]
            );
        }

        #[test]
        fn test_length_descending_is_stable() {
            let result = sorted(
                r#"import b from "b";
import a from "a";
import long from "long";"#,
                SortBy::LengthDesc,
            );

            assert_eq!(
                result,
                vec![
                    r#"import long from "long";"#,
                    r#"import b from "b";"#,
                    r#"import a from "a";"#,
                ]
            );
        }

        #[test]
        fn test_wrapped_and_single_line_share_length() {
            let result = sorted(
                r#"import {
  ab,
  cd
} from "x";
import { abc } from "x";"#,
                SortBy::LengthAsc,
            );

            assert_eq!(result[0], r#"import { abc } from "x";"#);
        }

        #[test]
        fn test_empty_bucket() {
            let mut records = Vec::new();
            sort_bucket(&mut records, SortBy::Alphabetical);
            assert!(records.is_empty());
        }
    }
}

mod unused {
    use crate::classify;
    use crate::parser::ImportRecord;
    use serde::Deserialize;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::process::{Command, ExitStatus};
    use thiserror::Error;

    /// Source of symbols an external linter considers unused.
    pub trait UnusedSymbols {
        fn unused_symbols(&self, document: &str) -> Result<Vec<String>, ProviderError>;
    }

    #[derive(Error, Debug)]
    pub enum ProviderError {
        #[error("Failed to read unused-symbol report '{}': {source}", .path.display())]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },

        #[error("Failed to run '{command}': {source}")]
        Spawn {
            command: String,
            source: std::io::Error,
        },

        #[error("'{command}' exited with {status}")]
        Failed { command: String, status: ExitStatus },

        #[error("Malformed unused-symbol report: {0}")]
        Malformed(#[from] serde_json::Error),

        #[error("Unused-symbol provider unavailable: {0}")]
        Unavailable(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Report {
        Symbols(Vec<String>),
        Wrapped { unused: Vec<String> },
    }

    /// Accepts `["a", "b"]` or `{"unused": ["a", "b"]}`.
    pub fn parse_report(bytes: &[u8]) -> Result<Vec<String>, ProviderError> {
        let report: Report = serde_json::from_slice(bytes)?;
        Ok(match report {
            Report::Symbols(symbols) => symbols,
            Report::Wrapped { unused } => unused,
        })
    }

    /// A report written ahead of time by a linter run.
    pub struct JsonReport {
        path: PathBuf,
    }

    impl JsonReport {
        pub fn new(path: impl AsRef<Path>) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
            }
        }
    }

    impl UnusedSymbols for JsonReport {
        fn unused_symbols(&self, _document: &str) -> Result<Vec<String>, ProviderError> {
            let bytes = std::fs::read(&self.path).map_err(|source| ProviderError::Read {
                path: self.path.clone(),
                source,
            })?;
            parse_report(&bytes)
        }
    }

    /// Runs a command with the document path appended and reads the
    /// report from its stdout.
    pub struct CommandProvider {
        program: String,
        args: Vec<String>,
    }

    impl CommandProvider {
        pub fn new(command_line: &str) -> Self {
            let mut parts = command_line.split_whitespace().map(str::to_string);
            Self {
                program: parts.next().unwrap_or_default(),
                args: parts.collect(),
            }
        }
    }

    impl UnusedSymbols for CommandProvider {
        fn unused_symbols(&self, document: &str) -> Result<Vec<String>, ProviderError> {
            if self.program.is_empty() {
                return Err(ProviderError::Unavailable("empty command".to_string()));
            }

            let output = Command::new(&self.program)
                .args(&self.args)
                .arg(document)
                .output()
                .map_err(|source| ProviderError::Spawn {
                    command: self.program.clone(),
                    source,
                })?;

            if !output.status.success() {
                return Err(ProviderError::Failed {
                    command: self.program.clone(),
                    status: output.status,
                });
            }

            parse_report(&output.stdout)
        }
    }

    /// Local names an import statement introduces.
    pub fn bindings(normalized: &str) -> Vec<String> {
        let Some(clause) = normalized.strip_prefix("import ") else {
            return Vec::new();
        };
        let clause = clause.strip_prefix("type ").unwrap_or(clause);
        // Side-effect imports bind nothing
        let Some(from) = clause.rfind(" from ") else {
            return Vec::new();
        };
        let clause = clause[..from].trim();

        let (head, named) = match (clause.find('{'), clause.rfind('}')) {
            (Some(open), Some(close)) if open < close => (
                format!("{}{}", &clause[..open], &clause[close + 1..]),
                Some(&clause[open + 1..close]),
            ),
            _ => (clause.to_string(), None),
        };

        let mut names = Vec::new();

        for part in head.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            match part.strip_prefix('*') {
                Some(namespace) => {
                    if let Some(name) = namespace.trim().strip_prefix("as ") {
                        names.push(name.trim().to_string());
                    }
                }
                None => names.push(part.to_string()),
            }
        }

        for member in named
            .into_iter()
            .flat_map(|named| named.split(','))
            .map(str::trim)
            .filter(|member| !member.is_empty())
        {
            let member = member.strip_prefix("type ").unwrap_or(member);
            if let Some(local) = member.rsplit(" as ").next() {
                names.push(local.trim().to_string());
            }
        }

        names
    }

    fn is_unused(record: &ImportRecord, unused: &HashSet<String>) -> bool {
        let names = bindings(&record.normalized);
        if names.is_empty() {
            return false;
        }
        if names.iter().all(|name| unused.contains(name)) {
            return true;
        }

        // Linters sometimes report the module rather than its lone binding
        names.len() == 1
            && classify::specifier(&record.normalized).is_some_and(|module| unused.contains(module))
    }

    /// Returns the records to keep and the number dropped.
    pub fn prune(records: Vec<ImportRecord>, unused: &HashSet<String>) -> (Vec<ImportRecord>, usize) {
        let before = records.len();
        let kept: Vec<ImportRecord> = records
            .into_iter()
            .filter(|record| !is_unused(record, unused))
            .collect();
        let removed = before - kept.len();
        (kept, removed)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse;
        use std::fs;
        use tempfile::TempDir;

        fn symbols(names: &[&str]) -> HashSet<String> {
            names.iter().map(|name| name.to_string()).collect()
        }

        #[test]
        fn test_bindings() {
            assert_eq!(bindings(r#"import React from "react";"#), vec!["React"]);
            assert_eq!(
                bindings(r#"import React, { useState, useEffect as effect } from "react";"#),
                vec!["React", "useState", "effect"]
            );
            assert_eq!(bindings(r#"import * as path from "path";"#), vec!["path"]);
            assert_eq!(bindings(r#"import def, * as ns from "mod";"#), vec!["def", "ns"]);
            assert_eq!(
                bindings(r#"import type { Props, type State } from "./types";"#),
                vec!["Props", "State"]
            );
            assert!(bindings(r#"import "./polyfill";"#).is_empty());
        }

        #[test]
        fn test_prune_removes_unused_import() {
            let parsed = parse(
                r#"import lodash from "lodash";
import React from "react";"#,
            );

            let (kept, removed) = prune(parsed.records, &symbols(&["lodash"]));
            assert_eq!(removed, 1);
            assert_eq!(kept.len(), 1);
            assert_eq!(kept[0].raw_text(), r#"import React from "react";"#);
        }

        #[test]
        fn test_prune_by_module_name() {
            let parsed = parse(r#"import _ from "lodash";"#);

            let (kept, removed) = prune(parsed.records, &symbols(&["lodash"]));
            assert_eq!(removed, 1);
            assert!(kept.is_empty());
        }

        #[test]
        fn test_prune_keeps_partially_used() {
            let parsed = parse(
                r#"import { a, b } from "ab";
import "./side-effect";"#,
            );

            let (kept, removed) = prune(parsed.records, &symbols(&["a", "./side-effect"]));
            assert_eq!(removed, 0);
            assert_eq!(kept.len(), 2);
        }

        #[test]
        fn test_parse_report_shapes() {
            assert_eq!(parse_report(br#"["a", "b"]"#).unwrap(), vec!["a", "b"]);
            assert_eq!(
                parse_report(br#"{"unused": ["lodash"]}"#).unwrap(),
                vec!["lodash"]
            );
            assert!(matches!(
                parse_report(b""),
                Err(ProviderError::Malformed(_))
            ));
        }

        #[test]
        fn test_json_report() {
            let temp_dir = TempDir::new().unwrap();
            let report_path = temp_dir.path().join("unused.json");
            fs::write(&report_path, r#"{"unused": ["lodash"]}"#).unwrap();

            let provider = JsonReport::new(&report_path);
            assert_eq!(provider.unused_symbols("src/app.ts").unwrap(), vec!["lodash"]);

            let missing = JsonReport::new(temp_dir.path().join("missing.json"));
            assert!(matches!(
                missing.unused_symbols("src/app.ts"),
                Err(ProviderError::Read { .. })
            ));
        }

        #[test]
        fn test_command_provider() {
            let temp_dir = TempDir::new().unwrap();
            let report_path = temp_dir.path().join("report.json");
            fs::write(&report_path, r#"["unusedThing"]"#).unwrap();

            // `cat <path>` echoes the report back
            let provider = CommandProvider::new("cat");
            let result = provider.unused_symbols(report_path.to_str().unwrap());
            assert_eq!(result.unwrap(), vec!["unusedThing"]);
        }

        #[test]
        fn test_command_provider_failures() {
            assert!(matches!(
                CommandProvider::new("   ").unused_symbols("a.ts"),
                Err(ProviderError::Unavailable(_))
            ));
            assert!(matches!(
                CommandProvider::new("definitely-not-a-real-linter-binary").unused_symbols("a.ts"),
                Err(ProviderError::Spawn { .. })
            ));
        }
    }
}

mod render {
    use crate::classify::Category;
    use crate::config::{Settings, TrailingComments};
    use crate::parser::{HeaderLine, ImportRecord, ParsedImports};
    use std::collections::{BTreeMap, HashSet};
    use tracing::debug;

    const WRAP_INDENT: &str = "  ";

    pub fn render(
        parsed: &ParsedImports,
        buckets: &BTreeMap<Category, Vec<ImportRecord>>,
        settings: &Settings,
    ) -> String {
        let mut lines: Vec<String> = Vec::new();

        for line in &parsed.preamble {
            match line {
                HeaderLine::Comment(_) if !settings.preserve_leading_comments => {}
                HeaderLine::Comment(text) | HeaderLine::Code(text) => lines.push(text.clone()),
            }
        }

        for category in &settings.import_order {
            let Some(records) = buckets.get(category).filter(|records| !records.is_empty()) else {
                continue;
            };

            if settings.empty_line_between_groups && !lines.is_empty() {
                lines.push(String::new());
            }

            let mut seen = HashSet::new();
            for record in records {
                if !seen.insert(record.raw_text()) {
                    debug!("Dropping duplicate import on line {}", record.span.0 + 1);
                    continue;
                }

                lines.extend(record.leading_comments.iter().cloned());
                match wrap(record, settings) {
                    Some(wrapped) => lines.extend(wrapped),
                    None => lines.extend(record.raw_lines.iter().cloned()),
                }
            }
        }

        if settings.trailing_comments == TrailingComments::Keep {
            lines.extend(parsed.trailing_comments.iter().cloned());
        }

        lines.join("\n")
    }

    /// Splits a long single-line `{ a, b }` import into one member per line.
    fn wrap(record: &ImportRecord, settings: &Settings) -> Option<Vec<String>> {
        if !settings.wrap_multiline_imports {
            return None;
        }

        let [line] = record.raw_lines.as_slice() else {
            return None;
        };
        if line.chars().count() <= settings.max_line_length {
            return None;
        }
        if line.matches('{').count() != 1 || line.matches('}').count() != 1 {
            return None;
        }

        let open = line.find('{')?;
        let close = line.find('}')?;
        if close < open {
            return None;
        }

        let members: Vec<&str> = line[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|member| !member.is_empty())
            .collect();
        if members.is_empty() {
            return None;
        }

        let mut wrapped = vec![line[..=open].trim_end().to_string()];
        let last = members.len() - 1;
        for (index, member) in members.iter().enumerate() {
            let separator = if index < last { "," } else { "" };
            wrapped.push(format!("{WRAP_INDENT}{member}{separator}"));
        }
        wrapped.push(format!("}}{}", line[close + 1..].trim_end()));

        Some(wrapped)
    }

}

mod align {
    //! The full pipeline from document text to a single replacement edit.

    use crate::config::Settings;
    use crate::scanner::ImportRegion;
    use crate::{classify, parser, render, scanner, sort, unused};
    use std::collections::HashSet;
    use tracing::debug;

    /// Replace `text[start..end]` with `text`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Edit {
        pub start: usize,
        pub end: usize,
        pub text: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Formatted {
        Unchanged,
        Edit(Edit),
    }

    pub fn format_region(
        text: &str,
        region: &ImportRegion,
        settings: &Settings,
        unused_symbols: &HashSet<String>,
    ) -> Formatted {
        let newline = line_ending(text);

        let (start, parsed_end) = if settings.whole_document {
            (0, scanner::trailing_comments_end(text, region.end))
        } else {
            (region.start, region.end)
        };
        let mut parsed = if settings.whole_document {
            parser::parse(&text[..parsed_end])
        } else {
            parser::parse(&region.text)
        };
        debug!(
            "Import region {}..{} holds {} statements",
            region.start,
            region.end,
            parsed.records.len()
        );

        let mut records = std::mem::take(&mut parsed.records);
        if !unused_symbols.is_empty() {
            let (kept, removed) = unused::prune(records, unused_symbols);
            debug!("Removed {removed} unused imports");
            records = kept;
        }

        let mut buckets = classify::partition(records, settings.group_by_scope);
        for records in buckets.values_mut() {
            sort::sort_bucket(records, settings.sort_by);
        }

        let rendered = render::render(&parsed, &buckets, settings);
        let rendered = if newline == "\n" {
            rendered
        } else {
            rendered.replace('\n', newline)
        };

        let rest = &text[parsed_end..];
        let (end, replacement) = if settings.whole_document {
            let rest = trim_blank_tail(rest);
            let rest = if rendered.is_empty() {
                rest.trim_start_matches(['\n', '\r'])
            } else {
                rest
            };
            (text.len(), format!("{rendered}{rest}{newline}"))
        } else if rendered.is_empty() {
            // Nothing left to emit, so the blank lines after the block go too
            let skipped = rest.len() - rest.trim_start_matches(['\n', '\r']).len();
            (parsed_end + skipped, rendered)
        } else {
            (parsed_end, rendered)
        };

        if text[start..end] == replacement {
            return Formatted::Unchanged;
        }

        Formatted::Edit(Edit {
            start,
            end,
            text: replacement,
        })
    }

    /// `\r\n` when the first line of the document ends with it.
    fn line_ending(text: &str) -> &'static str {
        match text.find('\n') {
            Some(index) if text[..index].ends_with('\r') => "\r\n",
            _ => "\n",
        }
    }

    /// Drops trailing blank lines, keeping whitespace on the last code line.
    fn trim_blank_tail(text: &str) -> &str {
        let mut text = text.trim_end_matches(['\n', '\r']);
        loop {
            let last_line = text.rfind('\n').map_or(0, |index| index + 1);
            if text.is_empty() || !text[last_line..].trim().is_empty() {
                return text;
            }
            text = text[..last_line].trim_end_matches(['\n', '\r']);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::TrailingComments;

        fn format_text(
            text: &str,
            settings: &Settings,
            unused_symbols: &HashSet<String>,
        ) -> Option<Formatted> {
            let region = scanner::find_region(text)?;
            Some(format_region(text, &region, settings, unused_symbols))
        }

        fn align_text(text: &str, settings: &Settings, unused_symbols: &[&str]) -> String {
            let unused_symbols = unused_symbols.iter().map(|s| s.to_string()).collect();
            match format_text(text, settings, &unused_symbols) {
                Some(Formatted::Edit(edit)) => {
                    let mut result = text.to_string();
                    result.replace_range(edit.start..edit.end, &edit.text);
                    result
                }
                Some(Formatted::Unchanged) | None => text.to_string(),
            }
        }

        #[test]
        fn test_default_grouping() {
            let input = r#"import z from "z";
import a from "a";
import b from "@scope/b";
import c from "./c";

console.log(z, a, b, c);
"#;

            let expected = r#"import a from "a";
import z from "z";

import b from "@scope/b";

import c from "./c";

console.log(z, a, b, c);
"#;

            assert_eq!(align_text(input, &Settings::default(), &[]), expected);
        }

        #[test]
        fn test_idempotent() {
            let input = r#"// app entry
import { render } from "react-dom";
import { alpha, beta, gamma, delta, epsilon, zeta, eta, theta } from "./letters";
import React from "react";
// styles
import "./app.css";
import type { Props } from "@app/types";

render(React.createElement("div"), document.body);
"#;

            let settings = Settings::default();
            let once = align_text(input, &settings, &[]);
            let twice = align_text(&once, &settings, &[]);

            assert_ne!(once, input);
            assert_eq!(once, twice);
            assert_eq!(
                format_text(&once, &settings, &HashSet::new()),
                Some(Formatted::Unchanged)
            );
        }

        #[test]
        fn test_idempotent_when_sorting_by_length() {
            let input = r#"import { alpha, beta, gamma } from "./letters";
import { b } from "./b";
import { abcdefghijklmnopqrstuvwxyz } from "./c";
"#;

            let settings = Settings {
                sort_by: crate::sort::SortBy::LengthAsc,
                max_line_length: 40,
                ..Settings::default()
            };
            let once = align_text(input, &settings, &[]);
            let twice = align_text(&once, &settings, &[]);

            assert_eq!(once, twice);
        }

        #[test]
        fn test_no_region_no_edit() {
            let input = "const x = require(\"x\");\n";
            assert_eq!(
                format_text(input, &Settings::default(), &HashSet::new()),
                None
            );
        }

        #[test]
        fn test_already_aligned() {
            let input = "import a from \"a\";\n\nimport b from \"./b\";\n";
            assert_eq!(
                format_text(input, &Settings::default(), &HashSet::new()),
                Some(Formatted::Unchanged)
            );
        }

        #[test]
        fn test_code_after_region_untouched() {
            let input = r#"import b from "b";
import a from "a";
// trailing note
const late = "import z from 'z';";
"#;

            let expected = r#"import a from "a";
import b from "b";
// trailing note
const late = "import z from 'z';";
"#;

            assert_eq!(align_text(input, &Settings::default(), &[]), expected);
        }

        #[test]
        fn test_remove_unused() {
            let input = r#"import React from "react";
import lodash from "lodash";

export const App = () => React;
"#;

            let settings = Settings {
                remove_unused: true,
                ..Settings::default()
            };

            let expected = r#"import React from "react";

export const App = () => React;
"#;

            assert_eq!(align_text(input, &settings, &["lodash"]), expected);
        }

        #[test]
        fn test_whole_document() {
            let input = "// License\n\nimport z from \"z\";\nimport a from \"a\";\n\n\nexport const x = 1;\n\n\n";

            let settings = Settings {
                whole_document: true,
                ..Settings::default()
            };

            let expected = "// License\n\nimport a from \"a\";\nimport z from \"z\";\n\n\nexport const x = 1;\n";

            let once = align_text(input, &settings, &[]);
            assert_eq!(once, expected);
            assert_eq!(align_text(&once, &settings, &[]), expected);
        }

        #[test]
        fn test_code_between_imports_is_not_moved() {
            let input = r#"import b from "b";
/* note */ const x = 1;
import a from "a";
"#;

            assert_eq!(align_text(input, &Settings::default(), &[]), input);
        }

        #[test]
        fn test_whole_document_trailing_comments() {
            let input = r#"import b from "b";
import a from "a";
// dangling
run();
"#;

            let keep = Settings {
                whole_document: true,
                ..Settings::default()
            };
            let kept = r#"import a from "a";
import b from "b";
// dangling
run();
"#;
            assert_eq!(align_text(input, &keep, &[]), kept);

            let discard = Settings {
                trailing_comments: TrailingComments::Discard,
                ..keep
            };
            let dropped = r#"import a from "a";
import b from "b";
run();
"#;
            assert_eq!(align_text(input, &discard, &[]), dropped);
            assert_eq!(align_text(dropped, &discard, &[]), dropped);
        }

        #[test]
        fn test_separated_comment_stays_with_code() {
            let input = r#"import a from "a";

// entry point
run();
"#;

            let settings = Settings {
                whole_document: true,
                trailing_comments: TrailingComments::Discard,
                ..Settings::default()
            };
            assert_eq!(align_text(input, &settings, &[]), input);
        }

        #[test]
        fn test_whole_document_keeps_trailing_whitespace_on_code() {
            let input = "import b from \"b\";\nimport a from \"a\";\nrun();   \n  \n\n";

            let settings = Settings {
                whole_document: true,
                ..Settings::default()
            };

            assert_eq!(
                align_text(input, &settings, &[]),
                "import a from \"a\";\nimport b from \"b\";\nrun();   \n"
            );
        }

        #[test]
        fn test_crlf_sorted_block_is_unchanged() {
            let input = "import a from \"a\";\r\nimport b from \"b\";\r\n\r\nrun();\r\n";
            assert_eq!(
                format_text(input, &Settings::default(), &HashSet::new()),
                Some(Formatted::Unchanged)
            );
        }

        #[test]
        fn test_crlf_line_endings_preserved() {
            let input = "import b from \"b\";\r\nimport a from \"./a\";\r\n\r\nrun();\r\n";

            let once = align_text(input, &Settings::default(), &[]);
            assert_eq!(
                once,
                "import b from \"b\";\r\n\r\nimport a from \"./a\";\r\n\r\nrun();\r\n"
            );
            assert_eq!(align_text(&once, &Settings::default(), &[]), once);

            let settings = Settings {
                whole_document: true,
                ..Settings::default()
            };
            assert_eq!(align_text(input, &settings, &[]), once);
        }

        #[test]
        fn test_removing_every_import_drops_separator() {
            let input = "import lodash from \"lodash\";\n\nrun();\n";

            let settings = Settings {
                remove_unused: true,
                ..Settings::default()
            };

            assert_eq!(align_text(input, &settings, &["lodash"]), "run();\n");
        }

        #[test]
        fn test_whole_document_adds_final_newline() {
            let input = "import b from \"b\";\nimport a from \"a\";";

            let settings = Settings {
                whole_document: true,
                ..Settings::default()
            };

            assert_eq!(
                align_text(input, &settings, &[]),
                "import a from \"a\";\nimport b from \"b\";\n"
            );
        }
    }
}

mod host {
    use crate::align::{self, Formatted};
    use crate::config::Settings;
    use crate::unused::UnusedSymbols;
    use anyhow::Context;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Language {
        JavaScript,
        JavaScriptReact,
        TypeScript,
        TypeScriptReact,
    }

    impl Language {
        pub fn from_path(path: &Path) -> Option<Self> {
            match path.extension()?.to_str()? {
                "js" | "mjs" | "cjs" => Some(Self::JavaScript),
                "jsx" => Some(Self::JavaScriptReact),
                "ts" | "mts" | "cts" => Some(Self::TypeScript),
                "tsx" => Some(Self::TypeScriptReact),
                _ => None,
            }
        }

        pub fn id(self) -> &'static str {
            match self {
                Self::JavaScript => "javascript",
                Self::JavaScriptReact => "javascriptreact",
                Self::TypeScript => "typescript",
                Self::TypeScriptReact => "typescriptreact",
            }
        }
    }

    /// What a host must provide for its documents.
    pub trait Document {
        fn id(&self) -> &str;
        fn language(&self) -> Option<Language>;
        fn text(&self) -> anyhow::Result<String>;
        /// Replaces `start..end` (byte offsets) in one step.
        fn replace_range(&mut self, start: usize, end: usize, text: &str) -> anyhow::Result<()>;
        fn save(&mut self) -> anyhow::Result<()>;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        NoImports,
        Unchanged,
        Edited,
        /// Unsupported language, or a format already running for the document
        Skipped,
        /// The document changed while unused symbols were being fetched
        Cancelled,
    }

    /// Documents with a format in progress.
    #[derive(Debug, Default)]
    pub struct InFlight {
        documents: RefCell<HashSet<String>>,
    }

    impl InFlight {
        /// `None` when `id` already has a format running.
        pub fn acquire(&self, id: &str) -> Option<InFlightGuard<'_>> {
            if !self.documents.borrow_mut().insert(id.to_string()) {
                return None;
            }
            Some(InFlightGuard {
                registry: self,
                id: id.to_string(),
            })
        }
    }

    /// Releases the document when dropped, on every exit path.
    pub struct InFlightGuard<'a> {
        registry: &'a InFlight,
        id: String,
    }

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            self.registry.documents.borrow_mut().remove(&self.id);
        }
    }

    pub struct Aligner {
        settings: Settings,
        provider: Option<Box<dyn UnusedSymbols>>,
        in_flight: InFlight,
    }

    impl Aligner {
        pub fn new(settings: Settings, provider: Option<Box<dyn UnusedSymbols>>) -> Self {
            Self {
                settings,
                provider,
                in_flight: InFlight::default(),
            }
        }

        /// The explicit "align imports" command.
        pub fn align(&self, document: &mut dyn Document) -> anyhow::Result<Outcome> {
            let text = document
                .text()
                .with_context(|| format!("No active document: cannot read {}", document.id()))?;

            let Some(region) = crate::scanner::find_region(&text) else {
                debug!("{}: no import region", document.id());
                return Ok(Outcome::NoImports);
            };

            let unused_symbols = if self.settings.remove_unused {
                let symbols = self.unused_symbols(document.id());
                if document.text()? != text {
                    info!("{} changed while fetching unused symbols", document.id());
                    return Ok(Outcome::Cancelled);
                }
                symbols
            } else {
                HashSet::new()
            };

            match align::format_region(&text, &region, &self.settings, &unused_symbols) {
                Formatted::Unchanged => Ok(Outcome::Unchanged),
                Formatted::Edit(edit) => {
                    document.replace_range(edit.start, edit.end, &edit.text)?;
                    Ok(Outcome::Edited)
                }
            }
        }

        /// Formats before the host writes the document.
        pub fn on_will_save(&self, document: &mut dyn Document) -> anyhow::Result<Outcome> {
            let Some(_guard) = self.begin_save(&*document) else {
                return Ok(Outcome::Skipped);
            };
            self.align(document)
        }

        /// Formats after a save and saves again. Save events fired by that
        /// second save are ignored.
        pub fn on_did_save(&self, document: &mut dyn Document) -> anyhow::Result<Outcome> {
            let Some(_guard) = self.begin_save(&*document) else {
                return Ok(Outcome::Skipped);
            };

            let outcome = self.align(document)?;
            if outcome == Outcome::Edited {
                document.save()?;
            }
            Ok(outcome)
        }

        fn begin_save(&self, document: &dyn Document) -> Option<InFlightGuard<'_>> {
            if document.language().is_none() {
                debug!("{}: not a JS/TS document", document.id());
                return None;
            }

            let guard = self.in_flight.acquire(document.id());
            if guard.is_none() {
                debug!("{}: format already in flight", document.id());
            }
            guard
        }

        /// Provider failures degrade to "nothing unused".
        fn unused_symbols(&self, id: &str) -> HashSet<String> {
            let Some(provider) = &self.provider else {
                warn!("remove_unused is enabled but no unused-symbol provider is configured");
                return HashSet::new();
            };

            match provider.unused_symbols(id) {
                Ok(symbols) => symbols.into_iter().collect(),
                Err(e) => {
                    warn!("Skipping unused import removal for {id}: {e}");
                    HashSet::new()
                }
            }
        }
    }

    /// A document backed by a file on disk. Edits stay in memory until saved.
    pub struct FileDocument {
        path: PathBuf,
        id: String,
        language: Option<Language>,
        pending: Option<String>,
        dry_run: bool,
    }

    impl FileDocument {
        pub fn new(path: impl AsRef<Path>) -> Self {
            let path = path.as_ref().to_path_buf();
            Self {
                id: path.display().to_string(),
                language: Language::from_path(&path),
                path,
                pending: None,
                dry_run: false,
            }
        }

        /// Never write to disk.
        pub fn dry_run(mut self) -> Self {
            self.dry_run = true;
            self
        }
    }

    impl Document for FileDocument {
        fn id(&self) -> &str {
            &self.id
        }

        fn language(&self) -> Option<Language> {
            self.language
        }

        fn text(&self) -> anyhow::Result<String> {
            if let Some(pending) = &self.pending {
                return Ok(pending.clone());
            }
            fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read file: {}", self.path.display()))
        }

        fn replace_range(&mut self, start: usize, end: usize, text: &str) -> anyhow::Result<()> {
            let mut content = self.text()?;
            anyhow::ensure!(
                start <= end
                    && end <= content.len()
                    && content.is_char_boundary(start)
                    && content.is_char_boundary(end),
                "Invalid range {start}..{end} for {}",
                self.path.display()
            );

            content.replace_range(start..end, text);
            self.pending = Some(content);
            Ok(())
        }

        fn save(&mut self) -> anyhow::Result<()> {
            if self.dry_run {
                return Ok(());
            }
            let Some(content) = self.pending.take() else {
                return Ok(());
            };

            fs::write(&self.path, content)
                .with_context(|| format!("Failed to write file: {}", self.path.display()))
        }
    }

}
