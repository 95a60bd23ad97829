//! `.desktop` file codec.
//!
//! Parsing keeps group order, key order and comments so a bundled entry can be
//! rewritten without losing anything the packager put there. Values are kept
//! verbatim; only `Exec=` is tokenized, and only when it is rewritten.

use std::io::{BufRead, Write};

use tracing::trace;
use upkg_config::env::EnvVar;
use upkg_utils::string::escape_double_quoted;

use crate::error::{ErrorContext, PackageError, Result};

pub const MAIN_GROUP: &str = "Desktop Entry";
const ACTION_GROUP_PREFIX: &str = "Desktop Action ";

/// Words kept upper-case by [`humanize_name`].
const ACRONYMS: &[&str] = &[
    "3D", "AI", "API", "CLI", "CPU", "DB", "DNS", "ESR", "FTP", "GPU", "GUI", "HTTP", "IDE",
    "IRC", "JSON", "LTS", "OS", "PDF", "QR", "RSS", "SDK", "SQL", "SSH", "TV", "UI", "URL",
    "VM", "VPN", "XML",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, value: String },
    Comment(String),
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopGroup {
    name: String,
    lines: Vec<Line>,
}

impl DesktopGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lines: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            match line {
                Line::Entry { key: k, value } if k == key => Some(value.as_str()),
                _ => None,
            }
        })
    }

    /// Sets `key`, replacing the first occurrence in place or appending it.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for line in &mut self.lines {
            if let Line::Entry { key: k, value: v } = line {
                if k == key {
                    *v = value;
                    return;
                }
            }
        }
        // Keep trailing blank lines after the new key.
        let at = self
            .lines
            .iter()
            .rposition(|l| !matches!(l, Line::Blank))
            .map_or(0, |i| i + 1);
        self.lines.insert(
            at,
            Line::Entry {
                key: key.to_string(),
                value,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self
            .lines
            .iter()
            .position(|l| matches!(l, Line::Entry { key: k, .. } if k == key))?;
        match self.lines.remove(idx) {
            Line::Entry { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| {
            match l {
                Line::Entry { key, .. } => Some(key.as_str()),
                _ => None,
            }
        })
    }
}

/// A parsed desktop entry file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesktopEntry {
    /// Comments and blank lines before the first group.
    preamble: Vec<Line>,
    groups: Vec<DesktopGroup>,
}

impl DesktopEntry {
    /// Builds a minimal application entry.
    pub fn application(name: &str, exec: &str, icon: Option<&str>) -> Self {
        let mut group = DesktopGroup::new(MAIN_GROUP);
        group.set("Type", "Application");
        group.set("Name", name);
        group.set("Exec", exec);
        if let Some(icon) = icon {
            group.set("Icon", icon);
        }
        group.set("Terminal", "false");
        Self {
            preamble: Vec::new(),
            groups: vec![group],
        }
    }

    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut entry = DesktopEntry::default();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| "reading desktop file".into())?;
            let trimmed = line.trim();

            let parsed = if trimmed.is_empty() {
                Line::Blank
            } else if trimmed.starts_with('#') {
                Line::Comment(line.clone())
            } else if let Some(name) = trimmed.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| {
                    PackageError::DesktopParse {
                        line: idx + 1,
                        reason: "unterminated group header".into(),
                    }
                })?;
                entry.groups.push(DesktopGroup::new(name));
                continue;
            } else if let Some((key, value)) = line.split_once('=') {
                Line::Entry {
                    key: key.trim().to_string(),
                    value: value.trim_start().to_string(),
                }
            } else {
                return Err(PackageError::DesktopParse {
                    line: idx + 1,
                    reason: format!("expected key=value, found `{trimmed}`"),
                });
            };

            match entry.groups.last_mut() {
                Some(group) => group.lines.push(parsed),
                None if matches!(parsed, Line::Entry { .. }) => {
                    return Err(PackageError::DesktopParse {
                        line: idx + 1,
                        reason: "key outside of any group".into(),
                    });
                }
                None => entry.preamble.push(parsed),
            }
        }

        Ok(entry)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer
            .write_all(self.to_string().as_bytes())
            .with_context(|| "writing desktop file".into())
    }

    pub fn groups(&self) -> &[DesktopGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&DesktopGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Returns the group called `name`, inserting it as the first group if missing.
    pub fn ensure_group(&mut self, name: &str) -> &mut DesktopGroup {
        if let Some(idx) = self.groups.iter().position(|g| g.name == name) {
            return &mut self.groups[idx];
        }
        self.groups.insert(0, DesktopGroup::new(name));
        &mut self.groups[0]
    }

    /// The `[Desktop Entry]` group, created if missing.
    pub fn main_mut(&mut self) -> &mut DesktopGroup {
        self.ensure_group(MAIN_GROUP)
    }

    pub fn push_group(&mut self, group: DesktopGroup) {
        self.groups.push(group);
    }

    /// Looks up a key in the `[Desktop Entry]` group.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.group(MAIN_GROUP).and_then(|g| g.get(key))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.main_mut().set(key, value);
    }

    /// Checks the keys every launcher needs.
    pub fn validate(&self) -> Result<()> {
        let main = self
            .group(MAIN_GROUP)
            .ok_or_else(|| {
                PackageError::InvalidDesktopEntry("missing [Desktop Entry] group".into())
            })?;

        let kind = main
            .get("Type")
            .ok_or_else(|| PackageError::InvalidDesktopEntry("missing Type key".into()))?;
        if main.get("Name").is_none_or(str::is_empty) {
            return Err(PackageError::InvalidDesktopEntry("missing Name key".into()));
        }
        if kind == "Application" && main.get("Exec").is_none_or(str::is_empty) {
            return Err(PackageError::InvalidDesktopEntry(
                "Application entries need an Exec key".into(),
            ));
        }
        if kind == "Link" && main.get("URL").is_none() {
            return Err(PackageError::InvalidDesktopEntry(
                "Link entries need a URL key".into(),
            ));
        }

        Ok(())
    }

    /// Points every `Exec=` (main group and actions) at `program`, keeping arguments
    /// such as `%U` and any `env` assignments.
    pub fn rewrite_exec(&mut self, program: &str) {
        for group in self.exec_groups_mut() {
            let Some(exec) = group.get("Exec") else {
                continue;
            };
            let parsed = ExecLine::parse(exec);
            let rewritten = parsed.with_program(program).render();
            trace!(group = group.name(), exec = %rewritten, "rewriting Exec");
            group.set("Exec", rewritten);
            if group.get("TryExec").is_some() {
                group.set("TryExec", program);
            }
        }
    }

    /// Prefixes every `Exec=` with `env NAME=value ...`.
    ///
    /// Variables already assigned in the prefix are updated in place, so injecting
    /// the same set twice yields the same line.
    pub fn inject_env_vars(&mut self, vars: &[EnvVar]) {
        if vars.is_empty() {
            return;
        }
        for group in self.exec_groups_mut() {
            let Some(exec) = group.get("Exec") else {
                continue;
            };
            let mut parsed = ExecLine::parse(exec);
            for var in vars {
                match parsed.env.iter_mut().find(|(name, _)| *name == var.name) {
                    Some((_, value)) => value.clone_from(&var.value),
                    None => parsed.env.push((var.name.clone(), var.value.clone())),
                }
            }
            group.set("Exec", parsed.render());
        }
    }

    fn exec_groups_mut(&mut self) -> impl Iterator<Item = &mut DesktopGroup> {
        self.groups
            .iter_mut()
            .filter(|g| g.name == MAIN_GROUP || g.name.starts_with(ACTION_GROUP_PREFIX))
    }
}

impl std::fmt::Display for DesktopEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn write_line(f: &mut std::fmt::Formatter<'_>, line: &Line) -> std::fmt::Result {
            match line {
                Line::Entry { key, value } => writeln!(f, "{key}={value}"),
                Line::Comment(c) => writeln!(f, "{c}"),
                Line::Blank => writeln!(f),
            }
        }

        for line in &self.preamble {
            write_line(f, line)?;
        }
        for (idx, group) in self.groups.iter().enumerate() {
            if idx > 0 && !matches!(group_tail(&self.groups[idx - 1]), Some(Line::Blank)) {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", group.name)?;
            for line in &group.lines {
                write_line(f, line)?;
            }
        }
        Ok(())
    }
}

fn group_tail(group: &DesktopGroup) -> Option<&Line> {
    group.lines.last()
}

/// Program an `Exec=` value starts, unquoted, with any `env` prefix skipped.
pub fn exec_program(exec: &str) -> Option<String> {
    let parsed = ExecLine::parse(exec);
    (!parsed.program.is_empty()).then_some(parsed.program)
}

/// An `Exec=` value split into an optional `env` prefix, the program and its raw arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExecLine {
    env: Vec<(String, String)>,
    program: String,
    /// Everything after the program, verbatim.
    args: String,
}

impl ExecLine {
    fn parse(exec: &str) -> Self {
        let mut tokens = tokenize(exec).into_iter().peekable();
        let mut env = Vec::new();

        if tokens.peek().is_some_and(|t| t.text == "env") {
            tokens.next();
            while let Some(token) = tokens.peek() {
                match token.text.split_once('=') {
                    Some((name, value)) if is_env_name(name) => {
                        env.push((name.to_string(), value.to_string()));
                        tokens.next();
                    }
                    _ => break,
                }
            }
        }

        match tokens.next() {
            Some(program) => {
                Self {
                    env,
                    program: program.text,
                    args: exec[program.end..].trim().to_string(),
                }
            }
            None => {
                Self {
                    env,
                    program: String::new(),
                    args: String::new(),
                }
            }
        }
    }

    fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.env.is_empty() {
            parts.push("env".to_string());
            for (name, value) in &self.env {
                parts.push(format!("{name}={}", quote_exec_arg(value)));
            }
        }
        parts.push(quote_exec_arg(&self.program));
        if !self.args.is_empty() {
            parts.push(self.args.clone());
        }
        parts.join(" ")
    }
}

struct Token {
    text: String,
    end: usize,
}

/// Splits an Exec value into words, honoring double quotes and backslash escapes.
fn tokenize(exec: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = exec.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            '\\' => {
                if let Some((_, next)) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        end: idx,
                    });
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(Token {
            text: current,
            end: exec.len(),
        });
    }
    tokens
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quotes a value when it contains whitespace, `;`, quotes or shell metacharacters.
pub fn quote_exec_arg(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '"' | '\'' | '\\' | '$' | '`'));
    if needs_quotes {
        format!("\"{}\"", escape_double_quoted(value))
    } else {
        value.to_string()
    }
}

/// Turns a package name into a display name: `my-cool_app` becomes `My Cool App`,
/// known acronyms stay upper-case (`firefox-esr` becomes `Firefox ESR`).
pub fn humanize_name(name: &str) -> String {
    name.split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let upper = word.to_ascii_uppercase();
            if ACRONYMS.contains(&upper.as_str()) {
                return upper;
            }
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse<R: BufRead>(reader: R) -> Result<DesktopEntry> {
    DesktopEntry::parse(reader)
}

pub fn write<W: Write>(writer: W, entry: &DesktopEntry) -> Result<()> {
    entry.write(writer)
}

pub fn validate(entry: &DesktopEntry) -> Result<()> {
    entry.validate()
}

/// Injects `vars` (the configured Wayland defaults followed by custom variables)
/// into every `Exec=` line, validating each variable first.
pub fn inject_wayland_env_vars(entry: &mut DesktopEntry, vars: &[EnvVar]) -> Result<()> {
    for var in vars {
        var.validate()
            .map_err(|e| PackageError::InvalidDesktopEntry(e.to_string()))?;
    }
    entry.inject_env_vars(vars);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# packaged by upstream
[Desktop Entry]
Name=Cool App
Exec=/usr/bin/coolapp %U
Icon=coolapp
Type=Application
Categories=Utility;Development;

[Desktop Action new-window]
Name=New Window
Exec=/usr/bin/coolapp --new-window
";

    fn sample() -> DesktopEntry {
        DesktopEntry::parse(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_and_write_preserves_layout() {
        let entry = sample();
        assert_eq!(entry.groups().len(), 2);
        assert_eq!(entry.get("Categories"), Some("Utility;Development;"));
        assert_eq!(entry.to_string(), SAMPLE);

        let mut out = Vec::new();
        write(&mut out, &entry).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), SAMPLE);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            DesktopEntry::parse("Name=x\n".as_bytes()),
            Err(PackageError::DesktopParse { line: 1, .. })
        ));
        assert!(matches!(
            DesktopEntry::parse("[Desktop Entry\n".as_bytes()),
            Err(PackageError::DesktopParse { .. })
        ));
        assert!(matches!(
            DesktopEntry::parse("[Desktop Entry]\ngarbage\n".as_bytes()),
            Err(PackageError::DesktopParse { line: 2, .. })
        ));
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut entry = sample();
        entry.main_mut().remove("Exec");
        assert!(validate(&entry).is_err());

        assert!(DesktopEntry::default().validate().is_err());
    }

    #[test]
    fn test_rewrite_exec_keeps_arguments() {
        let mut entry = sample();
        entry.rewrite_exec("/home/u/.local/bin/coolapp");
        assert_eq!(entry.get("Exec"), Some("/home/u/.local/bin/coolapp %U"));
        assert_eq!(
            entry
                .group("Desktop Action new-window")
                .and_then(|g| g.get("Exec")),
            Some("/home/u/.local/bin/coolapp --new-window")
        );
    }

    #[test]
    fn test_exec_program_unquotes_path() {
        assert_eq!(
            exec_program("env GDK_BACKEND=wayland \"/opt/My App/app\" %U").as_deref(),
            Some("/opt/My App/app")
        );
        assert_eq!(exec_program("/usr/bin/code %F").as_deref(), Some("/usr/bin/code"));
        assert_eq!(exec_program("   "), None);
    }

    #[test]
    fn test_rewrite_exec_quotes_paths_with_spaces() {
        let mut entry = DesktopEntry::application("X", "\"/opt/old app/x\" %F", None);
        entry.rewrite_exec("/opt/new app/x");
        assert_eq!(entry.get("Exec"), Some("\"/opt/new app/x\" %F"));
    }

    #[test]
    fn test_inject_env_vars_is_idempotent() {
        let vars = vec![
            EnvVar::new("QT_QPA_PLATFORM", "wayland;xcb"),
            EnvVar::new("GDK_BACKEND", "wayland,x11"),
        ];
        let mut entry = sample();
        inject_wayland_env_vars(&mut entry, &vars).unwrap();
        let once = entry.get("Exec").unwrap().to_string();
        assert_eq!(
            once,
            "env QT_QPA_PLATFORM=\"wayland;xcb\" GDK_BACKEND=wayland,x11 /usr/bin/coolapp %U"
        );

        inject_wayland_env_vars(&mut entry, &vars).unwrap();
        assert_eq!(entry.get("Exec"), Some(once.as_str()));
    }

    #[test]
    fn test_inject_env_vars_updates_existing_assignment() {
        let mut entry = DesktopEntry::application("X", "env FOO=old BAR=1 /bin/x", None);
        entry.inject_env_vars(&[EnvVar::new("FOO", "new value")]);
        assert_eq!(entry.get("Exec"), Some("env FOO=\"new value\" BAR=1 /bin/x"));
    }

    #[test]
    fn test_inject_rejects_invalid_vars() {
        let mut entry = sample();
        let bad = vec![EnvVar::new("BAD NAME", "1")];
        assert!(inject_wayland_env_vars(&mut entry, &bad).is_err());
        assert_eq!(entry.get("Exec"), Some("/usr/bin/coolapp %U"));
    }

    #[test]
    fn test_quote_exec_arg() {
        assert_eq!(quote_exec_arg("plain"), "plain");
        assert_eq!(quote_exec_arg("a b"), "\"a b\"");
        assert_eq!(quote_exec_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_exec_arg("x;y"), "\"x;y\"");
    }

    #[test]
    fn test_humanize_name() {
        assert_eq!(humanize_name("my-cool_app"), "My Cool App");
        assert_eq!(humanize_name("firefox-esr"), "Firefox ESR");
        assert_eq!(humanize_name("github-cli"), "Github CLI");
        assert_eq!(humanize_name("openapi-api-tool"), "Openapi API Tool");
    }

    #[test]
    fn test_set_inserts_before_trailing_blank() {
        let mut entry = sample();
        entry.set("StartupWMClass", "coolapp");
        let text = entry.to_string();
        assert!(text.contains("Categories=Utility;Development;\nStartupWMClass=coolapp\n\n[Desktop Action"));
    }
}
