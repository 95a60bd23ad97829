/// Quotes a value for POSIX shells using single quotes.
///
/// Embedded single quotes are closed, escaped and reopened (`'\''`).
///
/// ```
/// use upkg_utils::string::shell_quote;
///
/// assert_eq!(shell_quote("/opt/my app/run"), "'/opt/my app/run'");
/// assert_eq!(shell_quote("it's"), r"'it'\''s'");
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Escapes a value for a double-quoted shell context (`"` `\` `$` and `` ` ``).
pub fn escape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
