//! XDG base-directory lookups and `~`/`$VAR` path expansion.

use std::{env, iter::Peekable, path::PathBuf, str::Chars};

use crate::{
    error::{PathError, PathResult},
    system::get_username,
};

/// Resolves a path string that may contain environment variables.
///
/// Expands `$VAR` and `${VAR}`, resolves a leading `~` to the user's home directory and
/// turns relative paths into absolute ones based on the current working directory.
///
/// # Errors
///
/// * [`PathError::Empty`] if the path is empty
/// * [`PathError::CurrentDir`] if the current directory cannot be determined
/// * [`PathError::MissingEnvVar`] if a referenced variable is undefined
/// * [`PathError::UnclosedVariable`] for `${VAR` without the closing brace
///
/// # Example
///
/// ```
/// use upkg_utils::path::resolve_path;
///
/// let resolved = resolve_path("$HOME/.local/bin").unwrap();
/// assert!(resolved.is_absolute());
/// ```
pub fn resolve_path(path: &str) -> PathResult<PathBuf> {
    let path = path.trim();
    if path.is_empty() {
        return Err(PathError::Empty);
    }

    let expanded = PathBuf::from(expand_variables(path)?);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(expanded))
            .map_err(|err| PathError::CurrentDir { source: err })
    }
}

/// Returns `$HOME`, falling back to `/home/{username}`.
pub fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("/home/{}", get_username())))
}

/// Returns `$XDG_CONFIG_HOME`, defaulting to `$HOME/.config`.
pub fn xdg_config_home() -> PathBuf {
    env_dir("XDG_CONFIG_HOME").unwrap_or_else(|| home_dir().join(".config"))
}

/// Returns `$XDG_DATA_HOME`, defaulting to `$HOME/.local/share`.
pub fn xdg_data_home() -> PathBuf {
    env_dir("XDG_DATA_HOME").unwrap_or_else(|| home_dir().join(".local/share"))
}

/// Returns `$XDG_CACHE_HOME`, defaulting to `$HOME/.cache`.
pub fn xdg_cache_home() -> PathBuf {
    env_dir("XDG_CACHE_HOME").unwrap_or_else(|| home_dir().join(".cache"))
}

/// Returns `$XDG_RUNTIME_DIR` or the system temp dir.
pub fn runtime_dir() -> PathBuf {
    env_dir("XDG_RUNTIME_DIR").unwrap_or_else(env::temp_dir)
}

/// User applications directory scanned for `.desktop` entries.
pub fn applications_dir() -> PathBuf {
    xdg_data_home().join("applications")
}

/// Root of the user icon themes (`hicolor` lives below it).
pub fn icons_dir() -> PathBuf {
    xdg_data_home().join("icons")
}

/// Directory where wrapper scripts are placed.
pub fn user_bin_dir() -> PathBuf {
    home_dir().join(".local/bin")
}

fn env_dir(var: &str) -> Option<PathBuf> {
    env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn expand_variables(path: &str) -> PathResult<String> {
    let mut result = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let var_name = consume_until(&mut chars, '}')?;
                expand_env_var(&var_name, &mut result, path)?;
            }
            '$' => {
                let var_name = consume_var_name(&mut chars);
                if var_name.is_empty() {
                    result.push('$');
                } else {
                    expand_env_var(&var_name, &mut result, path)?;
                }
            }
            '~' if result.is_empty() => result.push_str(&home_dir().to_string_lossy()),
            _ => result.push(c),
        }
    }

    Ok(result)
}

fn consume_until(chars: &mut Peekable<Chars>, delimiter: char) -> PathResult<String> {
    let mut var_name = String::new();
    for c in chars.by_ref() {
        if c == delimiter {
            return Ok(var_name);
        }
        var_name.push(c);
    }

    Err(PathError::UnclosedVariable {
        input: format!("${{{var_name}"),
    })
}

fn consume_var_name(chars: &mut Peekable<Chars>) -> String {
    let mut var_name = String::new();
    while let Some(&c) = chars.peek() {
        if !(c.is_alphanumeric() || c == '_') {
            break;
        }
        var_name.push(c);
        chars.next();
    }
    var_name
}

fn expand_env_var(var_name: &str, result: &mut String, original: &str) -> PathResult<()> {
    let value = match var_name {
        "HOME" => home_dir(),
        "XDG_CONFIG_HOME" => xdg_config_home(),
        "XDG_DATA_HOME" => xdg_data_home(),
        "XDG_CACHE_HOME" => xdg_cache_home(),
        _ => {
            env::var(var_name).map(PathBuf::from).map_err(|_| {
                PathError::MissingEnvVar {
                    input: original.into(),
                    var: var_name.into(),
                }
            })?
        }
    };
    result.push_str(&value.to_string_lossy());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_resolve_path_expands_home_and_braces() {
        env::set_var("HOME", "/home/tester");
        env::set_var("UPKG_TEST_DIR", "apps");

        assert_eq!(
            resolve_path("~/x").unwrap(),
            PathBuf::from("/home/tester/x")
        );
        assert_eq!(
            resolve_path("$HOME/${UPKG_TEST_DIR}/bin").unwrap(),
            PathBuf::from("/home/tester/apps/bin")
        );

        env::remove_var("UPKG_TEST_DIR");
    }

    #[test]
    #[serial]
    fn test_resolve_path_errors() {
        assert!(matches!(resolve_path("   "), Err(PathError::Empty)));
        assert!(matches!(
            resolve_path("/a/${UNCLOSED"),
            Err(PathError::UnclosedVariable { .. })
        ));
        env::remove_var("UPKG_SURELY_MISSING");
        assert!(matches!(
            resolve_path("$UPKG_SURELY_MISSING/x"),
            Err(PathError::MissingEnvVar { .. })
        ));
    }

    #[test]
    fn test_lone_dollar_is_literal() {
        assert_eq!(resolve_path("/tmp/$").unwrap(), PathBuf::from("/tmp/$"));
    }

    #[test]
    #[serial]
    fn test_xdg_fallbacks() {
        env::set_var("HOME", "/home/tester");
        env::remove_var("XDG_DATA_HOME");
        assert_eq!(xdg_data_home(), PathBuf::from("/home/tester/.local/share"));
        assert_eq!(
            applications_dir(),
            PathBuf::from("/home/tester/.local/share/applications")
        );

        env::set_var("XDG_DATA_HOME", "/data");
        assert_eq!(icons_dir(), PathBuf::from("/data/icons"));
        env::remove_var("XDG_DATA_HOME");
    }
}
