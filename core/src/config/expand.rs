//! `${env:VAR}` placeholder and `~` expansion for config values.

/// Replace every `${env:NAME}` in `input` with the value of `NAME`.
///
/// Unset variables expand to the empty string so that required fields
/// fail validation instead of carrying the literal placeholder.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${env:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 6..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder, keep verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE"));
    match home {
        Ok(home) if path == "~" => home,
        Ok(home) if path.starts_with("~/") => format!("{home}{}", &path[1..]),
        _ => path.to_string(),
    }
}
