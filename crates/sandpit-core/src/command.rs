//! Allow-list tokenizer for user-supplied compiler options and program
//! arguments
//!
//! User strings never reach a shell verbatim. They are split on whitespace,
//! every token is checked against a fixed character allow-list, and the
//! surviving tokens are single-quoted before being placed in a script.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::SandpitError;

static TOKEN_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-=,:/+]+$"));

/// Upper bound on the number of tokens in one option string.
pub const MAX_TOKENS: usize = 128;

/// Split `input` into allow-listed tokens. `field` names the request field in
/// error messages.
pub fn tokenize(field: &str, input: &str) -> Result<Vec<String>, SandpitError> {
    let tokens: Vec<String> = input.split_whitespace().map(str::to_string).collect();

    if tokens.len() > MAX_TOKENS {
        return Err(SandpitError::validation(format!(
            "{} has {} tokens, at most {} are allowed",
            field,
            tokens.len(),
            MAX_TOKENS
        )));
    }

    let pattern = TOKEN_PATTERN
        .as_ref()
        .map_err(|e| SandpitError::internal(format!("token pattern: {}", e)))?;

    for token in &tokens {
        if !pattern.is_match(token) {
            return Err(SandpitError::validation(format!(
                "{} contains a disallowed token '{}'",
                field, token
            )));
        }
    }

    Ok(tokens)
}

/// Quote a single token for POSIX shells.
pub fn quote(token: &str) -> String {
    format!("'{}'", token.replace('\'', r"'\''"))
}

pub fn quote_all(tokens: &[String]) -> String {
    tokens.iter().map(|t| quote(t)).collect::<Vec<_>>().join(" ")
}

/// Fill a trusted command template with already tokenized options. A `%s`
/// placeholder receives the options, otherwise they are appended.
pub fn render_template(template: &str, options: &[String]) -> String {
    let quoted = quote_all(options);
    if template.contains("%s") {
        template.replacen("%s", &quoted, 1).trim().to_string()
    } else if quoted.is_empty() {
        template.to_string()
    } else {
        format!("{} {}", template, quoted)
    }
}
