//! Input validation: emails, user hashes, and argv strings.

use sha2::{Digest, Sha256};

/// The guest user sentinel; bypasses email validation.
pub const GUEST_USER: &str = "$guest";

/// The demo user sentinel; bypasses email validation.
pub const DEMO_USER: &str = "demouser@";

/// Upper bound on a caller-supplied argument string.
pub const MAX_ARGUMENTS_SIZE: usize = 8 * 1024;

const EMAIL_SEPARATOR: char = '@';

/// Lower-cases an email for comparison and storage.
#[must_use]
pub fn canonicalize_email(email: &str) -> String {
    email.to_ascii_lowercase()
}

/// True if `email` is the guest or demo sentinel.
#[must_use]
pub fn is_incognito_user(email: &str) -> bool {
    email == GUEST_USER || email == DEMO_USER
}

/// Validates an email address: legal characters only, exactly one `@`,
/// at least one character on each side.
#[must_use]
pub fn validate_email(email: &str) -> bool {
    if !email
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '@' | '+' | '_' | '-'))
    {
        return false;
    }
    let Some(at) = email.find(EMAIL_SEPARATOR) else {
        return false;
    };
    if email[at + 1..].contains(EMAIL_SEPARATOR) {
        return false;
    }
    at > 0 && at + 1 < email.len()
}

/// Sanitized user hash: lower-case hex SHA-256 of the canonical email.
///
/// Keys per-user runtime directories, so the output must be stable and
/// contain only filesystem-safe characters.
#[must_use]
pub fn sanitize_user_name(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize_email(email).as_bytes());
    hex::encode(hasher.finalize())
}

/// Errors from [`split_shell_args`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArgSplitError {
    /// The argument string exceeds [`MAX_ARGUMENTS_SIZE`].
    #[error("argument string too long")]
    TooLong,

    /// A quoted region was never closed.
    #[error("unterminated quote in argument string")]
    UnterminatedQuote,

    /// A trailing backslash has nothing to escape.
    #[error("dangling escape in argument string")]
    DanglingEscape,
}

/// Splits a command line the way a shell would: whitespace-separated
/// words, single and double quotes group, backslash escapes the next
/// character outside single quotes.
///
/// # Errors
///
/// Returns [`ArgSplitError`] for over-long input, unterminated quotes,
/// or a trailing escape.
pub fn split_shell_args(input: &str) -> Result<Vec<String>, ArgSplitError> {
    if input.len() > MAX_ARGUMENTS_SIZE {
        return Err(ArgSplitError::TooLong);
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    loop {
        let Some(c) = chars.next() else { break };
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(ArgSplitError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(ArgSplitError::UnterminatedQuote),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(ArgSplitError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(ArgSplitError::DanglingEscape),
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}
