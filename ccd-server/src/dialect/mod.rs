//! Command dialects spoken by legacy clients.
//!
//! Each dialect turns one command line into calls on the [`CameraHandle`]
//! and formats the reply the way its clients expect. A dialect returns
//! `None` for lines it does not recognise so the next one can try.
//!
//! [`CameraHandle`]: crate::camera::CameraHandle

pub mod ice;
pub mod mmt;

use std::str::FromStr;

pub use ice::IceDialect;
pub use mmt::MmtDialect;

/// One command syntax.
pub trait CommandDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle a command line, or return `None` if it is not ours.
    fn handle(&self, line: &str) -> Option<String>;
}

/// Split a command line into tokens, honouring single and double quotes.
///
/// ```
/// use ccd_server::dialect::tokenize;
///
/// let tokens = tokenize(r#"expose 1.0 zero "bias frame""#);
/// assert_eq!(tokens, vec!["expose", "1.0", "zero", "bias frame"]);
/// ```
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Parse positional argument `index`.
pub(crate) fn arg<T: FromStr>(tokens: &[String], index: usize) -> Result<T, String> {
    let raw = tokens
        .get(index)
        .ok_or_else(|| format!("missing argument {index}"))?;
    raw.parse()
        .map_err(|_| format!("invalid argument {index}: {raw}"))
}

/// Parse `N` consecutive integer arguments starting at `first`.
pub(crate) fn int_args<const N: usize>(tokens: &[String], first: usize) -> Result<[i64; N], String> {
    let mut values = [0i64; N];
    for (i, value) in values.iter_mut().enumerate() {
        *value = arg(tokens, first + i)?;
    }
    Ok(values)
}
