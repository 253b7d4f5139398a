//! `WWW-Authenticate` challenge parsing.

use lockbox_core::error::{LockboxError, Result};

/// A parsed authentication challenge: scheme plus `key=value` attributes in
/// the order they appeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: String,
    pub attributes: Vec<(String, String)>,
}

impl AuthChallenge {
    /// All values of attribute `key` (keys compare case-insensitively).
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-+!#$%&'*._^`|~".contains(c)
}

/// Parse a `WWW-Authenticate` header value.
///
/// Values are either tokens or quoted strings; backslash escapes inside
/// quoted strings are unescaped.
pub fn parse_www_authenticate(header: &str) -> Result<AuthChallenge> {
    let err = |pos: usize| {
        LockboxError::InvalidData(format!(
            "Failed to parse www-authenticate header at position {}: {}",
            pos, header
        ))
    };

    let chars: Vec<char> = header.chars().collect();
    let mut pos = 0;
    let skip_spaces = |pos: &mut usize| {
        while *pos < chars.len() && chars[*pos] == ' ' {
            *pos += 1;
        }
    };

    skip_spaces(&mut pos);
    let start = pos;
    while pos < chars.len() && is_token_char(chars[pos]) {
        pos += 1;
    }
    if pos == start {
        return Err(err(pos));
    }
    let scheme: String = chars[start..pos].iter().collect();
    skip_spaces(&mut pos);

    let mut attributes = Vec::new();
    while pos < chars.len() {
        let key_start = pos;
        while pos < chars.len() && is_token_char(chars[pos]) {
            pos += 1;
        }
        if pos == key_start || pos >= chars.len() || chars[pos] != '=' {
            return Err(err(pos));
        }
        let key: String = chars[key_start..pos].iter().collect();
        pos += 1;

        let value = if pos < chars.len() && chars[pos] == '"' {
            pos += 1;
            let mut value = String::new();
            loop {
                match chars.get(pos) {
                    None => return Err(err(pos)),
                    Some('"') => {
                        pos += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars.get(pos + 1).ok_or_else(|| err(pos))?;
                        value.push(*escaped);
                        pos += 2;
                    }
                    Some(c) => {
                        value.push(*c);
                        pos += 1;
                    }
                }
            }
            value
        } else {
            let value_start = pos;
            while pos < chars.len() && is_token_char(chars[pos]) {
                pos += 1;
            }
            if pos == value_start {
                return Err(err(pos));
            }
            chars[value_start..pos].iter().collect()
        };
        attributes.push((key, value));

        // Separator: ` *, *` or end of input
        skip_spaces(&mut pos);
        if pos < chars.len() {
            if chars[pos] != ',' {
                return Err(err(pos));
            }
            pos += 1;
            skip_spaces(&mut pos);
            if pos >= chars.len() {
                return Err(err(pos));
            }
        }
    }

    Ok(AuthChallenge { scheme, attributes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_www_authenticate(
            r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:app:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, "Bearer");
        assert_eq!(
            challenge.attributes,
            vec![
                ("realm".to_string(), "https://auth.example/token".to_string()),
                ("service".to_string(), "registry.example".to_string()),
                ("scope".to_string(), "repository:app:pull,push".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_basic_challenge_with_token_value() {
        let challenge = parse_www_authenticate(r#"Basic realm=registry , charset="UTF-8""#).unwrap();
        assert_eq!(challenge.scheme, "Basic");
        assert_eq!(challenge.values("realm"), vec!["registry"]);
        assert_eq!(challenge.values("charset"), vec!["UTF-8"]);
    }

    #[test]
    fn test_parse_unescapes_quoted_values() {
        let challenge = parse_www_authenticate(r#"Bearer realm="a\"b\\c""#).unwrap();
        assert_eq!(challenge.values("realm"), vec![r#"a"b\c"#]);
    }

    #[test]
    fn test_parse_scheme_only() {
        let challenge = parse_www_authenticate("Negotiate").unwrap();
        assert_eq!(challenge.scheme, "Negotiate");
        assert!(challenge.attributes.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_www_authenticate("").is_err());
        assert!(parse_www_authenticate(r#"Bearer realm="unterminated"#).is_err());
        assert!(parse_www_authenticate("Bearer realm=a service=b").is_err());
        assert!(parse_www_authenticate("Bearer realm=a,").is_err());
    }
}
