//! Tagged IMAP request parsing.
//!
//! The distributor and worker tiers only need the tag, the upper-cased
//! command word and the raw argument tokens; everything else stays on the
//! line and is proxied verbatim.

use driftmail_common::{Error, Result};

/// One parsed client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Client-chosen command tag
    pub tag: String,
    /// Upper-cased command word
    pub command: String,
    /// Remaining tokens
    pub args: Vec<String>,
}

impl Request {
    /// Parse `TAG COMMAND [args…]`.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let mut tokens = trimmed.split_whitespace();

        let tag = tokens
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Protocol("Received invalid IMAP command".to_string()))?;
        let command = tokens
            .next()
            .ok_or_else(|| Error::Protocol("Received invalid IMAP command".to_string()))?;

        Ok(Self {
            tag: tag.to_string(),
            command: command.to_uppercase(),
            args: tokens.map(|t| t.to_string()).collect(),
        })
    }
}

/// Literal size from the `{n}` (or `{n+}`) token of an APPEND line.
pub fn literal_size(req: &Request) -> Option<usize> {
    let token = req.args.iter().find(|a| a.starts_with('{'))?;
    token
        .trim_matches(['{', '}'])
        .trim_end_matches('+')
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_size() {
        let req = Request::parse("a1 APPEND INBOX {310}").unwrap();
        assert_eq!(literal_size(&req), Some(310));
        let req = Request::parse("a1 APPEND INBOX {42+}").unwrap();
        assert_eq!(literal_size(&req), Some(42));
        let req = Request::parse("a1 APPEND INBOX").unwrap();
        assert_eq!(literal_size(&req), None);
    }

    #[test]
    fn test_parse_tagged_command() {
        let req = Request::parse("a001 login alice secret\r\n").unwrap();
        assert_eq!(req.tag, "a001");
        assert_eq!(req.command, "LOGIN");
        assert_eq!(req.args, vec!["alice", "secret"]);
    }

    #[test]
    fn test_parse_requires_tag_and_command() {
        assert!(Request::parse("").is_err());
        assert!(Request::parse("a001").is_err());
        assert!(Request::parse("   \r\n").is_err());
    }
}
