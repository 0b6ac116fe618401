//! Common types for driftmail

use uuid::Uuid;

/// Textual rendering of an OR-Set element tag (a UUID minted per add)
pub type ElementTag = String;

/// Name a replica stamps on its outbound updates
pub type ReplicaName = String;

/// Mail-file name inside a Maildir `cur` directory; doubles as the
/// OR-Set element value identifying the message
pub type MailValue = String;

/// Mint a fresh element tag.
///
/// Tags are never reused; they are the identity of an OR-Set observation.
pub fn mint_tag() -> ElementTag {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_tag_shape() {
        let tag = mint_tag();
        assert_eq!(tag.len(), 36);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn test_mint_tag_unique() {
        assert_ne!(mint_tag(), mint_tag());
    }
}
