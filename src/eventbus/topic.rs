//! # Pure topic/filter matching.
//!
//! Listener dispatch is an explicit ordered list of `(pattern, callback)`
//! pairs filtered through [`topic_matches`]; there is no broker involvement
//! and no dynamic dispatch by type.
//!
//! ## Pattern syntax
//! Topics are `/`-separated. A pattern segment of `+` (or its `*` alias)
//! matches exactly one level; a trailing `#` matches the remaining levels,
//! including none at all, so `a/#` matches both `a/b/c` and `a`. `#` is only
//! meaningful as the final segment.

use crate::eventbus::broker::ExchangeKind;

/// Returns true when `topic` is covered by the wildcard `filter`.
///
/// # Example
/// ```
/// use eventvisor::topic_matches;
///
/// assert!(topic_matches("a/#", "a/b/c"));
/// assert!(topic_matches("a/+/c", "a/b/c"));
/// assert!(!topic_matches("a/+/c", "a/b/d/c"));
/// ```
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut pattern = filter.split('/');
    let mut levels = topic.split('/');

    loop {
        match (pattern.next(), levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) | (Some("*"), Some(_)) => {}
            (Some(seg), Some(level)) => {
                if seg != level {
                    return false;
                }
            }
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

/// Returns true when `filter` is syntactically valid: `#` may only appear
/// as the final segment.
///
/// Checked at subscribe time so a typo is rejected before it reaches the
/// broker, where a permanently failing declare would wedge the reconnect
/// cycle.
pub fn valid_filter(filter: &str) -> bool {
    let mut segments = filter.split('/').peekable();
    while let Some(seg) = segments.next() {
        if seg == "#" && segments.peek().is_some() {
            return false;
        }
    }
    true
}

/// Routing decision for one subscription kind.
///
/// `Topic` uses wildcard matching, `Direct` requires an exact match,
/// `Fanout` matches everything bound to the exchange.
pub(crate) fn kind_matches(kind: ExchangeKind, filter: &str, topic: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic_matches(filter, topic),
        ExchangeKind::Direct => filter == topic,
        ExchangeKind::Fanout => true,
    }
}
