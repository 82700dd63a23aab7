//! Forward-only, allocation-free path segment parser (spec §4.H).
//!
//! A path is a dot-free sequence the caller re-splits on `.` before handing
//! each segment here; a segment is `identifier` or `identifier[index]`.

use crate::error::{Error, Result};

/// One decoded path segment: the field name, an optional array index, and
/// whether the caller should keep navigating (always `false` here: the
/// reader decodes one segment per call; the owning navigation loop in
/// `object.rs` tracks `hasMore` against the dot-split sequence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub name: &'a str,
    pub index: Option<u32>,
}

/// Parse one path segment of the form `name` or `name[index]`.
pub fn parse_segment(segment: &str) -> Result<Segment<'_>> {
    if segment.is_empty() {
        return Err(Error::PathSyntax {
            position: 0,
            reason: "empty segment",
        });
    }

    let Some(bracket_pos) = segment.find('[') else {
        return Ok(Segment { name: segment, index: None });
    };

    if !segment.ends_with(']') {
        return Err(Error::PathSyntax {
            position: segment.len() - 1,
            reason: "unbalanced bracket",
        });
    }
    let name = &segment[..bracket_pos];
    if name.is_empty() {
        return Err(Error::PathSyntax {
            position: 0,
            reason: "empty segment",
        });
    }
    let index_str = &segment[bracket_pos + 1..segment.len() - 1];
    if index_str.contains('[') {
        return Err(Error::PathSyntax {
            position: bracket_pos,
            reason: "unbalanced bracket",
        });
    }
    let index: u32 = index_str.parse().map_err(|_| Error::PathSyntax {
        position: bracket_pos + 1,
        reason: "non-integer index",
    })?;
    Ok(Segment {
        name,
        index: Some(index),
    })
}

/// Split a dotted path into its `.`-separated segments and parse each one,
/// forward-only. Returns segments in order; the caller (`object.rs`) decides
/// `hasMore` from its position in the returned slice.
pub fn parse_path(path: &str) -> Result<Vec<Segment<'_>>> {
    if path.is_empty() {
        return Err(Error::PathSyntax {
            position: 0,
            reason: "empty segment",
        });
    }
    path.split('.').map(parse_segment).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifier() {
        let s = parse_segment("hp").unwrap();
        assert_eq!(s.name, "hp");
        assert_eq!(s.index, None);
    }

    #[test]
    fn identifier_with_index() {
        let s = parse_segment("items[3]").unwrap();
        assert_eq!(s.name, "items");
        assert_eq!(s.index, Some(3));
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(matches!(
            parse_segment(""),
            Err(Error::PathSyntax { reason: "empty segment", .. })
        ));
    }

    #[test]
    fn rejects_unbalanced_bracket() {
        assert!(matches!(
            parse_segment("items[3"),
            Err(Error::PathSyntax { reason: "unbalanced bracket", .. })
        ));
    }

    #[test]
    fn rejects_non_integer_index() {
        assert!(matches!(
            parse_segment("items[x]"),
            Err(Error::PathSyntax { reason: "non-integer index", .. })
        ));
    }

    #[test]
    fn splits_dotted_path() {
        let segments = parse_path("inventory.items[2]").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, "inventory");
        assert_eq!(segments[1].name, "items");
        assert_eq!(segments[1].index, Some(2));
    }
}
