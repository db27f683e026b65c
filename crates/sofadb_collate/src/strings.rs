//! Unicode string ordering.
//!
//! An approximation of the Unicode Collation Algorithm sufficient for
//! CouchDB view keys: primary weights are case-folded codepoints, the
//! secondary level breaks ties by case (lowercase first), and the tertiary
//! level falls back to raw codepoint order. Full UCA tailoring (locale
//! rules, contractions) is out of scope; `ascii` collation is available for
//! callers that need bit-exact ordering.

use std::cmp::Ordering;

/// Compares two strings under the three-level order described above.
#[must_use]
pub fn unicode_cmp(a: &str, b: &str) -> Ordering {
    let primary = cmp_primary(a, b);
    if primary != Ordering::Equal {
        return primary;
    }
    let secondary = cmp_case(a, b);
    if secondary != Ordering::Equal {
        return secondary;
    }
    a.cmp(b)
}

/// Primary level: compare case-folded codepoint sequences.
fn cmp_primary(a: &str, b: &str) -> Ordering {
    let mut x = a.chars().flat_map(char::to_lowercase);
    let mut y = b.chars().flat_map(char::to_lowercase);
    loop {
        match (x.next(), y.next()) {
            (Some(cx), Some(cy)) => {
                let ord = cx.cmp(&cy);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => return Ordering::Equal,
            // Shorter string sorts first.
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

/// Secondary level: at the first position where the characters differ only
/// by case, lowercase sorts first.
fn cmp_case(a: &str, b: &str) -> Ordering {
    for (cx, cy) in a.chars().zip(b.chars()) {
        if cx == cy {
            continue;
        }
        match (cx.is_lowercase(), cy.is_lowercase()) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => return Ordering::Equal,
        }
    }
    Ordering::Equal
}
