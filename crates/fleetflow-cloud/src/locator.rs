//! Sub-resource lookup by name

use crate::model::SubResource;

/// Case-insensitive name comparison, as used for every sub-resource name
pub fn names_equal(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// Find the first sub-resource called `name` and its index.
///
/// Names are not guaranteed unique by the remote side, so only the first
/// match is reported.
pub fn find<'a>(collection: &'a [SubResource], name: &str) -> Option<(usize, &'a SubResource)> {
    collection
        .iter()
        .enumerate()
        .find(|(_, sub)| names_equal(sub.name(), name))
}
