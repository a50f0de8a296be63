//! Reduced-fidelity renderings of a plaintext.

/// Longest suffix a masked value ever reveals.
pub const MASK_SUFFIX_MAX: usize = 4;

/// Replace all but a short suffix with `*`.
///
/// At most a quarter of the characters (and never more than
/// [`MASK_SUFFIX_MAX`]) stay visible, so short values are fully hidden.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let reveal = (chars.len() / 4).min(MASK_SUFFIX_MAX);
    let hidden = chars.len() - reveal;

    let mut out = String::with_capacity(value.len());
    out.extend(std::iter::repeat_n('*', hidden));
    out.extend(&chars[hidden..]);
    out
}
