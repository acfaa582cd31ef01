//! Interned string objects with a lazily built codepoint index.

/// Width class of the widest codepoint in a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrWidth {
    /// Pure ASCII; byte index equals codepoint index.
    Ascii,
    /// All codepoints fit in one byte (Latin-1 range).
    Ucs1,
    /// All codepoints fit in two bytes (BMP).
    Ucs2,
    /// Full range.
    Ucs4,
}

/// Decoded codepoints, width-specialized so ASCII-heavy workloads do not pay
/// four bytes per character.
#[derive(Debug)]
enum CpIndex {
    Ucs1(Box<[u8]>),
    Ucs2(Box<[u16]>),
    Ucs4(Box<[u32]>),
}

/// A UTF-8 string object.
///
/// The codepoint index is materialized on first character-indexed access;
/// ASCII strings never build one.
#[derive(Debug)]
pub struct Str {
    text: Box<str>,
    width: StrWidth,
    char_len: usize,
    index: Option<CpIndex>,
}

impl Str {
    #[must_use]
    pub fn new(text: impl Into<Box<str>>) -> Self {
        let text = text.into();
        let mut width = StrWidth::Ascii;
        let mut char_len = 0usize;
        for ch in text.chars() {
            char_len += 1;
            let cp = u32::from(ch);
            if cp > 0xffff {
                width = StrWidth::Ucs4;
            } else if cp > 0xff && width != StrWidth::Ucs4 {
                width = StrWidth::Ucs2;
            } else if cp > 0x7f && matches!(width, StrWidth::Ascii) {
                width = StrWidth::Ucs1;
            }
        }
        Self {
            text,
            width,
            char_len,
            index: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of codepoints (what `len()` reports).
    #[inline]
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.char_len
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> StrWidth {
        self.width
    }

    /// Codepoint at `idx`, building the index on first non-ASCII access.
    ///
    /// Callers have already normalized negative indices and checked bounds.
    pub fn char_at(&mut self, idx: usize) -> char {
        debug_assert!(idx < self.char_len);
        if matches!(self.width, StrWidth::Ascii) {
            return char::from(self.text.as_bytes()[idx]);
        }
        let index = self.index.get_or_insert_with(|| build_index(&self.text, self.width));
        let cp = match index {
            CpIndex::Ucs1(cps) => u32::from(cps[idx]),
            CpIndex::Ucs2(cps) => u32::from(cps[idx]),
            CpIndex::Ucs4(cps) => cps[idx],
        };
        char::from_u32(cp).unwrap_or('\u{fffd}')
    }

    /// Substring over a codepoint range (used by `__getslice__`).
    pub fn slice(&mut self, start: usize, end: usize) -> String {
        if matches!(self.width, StrWidth::Ascii) {
            return self.text[start.min(self.text.len())..end.min(self.text.len())].to_owned();
        }
        (start..end.min(self.char_len)).map(|i| self.char_at(i)).collect()
    }

    /// Rough payload size for the GC's allocation accounting.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.text.len() + std::mem::size_of::<Self>()
    }
}

fn build_index(text: &str, width: StrWidth) -> CpIndex {
    match width {
        StrWidth::Ascii | StrWidth::Ucs1 => CpIndex::Ucs1(text.chars().map(|c| u32::from(c) as u8).collect()),
        StrWidth::Ucs2 => CpIndex::Ucs2(text.chars().map(|c| u32::from(c) as u16).collect()),
        StrWidth::Ucs4 => CpIndex::Ucs4(text.chars().map(u32::from).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_has_no_index() {
        let mut s = Str::new("hello");
        assert_eq!(s.width(), StrWidth::Ascii);
        assert_eq!(s.char_len(), 5);
        assert_eq!(s.char_at(1), 'e');
        assert!(s.index.is_none());
    }

    #[test]
    fn width_classification() {
        assert_eq!(Str::new("caf\u{e9}").width(), StrWidth::Ucs1);
        assert_eq!(Str::new("\u{3042}").width(), StrWidth::Ucs2);
        assert_eq!(Str::new("\u{1f600}").width(), StrWidth::Ucs4);
    }

    #[test]
    fn wide_indexing() {
        let mut s = Str::new("a\u{3042}b");
        assert_eq!(s.char_len(), 3);
        assert_eq!(s.char_at(0), 'a');
        assert_eq!(s.char_at(1), '\u{3042}');
        assert_eq!(s.char_at(2), 'b');
        assert_eq!(s.slice(1, 3), "\u{3042}b");
    }
}
