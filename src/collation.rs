//! British-English string ordering for package and source lists.
//!
//! en-GB has no tailoring of its own in CLDR, so this is the CLDR root
//! collation with punctuation treated as significant (non-ignorable).

use std::cmp::Ordering;

use feruca::{Collator, Locale, Tailoring};

pub struct BritishCollator {
    inner: Collator,
}

impl BritishCollator {
    pub fn new() -> Self {
        Self {
            inner: Collator::new(Tailoring::Cldr(Locale::Root), false, false),
        }
    }

    pub fn compare(&mut self, a: &str, b: &str) -> Ordering {
        self.inner.collate(a, b)
    }

    /// Stable sort of `items` by the collated value of `key`, falling back to
    /// `Ord` on the whole item when two keys collate equal.
    pub fn sort_by_key<T: Ord>(&mut self, items: &mut [T], key: impl Fn(&T) -> &str) {
        items.sort_by(|a, b| self.compare(key(a), key(b)).then_with(|| a.cmp(b)));
    }

    pub fn sort_strings(&mut self, items: &mut [String]) {
        self.sort_by_key(items, |s| s.as_str());
    }
}

impl Default for BritishCollator {
    fn default() -> Self {
        Self::new()
    }
}
