//! Header flavors.
//!
//! The flavor fixes a header's element width, which of its three generic
//! cross-reference slots the collector follows, and whether teardown
//! work is required when it dies.

use crate::cell::CELL_SIZE;

/// Family of object a header represents.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Growable array of cells.
    Array = 0,
    /// Context values; slot 0 holds the archetype.
    Varlist = 1,
    /// Context keys (symbols).
    Keylist = 2,
    /// Callable parameters; slot 0 holds the archetype.
    Paramlist = 3,
    /// Callable implementation details.
    Details = 4,
    /// Alternating key/value cells of a map.
    Pairlist = 5,
    /// Hash index of a pairlist (`u32` entries).
    Hashlist = 6,
    /// Byte string.
    Binary = 7,
    /// UTF-8 string.
    String = 8,
    /// Codepoint-to-offset cache of a string.
    Bookmarks = 9,
    /// Interned symbol spelling.
    Symbol = 10,
    /// Foreign resource: `[pointer, length]`.
    Handle = 11,
    /// Single cell held alive by an API root scope.
    Api = 12,
    /// Two inline cells.
    Pairing = 13,
    /// The canonical target of dangling references.
    Inaccessible = 14,
}

impl Flavor {
    /// Number of flavors.
    pub const COUNT: usize = 15;

    /// Byte width of one element.
    pub const fn width(self) -> usize {
        match self {
            Flavor::Array
            | Flavor::Varlist
            | Flavor::Keylist
            | Flavor::Paramlist
            | Flavor::Details
            | Flavor::Pairlist
            | Flavor::Api
            | Flavor::Pairing => CELL_SIZE,
            Flavor::Hashlist => std::mem::size_of::<u32>(),
            Flavor::Bookmarks | Flavor::Handle => std::mem::size_of::<usize>(),
            Flavor::Binary | Flavor::String | Flavor::Symbol | Flavor::Inaccessible => 1,
        }
    }

    /// Whether elements are cells the collector must visit.
    #[inline]
    pub const fn holds_cells(self) -> bool {
        matches!(
            self,
            Flavor::Array
                | Flavor::Varlist
                | Flavor::Keylist
                | Flavor::Paramlist
                | Flavor::Details
                | Flavor::Pairlist
                | Flavor::Api
                | Flavor::Pairing
        )
    }

    /// Whether the content keeps a zero terminator after the last element.
    #[inline]
    pub const fn is_byte_sized(self) -> bool {
        matches!(self, Flavor::Binary | Flavor::String | Flavor::Symbol)
    }

    /// Units reserved past the end for a terminator.
    #[inline]
    pub const fn terminator(self) -> usize {
        if self.is_byte_sized() {
            1
        } else {
            0
        }
    }

    /// Whether `link` holds a followable reference.
    pub const fn follows_link(self) -> bool {
        matches!(
            self,
            Flavor::Varlist | Flavor::Keylist | Flavor::Paramlist | Flavor::Pairlist
        )
    }

    /// Whether `misc` holds a followable reference.
    pub const fn follows_misc(self) -> bool {
        matches!(self, Flavor::Varlist | Flavor::Paramlist)
    }

    /// Whether `info` holds a followable reference.
    pub const fn follows_info(self) -> bool {
        matches!(self, Flavor::Paramlist)
    }

    /// Whether the header size is fixed at creation.
    pub const fn is_fixed_size(self) -> bool {
        matches!(
            self,
            Flavor::Pairing | Flavor::Handle | Flavor::Api | Flavor::Inaccessible
        )
    }

    /// Whether the sweeper must run teardown before freeing.
    pub const fn needs_teardown(self) -> bool {
        !matches!(self, Flavor::Pairing | Flavor::Inaccessible)
    }

    /// Human-readable name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Flavor::Array => "array",
            Flavor::Varlist => "varlist",
            Flavor::Keylist => "keylist",
            Flavor::Paramlist => "paramlist",
            Flavor::Details => "details",
            Flavor::Pairlist => "pairlist",
            Flavor::Hashlist => "hashlist",
            Flavor::Binary => "binary",
            Flavor::String => "string",
            Flavor::Bookmarks => "bookmarks",
            Flavor::Symbol => "symbol",
            Flavor::Handle => "handle",
            Flavor::Api => "api",
            Flavor::Pairing => "pairing",
            Flavor::Inaccessible => "inaccessible",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(Flavor::Array.width(), CELL_SIZE);
        assert_eq!(Flavor::Binary.width(), 1);
        assert_eq!(Flavor::Hashlist.width(), 4);
        assert!(Flavor::Varlist.holds_cells());
        assert!(!Flavor::Hashlist.holds_cells());
        assert!(!Flavor::Handle.holds_cells());
    }

    #[test]
    fn test_terminator_only_for_bytes() {
        assert_eq!(Flavor::String.terminator(), 1);
        assert_eq!(Flavor::Binary.terminator(), 1);
        assert_eq!(Flavor::Array.terminator(), 0);
        assert_eq!(Flavor::Hashlist.terminator(), 0);
    }

    #[test]
    fn test_string_link_is_not_followed() {
        // The bookmark cache is owned, not traced.
        assert!(!Flavor::String.follows_link());
        assert!(Flavor::Pairlist.follows_link());
        assert!(Flavor::Paramlist.follows_info());
    }
}
