//! Value slots.
//!
//! A [`Cell`] is the fixed-size tagged record that evaluator code stores
//! in arrays, frames and the data stack. It has three payload fields, any
//! of which may hold a reference to a header record. Whether a field is
//! followed by the collector is decided by a per-kind table of
//! [`CellMarks`], not by switching on the kind at every visit.

use crate::stub::StubId;

bitflags::bitflags! {
    /// Which payload fields of a cell hold followable references.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CellMarks: u8 {
        /// The `extra` field (binding) needs marking.
        const EXTRA = 1 << 0;
        /// The `first` payload field needs marking.
        const FIRST = 1 << 1;
        /// The `second` payload field needs marking.
        const SECOND = 1 << 2;
    }
}

/// Datatype of a cell.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// No value.
    Blank = 0,
    /// Boolean.
    Logic = 1,
    /// 64-bit signed integer.
    Integer = 2,
    /// 64-bit float.
    Decimal = 3,
    /// Unicode codepoint.
    Char = 4,
    /// Array of values with a position.
    Block = 5,
    /// Array of values evaluated in place.
    Group = 6,
    /// UTF-8 string with a position.
    Text = 7,
    /// Byte string with a position.
    Binary = 8,
    /// Symbol with an optional binding.
    Word = 9,
    /// Context (varlist).
    Object = 10,
    /// Callable (paramlist) with an optional binding.
    Action = 11,
    /// Key/value map (pairlist).
    Map = 12,
    /// Two values held in a pairing.
    Pair = 13,
    /// Foreign resource handle.
    Handle = 14,
}

impl Kind {
    /// Number of kinds.
    pub const COUNT: usize = 15;

    /// Marking flags for this kind.
    #[inline]
    pub const fn marks(self) -> CellMarks {
        KIND_MARKS[self as usize]
    }

    /// Whether cells of this kind can reference headers at all.
    #[inline]
    pub const fn is_bindable_or_series(self) -> bool {
        !self.marks().is_empty()
    }
}

const NONE: CellMarks = CellMarks::empty();
const SERIES: CellMarks = CellMarks::FIRST;
const BOUND_SERIES: CellMarks = CellMarks::EXTRA.union(CellMarks::FIRST);

/// Per-kind marking table, indexed by `Kind as usize`.
const KIND_MARKS: [CellMarks; Kind::COUNT] = [
    NONE,         // Blank
    NONE,         // Logic
    NONE,         // Integer
    NONE,         // Decimal
    NONE,         // Char
    BOUND_SERIES, // Block
    BOUND_SERIES, // Group
    SERIES,       // Text
    SERIES,       // Binary
    BOUND_SERIES, // Word
    BOUND_SERIES, // Object (extra = phase)
    BOUND_SERIES, // Action (extra = coupling)
    SERIES,       // Map
    SERIES,       // Pair
    SERIES,       // Handle
];

/// One payload field of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// Unused.
    None,
    /// Integer data.
    Int(i64),
    /// Floating point data.
    Decimal(f64),
    /// Position within a series.
    Index(usize),
    /// Codepoint.
    Char(char),
    /// Boolean.
    Logic(bool),
    /// Reference to a header record.
    Node(StubId),
    /// Opaque machine word.
    Addr(usize),
}

impl Payload {
    /// The referenced header, if this field holds one.
    #[inline]
    pub fn node(self) -> Option<StubId> {
        match self {
            Payload::Node(id) => Some(id),
            _ => None,
        }
    }
}

/// Fixed-size tagged value slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    kind: Kind,
    /// Binding or other kind-specific extra data.
    pub extra: Payload,
    /// First payload field.
    pub first: Payload,
    /// Second payload field.
    pub second: Payload,
}

/// Size in bytes of one cell.
pub const CELL_SIZE: usize = std::mem::size_of::<Cell>();

impl Cell {
    /// Build a cell from raw parts.
    pub const fn new(kind: Kind, extra: Payload, first: Payload, second: Payload) -> Self {
        Self {
            kind,
            extra,
            first,
            second,
        }
    }

    /// The blank value.
    pub const fn blank() -> Self {
        Self::new(Kind::Blank, Payload::None, Payload::None, Payload::None)
    }

    /// A boolean.
    pub const fn logic(flag: bool) -> Self {
        Self::new(Kind::Logic, Payload::None, Payload::Logic(flag), Payload::None)
    }

    /// An integer.
    pub const fn integer(n: i64) -> Self {
        Self::new(Kind::Integer, Payload::None, Payload::Int(n), Payload::None)
    }

    /// A decimal.
    pub const fn decimal(d: f64) -> Self {
        Self::new(Kind::Decimal, Payload::None, Payload::Decimal(d), Payload::None)
    }

    /// A codepoint.
    pub const fn char(c: char) -> Self {
        Self::new(Kind::Char, Payload::None, Payload::Char(c), Payload::None)
    }

    /// A block positioned at `index` in `array`.
    pub const fn block(array: StubId, index: usize) -> Self {
        Self::new(
            Kind::Block,
            Payload::None,
            Payload::Node(array),
            Payload::Index(index),
        )
    }

    /// A group positioned at `index` in `array`.
    pub const fn group(array: StubId, index: usize) -> Self {
        Self::new(
            Kind::Group,
            Payload::None,
            Payload::Node(array),
            Payload::Index(index),
        )
    }

    /// Text positioned at `index` in `string`.
    pub const fn text(string: StubId, index: usize) -> Self {
        Self::new(
            Kind::Text,
            Payload::None,
            Payload::Node(string),
            Payload::Index(index),
        )
    }

    /// A binary positioned at `index`.
    pub const fn binary(bytes: StubId, index: usize) -> Self {
        Self::new(
            Kind::Binary,
            Payload::None,
            Payload::Node(bytes),
            Payload::Index(index),
        )
    }

    /// A word naming `symbol`, optionally bound to a context.
    pub fn word(symbol: StubId, binding: Option<StubId>) -> Self {
        Self::new(
            Kind::Word,
            binding.map_or(Payload::None, Payload::Node),
            Payload::Node(symbol),
            Payload::None,
        )
    }

    /// An object referencing its varlist.
    pub const fn object(varlist: StubId) -> Self {
        Self::new(
            Kind::Object,
            Payload::None,
            Payload::Node(varlist),
            Payload::None,
        )
    }

    /// An action referencing its paramlist, optionally coupled.
    pub fn action(paramlist: StubId, binding: Option<StubId>) -> Self {
        Self::new(
            Kind::Action,
            binding.map_or(Payload::None, Payload::Node),
            Payload::Node(paramlist),
            Payload::None,
        )
    }

    /// A map referencing its pairlist.
    pub const fn map(pairlist: StubId) -> Self {
        Self::new(Kind::Map, Payload::None, Payload::Node(pairlist), Payload::None)
    }

    /// A pair referencing its pairing.
    pub const fn pair(pairing: StubId) -> Self {
        Self::new(Kind::Pair, Payload::None, Payload::Node(pairing), Payload::None)
    }

    /// A handle referencing its handle header.
    pub const fn handle(stub: StubId) -> Self {
        Self::new(Kind::Handle, Payload::None, Payload::Node(stub), Payload::None)
    }

    /// The kind of this cell.
    #[inline]
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// The primary referenced header, if the kind has one.
    #[inline]
    pub fn series(&self) -> Option<StubId> {
        if self.kind.marks().contains(CellMarks::FIRST) {
            self.first.node()
        } else {
            None
        }
    }

    /// Visit every followable reference, allowing it to be rewritten.
    ///
    /// Only fields flagged in the kind's marking table are visited.
    #[inline]
    pub fn for_each_node_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut StubId),
    {
        let marks = self.kind.marks();
        if marks.contains(CellMarks::EXTRA) {
            if let Payload::Node(id) = &mut self.extra {
                f(id);
            }
        }
        if marks.contains(CellMarks::FIRST) {
            if let Payload::Node(id) = &mut self.first {
                f(id);
            }
        }
        if marks.contains(CellMarks::SECOND) {
            if let Payload::Node(id) = &mut self.second {
                f(id);
            }
        }
    }

    /// Collect the followable references of this cell.
    pub fn nodes(&self) -> impl Iterator<Item = StubId> {
        let mut copy = *self;
        let mut found = [None; 3];
        let mut n = 0;
        copy.for_each_node_mut(|id| {
            found[n] = Some(*id);
            n += 1;
        });
        found.into_iter().flatten()
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_fits_two_per_header() {
        // Two cells must fit the inline content of a header.
        assert!(CELL_SIZE <= 64);
        assert_eq!(CELL_SIZE % 8, 0);
    }

    #[test]
    fn test_scalars_hold_no_nodes() {
        assert_eq!(Cell::integer(5).nodes().count(), 0);
        assert_eq!(Cell::blank().nodes().count(), 0);
        assert_eq!(Cell::decimal(1.5).nodes().count(), 0);
    }

    #[test]
    fn test_word_marks_binding_and_symbol() {
        let sym = StubId::new(3, 1);
        let ctx = StubId::new(4, 1);
        let word = Cell::word(sym, Some(ctx));
        let nodes: Vec<_> = word.nodes().collect();
        assert_eq!(nodes, vec![ctx, sym]);

        let unbound = Cell::word(sym, None);
        assert_eq!(unbound.nodes().collect::<Vec<_>>(), vec![sym]);
    }

    #[test]
    fn test_unflagged_field_is_not_followed() {
        // Text does not mark `second`, even if it happens to hold a node.
        let s = StubId::new(1, 1);
        let mut cell = Cell::text(s, 0);
        cell.second = Payload::Node(StubId::new(9, 1));
        assert_eq!(cell.nodes().collect::<Vec<_>>(), vec![s]);
    }

    #[test]
    fn test_rewrite_in_place() {
        let old = StubId::new(1, 1);
        let new = StubId::new(2, 7);
        let mut cell = Cell::block(old, 3);
        cell.for_each_node_mut(|id| *id = new);
        assert_eq!(cell.series(), Some(new));
        assert_eq!(cell.second, Payload::Index(3));
    }
}
