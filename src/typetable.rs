//! Per-scope type table: an append-only vector of classified type entries.
//!
//! Type bodies are tagged enum variants rather than an opaque side buffer;
//! the classification tag doubles as the wire code of the typedef
//! encoding.  Like the symbol table, slot 0 is reserved and local ids
//! start at 1; global type ids are `id_offset + local`.

use num_enum::TryFromPrimitive;

use crate::scope::{Symbol, TypeId};

/// Wire classification of a type entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeClass {
    /// Carries a typeref and re-dispatches on the referenced type.
    Any = 1,
    /// A reference to a type in scope.
    TypeRef = 2,
    /// A reference to a symbol in scope.
    SymRef = 3,
    Int = 4,
    Choice = 5,
    Array = 6,
    Record = 7,
}

/// Integer type body.  `bits` of `None` selects the variable-length
/// encoding; a fixed width larger than 64 decodes as a bigint window.
#[derive(Debug, Clone, Default)]
pub struct IntType {
    /// Power-of-two bit alignment applied before the value (0 = none).
    pub align: u32,
    pub pad: u32,
    pub bits: Option<u32>,
    pub twos_complement: bool,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub bswap: Option<u32>,
    /// Named values (enumeration aliases).
    pub names: Vec<(Symbol, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceOption {
    /// Decoding continues with the referenced type.
    Type(TypeId),
    /// A literal; selecting it consumes nothing further.
    Value(i64),
}

#[derive(Debug, Clone, Default)]
pub struct ChoiceType {
    pub align: u32,
    pub pad: u32,
    pub options: Vec<ChoiceOption>,
}

#[derive(Debug, Clone)]
pub struct ArrayType {
    pub align: u32,
    pub pad: u32,
    pub elem_type: TypeId,
    /// Integer type used to encode dynamic dimensions; `None` means plain
    /// variable-length sizes.
    pub dim_type: Option<TypeId>,
    /// Declared dimensions; 0 marks a dynamic dimension read from the
    /// stream per value.
    pub dims: Vec<usize>,
}

/// Which of the three disjoint field sets a record field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Encoded for every record value, in declaration order.
    Always,
    /// Guarded by one bit of the record selector's presence bitmap.
    Often,
    /// Carried in the explicit extra-field list.
    Seldom,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordField {
    pub name: Symbol,
    pub ty: TypeId,
    pub placement: Placement,
}

#[derive(Debug, Clone, Default)]
pub struct RecordType {
    pub align: u32,
    pub pad: u32,
    pub static_bits: Option<usize>,
    /// When set, arbitrary extra fields are allowed and each decodes with
    /// this type.
    pub other_field_type: Option<TypeId>,
    pub fields: Vec<RecordField>,
}

impl RecordType {
    #[must_use]
    pub fn often_count(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| f.placement == Placement::Often)
            .count()
    }

    #[must_use]
    pub fn seldom_count(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| f.placement == Placement::Seldom)
            .count()
    }

    /// Whether any value of this record begins with a selector.
    #[must_use]
    pub fn has_selector(&self) -> bool {
        self.often_count() > 0 || self.seldom_count() > 0 || self.other_field_type.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum TypeDef {
    Any,
    TypeRef,
    SymRef,
    Int(IntType),
    Choice(ChoiceType),
    Array(ArrayType),
    Record(RecordType),
}

impl TypeDef {
    #[must_use]
    pub fn class(&self) -> TypeClass {
        match self {
            TypeDef::Any => TypeClass::Any,
            TypeDef::TypeRef => TypeClass::TypeRef,
            TypeDef::SymRef => TypeClass::SymRef,
            TypeDef::Int(_) => TypeClass::Int,
            TypeDef::Choice(_) => TypeClass::Choice,
            TypeDef::Array(_) => TypeClass::Array,
            TypeDef::Record(_) => TypeClass::Record,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub name: Symbol,
    pub parent: Option<TypeId>,
    pub def: TypeDef,
}

const MAX_ENTRIES: usize = (1 << 31) - 1;

#[derive(Debug)]
pub(crate) struct TypeTable {
    entries: Vec<TypeEntry>,
    id_offset: u32,
}

impl TypeTable {
    pub(crate) fn new(id_offset: u32) -> TypeTable {
        TypeTable {
            entries: Vec::new(),
            id_offset,
        }
    }

    /// Occupied entry count including the reserved slot 0.
    pub(crate) fn used(&self) -> usize {
        self.entries.len() + 1
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn id_offset(&self) -> u32 {
        self.id_offset
    }

    pub(crate) fn entry(&self, local: usize) -> Option<&TypeEntry> {
        if local == 0 {
            return None;
        }
        self.entries.get(local - 1)
    }

    pub(crate) fn push(&mut self, entry: TypeEntry) -> Result<usize, crate::error::Error> {
        if self.used() >= MAX_ENTRIES {
            return Err(crate::error::Error::DoingItWrong("type table is full"));
        }
        self.entries.push(entry);
        Ok(self.entries.len())
    }

    /// Roll the table back to `count` real entries.
    pub(crate) fn truncate(&mut self, count: usize) {
        self.entries.truncate(count);
    }

    /// Linear search by name symbol, newest first (later definitions
    /// shadow earlier ones).
    pub(crate) fn find_by_name(&self, name: Symbol) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| e.name == name)
            .map(|i| i + 1)
    }
}

#[test]
fn class_codes_round_trip() {
    for (code, class) in [
        (1u8, TypeClass::Any),
        (2, TypeClass::TypeRef),
        (3, TypeClass::SymRef),
        (4, TypeClass::Int),
        (5, TypeClass::Choice),
        (6, TypeClass::Array),
        (7, TypeClass::Record),
    ] {
        assert_eq!(TypeClass::try_from(code).unwrap(), class);
        assert_eq!(class as u8, code);
    }
    assert!(TypeClass::try_from(0u8).is_err());
    assert!(TypeClass::try_from(8u8).is_err());
}
