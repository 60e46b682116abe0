//! Scopes: stacked symbol and type tables with inheritance, imports, and
//! relative reference resolution.
//!
//! A scope starts mutable, accumulates symbols and types (either one at a
//! time or parsed from encoded blocks), and is then finalized.  Finalized
//! scopes are immutable: they can be shared (`Rc`), used as parents for
//! deeper scopes, used as import sources, and handed to decoders.

use std::num::NonZero;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::bits::Cursor;
use crate::bstr::{ByteString, Part};
use crate::env::Env;
use crate::error::Error;
use crate::symtable::{SymbolEntry, SymbolTable};
use crate::typetable::{
    ArrayType, ChoiceOption, ChoiceType, IntType, Placement, RecordField, RecordType, TypeClass,
    TypeDef, TypeEntry, TypeTable,
};
use crate::vint::{self, SignedVInt};

/// A symbol id.  Ids are 1-based and scope-global: valid within the scope
/// that produced them and its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(NonZero<u32>);

impl Symbol {
    pub(crate) fn new(id: u32) -> Option<Symbol> {
        NonZero::new(id).map(Symbol)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// A type id, with the same scope-global numbering rules as [`Symbol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(NonZero<u32>);

impl TypeId {
    pub(crate) fn new(id: u32) -> Option<TypeId> {
        NonZero::new(id).map(TypeId)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// A pending lazy import: symbols and types copy over from `src` on first
/// by-name lookup, tracked by the id maps.
#[derive(Debug)]
struct LazyImport {
    src: Rc<Scope>,
    sym_map: Vec<Option<Symbol>>,
    type_map: Vec<Option<TypeId>>,
}

#[derive(Debug)]
pub struct Scope {
    env: Rc<Env>,
    parent: Option<Rc<Scope>>,
    level: usize,
    is_final: bool,
    /// Whether the own tables joined the inherited stacks yet.  A scope
    /// that never defines a symbol contributes no symbol table.
    has_symbols: bool,
    has_types: bool,
    symtable: SymbolTable,
    typetable: TypeTable,
    lazy_imports: Vec<LazyImport>,
    /// Totals across the whole stack; also the highest valid ids.
    symbol_count: usize,
    type_count: usize,
}

impl Scope {
    /// Create a scope, optionally inheriting from `parent`.  The parent
    /// must be finalized, belong to the same environment, and sit below
    /// the configured nesting limit.
    pub fn new(env: &Rc<Env>, parent: Option<&Rc<Scope>>) -> Result<Scope, Error> {
        let (level, symbol_count, type_count) = match parent {
            Some(p) => {
                if !Rc::ptr_eq(&p.env, env) {
                    return Err(Error::ForeignScope);
                }
                if !p.is_final {
                    return Err(Error::DoingItWrong(
                        "parent scope must be finalized before nesting",
                    ));
                }
                if p.level >= env.scope_stack_max() {
                    return Err(Error::Limit {
                        what: "scope nesting level",
                        max: env.scope_stack_max(),
                    });
                }
                (p.level + 1, p.symbol_count, p.type_count)
            }
            None => (0, 0, 0),
        };
        log::trace!("scope: create level={level}");
        Ok(Scope {
            env: Rc::clone(env),
            parent: parent.cloned(),
            level,
            is_final: false,
            has_symbols: false,
            has_types: false,
            symtable: SymbolTable::new(symbol_count as u32, env.salt()),
            typetable: TypeTable::new(type_count as u32),
            lazy_imports: Vec::new(),
            symbol_count,
            type_count,
        })
    }

    #[must_use]
    pub fn env(&self) -> &Rc<Env> {
        &self.env
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Total symbols reachable from this scope (the highest valid id).
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbol_count
    }

    /// Total types reachable from this scope.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.type_count
    }

    #[must_use]
    pub fn contains_type(&self, ty: TypeId) -> bool {
        ty.get() as usize <= self.type_count
    }

    /// Scopes from the root down to `self`.
    fn ancestry(&self) -> SmallVec<[&Scope; 8]> {
        let mut chain: SmallVec<[&Scope; 8]> = SmallVec::new();
        let mut scope = self;
        loop {
            chain.push(scope);
            match &scope.parent {
                Some(p) => scope = p,
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// The symbol-table stack: one table per ancestor that defined
    /// symbols, oldest first.
    fn sym_stack(&self) -> SmallVec<[&SymbolTable; 8]> {
        self.ancestry()
            .into_iter()
            .filter(|s| s.has_symbols)
            .map(|s| &s.symtable)
            .collect()
    }

    fn type_stack(&self) -> SmallVec<[&TypeTable; 8]> {
        self.ancestry()
            .into_iter()
            .filter(|s| s.has_types)
            .map(|s| &s.typetable)
            .collect()
    }

    // ------------------------------------------------------------------
    // symbols

    /// Look up a symbol by name without creating it.  Does not trigger
    /// lazy imports (those materialize through the `&mut` paths).
    #[must_use]
    pub fn get_symbol(&self, name: &str) -> Option<Symbol> {
        let bytes = name.as_bytes();
        if self.has_symbols {
            if let Some(local) = self.symtable.lookup(bytes) {
                return Symbol::new(self.symtable.id_offset() + local as u32);
            }
        }
        let mut parent = self.parent.as_deref();
        while let Some(scope) = parent {
            if scope.has_symbols {
                if let Some(local) = scope.symtable.lookup(bytes) {
                    return Symbol::new(scope.symtable.id_offset() + local as u32);
                }
            }
            parent = scope.parent.as_deref();
        }
        None
    }

    /// Get or create a symbol.  Existing names anywhere in the stack (or
    /// reachable through a lazy import) are reused.
    pub fn add_symbol(&mut self, name: &str) -> Result<Symbol, Error> {
        if self.is_final {
            return Err(Error::ScopeFinal);
        }
        if let Some(sym) = self.find_symbol_populating(name.as_bytes())? {
            return Ok(sym);
        }
        if let Some(sym) = self.materialize_lazy(name)? {
            return Ok(sym);
        }
        self.create_symbol(name.as_bytes(), None)
    }

    /// Search the stack, catching the own table's index up first.
    fn find_symbol_populating(&mut self, name: &[u8]) -> Result<Option<Symbol>, Error> {
        if self.has_symbols {
            self.symtable.populate_index()?;
            if let Some(local) = self.symtable.lookup(name) {
                return Ok(Symbol::new(self.symtable.id_offset() + local as u32));
            }
        }
        let mut parent = self.parent.as_deref();
        while let Some(scope) = parent {
            if scope.has_symbols {
                if let Some(local) = scope.symtable.lookup(name) {
                    return Ok(Symbol::new(scope.symtable.id_offset() + local as u32));
                }
            }
            parent = scope.parent.as_deref();
        }
        Ok(None)
    }

    fn create_symbol(&mut self, name: &[u8], canonical: Option<Symbol>) -> Result<Symbol, Error> {
        let local = self.symtable.add(name)?;
        self.has_symbols = true;
        self.symbol_count += 1;
        let sym = Symbol::new(self.symtable.id_offset() + local as u32)
            .ok_or(Error::BadState("symbol id overflow"))?;
        if let (Some(c), Some(entry)) = (canonical, self.symtable.entry_mut(local)) {
            entry.canonical = Some(c);
        }
        Ok(sym)
    }

    /// Name of a symbol id, valid in this scope.
    #[must_use]
    pub fn symbol_name(&self, sym: Symbol) -> Option<&str> {
        std::str::from_utf8(self.symbol_name_bytes(sym)?).ok()
    }

    pub(crate) fn symbol_name_bytes(&self, sym: Symbol) -> Option<&[u8]> {
        let id = sym.get() as usize;
        for table in self.sym_stack() {
            let offset = table.id_offset() as usize;
            if id > offset && id <= offset + table.count() {
                return table.name_bytes(id - offset);
            }
        }
        None
    }

    pub(crate) fn symbol_entry(&self, sym: Symbol) -> Option<&SymbolEntry> {
        let id = sym.get() as usize;
        for table in self.sym_stack() {
            let offset = table.id_offset() as usize;
            if id > offset && id <= offset + table.count() {
                return table.entry(id - offset);
            }
        }
        None
    }

    /// Parse a packed NUL-delimited symbol block into this scope.
    pub fn parse_symbols(&mut self, parts: &[Part], count: usize) -> Result<(), Error> {
        if self.is_final {
            return Err(Error::ScopeFinal);
        }
        self.symtable.parse_block(parts, count)?;
        if count > 0 {
            self.has_symbols = true;
            self.symbol_count += count;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // relative references

    /// Resolve an encoded symbol reference.
    ///
    /// Even values are absolute ids (`raw >> 1`).  Odd values select a
    /// table by the count of trailing 1 bits `d`: odd `d` counts down
    /// from the top of the stack (`len - 1 - d/2`), even `d` counts from
    /// the bottom (`d/2`).  The remaining bits are an offset past each
    /// table's reserved slot 0.  Anything out of range resolves to
    /// `None`, never an error.
    #[must_use]
    pub fn resolve_relative_symref(&self, raw: usize) -> Option<Symbol> {
        let (depth, val) = split_relative(raw);
        if depth == 0 {
            return if val >= 1 && val <= self.symbol_count {
                Symbol::new(val as u32)
            } else {
                None
            };
        }
        let stack = self.sym_stack();
        let table = stack[select_table(depth, stack.len())?];
        let local = val + 1;
        if local >= table.used() {
            return None;
        }
        Symbol::new(table.id_offset() + local as u32)
    }

    /// Resolve an encoded type reference; same scheme as
    /// [`Scope::resolve_relative_symref`].
    #[must_use]
    pub fn resolve_relative_typeref(&self, raw: usize) -> Option<TypeId> {
        let (depth, val) = split_relative(raw);
        if depth == 0 {
            return if val >= 1 && val <= self.type_count {
                TypeId::new(val as u32)
            } else {
                None
            };
        }
        let stack = self.type_stack();
        let table = stack[select_table(depth, stack.len())?];
        let local = val + 1;
        if local >= table.used() {
            return None;
        }
        TypeId::new(table.id_offset() + local as u32)
    }

    // ------------------------------------------------------------------
    // types

    /// Define a type.  `name` must be a symbol valid in this scope, and
    /// every type referenced by `def` must already exist in the stack.
    pub fn add_type(&mut self, name: Symbol, def: TypeDef) -> Result<TypeId, Error> {
        if self.is_final {
            return Err(Error::ScopeFinal);
        }
        if name.get() as usize > self.symbol_count {
            return Err(Error::DoingItWrong("type name symbol is not in this scope"));
        }
        self.check_def_refs(&def)?;
        self.push_type(TypeEntry {
            name,
            parent: None,
            def,
        })
    }

    fn push_type(&mut self, entry: TypeEntry) -> Result<TypeId, Error> {
        let name = entry.name;
        let local = self.typetable.push(entry)?;
        self.has_types = true;
        self.type_count += 1;
        let ty = TypeId::new(self.typetable.id_offset() + local as u32)
            .ok_or(Error::BadState("type id overflow"))?;
        // when the name symbol lives in the own table, note the binding
        let sym_offset = self.symtable.id_offset() as usize;
        let sym_id = name.get() as usize;
        if self.has_symbols && sym_id > sym_offset {
            if let Some(e) = self.symtable.entry_mut(sym_id - sym_offset) {
                e.type_ref = Some(ty);
            }
        }
        Ok(ty)
    }

    fn check_def_refs(&self, def: &TypeDef) -> Result<(), Error> {
        let check = |ty: TypeId| {
            if self.contains_type(ty) {
                Ok(())
            } else {
                Err(Error::TypeScope)
            }
        };
        match def {
            TypeDef::Any | TypeDef::TypeRef | TypeDef::SymRef | TypeDef::Int(_) => Ok(()),
            TypeDef::Choice(c) => {
                for opt in &c.options {
                    if let ChoiceOption::Type(t) = opt {
                        check(*t)?;
                    }
                }
                Ok(())
            }
            TypeDef::Array(a) => {
                check(a.elem_type)?;
                if let Some(d) = a.dim_type {
                    check(d)?;
                }
                Ok(())
            }
            TypeDef::Record(r) => {
                if let Some(t) = r.other_field_type {
                    check(t)?;
                }
                if r.fields.len() > self.env.record_fields_max() {
                    return Err(Error::Limit {
                        what: "record field count",
                        max: self.env.record_fields_max(),
                    });
                }
                for f in &r.fields {
                    check(f.ty)?;
                    if f.name.get() as usize > self.symbol_count {
                        return Err(Error::Record("field name symbol is not in this scope"));
                    }
                }
                Ok(())
            }
        }
    }

    /// The type named by `name`, searching the stack newest-first.
    #[must_use]
    pub fn get_type(&self, name: Symbol) -> Option<TypeId> {
        for table in self.type_stack().into_iter().rev() {
            if let Some(local) = table.find_by_name(name) {
                return TypeId::new(table.id_offset() + local as u32);
            }
        }
        None
    }

    #[must_use]
    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.get_type(self.get_symbol(name)?)
    }

    #[must_use]
    pub fn type_entry(&self, ty: TypeId) -> Option<&TypeEntry> {
        let id = ty.get() as usize;
        for table in self.type_stack() {
            let offset = table.id_offset() as usize;
            if id > offset && id <= offset + table.count() {
                return table.entry(id - offset);
            }
        }
        None
    }

    /// Parse `count` encoded type definitions.  On any failure the type
    /// table is rolled back to its pre-call state.
    pub fn parse_types(&mut self, parts: &[Part], count: usize) -> Result<(), Error> {
        if self.is_final {
            return Err(Error::ScopeFinal);
        }
        let mut input = ByteString::new();
        input.append_parts(parts);
        let mut cur = Cursor::new(&input);
        let orig = self.typetable.count();
        let orig_has_types = self.has_types;
        for _ in 0..count {
            if let Err(e) = self.parse_one_typedef(&mut cur, &input) {
                let added = self.typetable.count() - orig;
                self.type_count -= added;
                self.typetable.truncate(orig);
                self.has_types = orig_has_types;
                // drop symbol bindings to the discarded entries
                let last_valid = self.typetable.id_offset() + orig as u32;
                self.symtable.clear_type_refs_above(last_valid);
                return Err(e);
            }
        }
        Ok(())
    }

    fn read_symref(&self, cur: &mut Cursor, input: &ByteString) -> Result<Symbol, Error> {
        let raw = vint::read_vsize(cur, input)?;
        self.resolve_relative_symref(raw)
            .ok_or(Error::Symbol {
                detail: "unresolvable symbol reference",
                pos: cur.byte_pos(input),
            })
    }

    fn read_typeref(&self, cur: &mut Cursor, input: &ByteString) -> Result<TypeId, Error> {
        let raw = vint::read_vsize(cur, input)?;
        self.resolve_relative_typeref(raw)
            .ok_or(Error::Type("unresolvable type reference"))
    }

    fn read_small_int(&self, cur: &mut Cursor, input: &ByteString) -> Result<i64, Error> {
        match vint::read_vint_signed(cur, input)? {
            SignedVInt::Small(v) => Ok(v),
            SignedVInt::Big(_) => Err(Error::Type("bigint not allowed in a type definition")),
        }
    }

    /// One typedef: `symref(name) vint(class) body`, with per-class
    /// presence flags ahead of optional fields.
    fn parse_one_typedef(&mut self, cur: &mut Cursor, input: &ByteString) -> Result<(), Error> {
        let name = self.read_symref(cur, input)?;
        let class_raw = vint::read_vsize(cur, input)?;
        let class = u8::try_from(class_raw)
            .ok()
            .and_then(|c| TypeClass::try_from(c).ok())
            .ok_or(Error::Type("unknown type class"))?;
        let mut parent = None;
        let def = match class {
            TypeClass::Any => TypeDef::Any,
            TypeClass::TypeRef => TypeDef::TypeRef,
            TypeClass::SymRef => TypeDef::SymRef,
            TypeClass::Int => {
                let flags = vint::read_vsize(cur, input)?;
                let mut int = IntType::default();
                if flags & 0x01 != 0 {
                    int.align = read_align(cur, input)?;
                }
                if flags & 0x02 != 0 {
                    int.pad = read_align(cur, input)?;
                }
                if flags & 0x04 != 0 {
                    let bits = vint::read_vsize(cur, input)?;
                    if bits == 0 || bits > u32::MAX as usize {
                        return Err(Error::Type("integer bit width out of range"));
                    }
                    int.bits = Some(bits as u32);
                }
                int.twos_complement = flags & 0x08 != 0;
                if flags & 0x10 != 0 {
                    int.min = Some(self.read_small_int(cur, input)?);
                }
                if flags & 0x20 != 0 {
                    int.max = Some(self.read_small_int(cur, input)?);
                }
                if flags & 0x40 != 0 {
                    int.bswap = Some(vint::read_vsize(cur, input)? as u32);
                }
                if flags & 0x80 != 0 {
                    let n = vint::read_vsize(cur, input)?;
                    if n > self.env.record_fields_max() {
                        return Err(Error::Limit {
                            what: "named value count",
                            max: self.env.record_fields_max(),
                        });
                    }
                    for _ in 0..n {
                        let sym = self.read_symref(cur, input)?;
                        let val = self.read_small_int(cur, input)?;
                        int.names.push((sym, val));
                    }
                }
                TypeDef::Int(int)
            }
            TypeClass::Choice => {
                let flags = vint::read_vsize(cur, input)?;
                let mut choice = ChoiceType::default();
                if flags & 0x01 != 0 {
                    choice.align = read_align(cur, input)?;
                }
                if flags & 0x02 != 0 {
                    choice.pad = read_align(cur, input)?;
                }
                let n = vint::read_vsize(cur, input)?;
                if n == 0 {
                    return Err(Error::Type("choice needs at least one option"));
                }
                if n > self.env.record_fields_max() {
                    return Err(Error::Limit {
                        what: "choice option count",
                        max: self.env.record_fields_max(),
                    });
                }
                for _ in 0..n {
                    let tag = vint::read_vsize(cur, input)?;
                    let opt = match tag {
                        0 => ChoiceOption::Type(self.read_typeref(cur, input)?),
                        1 => ChoiceOption::Value(self.read_small_int(cur, input)?),
                        _ => return Err(Error::Type("unknown choice option tag")),
                    };
                    choice.options.push(opt);
                }
                TypeDef::Choice(choice)
            }
            TypeClass::Array => {
                let flags = vint::read_vsize(cur, input)?;
                let mut align = 0;
                let mut pad = 0;
                if flags & 0x01 != 0 {
                    align = read_align(cur, input)?;
                }
                if flags & 0x02 != 0 {
                    pad = read_align(cur, input)?;
                }
                let dim_type = if flags & 0x04 != 0 {
                    Some(self.read_typeref(cur, input)?)
                } else {
                    None
                };
                let elem_type = self.read_typeref(cur, input)?;
                let n = vint::read_vsize(cur, input)?;
                if n > 255 {
                    return Err(Error::Limit {
                        what: "array dimension count",
                        max: 255,
                    });
                }
                let mut dims = Vec::with_capacity(n);
                for _ in 0..n {
                    dims.push(vint::read_vsize(cur, input)?);
                }
                TypeDef::Array(ArrayType {
                    align,
                    pad,
                    elem_type,
                    dim_type,
                    dims,
                })
            }
            TypeClass::Record => {
                let flags = vint::read_vsize(cur, input)?;
                let mut rec = RecordType::default();
                if flags & 0x01 != 0 {
                    rec.align = read_align(cur, input)?;
                }
                if flags & 0x02 != 0 {
                    rec.pad = read_align(cur, input)?;
                }
                if flags & 0x04 != 0 {
                    rec.static_bits = Some(vint::read_vsize(cur, input)?);
                }
                if flags & 0x08 != 0 {
                    rec.other_field_type = Some(self.read_typeref(cur, input)?);
                }
                if flags & 0x10 != 0 {
                    let n = vint::read_vsize(cur, input)?;
                    if n > self.env.record_fields_max() {
                        return Err(Error::Limit {
                            what: "record field count",
                            max: self.env.record_fields_max(),
                        });
                    }
                    for _ in 0..n {
                        let fname = self.read_symref(cur, input)?;
                        let fty = self.read_typeref(cur, input)?;
                        let placement = match vint::read_vsize(cur, input)? {
                            0 => Placement::Always,
                            1 => Placement::Often,
                            2 => Placement::Seldom,
                            _ => return Err(Error::Type("unknown field placement")),
                        };
                        rec.fields.push(RecordField {
                            name: fname,
                            ty: fty,
                            placement,
                        });
                    }
                }
                if flags & 0x20 != 0 {
                    parent = Some(self.read_typeref(cur, input)?);
                }
                TypeDef::Record(rec)
            }
        };
        self.push_type(TypeEntry { name, parent, def })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // imports

    /// Import symbols and types from a finalized scope of the same
    /// environment.  With `lazy`, nothing copies until a by-name lookup
    /// first needs it; the pending list is frozen once this scope is
    /// finalized.
    pub fn import(&mut self, src: &Rc<Scope>, lazy: bool) -> Result<(), Error> {
        if self.is_final {
            return Err(Error::DoingItWrong("can't import into a final scope"));
        }
        if !src.is_final {
            return Err(Error::DoingItWrong("can't import from a non-final scope"));
        }
        if !Rc::ptr_eq(&src.env, &self.env) {
            return Err(Error::ForeignScope);
        }
        let mut imp = LazyImport {
            src: Rc::clone(src),
            sym_map: vec![None; src.symbol_count + 1],
            type_map: vec![None; src.type_count + 1],
        };
        if lazy {
            self.lazy_imports.push(imp);
            return Ok(());
        }
        for id in 1..=imp.src.symbol_count {
            let sym = Symbol::new(id as u32).ok_or(Error::BadState("symbol id overflow"))?;
            self.import_symbol(&mut imp, sym)?;
        }
        for id in 1..=imp.src.type_count {
            let ty = TypeId::new(id as u32).ok_or(Error::BadState("type id overflow"))?;
            self.import_type(&mut imp, ty)?;
        }
        Ok(())
    }

    /// Copy one symbol over, reusing an existing definition by name.
    fn import_symbol(&mut self, imp: &mut LazyImport, src_sym: Symbol) -> Result<Symbol, Error> {
        if let Some(sym) = imp.sym_map[src_sym.get() as usize] {
            return Ok(sym);
        }
        let name = imp
            .src
            .symbol_name_bytes(src_sym)
            .ok_or(Error::BadState("import source symbol missing"))?
            .to_vec();
        let sym = match self.find_symbol_populating(&name)? {
            Some(existing) => existing,
            None => self.create_symbol(&name, Some(src_sym))?,
        };
        imp.sym_map[src_sym.get() as usize] = Some(sym);
        Ok(sym)
    }

    /// Copy one type over, remapping every reference inside its body.
    /// Same-name structurally identical definitions are reused.
    fn import_type(&mut self, imp: &mut LazyImport, src_ty: TypeId) -> Result<TypeId, Error> {
        if let Some(ty) = imp.type_map[src_ty.get() as usize] {
            return Ok(ty);
        }
        let entry = imp
            .src
            .type_entry(src_ty)
            .ok_or(Error::BadState("import source type missing"))?
            .clone();
        let name = self.import_symbol(imp, entry.name)?;
        let parent = match entry.parent {
            Some(p) => Some(self.import_type(imp, p)?),
            None => None,
        };
        let def = match entry.def {
            TypeDef::Any => TypeDef::Any,
            TypeDef::TypeRef => TypeDef::TypeRef,
            TypeDef::SymRef => TypeDef::SymRef,
            TypeDef::Int(mut int) => {
                for (sym, _) in &mut int.names {
                    *sym = self.import_symbol(imp, *sym)?;
                }
                TypeDef::Int(int)
            }
            TypeDef::Choice(mut choice) => {
                for opt in &mut choice.options {
                    if let ChoiceOption::Type(t) = opt {
                        *t = self.import_type(imp, *t)?;
                    }
                }
                TypeDef::Choice(choice)
            }
            TypeDef::Array(mut array) => {
                array.elem_type = self.import_type(imp, array.elem_type)?;
                if let Some(d) = array.dim_type {
                    array.dim_type = Some(self.import_type(imp, d)?);
                }
                TypeDef::Array(array)
            }
            TypeDef::Record(mut rec) => {
                if let Some(t) = rec.other_field_type {
                    rec.other_field_type = Some(self.import_type(imp, t)?);
                }
                for f in &mut rec.fields {
                    f.name = self.import_symbol(imp, f.name)?;
                    f.ty = self.import_type(imp, f.ty)?;
                }
                TypeDef::Record(rec)
            }
        };
        // reuse an identical definition of the same name
        if let Some(existing) = self.get_type(name) {
            if let Some(have) = self.type_entry(existing) {
                if type_def_eq(&have.def, &def) {
                    imp.type_map[src_ty.get() as usize] = Some(existing);
                    return Ok(existing);
                }
            }
        }
        let ty = self.push_type(TypeEntry { name, parent, def })?;
        imp.type_map[src_ty.get() as usize] = Some(ty);
        Ok(ty)
    }

    /// Walk pending lazy imports for `name`, materializing on a hit.
    fn materialize_lazy(&mut self, name: &str) -> Result<Option<Symbol>, Error> {
        if self.lazy_imports.is_empty() {
            return Ok(None);
        }
        let mut imports = std::mem::take(&mut self.lazy_imports);
        let mut result = Ok(None);
        for imp in &mut imports {
            let Some(src_sym) = imp.src.get_symbol(name) else {
                continue;
            };
            result = (|| {
                let sym = self.import_symbol(imp, src_sym)?;
                // a symbol naming a type brings the type along
                if let Some(entry) = imp.src.symbol_entry(src_sym) {
                    if let Some(src_ty) = entry.type_ref {
                        self.import_type(imp, src_ty)?;
                    }
                }
                Ok(Some(sym))
            })();
            break;
        }
        self.lazy_imports = imports;
        result
    }

    // ------------------------------------------------------------------

    /// Mark the scope immutable.  The symbol index is completed so that
    /// by-name lookup needs only `&self` from here on.
    pub fn finalize(&mut self) -> Result<(), Error> {
        if self.is_final {
            return Ok(());
        }
        if self.has_symbols {
            self.symtable.populate_index()?;
        }
        self.is_final = true;
        log::trace!(
            "scope: finalize level={} symbols={} types={}",
            self.level,
            self.symbol_count,
            self.type_count
        );
        Ok(())
    }

    /// Finalize and wrap for sharing.
    pub fn into_shared(mut self) -> Result<Rc<Scope>, Error> {
        self.finalize()?;
        Ok(Rc::new(self))
    }
}

/// Split a reference into (selector depth, remaining offset).
fn split_relative(raw: usize) -> (usize, usize) {
    let depth = raw.trailing_ones() as usize;
    if depth + 1 >= usize::BITS as usize {
        return (depth, 0);
    }
    (depth, raw >> (depth + 1))
}

/// Pick a stack index from the selector depth: odd depths count down from
/// the top, even depths up from the bottom.
fn select_table(depth: usize, stack_len: usize) -> Option<usize> {
    let idx = if depth & 1 == 1 {
        stack_len.checked_sub(1 + (depth >> 1))?
    } else {
        depth >> 1
    };
    if idx < stack_len { Some(idx) } else { None }
}

/// Structural equality of type bodies, for import deduplication.
fn type_def_eq(a: &TypeDef, b: &TypeDef) -> bool {
    match (a, b) {
        (TypeDef::Any, TypeDef::Any)
        | (TypeDef::TypeRef, TypeDef::TypeRef)
        | (TypeDef::SymRef, TypeDef::SymRef) => true,
        (TypeDef::Int(x), TypeDef::Int(y)) => {
            x.align == y.align
                && x.pad == y.pad
                && x.bits == y.bits
                && x.twos_complement == y.twos_complement
                && x.min == y.min
                && x.max == y.max
                && x.bswap == y.bswap
                && x.names == y.names
        }
        (TypeDef::Choice(x), TypeDef::Choice(y)) => {
            x.align == y.align && x.pad == y.pad && x.options == y.options
        }
        (TypeDef::Array(x), TypeDef::Array(y)) => {
            x.align == y.align
                && x.pad == y.pad
                && x.elem_type == y.elem_type
                && x.dim_type == y.dim_type
                && x.dims == y.dims
        }
        (TypeDef::Record(x), TypeDef::Record(y)) => {
            x.align == y.align
                && x.pad == y.pad
                && x.static_bits == y.static_bits
                && x.other_field_type == y.other_field_type
                && x.fields.len() == y.fields.len()
                && x.fields.iter().zip(&y.fields).all(|(f, g)| {
                    f.name == g.name && f.ty == g.ty && f.placement == g.placement
                })
        }
        _ => false,
    }
}

/// Alignment exponents are bounded well below the bit-position range.
fn read_align(cur: &mut Cursor, input: &ByteString) -> Result<u32, Error> {
    let v = vint::read_vsize(cur, input)?;
    if v > 31 {
        return Err(Error::Type("alignment exponent out of range"));
    }
    Ok(v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_stack_4() -> Rc<Scope> {
        let env = Env::new();
        let mut prev: Option<Rc<Scope>> = None;
        for i in 0..4 {
            let mut s = Scope::new(&env, prev.as_ref()).unwrap();
            s.add_symbol(&format!("sym{i}_1")).unwrap();
            s.add_symbol(&format!("sym{i}_2")).unwrap();
            prev = Some(s.into_shared().unwrap());
        }
        prev.unwrap()
    }

    #[test]
    fn relative_refs_across_stack() {
        let top = scope_stack_4();
        assert_eq!(top.symbol_count(), 8);
        assert_eq!(top.get_symbol("sym0_1").unwrap().get(), 1);
        assert_eq!(top.get_symbol("sym3_2").unwrap().get(), 8);

        let name = |sym: Option<Symbol>| sym.and_then(|s| top.symbol_name(s));
        // depth ladders starting from offsets 0..4, exactly the original
        // reference behavior
        let expect: [[Option<&str>; 8]; 4] = [
            [
                None,
                Some("sym3_1"),
                Some("sym1_1"),
                Some("sym2_1"),
                Some("sym2_1"),
                Some("sym1_1"),
                Some("sym3_1"),
                Some("sym0_1"),
            ],
            [
                Some("sym0_1"),
                Some("sym3_2"),
                Some("sym1_2"),
                Some("sym2_2"),
                Some("sym2_2"),
                Some("sym1_2"),
                Some("sym3_2"),
                Some("sym0_2"),
            ],
            [Some("sym0_2"), None, None, None, None, None, None, None],
            [Some("sym1_1"), None, None, None, None, None, None, None],
        ];
        for (i, row) in expect.iter().enumerate() {
            let mut raw = i << 1;
            for (d, want) in row.iter().enumerate() {
                let got = name(top.resolve_relative_symref(raw));
                assert_eq!(got, *want, "offset={i} depth={d} raw={raw:#b}");
                raw = (raw << 1) | 1;
            }
        }
    }

    #[test]
    fn spec_symref_one() {
        // 0b0000000001 in a 4-deep stack names symbol 1 of the top scope
        let top = scope_stack_4();
        let sym = top.resolve_relative_symref(0b01).unwrap();
        assert_eq!(top.symbol_name(sym), Some("sym3_1"));
        assert_eq!(sym.get(), 7);
    }

    #[test]
    fn finalize_blocks_mutation() {
        let env = Env::new();
        let mut s = Scope::new(&env, None).unwrap();
        s.add_symbol("early").unwrap();
        s.finalize().unwrap();
        assert_eq!(s.add_symbol("late").unwrap_err(), Error::ScopeFinal);
        let parts = [Part::new(crate::buffer::Buffer::copy_of(b"x\0"), 0..2).unwrap()];
        assert_eq!(s.parse_symbols(&parts, 1).unwrap_err(), Error::ScopeFinal);
        // lookups still work
        assert!(s.get_symbol("early").is_some());
    }

    #[test]
    fn nesting_limit() {
        let mut env = Env::default();
        env.set_scope_stack_max(2);
        let env = env.shared();
        let s0 = Scope::new(&env, None).unwrap().into_shared().unwrap();
        let s1 = Scope::new(&env, Some(&s0)).unwrap().into_shared().unwrap();
        let s2 = Scope::new(&env, Some(&s1)).unwrap().into_shared().unwrap();
        match Scope::new(&env, Some(&s2)) {
            Err(Error::Limit { what, max }) => {
                assert_eq!(what, "scope nesting level");
                assert_eq!(max, 2);
            }
            other => panic!("expected nesting limit error, got {other:?}"),
        }
    }

    #[test]
    fn foreign_env_rejected() {
        let env_a = Env::new();
        let env_b = Env::new();
        let parent = Scope::new(&env_a, None).unwrap().into_shared().unwrap();
        assert_eq!(
            Scope::new(&env_b, Some(&parent)).unwrap_err(),
            Error::ForeignScope
        );
        let mut child = Scope::new(&env_b, None).unwrap();
        assert_eq!(child.import(&parent, false).unwrap_err(), Error::ForeignScope);
    }

    #[test]
    fn parent_must_be_final() {
        let env = Env::new();
        let parent = Rc::new(Scope::new(&env, None).unwrap());
        assert!(matches!(
            Scope::new(&env, Some(&parent)),
            Err(Error::DoingItWrong(_))
        ));
    }

    #[test]
    fn eager_import_dedupes() {
        let env = Env::new();
        let mut lib = Scope::new(&env, None).unwrap();
        let n = lib.add_symbol("byte").unwrap();
        lib.add_type(
            n,
            TypeDef::Int(IntType {
                bits: Some(8),
                align: 3,
                ..IntType::default()
            }),
        )
        .unwrap();
        lib.add_symbol("color").unwrap();
        let lib = lib.into_shared().unwrap();

        let mut dst = Scope::new(&env, None).unwrap();
        dst.add_symbol("color").unwrap(); // same name, should be reused
        dst.import(&lib, false).unwrap();
        assert_eq!(dst.symbol_count(), 2); // color + byte; color not duplicated
        let byte = dst.type_by_name("byte").unwrap();
        match &dst.type_entry(byte).unwrap().def {
            TypeDef::Int(i) => assert_eq!(i.bits, Some(8)),
            other => panic!("wrong def: {other:?}"),
        }
        // importing again adds nothing
        dst.import(&lib, false).unwrap();
        assert_eq!(dst.symbol_count(), 3);
        assert_eq!(dst.type_count(), 1);
    }

    #[test]
    fn lazy_import_materializes_on_lookup() {
        let env = Env::new();
        let mut lib = Scope::new(&env, None).unwrap();
        let n = lib.add_symbol("word").unwrap();
        lib.add_type(
            n,
            TypeDef::Int(IntType {
                bits: Some(16),
                ..IntType::default()
            }),
        )
        .unwrap();
        let lib = lib.into_shared().unwrap();

        let mut dst = Scope::new(&env, None).unwrap();
        dst.import(&lib, true).unwrap();
        assert_eq!(dst.symbol_count(), 0, "lazy import copies nothing eagerly");
        let sym = dst.add_symbol("word").unwrap();
        assert_eq!(dst.symbol_count(), 1);
        assert_eq!(dst.symbol_name(sym), Some("word"));
        // the type came along with the symbol
        assert_eq!(dst.type_count(), 1);
        assert!(dst.get_type(sym).is_some());
    }

    #[test]
    fn typedef_wire_round_trip() {
        use crate::enc::Writer;

        let env = Env::new();
        let mut s = Scope::new(&env, None).unwrap();
        let n_u8 = s.add_symbol("u8").unwrap();
        let n_list = s.add_symbol("list").unwrap();
        assert_eq!(n_u8.get(), 1);
        assert_eq!(n_list.get(), 2);

        // u8: int, flags = has_bits|align, align 3, bits 8
        let mut w = Writer::new();
        w.write_vsize((n_u8.get() << 1) as usize).unwrap(); // absolute symref
        w.write_vsize(TypeClass::Int as usize).unwrap();
        w.write_vsize(0x01 | 0x04).unwrap();
        w.write_vsize(3).unwrap(); // align
        w.write_vsize(8).unwrap(); // bits
        // list: array of u8, one dynamic dim
        w.write_vsize((n_list.get() << 1) as usize).unwrap();
        w.write_vsize(TypeClass::Array as usize).unwrap();
        w.write_vsize(0).unwrap(); // no flags
        w.write_vsize(1 << 1).unwrap(); // absolute typeref to type 1
        w.write_vsize(1).unwrap(); // one dimension
        w.write_vsize(0).unwrap(); // dynamic

        let bytes = w.into_vec();
        let parts = [Part::new(crate::buffer::Buffer::copy_of(&bytes), 0..bytes.len()).unwrap()];
        s.parse_types(&parts, 2).unwrap();
        assert_eq!(s.type_count(), 2);

        let list = s.type_by_name("list").unwrap();
        match &s.type_entry(list).unwrap().def {
            TypeDef::Array(a) => {
                assert_eq!(a.dims, vec![0]);
                assert_eq!(a.elem_type.get(), 1);
            }
            other => panic!("wrong def: {other:?}"),
        }

        // a truncated typedef rolls the whole parse back
        let mut s2 = Scope::new(&env, None).unwrap();
        s2.add_symbol("u8").unwrap();
        s2.add_symbol("list").unwrap();
        let short = &bytes[..bytes.len() - 2];
        let parts = [Part::new(crate::buffer::Buffer::copy_of(short), 0..short.len()).unwrap()];
        assert_eq!(s2.parse_types(&parts, 2).unwrap_err(), Error::Overrun);
        assert_eq!(s2.type_count(), 0);
    }

    #[test]
    fn bad_typedefs_rejected() {
        let env = Env::new();
        let mut s = Scope::new(&env, None).unwrap();
        s.add_symbol("t").unwrap();

        // unknown class code
        let mut w = crate::enc::Writer::new();
        w.write_vsize(1 << 1).unwrap();
        w.write_vsize(9).unwrap();
        let bytes = w.into_vec();
        let parts = [Part::new(crate::buffer::Buffer::copy_of(&bytes), 0..bytes.len()).unwrap()];
        assert!(matches!(
            s.parse_types(&parts, 1).unwrap_err(),
            Error::Type(_)
        ));

        // unresolvable type reference inside an array def
        let mut w = crate::enc::Writer::new();
        w.write_vsize(1 << 1).unwrap();
        w.write_vsize(TypeClass::Array as usize).unwrap();
        w.write_vsize(0).unwrap();
        w.write_vsize(40 << 1).unwrap(); // type 40 does not exist
        w.write_vsize(0).unwrap();
        let bytes = w.into_vec();
        let parts = [Part::new(crate::buffer::Buffer::copy_of(&bytes), 0..bytes.len()).unwrap()];
        assert!(matches!(
            s.parse_types(&parts, 1).unwrap_err(),
            Error::Type(_)
        ));
        assert_eq!(s.type_count(), 0);
    }
}
