//! The decoder: a typed cursor over a value tree.
//!
//! A decoder holds a frame stack describing its descent into records and
//! arrays, a bit cursor over the input byte string, and the "node info"
//! view of the current node.  Each navigation call consumes whatever the
//! current frame's type demands from the stream and republishes the node
//! info.  Every fallible call either succeeds or leaves the decoder
//! exactly as it was, so callers may feed more input and retry.

use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use smallvec::{SmallVec, smallvec};

use crate::bits::Cursor;
use crate::bstr::{ByteString, Part};
use crate::buffer::Buffer;
use crate::error::Error;
use crate::scope::{Scope, Symbol, TypeId};
use crate::typetable::{ChoiceOption, IntType, Placement, RecordType, TypeDef};
use crate::vint::{self, SignedVInt, VInt};

bitflags::bitflags! {
    /// Which facets of a [`NodeInfo`] are populated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u32 {
        const INT          = 0x0001;
        const UNSIGNED     = 0x0002;
        const BIGINT       = 0x0004;
        const SYM          = 0x0008;
        const TYPEREF      = 0x0010;
        const ALIGNED_INT  = 0x0020;
        const ARRAY        = 0x0040;
        const RECORD       = 0x0080;
        /// The node is a literal selected by a choice discriminator.
        const CHOICE_VALUE = 0x0100;
    }
}

/// "Feed me more input": append at least one part and return `true`, or
/// return `false` to signal end-of-stream.
pub type ReaderFn = dyn FnMut(&mut ByteString, usize) -> bool;

/// Transient description of the current node.
///
/// Borrowed from the decoder; anything worth keeping past the next
/// navigation call must be copied out (the borrow checker enforces the
/// lifetime, unlike the original's raw-pointer contract).
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub flags: NodeFlags,
    /// Declared type of this node; `None` when iteration has passed the
    /// last element of the open record or array.
    pub node_type: Option<TypeId>,
    /// Type the value actually decoded as, after `Any`/choice dispatch.
    pub value_type: Option<TypeId>,
    /// Number of parent records/arrays above this node.
    pub node_depth: usize,
    /// Integer value when `INT` is set (raw bits; see `UNSIGNED`).
    pub intval: i64,
    /// Zero-copy window for bigints and wide fixed-width integers.
    pub data: Option<ByteString>,
    pub array_dims: SmallVec<[usize; 2]>,
    /// Elements of an array / present fields of a record.
    pub elem_count: usize,
    /// Chain of sub-types crossed by `Any` and choice dispatch.
    pub subtypes: SmallVec<[TypeId; 2]>,
    /// Field name when this node is a record field.
    pub field: Option<Symbol>,
    pub(crate) sym: Option<Symbol>,
    pub(crate) typeref: Option<TypeId>,
    pub(crate) bigint_negative: bool,
}

#[derive(Debug, Clone, Copy)]
struct PresentField {
    name: Option<Symbol>,
    ty: TypeId,
}

#[derive(Debug, Clone)]
enum FrameKind {
    Root,
    Record {
        fields: SmallVec<[PresentField; 8]>,
    },
    Array {
        elem: TypeId,
    },
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    elem_i: usize,
    elem_lim: usize,
}

/// Everything a failed call restores: the cursor, the top frame's
/// position, and the published node.
#[derive(Clone)]
struct Snapshot {
    cur: Cursor,
    elem_i: usize,
    loaded: bool,
    node: NodeInfo,
    pending: Option<SmallVec<[PresentField; 8]>>,
}

pub struct Decoder {
    scope: Rc<Scope>,
    root_type: TypeId,
    input: ByteString,
    cur: Cursor,
    stack: SmallVec<[Frame; 8]>,
    node: NodeInfo,
    loaded: bool,
    /// Present-field list read by a record header, handed to `begin`.
    pending_record: Option<SmallVec<[PresentField; 8]>>,
    reader: Option<Box<ReaderFn>>,
}

#[inline]
fn bit_width(n: usize) -> u32 {
    usize::BITS - n.leading_zeros()
}

impl Decoder {
    /// Create a decoder with no input yet.  `root_type` must be reachable
    /// from `scope`.
    pub fn new(scope: Rc<Scope>, root_type: TypeId) -> Result<Decoder, Error> {
        if !scope.contains_type(root_type) {
            return Err(Error::TypeScope);
        }
        let input = ByteString::new();
        let cur = Cursor::new(&input);
        Ok(Decoder {
            scope,
            root_type,
            input,
            cur,
            stack: smallvec![Frame {
                kind: FrameKind::Root,
                elem_i: 0,
                elem_lim: 1,
            }],
            node: NodeInfo::default(),
            loaded: false,
            pending_record: None,
            reader: None,
        })
    }

    /// Create a decoder over `range` of a shared buffer.
    pub fn with_input(
        scope: Rc<Scope>,
        root_type: TypeId,
        buf: Rc<Buffer>,
        range: Range<usize>,
    ) -> Result<Decoder, Error> {
        let mut dec = Decoder::new(scope, root_type)?;
        dec.feed_buffer(buf, range)?;
        Ok(dec)
    }

    /// Create a decoder that owns its input bytes.
    pub fn from_bytes(
        scope: Rc<Scope>,
        root_type: TypeId,
        bytes: Vec<u8>,
    ) -> Result<Decoder, Error> {
        let len = bytes.len();
        Decoder::with_input(scope, root_type, Buffer::from_vec(bytes), 0..len)
    }

    #[must_use]
    pub fn scope(&self) -> &Rc<Scope> {
        &self.scope
    }

    /// Append more input.  Fails with [`Error::BufPointer`] when `range`
    /// lies outside `buf`.
    pub fn feed_buffer(&mut self, buf: Rc<Buffer>, range: Range<usize>) -> Result<(), Error> {
        self.input.push_buffer(buf, range)
    }

    pub fn feed_part(&mut self, part: Part) {
        self.input.push_part(part);
    }

    /// Install or remove the reader callback invoked on input underrun.
    pub fn set_reader(&mut self, reader: Option<Box<ReaderFn>>) {
        self.reader = reader;
    }

    /// Depth of the current node (0 = root).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Cumulative bit offset of the cursor, mainly for tests and
    /// diagnostics.
    #[must_use]
    pub fn stream_pos_bits(&self) -> usize {
        self.cur.bit_pos(&self.input)
    }

    /// Decode the current node if not yet decoded and describe it.
    pub fn node_info(&mut self) -> Result<&NodeInfo, Error> {
        self.ensure_loaded()?;
        Ok(&self.node)
    }

    // ------------------------------------------------------------------
    // navigation

    /// Descend into the current record or array; the first child becomes
    /// the current node.
    pub fn begin(&mut self) -> Result<(), Error> {
        self.ensure_loaded()?;
        if self.stack.len() >= self.scope.env().max_decode_depth() {
            return Err(Error::Limit {
                what: "decoder nesting depth",
                max: self.scope.env().max_decode_depth(),
            });
        }
        if self.node.flags.contains(NodeFlags::RECORD) {
            let fields = self
                .pending_record
                .take()
                .ok_or(Error::BadState("record header vanished"))?;
            let lim = fields.len();
            self.stack.push(Frame {
                kind: FrameKind::Record { fields },
                elem_i: 0,
                elem_lim: lim,
            });
        } else if self.node.flags.contains(NodeFlags::ARRAY) {
            let ty = self
                .node
                .value_type
                .ok_or(Error::BadState("array node without a type"))?;
            let scope = Rc::clone(&self.scope);
            let entry = scope.type_entry(ty).ok_or(Error::TypeScope)?;
            let TypeDef::Array(a) = &entry.def else {
                return Err(Error::BadState("array node with a non-array type"));
            };
            self.stack.push(Frame {
                kind: FrameKind::Array { elem: a.elem_type },
                elem_i: 0,
                elem_lim: self.node.elem_count,
            });
        } else {
            return Err(Error::DoingItWrong("current node is not a record or array"));
        }
        self.loaded = false;
        Ok(())
    }

    /// Close the open record or array, discarding any unread elements;
    /// the node following the container becomes current.
    pub fn end(&mut self) -> Result<(), Error> {
        self.ensure_loaded()?;
        if self.stack.len() <= 1 {
            return Err(Error::DoingItWrong("no open record or array to end"));
        }
        self.transact(|d| {
            while d.top().elem_i < d.top().elem_lim {
                d.skip_inner()?;
            }
            Ok(())
        })?;
        self.stack.pop();
        self.advance();
        Ok(())
    }

    /// Skip the current node without exposing its content.
    pub fn skip(&mut self) -> Result<(), Error> {
        self.ensure_loaded()?;
        if self.node.node_type.is_none() {
            return Err(Error::DoingItWrong("no current node to skip"));
        }
        self.transact(Self::skip_inner)
    }

    /// Seek to element `idx` of the open record or array.  Seeks are
    /// monotonic: earlier elements cannot be revisited.
    pub fn seek_elem(&mut self, idx: usize) -> Result<(), Error> {
        self.ensure_loaded()?;
        if self.stack.len() <= 1 {
            return Err(Error::DoingItWrong("not inside a record or array"));
        }
        if idx >= self.top().elem_lim {
            return Err(Error::DoingItWrong("element index out of range"));
        }
        if idx < self.top().elem_i {
            return Err(Error::DoingItWrong("seeks must be monotonic"));
        }
        self.transact(move |d| {
            while d.top().elem_i < idx {
                d.skip_inner()?;
            }
            d.load_if_needed()
        })
    }

    /// Seek to the named field of the open record.
    pub fn seek_field(&mut self, name: Symbol) -> Result<(), Error> {
        self.ensure_loaded()?;
        if self.stack.len() <= 1 {
            return Err(Error::DoingItWrong("not inside a record"));
        }
        let at = self.top().elem_i;
        let target = {
            let FrameKind::Record { fields } = &self.top().kind else {
                return Err(Error::DoingItWrong("not inside a record"));
            };
            match fields[at..].iter().position(|f| f.name == Some(name)) {
                Some(rel) => at + rel,
                None => {
                    return if fields[..at].iter().any(|f| f.name == Some(name)) {
                        Err(Error::DoingItWrong("seeks must be monotonic"))
                    } else {
                        Err(Error::Record("field not present in this record value"))
                    };
                }
            }
        };
        self.transact(move |d| {
            while d.top().elem_i < target {
                d.skip_inner()?;
            }
            d.load_if_needed()
        })
    }

    // ------------------------------------------------------------------
    // leaf extraction

    /// Decode the current node as a signed integer and move on.
    pub fn int(&mut self) -> Result<i64, Error> {
        self.ensure_loaded()?;
        if !self.node.flags.contains(NodeFlags::INT) {
            return Err(Error::DoingItWrong("current node is not an integer"));
        }
        if self.node.flags.contains(NodeFlags::UNSIGNED) && self.node.intval < 0 {
            return Err(Error::Overflow);
        }
        let val = self.node.intval;
        self.advance();
        Ok(val)
    }

    /// Decode the current node as an unsigned integer and move on.
    pub fn uint(&mut self) -> Result<u64, Error> {
        self.ensure_loaded()?;
        if !self.node.flags.contains(NodeFlags::INT) {
            return Err(Error::DoingItWrong("current node is not an integer"));
        }
        if !self.node.flags.contains(NodeFlags::UNSIGNED) && self.node.intval < 0 {
            return Err(Error::Overflow);
        }
        let val = self.node.intval as u64;
        self.advance();
        Ok(val)
    }

    /// The current node's bigint as `(negative, little-endian magnitude)`
    /// windowed zero-copy onto the input.
    pub fn bigint(&mut self) -> Result<(bool, ByteString), Error> {
        self.ensure_loaded()?;
        if !self.node.flags.contains(NodeFlags::BIGINT) {
            return Err(Error::DoingItWrong("current node is not a bigint"));
        }
        let data = self
            .node
            .data
            .clone()
            .ok_or(Error::BadState("bigint node without data"))?;
        let negative = self.node.bigint_negative;
        self.advance();
        Ok((negative, data))
    }

    /// Decode the current node as a symbol reference and move on.
    pub fn symbol(&mut self) -> Result<Symbol, Error> {
        self.ensure_loaded()?;
        if !self.node.flags.contains(NodeFlags::SYM) {
            return Err(Error::DoingItWrong("current node is not a symbol"));
        }
        let sym = self.node.sym.ok_or(Error::BadState("symbol node without a value"))?;
        self.advance();
        Ok(sym)
    }

    /// Decode the current node as a type reference and move on.
    pub fn typeref(&mut self) -> Result<TypeId, Error> {
        self.ensure_loaded()?;
        if !self.node.flags.contains(NodeFlags::TYPEREF) {
            return Err(Error::DoingItWrong("current node is not a type reference"));
        }
        let ty = self
            .node
            .typeref
            .ok_or(Error::BadState("typeref node without a value"))?;
        self.advance();
        Ok(ty)
    }

    /// Copy out the raw bytes of the current node (a bigint window or an
    /// array with a fixed byte-compatible element encoding).
    pub fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        self.ensure_loaded()?;
        let mut out = None;
        self.transact(|d| {
            out = Some(d.take_bytes_window()?);
            Ok(())
        })?;
        let window = out.ok_or(Error::BadState("byte window missing"))?;
        Ok(window.to_vec())
    }

    /// As [`Decoder::bytes`] but without copying: a window onto the source
    /// buffers.  Requires the span to land in a single part.
    pub fn bytes_zerocopy(&mut self) -> Result<ByteString, Error> {
        self.ensure_loaded()?;
        let mut out = None;
        self.transact(|d| {
            let window = d.take_bytes_window()?;
            if window.part_count() > 1 {
                return Err(Error::DoingItWrong(
                    "zero-copy span crosses a buffer boundary",
                ));
            }
            out = Some(window);
            Ok(())
        })?;
        out.ok_or(Error::BadState("byte window missing"))
    }

    // ------------------------------------------------------------------
    // internals

    fn top(&self) -> &Frame {
        &self.stack[self.stack.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let i = self.stack.len() - 1;
        &mut self.stack[i]
    }

    /// Type and field name of the element the top frame points at.
    fn current_elem(&self) -> Option<(TypeId, Option<Symbol>)> {
        let frame = self.top();
        if frame.elem_i >= frame.elem_lim {
            return None;
        }
        match &frame.kind {
            FrameKind::Root => Some((self.root_type, None)),
            FrameKind::Record { fields } => {
                let f = &fields[frame.elem_i];
                Some((f.ty, f.name))
            }
            FrameKind::Array { elem } => Some((*elem, None)),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            cur: self.cur,
            elem_i: self.top().elem_i,
            loaded: self.loaded,
            node: self.node.clone(),
            pending: self.pending_record.clone(),
        }
    }

    fn restore(&mut self, snap: Snapshot) {
        self.cur = snap.cur;
        self.top_mut().elem_i = snap.elem_i;
        self.loaded = snap.loaded;
        self.node = snap.node;
        self.pending_record = snap.pending;
    }

    /// Run `op` atomically: on failure restore the pre-call state, on
    /// input underrun invoke the reader and retry.
    fn transact<F>(&mut self, mut op: F) -> Result<(), Error>
    where
        F: FnMut(&mut Self) -> Result<(), Error>,
    {
        let snap = self.snapshot();
        loop {
            match op(self) {
                Ok(()) => return Ok(()),
                Err(Error::Overrun) if self.reader.is_some() => {
                    self.restore(snap.clone());
                    if !self.invoke_reader() {
                        return Err(Error::Overrun);
                    }
                }
                Err(e) => {
                    self.restore(snap);
                    return Err(e);
                }
            }
        }
    }

    /// Ask the reader for more input; false when it declines or adds
    /// nothing.
    fn invoke_reader(&mut self) -> bool {
        let before = self.input.len();
        let Some(mut reader) = self.reader.take() else {
            return false;
        };
        let ok = reader(&mut self.input, 1);
        self.reader = Some(reader);
        if !ok || self.input.len() == before {
            log::debug!("decoder: {}", Error::FeedMe);
            return false;
        }
        true
    }

    fn ensure_loaded(&mut self) -> Result<(), Error> {
        if self.loaded {
            return Ok(());
        }
        self.transact(|d| d.load_current())?;
        self.loaded = true;
        Ok(())
    }

    fn load_if_needed(&mut self) -> Result<(), Error> {
        if !self.loaded {
            self.load_current()?;
            self.loaded = true;
        }
        Ok(())
    }

    /// Advance past the (fully consumed) current node.
    fn advance(&mut self) {
        self.top_mut().elem_i += 1;
        self.loaded = false;
        self.pending_record = None;
    }

    /// Decode the current element into the node-info view.
    fn load_current(&mut self) -> Result<(), Error> {
        let mut node = NodeInfo {
            node_depth: self.stack.len() - 1,
            ..NodeInfo::default()
        };
        let Some((ty, field)) = self.current_elem() else {
            self.node = node;
            self.pending_record = None;
            return Ok(());
        };
        node.node_type = Some(ty);
        node.field = field;
        let mut pending = None;
        self.load_value(ty, &mut node, &mut pending, 0)?;
        self.node = node;
        self.pending_record = pending;
        Ok(())
    }

    /// Consume whatever a value of `ty` starts with, filling `node`.
    /// Records leave their present-field list in `pending` for `begin`.
    fn load_value(
        &mut self,
        ty: TypeId,
        node: &mut NodeInfo,
        pending: &mut Option<SmallVec<[PresentField; 8]>>,
        depth: usize,
    ) -> Result<(), Error> {
        if depth > self.scope.env().max_decode_depth() {
            return Err(Error::Limit {
                what: "type dispatch depth",
                max: self.scope.env().max_decode_depth(),
            });
        }
        node.value_type = Some(ty);
        let scope = Rc::clone(&self.scope);
        let entry = scope.type_entry(ty).ok_or(Error::TypeScope)?;
        match &entry.def {
            TypeDef::Any => {
                let raw = vint::read_vsize(&mut self.cur, &self.input)?;
                let target = self
                    .scope
                    .resolve_relative_typeref(raw)
                    .ok_or(Error::Type("unresolvable typeref in stream"))?;
                node.subtypes.push(target);
                self.load_value(target, node, pending, depth + 1)?;
            }
            TypeDef::TypeRef => {
                let raw = vint::read_vsize(&mut self.cur, &self.input)?;
                let target = self
                    .scope
                    .resolve_relative_typeref(raw)
                    .ok_or(Error::Type("unresolvable typeref in stream"))?;
                node.typeref = Some(target);
                node.flags |= NodeFlags::TYPEREF;
            }
            TypeDef::SymRef => {
                let raw = vint::read_vsize(&mut self.cur, &self.input)?;
                let target = self.scope.resolve_relative_symref(raw).ok_or(Error::Symbol {
                    detail: "unresolvable symbol reference in stream",
                    pos: self.cur.byte_pos(&self.input),
                })?;
                node.sym = Some(target);
                node.flags |= NodeFlags::SYM;
            }
            TypeDef::Int(int) => self.load_int(int, node)?,
            TypeDef::Choice(choice) => {
                if choice.align > 0 {
                    self.cur.align(&self.input, choice.align)?;
                }
                let count = choice.options.len();
                if count == 0 {
                    return Err(Error::Type("choice with no options"));
                }
                let bits = bit_width(count - 1);
                let disc = if bits > 0 {
                    self.cur.read(&self.input, bits)? as usize
                } else {
                    0
                };
                let opt = choice
                    .options
                    .get(disc)
                    .ok_or(Error::Protocol("choice discriminator out of range"))?;
                match opt {
                    ChoiceOption::Value(v) => {
                        node.intval = *v;
                        node.flags |= NodeFlags::INT | NodeFlags::CHOICE_VALUE;
                    }
                    ChoiceOption::Type(target) => {
                        node.subtypes.push(*target);
                        self.load_value(*target, node, pending, depth + 1)?;
                    }
                }
            }
            TypeDef::Array(array) => {
                if array.align > 0 {
                    self.cur.align(&self.input, array.align)?;
                }
                let mut dims: SmallVec<[usize; 2]> = SmallVec::new();
                for &dim in &array.dims {
                    if dim != 0 {
                        dims.push(dim);
                    } else {
                        let v = match array.dim_type {
                            None => vint::read_vsize(&mut self.cur, &self.input)?,
                            Some(dt) => self.read_size_with(dt)?,
                        };
                        dims.push(v);
                    }
                }
                let count = dims
                    .iter()
                    .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                    .ok_or(Error::Overflow)?;
                node.array_dims = dims;
                node.elem_count = count;
                node.flags |= NodeFlags::ARRAY;
            }
            TypeDef::Record(rec) => {
                let fields = self.read_record_header(rec)?;
                node.elem_count = fields.len();
                node.flags |= NodeFlags::RECORD;
                *pending = Some(fields);
            }
        }
        Ok(())
    }

    fn load_int(&mut self, int: &IntType, node: &mut NodeInfo) -> Result<(), Error> {
        match int.bits {
            None => {
                if int.twos_complement {
                    match vint::read_vint_signed(&mut self.cur, &self.input)? {
                        SignedVInt::Small(v) => {
                            node.intval = v;
                            node.flags |= NodeFlags::INT;
                        }
                        SignedVInt::Big(b) => {
                            node.bigint_negative = b.negative;
                            node.data = Some(b.data);
                            node.flags |= NodeFlags::BIGINT;
                        }
                    }
                } else {
                    match vint::read_vint(&mut self.cur, &self.input)? {
                        VInt::Small(v) => {
                            node.intval = v as i64;
                            node.flags |= NodeFlags::INT | NodeFlags::UNSIGNED;
                        }
                        VInt::Big(b) => {
                            node.bigint_negative = b.negative;
                            node.data = Some(b.data);
                            node.flags |= NodeFlags::BIGINT | NodeFlags::UNSIGNED;
                        }
                    }
                }
            }
            Some(bits) if bits <= 64 => {
                if int.align > 0 {
                    self.cur.align(&self.input, int.align)?;
                }
                if int.twos_complement {
                    node.intval = self.cur.read_signed(&self.input, bits)?;
                    node.flags |= NodeFlags::INT;
                } else {
                    node.intval = self.cur.read(&self.input, bits)? as i64;
                    node.flags |= NodeFlags::INT | NodeFlags::UNSIGNED;
                }
                if int.align >= 3 && bits % 8 == 0 {
                    node.flags |= NodeFlags::ALIGNED_INT;
                }
            }
            Some(bits) => {
                // wider than 64: expose the bytes as a bigint window
                if bits % 8 != 0 {
                    return Err(Error::Type("wide integers must span whole bytes"));
                }
                self.cur.align(&self.input, int.align.max(3))?;
                let nbytes = (bits / 8) as usize;
                let start = self.cur.byte_pos(&self.input);
                self.cur.skip_bytes(&self.input, nbytes)?;
                node.data = Some(
                    self.input
                        .substr(start..start + nbytes)
                        .ok_or(Error::BadState("wide-int window out of range"))?,
                );
                node.flags |= NodeFlags::BIGINT;
                if !int.twos_complement {
                    node.flags |= NodeFlags::UNSIGNED;
                }
            }
        }
        Ok(())
    }

    /// Read an array dimension encoded with an integer type.
    fn read_size_with(&mut self, ty: TypeId) -> Result<usize, Error> {
        let scope = Rc::clone(&self.scope);
        let entry = scope.type_entry(ty).ok_or(Error::TypeScope)?;
        let TypeDef::Int(int) = &entry.def else {
            return Err(Error::Type("array dimension type must be an integer"));
        };
        match int.bits {
            None => vint::read_vsize(&mut self.cur, &self.input),
            Some(bits) if bits <= 64 => {
                if int.align > 0 {
                    self.cur.align(&self.input, int.align)?;
                }
                let v = self.cur.read(&self.input, bits)?;
                usize::try_from(v).map_err(|_| Error::Overflow)
            }
            Some(_) => Err(Error::Type("array dimension type too wide")),
        }
    }

    /// Read a record's selector, extra-field list, and alignment, and
    /// resolve the sequence of present fields in stream order:
    /// declaration-order always/often fields, then the listed extras.
    fn read_record_header(
        &mut self,
        rec: &RecordType,
    ) -> Result<SmallVec<[PresentField; 8]>, Error> {
        let often: SmallVec<[&crate::typetable::RecordField; 8]> = rec
            .fields
            .iter()
            .filter(|f| f.placement == Placement::Often)
            .collect();
        let seldom: SmallVec<[&crate::typetable::RecordField; 8]> = rec
            .fields
            .iter()
            .filter(|f| f.placement == Placement::Seldom)
            .collect();
        let mut present_often = 0u64;
        let mut extra_count = 0usize;
        if rec.has_selector() {
            if often.len() > 64 {
                return Err(Error::Limit {
                    what: "often field count",
                    max: 64,
                });
            }
            if !often.is_empty() {
                present_often = self.cur.read(&self.input, often.len() as u32)?;
            }
            if rec.other_field_type.is_some() {
                extra_count = vint::read_vsize(&mut self.cur, &self.input)?;
            } else if !seldom.is_empty() {
                extra_count = self.cur.read(&self.input, bit_width(seldom.len()))? as usize;
            }
        }
        let mut extras: SmallVec<[PresentField; 8]> = SmallVec::new();
        if extra_count > 0 {
            if extra_count > self.scope.env().record_fields_max() {
                return Err(Error::Limit {
                    what: "record extra-field count",
                    max: self.scope.env().record_fields_max(),
                });
            }
            if let Some(other_ty) = rec.other_field_type {
                for _ in 0..extra_count {
                    let raw = vint::read_vsize(&mut self.cur, &self.input)?;
                    let sym = self
                        .scope
                        .resolve_relative_symref(raw)
                        .ok_or(Error::Record("unresolvable extra field reference"))?;
                    extras.push(PresentField {
                        name: Some(sym),
                        ty: other_ty,
                    });
                }
            } else {
                let bits = bit_width(seldom.len());
                for _ in 0..extra_count {
                    let idx = self.cur.read(&self.input, bits)? as usize;
                    let f = seldom
                        .get(idx)
                        .ok_or(Error::Record("extra field index out of range"))?;
                    extras.push(PresentField {
                        name: Some(f.name),
                        ty: f.ty,
                    });
                }
            }
        }
        if rec.align > 0 {
            self.cur.align(&self.input, rec.align)?;
        }
        let mut fields: SmallVec<[PresentField; 8]> = SmallVec::new();
        let mut often_i = 0u32;
        for f in &rec.fields {
            match f.placement {
                Placement::Always => fields.push(PresentField {
                    name: Some(f.name),
                    ty: f.ty,
                }),
                Placement::Often => {
                    if (present_often >> often_i) & 1 == 1 {
                        fields.push(PresentField {
                            name: Some(f.name),
                            ty: f.ty,
                        });
                    }
                    often_i += 1;
                }
                Placement::Seldom => {}
            }
        }
        fields.extend(extras);
        Ok(fields)
    }

    /// Consume the remainder of the current node and step past it.
    fn skip_inner(&mut self) -> Result<(), Error> {
        self.load_if_needed()?;
        if self.node.flags.contains(NodeFlags::RECORD) {
            let fields = self
                .pending_record
                .take()
                .ok_or(Error::BadState("record header vanished"))?;
            for f in &fields {
                self.discard_value(f.ty, 0)?;
            }
        } else if self.node.flags.contains(NodeFlags::ARRAY) {
            let ty = self
                .node
                .value_type
                .ok_or(Error::BadState("array node without a type"))?;
            let elem = {
                let scope = Rc::clone(&self.scope);
                let entry = scope.type_entry(ty).ok_or(Error::TypeScope)?;
                match &entry.def {
                    TypeDef::Array(a) => a.elem_type,
                    _ => return Err(Error::BadState("array node with a non-array type")),
                }
            };
            for _ in 0..self.node.elem_count {
                self.discard_value(elem, 0)?;
            }
        }
        self.advance();
        Ok(())
    }

    /// Decode and drop one whole value of `ty`.
    fn discard_value(&mut self, ty: TypeId, depth: usize) -> Result<(), Error> {
        let mut scratch = NodeInfo::default();
        let mut pending = None;
        self.load_value(ty, &mut scratch, &mut pending, depth)?;
        if let Some(fields) = pending {
            for f in &fields {
                self.discard_value(f.ty, depth + 1)?;
            }
        } else if scratch.flags.contains(NodeFlags::ARRAY) {
            let vt = scratch
                .value_type
                .ok_or(Error::BadState("array node without a type"))?;
            let elem = {
                let scope = Rc::clone(&self.scope);
                let entry = scope.type_entry(vt).ok_or(Error::TypeScope)?;
                match &entry.def {
                    TypeDef::Array(a) => a.elem_type,
                    _ => return Err(Error::BadState("array node with a non-array type")),
                }
            };
            for _ in 0..scratch.elem_count {
                self.discard_value(elem, depth + 1)?;
            }
        }
        Ok(())
    }

    /// Window over the current node's raw bytes, advancing past it.
    fn take_bytes_window(&mut self) -> Result<ByteString, Error> {
        self.load_if_needed()?;
        if self.node.flags.contains(NodeFlags::BIGINT) {
            let data = self
                .node
                .data
                .clone()
                .ok_or(Error::BadState("bigint node without data"))?;
            self.advance();
            return Ok(data);
        }
        if !self.node.flags.contains(NodeFlags::ARRAY) {
            return Err(Error::DoingItWrong(
                "current node has no byte-compatible encoding",
            ));
        }
        let vt = self
            .node
            .value_type
            .ok_or(Error::BadState("array node without a type"))?;
        let elem = {
            let scope = Rc::clone(&self.scope);
            let entry = scope.type_entry(vt).ok_or(Error::TypeScope)?;
            match &entry.def {
                TypeDef::Array(a) => a.elem_type,
                _ => return Err(Error::BadState("array node with a non-array type")),
            }
        };
        let elem_bits = self
            .fixed_bit_size(elem, 0)?
            .ok_or(Error::DoingItWrong("element type has no fixed encoding"))?;
        if elem_bits == 0 || elem_bits % 8 != 0 {
            return Err(Error::DoingItWrong(
                "element type is not byte-compatible",
            ));
        }
        let total = self
            .node
            .elem_count
            .checked_mul(elem_bits / 8)
            .ok_or(Error::Overflow)?;
        self.cur.align(&self.input, 3)?;
        let start = self.cur.byte_pos(&self.input);
        self.cur.skip_bytes(&self.input, total)?;
        let window = self
            .input
            .substr(start..start + total)
            .ok_or(Error::BadState("byte window out of range"))?;
        self.advance();
        Ok(window)
    }

    /// Static bit size of a value of `ty`, when every value of the type
    /// occupies the same bits with no position-dependent alignment.
    fn fixed_bit_size(&self, ty: TypeId, depth: usize) -> Result<Option<usize>, Error> {
        if depth > self.scope.env().max_decode_depth() {
            return Err(Error::Limit {
                what: "type dispatch depth",
                max: self.scope.env().max_decode_depth(),
            });
        }
        let entry = self.scope.type_entry(ty).ok_or(Error::TypeScope)?;
        Ok(match &entry.def {
            TypeDef::Int(int) => match int.bits {
                Some(bits) if int.align <= 3 => Some(bits as usize),
                _ => None,
            },
            TypeDef::Array(a) => {
                if a.align > 3 || a.dims.is_empty() || a.dims.contains(&0) {
                    None
                } else {
                    match self.fixed_bit_size(a.elem_type, depth + 1)? {
                        Some(elem) => a
                            .dims
                            .iter()
                            .try_fold(elem, |acc, &d| acc.checked_mul(d)),
                        None => None,
                    }
                }
            }
            _ => None,
        })
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("depth", &self.depth())
            .field("input_len", &self.input.len())
            .field("bit_pos", &self.cur.bit_pos(&self.input))
            .field("loaded", &self.loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enc::Writer;
    use crate::env::Env;
    use crate::typetable::{ArrayType, ChoiceType};

    /// A scope with the small stable of types the tests decode against.
    fn test_scope() -> Rc<Scope> {
        let env = Env::new();
        let mut s = Scope::new(&env, None).unwrap();
        let n = s.add_symbol("vuint").unwrap();
        s.add_type(n, TypeDef::Int(IntType::default())).unwrap();
        let n = s.add_symbol("vint").unwrap();
        s.add_type(
            n,
            TypeDef::Int(IntType {
                twos_complement: true,
                ..IntType::default()
            }),
        )
        .unwrap();
        let n = s.add_symbol("u8").unwrap();
        s.add_type(
            n,
            TypeDef::Int(IntType {
                bits: Some(8),
                align: 3,
                ..IntType::default()
            }),
        )
        .unwrap();
        let n = s.add_symbol("bit").unwrap();
        s.add_type(
            n,
            TypeDef::Int(IntType {
                bits: Some(1),
                ..IntType::default()
            }),
        )
        .unwrap();
        let n = s.add_symbol("any").unwrap();
        s.add_type(n, TypeDef::Any).unwrap();
        s.into_shared().unwrap()
    }

    fn ty(s: &Rc<Scope>, name: &str) -> TypeId {
        s.type_by_name(name).unwrap()
    }

    #[test]
    fn decode_root_vuint() {
        let scope = test_scope();
        let mut w = Writer::new();
        w.write_vint(0x4000).unwrap();
        let mut dec = Decoder::from_bytes(Rc::clone(&scope), ty(&scope, "vuint"), w.into_vec())
            .unwrap();
        let info = dec.node_info().unwrap();
        assert_eq!(info.node_depth, 0);
        assert!(info.flags.contains(NodeFlags::INT | NodeFlags::UNSIGNED));
        assert_eq!(dec.uint().unwrap(), 0x4000);
        // past the root there is nothing
        let info = dec.node_info().unwrap();
        assert_eq!(info.node_type, None);
        assert_eq!(info.node_depth, 0);
    }

    #[test]
    fn decode_any_dispatch() {
        let scope = test_scope();
        let target = ty(&scope, "u8");
        let mut w = Writer::new();
        w.write_vsize((target.get() << 1) as usize).unwrap(); // absolute typeref
        w.write_bits(0xAB, 8).unwrap();
        let mut dec =
            Decoder::from_bytes(Rc::clone(&scope), ty(&scope, "any"), w.into_vec()).unwrap();
        let info = dec.node_info().unwrap();
        assert_eq!(info.value_type, Some(target));
        assert_eq!(info.subtypes.as_slice(), &[target]);
        assert_eq!(dec.uint().unwrap(), 0xAB);
    }

    #[test]
    fn decode_fixed_array_and_zerocopy() {
        let env = Env::new();
        let mut s = Scope::new(&env, None).unwrap();
        let n = s.add_symbol("u8").unwrap();
        let u8t = s
            .add_type(
                n,
                TypeDef::Int(IntType {
                    bits: Some(8),
                    align: 3,
                    ..IntType::default()
                }),
            )
            .unwrap();
        let n = s.add_symbol("bytes").unwrap();
        let arr = s
            .add_type(
                n,
                TypeDef::Array(ArrayType {
                    align: 0,
                    pad: 0,
                    elem_type: u8t,
                    dim_type: None,
                    dims: vec![0],
                }),
            )
            .unwrap();
        let scope = s.into_shared().unwrap();

        let mut w = Writer::new();
        w.write_vsize(5).unwrap();
        w.write_bytes(b"hello").unwrap();
        let mut dec = Decoder::from_bytes(Rc::clone(&scope), arr, w.into_vec()).unwrap();
        {
            let info = dec.node_info().unwrap();
            assert!(info.flags.contains(NodeFlags::ARRAY));
            assert_eq!(info.elem_count, 5);
            assert_eq!(info.array_dims.as_slice(), &[5]);
        }
        let window = dec.bytes_zerocopy().unwrap();
        assert_eq!(window.to_vec(), b"hello");
        assert_eq!(window.part_count(), 1);

        // element-by-element iteration of the same value
        let mut w = Writer::new();
        w.write_vsize(3).unwrap();
        w.write_bytes(&[1, 2, 3]).unwrap();
        let mut dec = Decoder::from_bytes(Rc::clone(&scope), arr, w.into_vec()).unwrap();
        dec.begin().unwrap();
        assert_eq!(dec.uint().unwrap(), 1);
        assert_eq!(dec.uint().unwrap(), 2);
        assert_eq!(dec.uint().unwrap(), 3);
        assert_eq!(dec.node_info().unwrap().node_type, None);
        dec.end().unwrap();
        assert_eq!(dec.node_info().unwrap().node_type, None);
        assert_eq!(dec.depth(), 0);
    }

    #[test]
    fn decode_choice() {
        let env = Env::new();
        let mut s = Scope::new(&env, None).unwrap();
        let n = s.add_symbol("u8").unwrap();
        let u8t = s
            .add_type(
                n,
                TypeDef::Int(IntType {
                    bits: Some(8),
                    align: 3,
                    ..IntType::default()
                }),
            )
            .unwrap();
        let n = s.add_symbol("maybe").unwrap();
        let choice = s
            .add_type(
                n,
                TypeDef::Choice(ChoiceType {
                    align: 0,
                    pad: 0,
                    options: vec![ChoiceOption::Value(-5), ChoiceOption::Type(u8t)],
                }),
            )
            .unwrap();
        let scope = s.into_shared().unwrap();

        // option 0: literal, consumes only the discriminator bit
        let mut w = Writer::new();
        w.write_bits(0, 1).unwrap();
        let mut dec = Decoder::from_bytes(Rc::clone(&scope), choice, w.into_vec()).unwrap();
        {
            let info = dec.node_info().unwrap();
            assert!(info.flags.contains(NodeFlags::CHOICE_VALUE));
        }
        assert_eq!(dec.int().unwrap(), -5);

        // option 1: dispatch to u8 (aligned, so the byte follows the bit)
        let mut w = Writer::new();
        w.write_bits(1, 1).unwrap();
        w.align(3).unwrap();
        w.write_bits(0x7E, 8).unwrap();
        let mut dec = Decoder::from_bytes(Rc::clone(&scope), choice, w.into_vec()).unwrap();
        {
            let info = dec.node_info().unwrap();
            assert_eq!(info.value_type, Some(u8t));
            assert_eq!(info.subtypes.as_slice(), &[u8t]);
        }
        assert_eq!(dec.uint().unwrap(), 0x7E);
    }

    #[test]
    fn reader_feeds_more_input() {
        let scope = test_scope();
        let mut w = Writer::new();
        w.write_vint(0x20000000).unwrap(); // five bytes
        let bytes = w.into_vec();
        let (head, tail) = bytes.split_at(2);
        let mut dec =
            Decoder::from_bytes(Rc::clone(&scope), ty(&scope, "vuint"), head.to_vec()).unwrap();
        let tail: Vec<u8> = tail.to_vec();
        let mut fed = false;
        dec.set_reader(Some(Box::new(move |input, _need| {
            if fed {
                return false;
            }
            fed = true;
            let len = tail.len();
            input.push_buffer(Buffer::copy_of(&tail), 0..len).is_ok()
        })));
        assert_eq!(dec.uint().unwrap(), 0x20000000);
    }

    #[test]
    fn no_reader_overrun_is_clean() {
        let scope = test_scope();
        let mut dec =
            Decoder::from_bytes(Rc::clone(&scope), ty(&scope, "vuint"), vec![0x01]).unwrap();
        let pos = dec.stream_pos_bits();
        assert_eq!(dec.node_info().unwrap_err(), Error::Overrun);
        assert_eq!(dec.stream_pos_bits(), pos, "failed load must not move");
        // feeding the missing byte makes the same call succeed
        dec.feed_buffer(Buffer::copy_of(&[0x02]), 0..1).unwrap();
        assert_eq!(dec.uint().unwrap(), 0x80);
    }

    #[test]
    fn root_type_must_be_in_scope() {
        let scope = test_scope();
        let env = Env::new();
        let other = Scope::new(&env, None).unwrap().into_shared().unwrap();
        let t = ty(&scope, "u8");
        assert_eq!(Decoder::new(other, t).unwrap_err(), Error::TypeScope);
    }

    #[test]
    fn input_range_must_be_in_buffer() {
        let scope = test_scope();
        let buf = Buffer::copy_of(b"abc");
        let t = ty(&scope, "vuint");
        assert_eq!(
            Decoder::with_input(Rc::clone(&scope), t, buf, 1..4).unwrap_err(),
            Error::BufPointer
        );
    }
}
