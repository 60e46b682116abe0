//! By-name symbol index: a hash table whose buckets hold either a single
//! symbol, an inline pair of symbols, or the root of a red/black tree
//! ordered by `(hash, name)`.
//!
//! Buckets and tree nodes are plain integers, not pointers, so the whole
//! index can be rebuilt at a different word width as the symbol count
//! grows: 8-bit words below 128 symbols, 16-bit below 32768, 32-bit above.
//! The low bit of a bucket word discriminates "symbol id" from "node id";
//! the top bit of a node's `sym` word marks a pair node, and the top bit of
//! its `right` word is the red/black color.  Node 0 is the leaf sentinel.

use std::cmp::Ordering;

use crate::error::Error;

/// Access to symbol names and hashes, provided by the symbol table.
/// Indices are table-local (1-based; slot 0 is the reserved NUL entry).
pub(crate) trait SymbolSource {
    fn name(&self, idx: usize) -> &[u8];
    fn hash(&self, idx: usize) -> u32;
}

pub(crate) trait IndexWord: Copy + Eq + Ord + std::fmt::Debug {
    const BITS: u32;
    /// Ids carry one bit less than the word, leaving room for a tag bit.
    const MAX_ID: usize;
    const ZERO: Self;
    fn from_usize(v: usize) -> Self;
    fn to_usize(self) -> usize;
    fn from_hash(h: u32) -> Self;
}

macro_rules! index_word {
    ($ty:ty, $bits:expr) => {
        impl IndexWord for $ty {
            const BITS: u32 = $bits;
            const MAX_ID: usize = (1 << ($bits - 1)) - 1;
            const ZERO: Self = 0;
            #[inline]
            fn from_usize(v: usize) -> Self {
                v as $ty
            }
            #[inline]
            fn to_usize(self) -> usize {
                self as usize
            }
            #[inline]
            fn from_hash(h: u32) -> Self {
                h as $ty
            }
        }
    };
}
index_word!(u8, 8);
index_word!(u16, 16);
index_word!(u32, 32);

/// One tree node.  A pair node wedges two symbols into one record instead:
/// `(sym, hash)` is the first and `(right, left)` holds the second's id and
/// hash.
#[derive(Debug, Clone, Copy)]
struct Node<W> {
    sym: W,
    hash: W,
    left: W,
    right: W,
}

/// Outcome of an insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Insert {
    Done,
    /// The symbol or node id no longer fits this word width; the caller
    /// must rebuild at the next width.
    NeedsWiderIndex,
}

#[derive(Debug)]
pub(crate) struct HashTree<W> {
    buckets: Vec<W>,
    nodes: Vec<Node<W>>,
    bucket_used: usize,
}

impl<W: IndexWord> HashTree<W> {
    pub(crate) fn with_buckets(count: usize) -> HashTree<W> {
        HashTree {
            buckets: vec![W::ZERO; count],
            nodes: Vec::new(),
            bucket_used: 0,
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn bucket_used(&self) -> usize {
        self.bucket_used
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    fn sym_of(&self, n: usize) -> usize {
        self.nodes[n].sym.to_usize() & W::MAX_ID
    }

    fn is_pair(&self, n: usize) -> bool {
        self.nodes[n].sym.to_usize() > W::MAX_ID
    }

    fn left(&self, n: usize) -> usize {
        self.nodes[n].left.to_usize()
    }

    fn set_left(&mut self, n: usize, child: usize) {
        self.nodes[n].left = W::from_usize(child);
    }

    fn right(&self, n: usize) -> usize {
        self.nodes[n].right.to_usize() & W::MAX_ID
    }

    fn is_red(&self, n: usize) -> bool {
        self.nodes[n].right.to_usize() > W::MAX_ID
    }

    fn set_right(&mut self, n: usize, child: usize) {
        let color = self.nodes[n].right.to_usize() & !W::MAX_ID;
        self.nodes[n].right = W::from_usize(child | color);
    }

    fn set_red(&mut self, n: usize, red: bool) {
        let child = self.right(n);
        self.nodes[n].right = W::from_usize(child | if red { W::MAX_ID + 1 } else { 0 });
    }

    /// `(hash, name)` ordering between the would-be node `a` and node `b`.
    fn node_cmp<S: SymbolSource>(&self, src: &S, a: usize, b: usize) -> Ordering {
        self.nodes[a]
            .hash
            .cmp(&self.nodes[b].hash)
            .then_with(|| src.name(self.sym_of(a)).cmp(src.name(self.sym_of(b))))
    }

    /// Find the table-local index of `name`, or `None`.  Never mutates.
    pub(crate) fn get<S: SymbolSource>(&self, src: &S, hash: u32, name: &[u8]) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = self.buckets[hash as usize % self.buckets.len()].to_usize();
        if bucket & 1 == 0 {
            let sym = bucket >> 1;
            if sym != 0 && src.name(sym) == name {
                return Some(sym);
            }
            return None;
        }
        let mut node = bucket >> 1;
        if self.is_pair(node) {
            let kh = W::from_hash(hash);
            if kh == self.nodes[node].hash && name == src.name(self.sym_of(node)) {
                return Some(self.sym_of(node));
            }
            let second = self.right(node);
            if kh == self.nodes[node].left && name == src.name(second) {
                return Some(second);
            }
            return None;
        }
        let kh = W::from_hash(hash);
        while node != 0 {
            let cmp = kh
                .cmp(&self.nodes[node].hash)
                .then_with(|| name.cmp(src.name(self.sym_of(node))));
            match cmp {
                Ordering::Equal => return Some(self.sym_of(node)),
                Ordering::Less => node = self.left(node),
                Ordering::Greater => node = self.right(node),
            }
        }
        None
    }

    /// Insert one symbol.  Signals when the id space of this width is
    /// exhausted so the caller can rebuild wider.
    pub(crate) fn insert<S: SymbolSource>(
        &mut self,
        src: &S,
        sym: usize,
    ) -> Result<Insert, Error> {
        if sym > W::MAX_ID || self.buckets.is_empty() {
            return Ok(Insert::NeedsWiderIndex);
        }
        let hash = src.hash(sym);
        let bi = hash as usize % self.buckets.len();
        let bucket = self.buckets[bi].to_usize();
        if bucket == 0 {
            self.buckets[bi] = W::from_usize(sym << 1);
            self.bucket_used += 1;
            return Ok(Insert::Done);
        }
        if self.nodes.is_empty() {
            // node 0 is the leaf sentinel
            self.nodes.push(Node {
                sym: W::ZERO,
                hash: W::ZERO,
                left: W::ZERO,
                right: W::ZERO,
            });
        }
        if bucket & 1 == 0 {
            // single symbol -> pair node
            let other = bucket >> 1;
            let node = self.nodes.len();
            if node > W::MAX_ID {
                return Ok(Insert::NeedsWiderIndex);
            }
            self.nodes.push(Node {
                sym: W::from_usize(sym | (W::MAX_ID + 1)),
                hash: W::from_hash(hash),
                left: W::from_hash(src.hash(other)),
                right: W::from_usize(other),
            });
            self.buckets[bi] = W::from_usize((node << 1) | 1);
            return Ok(Insert::Done);
        }
        let mut root = bucket >> 1;
        if self.is_pair(root) {
            // unpack the pair into a two-node tree
            if self.nodes.len() + 1 > W::MAX_ID {
                return Ok(Insert::NeedsWiderIndex);
            }
            let second_sym = self.right(root);
            let second_hash = self.nodes[root].left;
            let child = self.nodes.len();
            self.nodes.push(Node {
                sym: W::from_usize(second_sym),
                hash: second_hash,
                left: W::ZERO,
                right: W::from_usize(W::MAX_ID + 1), // red leaf
            });
            let first_sym = self.sym_of(root);
            self.nodes[root].sym = W::from_usize(first_sym);
            if self.node_cmp(src, child, root) == Ordering::Less {
                self.nodes[root].left = W::from_usize(child);
                self.nodes[root].right = W::ZERO;
            } else {
                self.nodes[root].left = W::ZERO;
                self.nodes[root].right = W::from_usize(child);
            }
        }
        // node for the new symbol, then standard red/black insertion
        let node = self.nodes.len();
        if node > W::MAX_ID {
            return Ok(Insert::NeedsWiderIndex);
        }
        self.nodes.push(Node {
            sym: W::from_usize(sym),
            hash: W::from_hash(hash),
            left: W::ZERO,
            right: W::ZERO,
        });
        let prev_root = root;
        self.rb_insert(src, &mut root, node)?;
        if root != prev_root {
            self.buckets[bi] = W::from_usize((root << 1) | 1);
        }
        Ok(Insert::Done)
    }

    fn rotate_left(&mut self, n: usize) -> usize {
        let r = self.right(n);
        let inner = self.left(r);
        self.set_right(n, inner);
        self.set_left(r, n);
        r
    }

    fn rotate_right(&mut self, n: usize) -> usize {
        let l = self.left(n);
        let inner = self.right(l);
        self.set_left(n, inner);
        self.set_right(l, n);
        l
    }

    fn replace_child(&mut self, parent: usize, root: &mut usize, old: usize, new: usize) {
        if parent == 0 {
            *root = new;
        } else if self.right(parent) == old {
            self.set_right(parent, new);
        } else {
            self.set_left(parent, new);
        }
    }

    /// Parent-stack red/black insertion, bounded by twice the word width.
    fn rb_insert<S: SymbolSource>(
        &mut self,
        src: &S,
        root: &mut usize,
        node: usize,
    ) -> Result<(), Error> {
        let limit = (W::BITS * 2) as usize;
        let mut stack = [0usize; 64];
        let mut top = 0usize;
        let mut pos = *root;
        let mut cmp = Ordering::Less;
        while pos != 0 {
            top += 1;
            if top >= limit {
                return Err(Error::BadState("symbol index tree too deep"));
            }
            stack[top] = pos;
            cmp = self.node_cmp(src, node, pos);
            pos = if cmp == Ordering::Less {
                self.left(stack[top])
            } else {
                self.right(stack[top])
            };
        }
        if cmp == Ordering::Less {
            self.set_left(stack[top], node);
        } else {
            self.set_right(stack[top], node);
        }
        self.set_red(node, true);

        let mut x = node;
        let mut i = top; // stack[i] is x's parent
        while i >= 2 && self.is_red(stack[i]) {
            let parent = stack[i];
            let gp = stack[i - 1];
            if self.left(gp) == parent {
                let uncle = self.right(gp);
                if uncle != 0 && self.is_red(uncle) {
                    self.set_red(parent, false);
                    self.set_red(uncle, false);
                    self.set_red(gp, true);
                    x = gp;
                    i -= 2;
                    continue;
                }
                let pivot = if self.right(parent) == x {
                    let sub = self.rotate_left(parent);
                    self.set_left(gp, sub);
                    sub
                } else {
                    parent
                };
                self.set_red(pivot, false);
                self.set_red(gp, true);
                let sub = self.rotate_right(gp);
                self.replace_child(stack[i - 2], root, gp, sub);
                break;
            } else {
                let uncle = self.left(gp);
                if uncle != 0 && self.is_red(uncle) {
                    self.set_red(parent, false);
                    self.set_red(uncle, false);
                    self.set_red(gp, true);
                    x = gp;
                    i -= 2;
                    continue;
                }
                let pivot = if self.left(parent) == x {
                    let sub = self.rotate_right(parent);
                    self.set_right(gp, sub);
                    sub
                } else {
                    parent
                };
                self.set_red(pivot, false);
                self.set_red(gp, true);
                let sub = self.rotate_left(gp);
                self.replace_child(stack[i - 2], root, gp, sub);
                break;
            }
        }
        self.set_red(*root, false);
        Ok(())
    }
}

/// The index at whichever word width the table currently needs.
#[derive(Debug)]
pub(crate) enum HashIndex {
    None,
    W7(HashTree<u8>),
    W15(HashTree<u16>),
    W31(HashTree<u32>),
}

impl HashIndex {
    /// Word width needed to index `count` symbols.
    pub(crate) fn width_for(count: usize) -> u32 {
        if count <= u8::MAX_ID {
            8
        } else if count <= u16::MAX_ID {
            16
        } else {
            32
        }
    }

    pub(crate) fn width(&self) -> u32 {
        match self {
            HashIndex::None => 0,
            HashIndex::W7(_) => 8,
            HashIndex::W15(_) => 16,
            HashIndex::W31(_) => 32,
        }
    }

    pub(crate) fn with_buckets(width: u32, count: usize) -> HashIndex {
        match width {
            8 => HashIndex::W7(HashTree::with_buckets(count)),
            16 => HashIndex::W15(HashTree::with_buckets(count)),
            _ => HashIndex::W31(HashTree::with_buckets(count)),
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        match self {
            HashIndex::None => 0,
            HashIndex::W7(t) => t.bucket_count(),
            HashIndex::W15(t) => t.bucket_count(),
            HashIndex::W31(t) => t.bucket_count(),
        }
    }

    pub(crate) fn bucket_used(&self) -> usize {
        match self {
            HashIndex::None => 0,
            HashIndex::W7(t) => t.bucket_used(),
            HashIndex::W15(t) => t.bucket_used(),
            HashIndex::W31(t) => t.bucket_used(),
        }
    }

    pub(crate) fn get<S: SymbolSource>(&self, src: &S, hash: u32, name: &[u8]) -> Option<usize> {
        match self {
            HashIndex::None => None,
            HashIndex::W7(t) => t.get(src, hash, name),
            HashIndex::W15(t) => t.get(src, hash, name),
            HashIndex::W31(t) => t.get(src, hash, name),
        }
    }

    pub(crate) fn insert<S: SymbolSource>(
        &mut self,
        src: &S,
        sym: usize,
    ) -> Result<Insert, Error> {
        match self {
            HashIndex::None => Ok(Insert::NeedsWiderIndex),
            HashIndex::W7(t) => t.insert(src, sym),
            HashIndex::W15(t) => t.insert(src, sym),
            HashIndex::W31(t) => t.insert(src, sym),
        }
    }
}
