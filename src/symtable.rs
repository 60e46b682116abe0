//! Per-scope symbol table: an append-only entry vector backed by shared
//! name storage, with a lazily built by-name index.
//!
//! Slot 0 of every table is the reserved NUL symbol and is never stored;
//! local ids start at 1.  Global symbol ids are `id_offset + local`.

use std::ops::Range;
use std::rc::Rc;

use crate::bstr::{ByteString, Part};
use crate::buffer::{Buffer, BufferFlags};
use crate::error::Error;
use crate::hashtree::{HashIndex, Insert, SymbolSource};
use crate::scope::{Symbol, TypeId};

/// Caps both the id space of the widest index and `usize` arithmetic on
/// 32-bit hosts.
const MAX_ENTRIES: usize = (1 << 31) - 1;

#[derive(Debug, Clone)]
pub(crate) struct SymbolEntry {
    name_buf: Rc<Buffer>,
    name_range: Range<usize>,
    /// 0 means "not computed yet"; real hashes are remapped away from 0.
    hash: u32,
    /// Set when this symbol names a type in its scope.
    pub(crate) type_ref: Option<TypeId>,
    /// Canonical entry in the scope this symbol was imported from.
    pub(crate) canonical: Option<Symbol>,
}

impl SymbolEntry {
    pub(crate) fn name(&self) -> &[u8] {
        &self.name_buf.bytes()[self.name_range.clone()]
    }
}

/// MurmurHash3-style mixer, fed in 4-byte blocks with a 7-bit shift fold,
/// salted per table.  Zero results are remapped to 1 so that zero can mean
/// "uncomputed".
pub(crate) fn hash_name(salt: u32, name: &[u8]) -> u32 {
    let mut hash = salt;
    let mut accum: u32 = 0;
    let mut i = 0;
    if !name.is_empty() {
        loop {
            accum = (accum << 7) ^ u32::from(name[i]);
            i += 1;
            let mut k = 0;
            while k < 3 && i < name.len() {
                accum = (accum << 7) ^ u32::from(name[i]);
                i += 1;
                k += 1;
            }
            accum = accum.wrapping_mul(0xcc9e_2d51);
            accum = accum.rotate_left(15);
            accum = accum.wrapping_mul(0x1b87_3593);
            hash ^= accum;
            if i >= name.len() {
                break;
            }
            hash = hash.rotate_left(13);
            hash = hash.wrapping_mul(5).wrapping_add(0xe654_6b64);
        }
    }
    hash ^= name.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    if hash == 0 { 1 } else { hash }
}

/// Borrowed view the index uses for name/hash comparisons.
struct Entries<'a>(&'a [SymbolEntry]);

impl SymbolSource for Entries<'_> {
    fn name(&self, idx: usize) -> &[u8] {
        self.0[idx - 1].name()
    }
    fn hash(&self, idx: usize) -> u32 {
        self.0[idx - 1].hash
    }
}

#[derive(Debug)]
pub(crate) struct SymbolTable {
    symbols: Vec<SymbolEntry>,
    /// Every buffer holding name bytes, packed end-to-end in protocol
    /// order.
    chardata: ByteString,
    id_offset: u32,
    salt: u32,
    index: HashIndex,
    /// Entries incorporated into the index, counting the reserved slot 0.
    /// Zero means the index is unbuilt or cleared.
    processed: usize,
}

impl SymbolTable {
    pub(crate) fn new(id_offset: u32, salt: u32) -> SymbolTable {
        SymbolTable {
            symbols: Vec::new(),
            chardata: ByteString::new(),
            id_offset,
            salt,
            index: HashIndex::None,
            processed: 0,
        }
    }

    /// Occupied entry count including the reserved slot 0.
    pub(crate) fn used(&self) -> usize {
        self.symbols.len() + 1
    }

    /// Number of real symbols.
    pub(crate) fn count(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn id_offset(&self) -> u32 {
        self.id_offset
    }

    pub(crate) fn entry(&self, local: usize) -> Option<&SymbolEntry> {
        if local == 0 {
            return None;
        }
        self.symbols.get(local - 1)
    }

    pub(crate) fn entry_mut(&mut self, local: usize) -> Option<&mut SymbolEntry> {
        if local == 0 {
            return None;
        }
        self.symbols.get_mut(local - 1)
    }

    pub(crate) fn name_bytes(&self, local: usize) -> Option<&[u8]> {
        self.entry(local).map(SymbolEntry::name)
    }

    /// Append one symbol, copying its name into table-owned storage as a
    /// single contiguous NUL-terminated span.  No duplicate check; callers
    /// look up first.
    pub(crate) fn add(&mut self, name: &[u8]) -> Result<usize, Error> {
        if self.used() >= MAX_ENTRIES {
            return Err(Error::DoingItWrong("symbol table is full"));
        }
        let hash = hash_name(self.salt, name);
        let span = self.chardata.append_reserve(name.len() + 1)?;
        span[..name.len()].copy_from_slice(name);
        let part = self
            .chardata
            .parts()
            .last()
            .ok_or(Error::BadState("chardata append left no part"))?;
        let end = part.buf_range().end;
        self.symbols.push(SymbolEntry {
            name_buf: Rc::clone(part.buffer()),
            name_range: end - name.len() - 1..end - 1,
            hash,
            type_ref: None,
            canonical: None,
        });
        Ok(self.symbols.len())
    }

    /// Local id of `name`, if present.  Uses the index for everything it
    /// has caught up with and scans the unprocessed tail linearly; never
    /// mutates the table.
    pub(crate) fn lookup(&self, name: &[u8]) -> Option<usize> {
        let hash = hash_name(self.salt, name);
        let src = Entries(&self.symbols);
        if let Some(idx) = self.index.get(&src, hash, name) {
            return Some(idx);
        }
        let first_unindexed = self.processed.saturating_sub(1);
        for (i, entry) in self.symbols.iter().enumerate().skip(first_unindexed) {
            if entry.name() == name {
                return Some(i + 1);
            }
        }
        None
    }

    /// Catch the index up with every appended entry, allocating or
    /// rebuilding buckets as required.
    pub(crate) fn populate_index(&mut self) -> Result<(), Error> {
        let count = self.used();
        let needed_width = HashIndex::width_for(self.symbols.len());

        // More buckets, or wider words?  Either way the index restarts
        // from scratch; the hash layout changes with the bucket count.
        if self.index.bucket_count() < count + (count >> 1) || self.index.width() < needed_width {
            let grown = self.index.bucket_count() != 0;
            let mut buckets =
                self.symbols.len().next_power_of_two() << if grown { 2usize } else { 1 };
            buckets = buckets.clamp(0x200, usize::MAX / 4);
            // odd bucket counts distribute the hash much better
            if buckets & 1 == 0 {
                buckets -= 1;
            }
            log::trace!(
                "symtable: alloc hashtree buckets={} for {} symbols",
                buckets,
                count
            );
            if grown {
                log::trace!(
                    "symtable: rebuild hashtree ({}/{}) at {} symbols",
                    self.index.bucket_used(),
                    self.index.bucket_count(),
                    count
                );
            }
            self.index = HashIndex::with_buckets(needed_width, buckets);
            self.processed = 0;
        }
        if self.processed == 0 {
            self.processed = 1; // slot 0 counts as processed
        }
        let batch = self.used() - self.processed;
        while self.processed < self.used() {
            let local = self.processed;
            let hash = {
                let e = &self.symbols[local - 1];
                if e.hash != 0 {
                    e.hash
                } else {
                    hash_name(self.salt, e.name())
                }
            };
            self.symbols[local - 1].hash = hash;
            let outcome = {
                let src = Entries(&self.symbols);
                self.index.insert(&src, local)?
            };
            match outcome {
                Insert::Done => self.processed += 1,
                Insert::NeedsWiderIndex => {
                    let width = match self.index.width() {
                        8 => 16,
                        16 => 32,
                        _ => return Err(Error::BadState("symbol index exhausted its id space")),
                    };
                    log::debug!("symtable: upgrade hashtree to {width}-bit words");
                    let buckets = self.index.bucket_count();
                    self.index = HashIndex::with_buckets(width, buckets);
                    self.processed = 1;
                }
            }
        }
        if batch > 1 {
            log::trace!(
                "symtable: added {} symbols to hashtree ({}/{})",
                batch,
                self.index.bucket_used(),
                self.index.bucket_count()
            );
        }
        Ok(())
    }

    /// True once every entry is reachable through the index.
    pub(crate) fn index_current(&self) -> bool {
        self.processed == self.used()
    }

    /// Forget bindings to type ids above `last_valid`; used when a type
    /// parse rolls back entries some symbols already point at.
    pub(crate) fn clear_type_refs_above(&mut self, last_valid: u32) {
        for entry in &mut self.symbols {
            if entry.type_ref.is_some_and(|t| t.get() > last_valid) {
                entry.type_ref = None;
            }
        }
    }

    /// Parse `expected` NUL-delimited names out of the given parts.
    ///
    /// Names are recorded zero-copy against the source buffers; a name
    /// split across a part boundary is copied into a fresh contiguous
    /// buffer covering the joined bytes (the name continues to the first
    /// NUL found in a later part).  On any failure the table is restored
    /// to its pre-call state.
    pub(crate) fn parse_block(&mut self, parts: &[Part], expected: usize) -> Result<(), Error> {
        if expected == 0 {
            return Ok(());
        }
        if parts.iter().all(|p| p.is_empty()) {
            return Err(Error::Overrun);
        }
        if self.used() + expected > MAX_ENTRIES {
            return Err(Error::DoingItWrong("symbol table is full"));
        }
        // at most one new chardata part per input part plus one per
        // boundary-spanning name
        self.chardata
            .reserve_parts(self.chardata.part_count() + parts.len() * 2 - 1);
        let orig_syms = self.symbols.len();
        let orig_parts = self.chardata.part_count();

        let result = self.parse_block_inner(parts, expected);
        if result.is_err() {
            self.symbols.truncate(orig_syms);
            self.chardata.truncate_parts(orig_parts);
        }
        result
    }

    fn parse_block_inner(&mut self, parts: &[Part], expected: usize) -> Result<(), Error> {
        let mut remaining = expected;
        let mut pi = 0usize;
        let mut pos = 0usize;
        let mut abs_base = 0usize;
        while remaining > 0 {
            if pi >= parts.len() {
                return Err(Error::Overrun);
            }
            let bytes = parts[pi].bytes();
            let span_start = pos;
            while remaining > 0 {
                let Some(rel) = bytes[pos..].iter().position(|&b| b == 0) else {
                    break;
                };
                let name = &bytes[pos..pos + rel];
                validate_name(name, abs_base + pos)?;
                let start = parts[pi].buf_range().start + pos;
                self.symbols.push(SymbolEntry {
                    name_buf: Rc::clone(parts[pi].buffer()),
                    name_range: start..start + rel,
                    hash: 0,
                    type_ref: None,
                    canonical: None,
                });
                pos += rel + 1;
                remaining -= 1;
            }
            // record the consumed span of this part as chardata
            if pos > span_start {
                let start = parts[pi].buf_range().start;
                self.chardata.push_part(Part::new(
                    Rc::clone(parts[pi].buffer()),
                    start + span_start..start + pos,
                )?);
            }
            if remaining == 0 {
                break;
            }
            if pos >= bytes.len() {
                // clean boundary between names
                abs_base += bytes.len();
                pi += 1;
                pos = 0;
                continue;
            }
            // a name runs off the end of this part: join fragments into
            // one exact-size contiguous buffer, NUL included
            let name_pos = abs_base + pos;
            let mut joined = bytes[pos..].to_vec();
            abs_base += bytes.len();
            let mut pj = pi + 1;
            let resume;
            loop {
                if pj >= parts.len() {
                    return Err(Error::Overrun);
                }
                let frag = parts[pj].bytes();
                if let Some(rel) = frag.iter().position(|&b| b == 0) {
                    joined.extend_from_slice(&frag[..rel]);
                    resume = rel + 1;
                    break;
                }
                joined.extend_from_slice(frag);
                abs_base += frag.len();
                pj += 1;
            }
            validate_name(&joined, name_pos)?;
            let mut buf = Buffer::raw_with_capacity(joined.len() + 1, BufferFlags::EXACT);
            buf.push_bytes(&joined);
            buf.push_bytes(&[0]);
            let buf = Rc::new(buf);
            self.symbols.push(SymbolEntry {
                name_buf: Rc::clone(&buf),
                name_range: 0..joined.len(),
                hash: 0,
                type_ref: None,
                canonical: None,
            });
            self.chardata.push_part(Part::new(buf, 0..joined.len() + 1)?);
            remaining -= 1;
            pi = pj;
            pos = resume;
        }
        Ok(())
    }
}

/// Names must be non-empty strict UTF-8 with no control bytes
/// (0x00..=0x1F) and no 0x7F.
fn validate_name(name: &[u8], pos: usize) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Symbol {
            detail: "zero-length name",
            pos,
        });
    }
    if std::str::from_utf8(name).is_err() {
        return Err(Error::Symbol {
            detail: "invalid UTF-8 sequence",
            pos,
        });
    }
    if name.iter().any(|&b| b < 0x20 || b == 0x7F) {
        return Err(Error::Symbol {
            detail: "forbidden control character",
            pos,
        });
    }
    Ok(())
}
