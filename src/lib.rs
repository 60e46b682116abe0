//! Decoder core for the Userp self-describing binary serialization format.
//!
//! Values are encoded against a *scope* that names symbols and defines
//! types; decoders stream structured data back out of buffer sequences,
//! copying as little as possible.  The crate is organized bottom-up:
//! reference-counted [`Buffer`]s and multi-part [`ByteString`]s, a
//! bit-level [`Cursor`], variable-length integer codecs, [`Scope`]s with
//! their symbol and type tables, and finally the [`Decoder`] that walks a
//! value tree against a scope.

/// Reference-counted byte buffers
pub mod buffer;
/// Multi-part byte strings over shared buffers
pub mod bstr;
mod bits;
/// Variable-length integer codecs
pub mod vint;
/// Encoder building blocks
pub mod enc;
/// Decoder state machine and node info
pub mod dec;
/// Environment limits and defaults
pub mod env;
/// Error taxonomy
pub mod error;
mod hashtree;
/// Scopes, symbols and relative references
pub mod scope;
mod symtable;
/// Type classification and definitions
pub mod typetable;

pub use self::bits::Cursor;
pub use self::bstr::{ByteString, Part};
pub use self::buffer::{Buffer, BufferFlags};
pub use self::dec::{Decoder, NodeFlags, NodeInfo};
pub use self::env::Env;
pub use self::error::Error;
pub use self::scope::{Scope, Symbol, TypeId};
pub use self::typetable::{TypeClass, TypeDef};
