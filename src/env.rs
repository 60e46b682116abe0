use std::rc::Rc;

/// Shared limits and defaults for a family of scopes, buffers and decoders.
///
/// Every scope holds a reference to the environment it was created from, and
/// objects from different environments may not be mixed.  The environment
/// carries no callbacks or allocator state; it is only the tunable knobs and
/// the per-process hash salt.
#[derive(Debug, Clone)]
pub struct Env {
    scope_stack_max: usize,
    record_fields_max: usize,
    max_decode_depth: usize,
    salt: u32,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            scope_stack_max: 255,
            record_fields_max: (1 << 16) - 1,
            max_decode_depth: 255,
            salt: 0,
        }
    }
}

impl Env {
    #[must_use]
    pub fn new() -> Rc<Env> {
        Rc::new(Env::default())
    }

    /// Wrap a configured environment for sharing.
    #[must_use]
    pub fn shared(self) -> Rc<Env> {
        Rc::new(self)
    }

    /// Maximum scope nesting depth.
    #[must_use]
    pub fn scope_stack_max(&self) -> usize {
        self.scope_stack_max
    }

    pub fn set_scope_stack_max(&mut self, max: usize) -> &mut Self {
        self.scope_stack_max = max;
        self
    }

    /// Maximum number of fields a single record definition may declare.
    #[must_use]
    pub fn record_fields_max(&self) -> usize {
        self.record_fields_max
    }

    pub fn set_record_fields_max(&mut self, max: usize) -> &mut Self {
        self.record_fields_max = max;
        self
    }

    /// Maximum recursion depth while loading or skipping a node.
    #[must_use]
    pub fn max_decode_depth(&self) -> usize {
        self.max_decode_depth
    }

    pub fn set_max_decode_depth(&mut self, max: usize) -> &mut Self {
        self.max_decode_depth = max;
        self
    }

    /// Salt mixed into every symbol-table hash.
    #[must_use]
    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn set_salt(&mut self, salt: u32) -> &mut Self {
        self.salt = salt;
        self
    }
}
