//! Attention mask over the positions visible to the model.

/// 0/1 flags, one per visible position.
///
/// Backed by a buffer sized for the whole generation up front so decode
/// steps push without reallocating.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttentionMask {
    flags: Vec<u8>,
}

impl AttentionMask {
    /// All-visible mask of `len` positions.
    pub fn ones(len: usize) -> Self {
        Self {
            flags: vec![1; len],
        }
    }

    pub fn from_flags(flags: Vec<u8>) -> Self {
        Self { flags }
    }

    /// Reserve room for `additional` more positions.
    pub fn reserve(&mut self, additional: usize) {
        self.flags.reserve(additional);
    }

    /// Mark one more position as visible.
    pub fn push_visible(&mut self) {
        self.flags.push(1);
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.flags.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.flags
    }

    pub fn visible_count(&self) -> usize {
        self.flags.iter().filter(|&&flag| flag != 0).count()
    }
}

impl From<Vec<u8>> for AttentionMask {
    fn from(flags: Vec<u8>) -> Self {
        Self::from_flags(flags)
    }
}
