//! Implements the [`Batch`] struct

use llama_cpp_sys::{llama_batch, llama_batch_free, llama_batch_init};
use tracing::trace;

use crate::Token;

/// The only sequence a single-turn context ever decodes into.
const SEQUENCE_ID: i32 = 0;

/// A safe wrapper around a single-sequence [`llama_batch`].
///
/// The batch is allocated once per context with `n_batch` slots and reused for every prompt
/// chunk and every generated token.
pub(crate) struct Batch {
    inner: llama_batch,

    /// The maximum number of tokens this batch can hold.
    capacity: usize,
}

impl Batch {
    /// Allocates a batch with room for `capacity` tokens.
    ///
    /// `capacity` comes from a resolved `n_batch`, which is never zero.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "Cannot create a batch with no capacity");

        Self {
            // SAFETY: `embd == 0` allocates token storage, one sequence id per token.
            inner: unsafe { llama_batch_init(capacity as i32, 0, 1) },
            capacity,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.inner.n_tokens = 0;
    }

    /// Appends `token` at `position`, returning `false` once the batch is full.
    pub(crate) fn add(&mut self, token: Token, position: usize, logits: bool) -> bool {
        let i = self.inner.n_tokens as usize;

        if i == self.capacity {
            return false;
        }

        trace!("Writing token {i} of {} ({token:?})", self.capacity);

        unsafe {
            // SAFETY: `llama_batch_init` allocated `capacity` slots for each of these arrays,
            // and `i < capacity`.
            self.inner.token.add(i).write(token.0);
            self.inner.pos.add(i).write(position as i32);
            self.inner.logits.add(i).write(i8::from(logits));
            self.inner.n_seq_id.add(i).write(1);

            let seq_ptr = *self.inner.seq_id.add(i);
            if !seq_ptr.is_null() {
                seq_ptr.write(SEQUENCE_ID);
            }
        }

        self.inner.n_tokens += 1;
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.n_tokens as usize
    }

    pub(crate) fn handle(&self) -> llama_batch {
        self.inner
    }
}

// SAFETY: the arrays behind `inner` are owned by this batch alone, and only touched through
// `&mut self`.
unsafe impl Send for Batch {}

impl Drop for Batch {
    fn drop(&mut self) {
        trace!("Freeing batch");

        // SAFETY: `inner` was allocated by `llama_batch_init` and is freed exactly once.
        unsafe { llama_batch_free(self.inner) }
    }
}
