//! Lazy pipelined map and the asynchronous read-ahead buffer it is built on
//! (§4.6): a double-buffered producer/consumer range over a pool-owned
//! background task, with O(1) chaining when one of these is stacked on
//! another.
//!
//! Both [`async_buf`] and [`map`] return the same [`AsyncBuf`] type; `map`
//! is just `async_buf` whose producer closure runs [`crate::amap::amap`]
//! over a batch pulled from its own inner `AsyncBuf` instead of pulling
//! from a plain iterator. A pipeline built this way needs a `'static` pool
//! reference (typically [`crate::global::global_pool`]) since the
//! background-fill closure is boxed and outlives the call that submitted
//! it, so it cannot hold a borrow scoped to that call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::amap;
use crate::pool::TaskPool;
use crate::task::Task;

/// A double-buffered, pull-based range: [`AsyncBuf::next`] drains the
/// current buffer while a background task fills the other one, swapping
/// when the current buffer runs dry.
///
/// Constructed directly by [`async_buf`] (wrapping a plain iterator) or by
/// [`map`] (wrapping another `AsyncBuf`, eliding the intermediate copy a
/// second independent pipeline stage would otherwise need).
pub struct AsyncBuf<T: Send + 'static> {
    pool: &'static TaskPool,
    buffer_size: usize,
    current: VecDeque<T>,
    next_task: Option<Task<Vec<T>>>,
    produce: Arc<Mutex<dyn FnMut(usize) -> Vec<T> + Send>>,
    len_hint: Option<usize>,
}

impl<T: Send + 'static> AsyncBuf<T> {
    fn spawn_fill(pool: &'static TaskPool, produce: &Arc<Mutex<dyn FnMut(usize) -> Vec<T> + Send>>, want: usize) -> Task<Vec<T>> {
        let produce = produce.clone();
        pool.submit(move || {
            let mut produce = produce.lock().unwrap_or_else(|e| e.into_inner());
            produce(want)
        })
    }

    /// Builds a pipeline from a boxed `produce` closure: called with a
    /// requested batch size, returning fewer elements than asked for only
    /// on the source's final (possibly empty) batch.
    fn from_producer(
        pool: &'static TaskPool,
        buffer_size: usize,
        len_hint: Option<usize>,
        mut produce: impl FnMut(usize) -> Vec<T> + Send + 'static,
    ) -> Self {
        let first = produce(buffer_size);
        let produce: Arc<Mutex<dyn FnMut(usize) -> Vec<T> + Send>> = Arc::new(Mutex::new(produce));
        let next_task =
            if first.len() < buffer_size { None } else { Some(Self::spawn_fill(pool, &produce, buffer_size)) };
        Self { pool, buffer_size, current: first.into(), next_task, produce, len_hint }
    }

    /// The batch size this pipeline was constructed with, unless a chained
    /// [`map`] has since overridden it to track an inner pipeline's own.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Remaining element count, if the underlying source reported one at
    /// construction time.
    pub fn len_hint(&self) -> Option<usize> {
        self.len_hint
    }

    /// Forces the in-flight background fill (if any) and swaps it in as
    /// the current buffer, submitting a fresh background fill for what
    /// comes after unless the source is now exhausted.
    ///
    /// A panic raised while producing the swapped-in buffer surfaces here,
    /// from [`Task::yield_force`] — this is the "exceptions ... surfaced
    /// at the consumer's next element-read" requirement of §4.6.
    fn swap_in_next(&mut self) {
        let batch = match self.next_task.take() {
            // `_once`: each background-fill task is forced at most once
            // (it is immediately taken out of `next_task`), so there is no
            // idempotent-reread requirement to uphold and no need for
            // `Vec<T>: Clone`.
            Some(task) => task.yield_force_once(),
            None => Vec::new(),
        };
        let exhausted = batch.len() < self.buffer_size;
        self.current = batch.into();
        self.next_task = if exhausted { None } else { Some(Self::spawn_fill(self.pool, &self.produce, self.buffer_size)) };
    }

    fn note_consumed(&mut self, n: usize) {
        if let Some(remaining) = &mut self.len_hint {
            *remaining = remaining.saturating_sub(n);
        }
    }

    /// Returns the next element, or `None` once every batch the source can
    /// produce has been consumed.
    pub fn next(&mut self) -> Option<T> {
        if let Some(item) = self.current.pop_front() {
            self.note_consumed(1);
            return Some(item);
        }
        if self.next_task.is_none() {
            return None;
        }
        self.swap_in_next();
        let item = self.current.pop_front();
        if item.is_some() {
            self.note_consumed(1);
        }
        item
    }

    /// Takes ownership of everything left in the current buffer as one
    /// bulk move (no per-element pulling through [`AsyncBuf::next`]), then
    /// — if the current buffer was already empty — swaps in and drains
    /// whatever the background fill produces next.
    ///
    /// Used by [`map`] to elide the intermediate per-element copy a naive
    /// "pull one, push one" chain on top of an inner `AsyncBuf` would
    /// otherwise pay — see §4.6's chaining note. `want` is advisory: the
    /// producer this pipeline was built from already decided its own
    /// batch size.
    fn take_batch(&mut self, want: usize) -> Vec<T> {
        let _ = want;
        if !self.current.is_empty() {
            let out: Vec<T> = self.current.drain(..).collect();
            self.note_consumed(out.len());
            return out;
        }
        if self.next_task.is_none() {
            return Vec::new();
        }
        self.swap_in_next();
        let out: Vec<T> = self.current.drain(..).collect();
        self.note_consumed(out.len());
        out
    }
}

/// Wraps a plain, already-parallel-agnostic iterator as a read-ahead
/// pipeline: the iterator is drained `buffer_size` elements at a time on a
/// pool worker, one batch ahead of the consumer.
pub fn async_buf<T, I>(pool: &'static TaskPool, source: I, buffer_size: usize) -> AsyncBuf<T>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    let len_hint = source.size_hint().1;
    let mut source = source;
    AsyncBuf::from_producer(pool, buffer_size, len_hint, move |want| source.by_ref().take(want).collect())
}

/// Lazily applies `f` to every element produced by `inner`, running each
/// background batch through [`crate::amap::amap`] before handing it to the
/// consumer.
///
/// Per §4.6's chaining rule, the returned pipeline's buffer size tracks
/// `inner`'s own buffer size rather than `requested_buffer_size` — `inner`
/// is consumed via its O(1) bulk-take rather than one element at a time,
/// so there is no second, independently-sized buffer to allocate.
pub fn map<T, U, F>(pool: &'static TaskPool, mut inner: AsyncBuf<T>, requested_buffer_size: usize, f: F) -> AsyncBuf<U>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
    F: Fn(&T) -> U + Sync + Send + 'static,
{
    let _ = requested_buffer_size;
    let buffer_size = inner.buffer_size();
    let len_hint = inner.len_hint();
    AsyncBuf::from_producer(pool, buffer_size, len_hint, move |want| {
        let batch = inner.take_batch(want);
        amap::amap(pool, &batch, &f)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::global_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn drain<T: Send + 'static>(mut buf: AsyncBuf<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = buf.next() {
            out.push(item);
        }
        out
    }

    #[test]
    fn async_buf_yields_every_element_in_order() {
        let pool = global_pool();
        let buf = async_buf(pool, 0..1000, 64);
        assert_eq!(drain(buf), (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn async_buf_handles_a_length_not_divisible_by_buffer_size() {
        let pool = global_pool();
        let buf = async_buf(pool, 0..97, 10);
        assert_eq!(drain(buf), (0..97).collect::<Vec<_>>());
    }

    #[test]
    fn empty_source_yields_nothing() {
        let pool = global_pool();
        let buf: AsyncBuf<i32> = async_buf(pool, std::iter::empty(), 16);
        assert_eq!(drain(buf), Vec::<i32>::new());
    }

    #[test]
    fn single_element_source() {
        let pool = global_pool();
        let buf = async_buf(pool, std::iter::once(7), 16);
        assert_eq!(drain(buf), vec![7]);
    }

    #[test]
    fn map_applies_f_in_order_over_an_async_buf_source() {
        let pool = global_pool();
        let inner = async_buf(pool, 0..256, 64);
        let mapped = map(pool, inner, 128, |x: &i32| x * x);
        assert_eq!(drain(mapped), (0..256).map(|x: i32| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn chained_map_buffer_size_tracks_the_inner_pipeline() {
        let pool = global_pool();
        let inner = async_buf(pool, 0..10, 64);
        let mapped = map(pool, inner, 128, |x: &i32| *x);
        // The outer call asked for 128; chaining elision overrides that to
        // the inner pipeline's own buffer size instead.
        assert_eq!(mapped.buffer_size(), 64);
    }

    #[test]
    fn producer_runs_ahead_on_a_background_worker() {
        let pool = global_pool();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut buf = AsyncBuf::from_producer(pool, 4, None, move |want| {
            calls2.fetch_add(1, Ordering::SeqCst);
            (0..want as i32).collect()
        });
        // Construction already synchronously filled the first buffer and
        // kicked off a background fill for the second.
        assert!(calls.load(Ordering::SeqCst) >= 1);
        for _ in 0..4 {
            buf.next();
        }
        // Draining the first buffer forces the background task, which by
        // now should already be done or nearly done.
        buf.next();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn a_panic_during_production_surfaces_on_the_next_read() {
        let pool = global_pool();
        let mut calls = 0;
        let mut buf = AsyncBuf::from_producer(pool, 2, None, move |_want| {
            calls += 1;
            if calls == 2 {
                panic!("boom");
            }
            vec![1, 2]
        });
        buf.next();
        buf.next();
        // The second buffer's background fill panicked; forcing it here
        // (buffer #1 just ran dry) re-raises it.
        buf.next();
    }
}
