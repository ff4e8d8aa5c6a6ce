//! Eager parallel map (§4.4): apply `f` to every element of a slice right
//! now, across `pool`'s workers, either returning a freshly-allocated
//! `Vec<U>` or writing into a caller-provided output buffer.
//!
//! Built on [`crate::pool::TaskPool::scope`] rather than the batched
//! submitter used by [`crate::foreach`]: the chunk count here is already
//! bounded by `pool.size()`, so there is no need for a self-resubmitting
//! driver — one scoped task per chunk is already O(pool size) tasks.

use crate::chunk;
use crate::error::PreconditionError;
use crate::pool::TaskPool;

/// Maps `f` over `input`, returning the results in a freshly-allocated
/// `Vec` in input order.
pub fn amap<T, U, F>(pool: &TaskPool, input: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send + 'static,
    F: Fn(&T) -> U + Sync,
{
    if input.is_empty() {
        return Vec::new();
    }
    if pool.size() == 0 {
        return input.iter().map(|x| f(x)).collect();
    }

    pool.scope(|s| {
        let handles: Vec<_> = chunk::bounds(input.len(), pool.size())
            .into_iter()
            .map(|(start, end)| {
                let slice = &input[start..end];
                let f = &f;
                s.spawn(move || slice.iter().map(f).collect::<Vec<U>>())
            })
            .collect();
        handles.into_iter().flat_map(|h| h.spin_force()).collect()
    })
}

/// Like [`amap`], but writes results into `output` in place instead of
/// allocating. `output` must have the same length as `input`.
pub fn amap_into<T, U, F>(pool: &TaskPool, input: &[T], output: &mut [U], f: F) -> Result<(), PreconditionError>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync,
{
    if output.len() != input.len() {
        return Err(PreconditionError::WrongBufferLength { expected: input.len(), actual: output.len() });
    }
    if input.is_empty() {
        return Ok(());
    }
    if pool.size() == 0 {
        for (slot, x) in output.iter_mut().zip(input.iter()) {
            *slot = f(x);
        }
        return Ok(());
    }

    pool.scope(|s| {
        let mut remaining = output;
        let handles: Vec<_> = chunk::bounds(input.len(), pool.size())
            .into_iter()
            .map(|(start, end)| {
                let width = end - start;
                let (chunk_out, rest) = remaining.split_at_mut(width);
                remaining = rest;
                let chunk_in = &input[start..end];
                let f = &f;
                s.spawn(move || {
                    for (slot, x) in chunk_out.iter_mut().zip(chunk_in.iter()) {
                        *slot = f(x);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.spin_force();
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_element_in_order() {
        let pool = TaskPool::with_threads(4);
        let input: Vec<i32> = (0..200).collect();
        let output = amap(&pool, &input, |x| x * 2);
        assert_eq!(output, input.iter().map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn empty_input_maps_to_empty_output() {
        let pool = TaskPool::with_threads(4);
        let input: Vec<i32> = Vec::new();
        assert!(amap(&pool, &input, |x| *x).is_empty());
    }

    #[test]
    fn degenerate_pool_maps_serially() {
        let pool = TaskPool::with_threads(0);
        let input: Vec<i32> = (0..50).collect();
        let output = amap(&pool, &input, |x| x + 1);
        assert_eq!(output, input.iter().map(|x| x + 1).collect::<Vec<_>>());
    }

    #[test]
    fn amap_into_rejects_a_mismatched_buffer() {
        let pool = TaskPool::with_threads(2);
        let input = vec![1, 2, 3];
        let mut output = vec![0; 2];
        let err = amap_into(&pool, &input, &mut output, |x| *x);
        assert!(matches!(err, Err(PreconditionError::WrongBufferLength { expected: 3, actual: 2 })));
    }

    #[test]
    fn amap_into_writes_in_place() {
        let pool = TaskPool::with_threads(3);
        let input: Vec<i32> = (0..97).collect();
        let mut output = vec![0; 97];
        amap_into(&pool, &input, &mut output, |x| x * x).unwrap();
        assert_eq!(output, input.iter().map(|x| x * x).collect::<Vec<_>>());
    }
}
