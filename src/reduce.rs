//! Parallel reduce (§4.7): split `[0, L)` into `pool.size()`-ish contiguous
//! chunks, left-fold each chunk independently, then fold the partial
//! results serially in submission order with the same operator.
//!
//! The serial final fold is what lets this accept a merely *associative*
//! (not necessarily commutative) operator: the chunk results are combined
//! with the exact same `op` that folded each chunk, so `op` only ever sees
//! two `T`s at a time — never a chunk-local accumulator of a different
//! shape than the elements it folds.

use crate::chunk;
use crate::error::PreconditionError;
use crate::pool::TaskPool;

/// Reduces `input` with an associative `op`, starting from `seed`.
///
/// Valid (and not a precondition fault) for an empty `input`: there is
/// nothing to fold, so the seed is returned unchanged. See [`reduce`] for
/// the unseeded form, which instead seeds from `input`'s own first element.
pub fn reduce_seeded<T, Op>(pool: &TaskPool, input: &[T], seed: T, op: Op) -> T
where
    T: Sync + Send + Clone,
    Op: Fn(T, T) -> T + Sync,
{
    if input.is_empty() {
        return seed;
    }
    if pool.size() == 0 {
        return input.iter().cloned().fold(seed, &op);
    }

    let partials: Vec<T> = pool.scope(|s| {
        let handles: Vec<_> = chunk::bounds(input.len(), pool.size())
            .into_iter()
            .map(|(start, end)| {
                let slice = &input[start..end];
                let op = &op;
                let seed = seed.clone();
                s.spawn(move || slice.iter().cloned().fold(seed, op))
            })
            .collect();
        handles.into_iter().map(|h| h.spin_force()).collect()
    });

    partials.into_iter().fold(seed, &op)
}

/// Reduces `input` with an associative `op`, seeded with its own first
/// element when `input` is non-empty.
///
/// Fails with [`PreconditionError::EmptyReduce`] for an empty `input` —
/// there is no element to seed from and no operator identity to fall back
/// on (use [`reduce_seeded`] if one is available).
pub fn reduce<T, Op>(pool: &TaskPool, input: &[T], op: Op) -> Result<T, PreconditionError>
where
    T: Sync + Send + Clone,
    Op: Fn(T, T) -> T + Sync,
{
    let Some((first, rest)) = input.split_first() else {
        return Err(PreconditionError::EmptyReduce);
    };
    if rest.is_empty() || pool.size() == 0 {
        return Ok(rest.iter().cloned().fold(first.clone(), &op));
    }

    let partials: Vec<T> = pool.scope(|s| {
        let handles: Vec<_> = chunk::bounds(input.len(), pool.size())
            .into_iter()
            .map(|(start, end)| {
                let slice = &input[start..end];
                let op = &op;
                s.spawn(move || {
                    let (head, tail) = slice.split_first().expect("chunk bounds never produce an empty slice");
                    tail.iter().cloned().fold(head.clone(), op)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.spin_force()).collect()
    });

    let mut iter = partials.into_iter();
    let seed = iter.next().expect("at least one chunk exists for a non-empty input");
    Ok(iter.fold(seed, &op))
}

/// Folds two independent operators over the same input in one pass, e.g.
/// simultaneous sum and product:
/// `reduce2(pool, xs, 0, |a, b| a + b, 1, |a, b| a * b)`. See §4.7 — an
/// `N`-ary generalization needs const generics this crate does not reach
/// for; additional fixed arities would follow the same pattern (recorded
/// as an Open Question in DESIGN.md).
pub fn reduce2<T, Op1, Op2>(pool: &TaskPool, input: &[T], seed1: T, op1: Op1, seed2: T, op2: Op2) -> (T, T)
where
    T: Sync + Send + Clone,
    Op1: Fn(T, T) -> T + Sync,
    Op2: Fn(T, T) -> T + Sync,
{
    if input.is_empty() {
        return (seed1, seed2);
    }
    if pool.size() == 0 {
        let a = input.iter().cloned().fold(seed1, &op1);
        let b = input.iter().cloned().fold(seed2, &op2);
        return (a, b);
    }

    let partials: Vec<(T, T)> = pool.scope(|s| {
        let handles: Vec<_> = chunk::bounds(input.len(), pool.size())
            .into_iter()
            .map(|(start, end)| {
                let slice = &input[start..end];
                let op1 = &op1;
                let op2 = &op2;
                let seed1 = seed1.clone();
                let seed2 = seed2.clone();
                s.spawn(move || {
                    let a = slice.iter().cloned().fold(seed1, op1);
                    let b = slice.iter().cloned().fold(seed2, op2);
                    (a, b)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.spin_force()).collect()
    });

    partials.into_iter().fold((seed1, seed2), |(acc1, acc2), (p1, p2)| (op1(acc1, p1), op2(acc2, p2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_matches_serial_fold() {
        let pool = TaskPool::with_threads(4);
        let xs = vec![1, 2, 3, 4];
        assert_eq!(reduce(&pool, &xs, |a, b| a + b).unwrap(), 10);
    }

    #[test]
    fn two_operators_run_in_one_pass() {
        let pool = TaskPool::with_threads(4);
        let xs = vec![1, 2, 3, 4];
        let (sum, product) = reduce2(&pool, &xs, 0i64, |a, b| a + b, 1i64, |a, b| a * b);
        assert_eq!((sum, product), (10, 24));
    }

    #[test]
    fn empty_input_without_seed_is_a_precondition_fault() {
        let pool = TaskPool::with_threads(2);
        let xs: Vec<i32> = Vec::new();
        assert!(matches!(reduce(&pool, &xs, |a, b| a + b), Err(PreconditionError::EmptyReduce)));
    }

    #[test]
    fn empty_input_with_seed_returns_the_seed() {
        let pool = TaskPool::with_threads(2);
        let xs: Vec<i32> = Vec::new();
        assert_eq!(reduce_seeded(&pool, &xs, 0, |a, b| a + b), 0);
    }

    #[test]
    fn degenerate_pool_folds_serially() {
        let pool = TaskPool::with_threads(0);
        let xs: Vec<i32> = (1..=100).collect();
        assert_eq!(reduce(&pool, &xs, |a, b| a + b).unwrap(), (1..=100).sum());
    }

    #[test]
    fn non_commutative_operator_preserves_source_order() {
        let pool = TaskPool::with_threads(4);
        // String concatenation is associative but not commutative: a
        // correct reduce must still read "abcdefgh" in this exact order.
        let xs: Vec<String> = "abcdefgh".chars().map(|c| c.to_string()).collect();
        let joined = reduce_seeded(&pool, &xs, String::new(), |mut acc, s| {
            acc.push_str(&s);
            acc
        });
        assert_eq!(joined, "abcdefgh");
    }

    #[test]
    fn single_element_input() {
        let pool = TaskPool::with_threads(4);
        let xs = vec![42];
        assert_eq!(reduce(&pool, &xs, |a, b| a + b).unwrap(), 42);
    }

    #[test]
    fn work_unit_not_evenly_dividing_length() {
        let pool = TaskPool::with_threads(3);
        let xs: Vec<i32> = (1..=37).collect();
        assert_eq!(reduce(&pool, &xs, |a, b| a + b).unwrap(), (1..=37).sum());
    }
}
