//! Parallel processing utilities.

use rayon::prelude::*;

/// Multiplier for number of chunks relative to CPU threads.
/// Using 3x threads provides good load balancing when some chunks finish faster.
const CHUNKS_PER_THREAD: usize = 3;

/// Compute optimal chunk size for the given length.
#[inline]
fn auto_chunk_size(len: usize) -> usize {
    let num_chunks = rayon::current_num_threads() * CHUNKS_PER_THREAD;
    (len / num_chunks).max(1)
}

/// Consume `items` on the rayon pool, processing chunks of an automatically
/// chosen size.
pub fn par_for_each<T, F>(items: Vec<T>, f: F)
where
    T: Send,
    F: Fn(T) + Send + Sync,
{
    let chunk_size = auto_chunk_size(items.len());
    items
        .into_par_iter()
        .with_min_len(chunk_size)
        .for_each(f);
}

/// Map `items` on the rayon pool, preserving order.
pub fn par_map<T, R, F>(items: Vec<T>, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    let chunk_size = auto_chunk_size(items.len());
    items
        .into_par_iter()
        .with_min_len(chunk_size)
        .map(f)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn par_map_preserves_order() {
        let items: Vec<usize> = (0..1000).collect();
        let doubled = par_map(items, |v| v * 2);
        assert!(doubled.iter().enumerate().all(|(idx, v)| *v == idx * 2));
    }

    #[test]
    fn par_for_each_visits_all() {
        let counter = AtomicUsize::new(0);
        par_for_each((0..257).collect::<Vec<usize>>(), |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 257);
    }
}
