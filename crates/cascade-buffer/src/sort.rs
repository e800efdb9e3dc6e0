//! Iterative three-median quicksort on the hash column.
//!
//! The record column is carried through every swap so both columns stay
//! aligned. Small segments fall back to insertion sort; pending segments
//! live on an explicit stack that starts at 128 frames and grows on
//! demand (larger segments are deferred, smaller ones processed first,
//! which keeps the live depth logarithmic).

use cascade_common::Record;

const INSERTION_CUTOFF: usize = 7;
const INITIAL_STACK_FRAMES: usize = 128;

#[inline(always)]
fn swap_pair(hashes: &mut [u32], records: &mut [Record], a: usize, b: usize) {
    hashes.swap(a, b);
    records.swap(a, b);
}

fn insertion_sort(hashes: &mut [u32], records: &mut [Record], left: usize, right: usize) {
    for j in (left + 1)..=right {
        let hash = hashes[j];
        let record = records[j];
        let mut i = j;
        while i > left && hashes[i - 1] > hash {
            hashes[i] = hashes[i - 1];
            records[i] = records[i - 1];
            i -= 1;
        }
        hashes[i] = hash;
        records[i] = record;
    }
}

/// Sorts both columns by hash. Not stable; total on the hash values.
pub(crate) fn sort_by_hash(hashes: &mut [u32], records: &mut [Record]) {
    debug_assert_eq!(hashes.len(), records.len());
    let n = hashes.len();
    if n < 2 {
        return;
    }

    let mut stack: Vec<(usize, usize)> = Vec::with_capacity(INITIAL_STACK_FRAMES);
    let mut left = 0usize;
    let mut right = n - 1;

    loop {
        if right - left <= INSERTION_CUTOFF {
            insertion_sort(hashes, records, left, right);
            match stack.pop() {
                Some((l, r)) => {
                    left = l;
                    right = r;
                    continue;
                }
                None => break,
            }
        }

        // Median-of-three: stash the middle element at left+1, then order
        // left, left+1, right. The ends become scan sentinels.
        let median = left + (right - left) / 2;
        swap_pair(hashes, records, median, left + 1);
        if hashes[left] > hashes[right] {
            swap_pair(hashes, records, left, right);
        }
        if hashes[left + 1] > hashes[right] {
            swap_pair(hashes, records, left + 1, right);
        }
        if hashes[left] > hashes[left + 1] {
            swap_pair(hashes, records, left, left + 1);
        }

        let pivot = hashes[left + 1];
        let mut i = left + 1;
        let mut j = right;
        loop {
            i += 1;
            while hashes[i] < pivot {
                i += 1;
            }
            j -= 1;
            while hashes[j] > pivot {
                j -= 1;
            }
            if j < i {
                break;
            }
            swap_pair(hashes, records, i, j);
        }
        // Move the pivot into its final slot.
        swap_pair(hashes, records, left + 1, j);

        // Defer the larger segment, iterate the smaller.
        let right_len = right - i + 1;
        let left_len = j - left;
        if right_len >= left_len {
            stack.push((i, right));
            if j > left {
                right = j - 1;
            } else {
                // Left segment empty; pull the deferred one back.
                let (l, r) = stack.pop().expect("segment just pushed");
                left = l;
                right = r;
            }
        } else {
            if j > left {
                stack.push((left, j - 1));
            }
            left = i;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn make_columns(hashes: &[u32]) -> (Vec<u32>, Vec<Record>) {
        let records: Vec<Record> = hashes
            .iter()
            .enumerate()
            .map(|(i, &h)| Record::new(h, format!("k{i}").as_bytes(), i as u64))
            .collect();
        (hashes.to_vec(), records)
    }

    fn check_sorted(hashes: &[u32], records: &[Record]) {
        for i in 1..hashes.len() {
            assert!(hashes[i - 1] <= hashes[i], "hash order broken at {i}");
        }
        for i in 0..hashes.len() {
            assert_eq!(
                hashes[i], records[i].hash,
                "record column desynced at {i}"
            );
        }
    }

    #[test]
    fn test_sort_empty_and_single() {
        let (mut h, mut r) = make_columns(&[]);
        sort_by_hash(&mut h, &mut r);
        assert!(h.is_empty());

        let (mut h, mut r) = make_columns(&[42]);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, vec![42]);
    }

    #[test]
    fn test_sort_two() {
        let (mut h, mut r) = make_columns(&[9, 3]);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, vec![3, 9]);
        check_sorted(&h, &r);
    }

    #[test]
    fn test_sort_small_reverse() {
        let input: Vec<u32> = (0..8).rev().collect();
        let (mut h, mut r) = make_columns(&input);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, (0..8).collect::<Vec<u32>>());
        check_sorted(&h, &r);
    }

    #[test]
    fn test_sort_just_past_cutoff() {
        let input: Vec<u32> = (0..9).rev().collect();
        let (mut h, mut r) = make_columns(&input);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, (0..9).collect::<Vec<u32>>());
        check_sorted(&h, &r);
    }

    #[test]
    fn test_sort_already_sorted() {
        let input: Vec<u32> = (0..1000).collect();
        let (mut h, mut r) = make_columns(&input);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, input);
        check_sorted(&h, &r);
    }

    #[test]
    fn test_sort_reverse() {
        let input: Vec<u32> = (0..1000).rev().collect();
        let (mut h, mut r) = make_columns(&input);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, (0..1000).collect::<Vec<u32>>());
        check_sorted(&h, &r);
    }

    #[test]
    fn test_sort_all_equal() {
        let input = vec![7u32; 500];
        let (mut h, mut r) = make_columns(&input);
        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, input);
        check_sorted(&h, &r);
    }

    #[test]
    fn test_sort_random_against_oracle() {
        let mut rng = rand::thread_rng();
        for &size in &[10usize, 100, 1_000, 10_000] {
            let input: Vec<u32> = (0..size).map(|_| rng.gen::<u32>() % 1000).collect();
            let (mut h, mut r) = make_columns(&input);

            let mut oracle = input.clone();
            oracle.sort_unstable();

            sort_by_hash(&mut h, &mut r);
            assert_eq!(h, oracle);
            check_sorted(&h, &r);
        }
    }

    #[test]
    fn test_sort_organ_pipe() {
        let mut input: Vec<u32> = (0..500).collect();
        input.extend((0..500).rev());
        let (mut h, mut r) = make_columns(&input);

        let mut oracle = input.clone();
        oracle.sort_unstable();

        sort_by_hash(&mut h, &mut r);
        assert_eq!(h, oracle);
        check_sorted(&h, &r);
    }
}
