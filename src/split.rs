/*!
Even partitioning of host arrays.

`total` elements are divided into `parts` contiguous ranges. The first
`total % parts` ranges get one extra element.

```
# use cuplex::split::partition;
assert_eq!(partition(5, 2), [0..3, 3..5]);
assert_eq!(partition(2, 3), [0..1, 1..2, 2..2]);
```
*/

use std::ops::Range;

/** Divides `0..total` into `parts` ranges.

The ranges are contiguous and in order, and their lengths differ by at most one.
Returns no ranges if `parts` is 0. */
pub fn partition(total: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let remainder = total % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < remainder);
            let range = start..start + len;
            start = range.end;
            range
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn partition_5_2() {
        assert_eq!(partition(5, 2), [0..3, 3..5]);
    }

    #[test]
    fn partition_fewer_elements_than_parts() {
        assert_eq!(partition(0, 2), [0..0, 0..0]);
        assert_eq!(partition(3, 5), [0..1, 1..2, 2..3, 3..3, 3..3]);
    }

    #[test]
    fn partition_no_parts() {
        assert!(partition(10, 0).is_empty());
    }

    proptest! {
        #[test]
        fn partition_is_even_and_exact(total in 0..100_000usize, parts in 1..64usize) {
            let ranges = partition(total, parts);
            prop_assert_eq!(ranges.len(), parts);
            prop_assert_eq!(ranges.first().map(|x| x.start), Some(0));
            prop_assert_eq!(ranges.last().map(|x| x.end), Some(total));
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            let (floor, ceil) = (total / parts, (total + parts - 1) / parts);
            for (i, range) in ranges.iter().enumerate() {
                let len = range.len();
                prop_assert!(len == floor || len == ceil);
                prop_assert_eq!(len == floor + 1, i < total % parts);
            }
            prop_assert_eq!(ranges.iter().map(|x| x.len()).sum::<usize>(), total);
        }
    }
}
