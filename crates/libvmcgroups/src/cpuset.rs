//! Conversion between the kernel range-list format (`0-2,4`) and sorted cpu lists.
use fixedbitset::FixedBitSet;

/// Highest cpu index accepted when parsing a cpu list, exclusive
pub const MAX_CPUS: usize = 5000;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseCpuSetError {
    #[error("invalid index {index}: {err}")]
    InvalidIndex {
        err: std::num::ParseIntError,
        index: String,
    },
    #[error("invalid cpu range {0}")]
    InvalidRange(String),
    #[error("cpu {cpu} exceeds the maximum of {max} cpus")]
    TooLarge { cpu: usize, max: usize },
}

fn parse_index(index: &str) -> Result<usize, ParseCpuSetError> {
    let cpu: usize = index.parse().map_err(|err| ParseCpuSetError::InvalidIndex {
        err,
        index: index.into(),
    })?;
    if cpu >= MAX_CPUS {
        return Err(ParseCpuSetError::TooLarge { cpu, max: MAX_CPUS });
    }

    Ok(cpu)
}

/// Parses a range list into a strictly increasing list of cpus. An empty
/// line is an empty set.
pub fn parse_cpu_set(line: &str) -> Result<Vec<usize>, ParseCpuSetError> {
    let mut bitset = FixedBitSet::with_capacity(8);

    for cpu_set in line.trim().split_terminator(',') {
        let cpu_set = cpu_set.trim();
        if cpu_set.is_empty() {
            continue;
        }

        let cpus: Vec<&str> = cpu_set.split('-').map(|s| s.trim()).collect();
        match cpus.as_slice() {
            [single] => {
                let cpu_index = parse_index(single)?;
                if cpu_index >= bitset.len() {
                    bitset.grow(cpu_index + 1);
                }
                bitset.insert(cpu_index);
            }
            [start, end] => {
                let start_index = parse_index(start)?;
                let end_index = parse_index(end)?;
                if start_index > end_index {
                    return Err(ParseCpuSetError::InvalidRange(cpu_set.into()));
                }

                if end_index >= bitset.len() {
                    bitset.grow(end_index + 1);
                }
                bitset.set_range(start_index..end_index + 1, true);
            }
            _ => return Err(ParseCpuSetError::InvalidRange(cpu_set.into())),
        }
    }

    Ok(bitset.ones().collect())
}

/// Formats cpus as a range list, collapsing runs of consecutive cpus.
/// Duplicates and ordering of the input do not matter.
pub fn format_cpu_set(cpus: &[usize]) -> String {
    let mut bitset = FixedBitSet::with_capacity(cpus.iter().max().map_or(0, |max| max + 1));
    for cpu in cpus {
        bitset.insert(*cpu);
    }

    let mut ranges: Vec<String> = Vec::new();
    let mut ones = bitset.ones().peekable();
    while let Some(start) = ones.next() {
        let mut end = start;
        while ones.peek() == Some(&(end + 1)) {
            end += 1;
            ones.next();
        }

        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{end}"));
        }
    }

    ranges.join(",")
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result};

    use super::*;

    #[test]
    fn parse_single_value() -> Result<()> {
        assert_eq!(parse_cpu_set("3").context("parse")?, vec![3]);
        Ok(())
    }

    #[test]
    fn parse_mixed() -> Result<()> {
        let cpus = parse_cpu_set("0,2-4,7,9-10").context("parse")?;
        assert_eq!(cpus, vec![0, 2, 3, 4, 7, 9, 10]);
        Ok(())
    }

    #[test]
    fn parse_kernel_file_content() -> Result<()> {
        let cpus = parse_cpu_set("0-1,6\n").context("parse")?;
        assert_eq!(cpus, vec![0, 1, 6]);
        Ok(())
    }

    #[test]
    fn parse_extra_characters() -> Result<()> {
        let cpus = parse_cpu_set("0, 2- 4,,7   ,,9-10").context("parse")?;
        assert_eq!(cpus, vec![0, 2, 3, 4, 7, 9, 10]);
        Ok(())
    }

    #[test]
    fn parse_empty() -> Result<()> {
        assert!(parse_cpu_set("").context("parse")?.is_empty());
        assert!(parse_cpu_set("\n").context("parse")?.is_empty());
        Ok(())
    }

    #[test]
    fn parse_interchanged_range() {
        assert_eq!(
            parse_cpu_set("2-0"),
            Err(ParseCpuSetError::InvalidRange("2-0".to_owned()))
        );
    }

    #[test]
    fn parse_incomplete_range() {
        for c in ["2-", "-2", "1-2-3", "a"] {
            assert!(parse_cpu_set(c).is_err(), "{c} should not parse");
        }
    }

    #[test]
    fn parse_too_large() {
        assert_eq!(
            parse_cpu_set("4998-5000"),
            Err(ParseCpuSetError::TooLarge {
                cpu: 5000,
                max: MAX_CPUS
            })
        );
    }

    #[test]
    fn format_disjoint() {
        assert_eq!(format_cpu_set(&[2, 5, 7]), "2,5,7");
    }

    #[test]
    fn format_collapses_runs() {
        assert_eq!(format_cpu_set(&[0, 1, 2, 4]), "0-2,4");
        assert_eq!(format_cpu_set(&[4, 3, 3, 9, 10, 11]), "3-4,9-11");
    }

    #[test]
    fn format_empty() {
        assert_eq!(format_cpu_set(&[]), "");
    }

    quickcheck! {
        fn prop_format_then_parse_is_sorted_dedup(cpus: Vec<u16>) -> bool {
            let cpus: Vec<usize> = cpus.into_iter().map(|c| c as usize % MAX_CPUS).collect();
            let mut expected = cpus.clone();
            expected.sort_unstable();
            expected.dedup();

            parse_cpu_set(&format_cpu_set(&cpus)) == Ok(expected)
        }
    }
}
