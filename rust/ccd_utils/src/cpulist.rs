// SPDX-License-Identifier: GPL-2.0

//! CPU-list strings as used by sysfs `shared_cpu_list`, `Cpus_allowed_list`
//! and the cgroup `AllowedCPUs` property: comma-separated single CPUs and
//! inclusive `lo-hi` ranges.

use crate::error::{Error, Result};

/// Parse a CPU-list string into a sorted, deduplicated set of CPU ids.
pub fn parse(list: &str) -> Result<Vec<usize>> {
    if list
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err(Error::invalid_cpu_list(list, "invalid character"));
    }

    let mut cpus = Vec::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::invalid_cpu_list(list, format!("bad range start {start_str:?}")))?;
            let end = end_str
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::invalid_cpu_list(list, format!("bad range end {end_str:?}")))?;
            if start > end {
                return Err(Error::invalid_cpu_list(list, format!("inverted range {start}-{end}")));
            }
            cpus.extend(start..=end);
        } else {
            let cpu = token
                .parse::<usize>()
                .map_err(|_| Error::invalid_cpu_list(list, format!("bad CPU {token:?}")))?;
            cpus.push(cpu);
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Emit the canonical string form: strictly increasing, runs of two or more
/// consecutive CPUs as `lo-hi`, singletons bare.
pub fn format(cpus: &[usize]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < cpus.len() {
        let lo = cpus[i];
        let mut hi = lo;
        while i + 1 < cpus.len() && cpus[i + 1] == hi + 1 {
            i += 1;
            hi = cpus[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if hi > lo {
            out.push_str(&format!("{lo}-{hi}"));
        } else {
            out.push_str(&format!("{lo}"));
        }
        i += 1;
    }
    out
}

/// Canonicalize a CPU-list string. Empty input yields the empty string.
pub fn canonicalize(list: &str) -> Result<String> {
    Ok(format(&parse(list)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_cpu() {
        assert_eq!(parse("3").unwrap(), vec![3]);
    }

    #[test]
    fn parses_ranges_and_singles() {
        assert_eq!(parse("0-2,5").unwrap(), vec![0, 1, 2, 5]);
        assert_eq!(parse(" 8 , 10-11 ").unwrap(), vec![8, 10, 11]);
    }

    #[test]
    fn dedups_overlapping_tokens() {
        assert_eq!(parse("10-11,0-3,2,8").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("0-2,a").is_err());
        assert!(parse("5-3").is_err());
        assert!(parse("-3").is_err());
        assert!(parse("1--2").is_err());
    }

    #[test]
    fn empty_is_empty() {
        assert_eq!(parse("").unwrap(), Vec::<usize>::new());
        assert_eq!(canonicalize("").unwrap(), "");
        assert_eq!(canonicalize(" , ").unwrap(), "");
    }

    #[test]
    fn canonical_form() {
        assert_eq!(canonicalize("10-11,0-3,2,8").unwrap(), "0-3,8,10-11");
        assert_eq!(canonicalize("0,1").unwrap(), "0-1");
        assert_eq!(canonicalize("7").unwrap(), "7");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for s in ["10-11,0-3,2,8", "0-15", "1,3,5,7", ""] {
            let once = canonicalize(s).unwrap();
            assert_eq!(canonicalize(&once).unwrap(), once);
            assert_eq!(parse(&once).unwrap(), parse(s).unwrap());
        }
    }
}
