// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small rendering helpers for error and log messages.

/// Render a list of numbers as a compact range string, e.g.
/// `[0, 1, 2, 5, 7, 8]` becomes `"0-2,5,7-8"`. The input does not have to
/// be sorted.
pub fn rangify(nums: &[u32]) -> String {
    if nums.is_empty() {
        return String::new();
    }

    let mut sorted: Vec<u32> = nums.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut start = sorted[0];
    let mut end = sorted[0];

    for &num in &sorted[1..] {
        if num == end + 1 {
            end = num;
            continue;
        }
        parts.push(range_str(start, end));
        start = num;
        end = num;
    }
    parts.push(range_str(start, end));

    parts.join(",")
}

fn range_str(start: u32, end: u32) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}

/// Render a frequency in Hz with an SI prefix, e.g. `2500000000` becomes
/// `"2.5GHz"`. Exact multiples print without a fractional part.
pub fn hertz(freq: u64) -> String {
    const UNITS: [(u64, &str); 3] = [
        (1_000_000_000, "GHz"),
        (1_000_000, "MHz"),
        (1_000, "kHz"),
    ];

    for (scale, unit) in UNITS {
        if freq >= scale {
            if freq % scale == 0 {
                return format!("{}{unit}", freq / scale);
            }
            let value = freq as f64 / scale as f64;
            let mut num = format!("{value:.4}");
            while num.ends_with('0') {
                num.pop();
            }
            if num.ends_with('.') {
                num.pop();
            }
            return format!("{num}{unit}");
        }
    }
    format!("{freq}Hz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rangify_basic() {
        assert_eq!(rangify(&[0, 1, 2, 5, 7, 8]), "0-2,5,7-8");
        assert_eq!(rangify(&[4]), "4");
        assert_eq!(rangify(&[]), "");
        assert_eq!(rangify(&[3, 1, 2]), "1-3");
    }

    #[test]
    fn hertz_rendering() {
        assert_eq!(hertz(2_500_000_000), "2.5GHz");
        assert_eq!(hertz(800_000_000), "800MHz");
        assert_eq!(hertz(100_000_000), "100MHz");
        assert_eq!(hertz(999), "999Hz");
        assert_eq!(hertz(1_200_000), "1.2MHz");
    }
}
