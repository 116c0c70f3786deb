//! Parse the tabular text printed by `show flow monitor <name> cache`.
//!
//! The cache table is column-aligned: columns are separated by runs of two
//! or more spaces, while single spaces occur inside labels such as
//! `IPV4 SRC ADDR`. Rows are borrowed from the command output; nothing is
//! copied until the normalizer coerces the cells.

use tracing::debug;

use crate::errors::ParseError;

/// Column labels that identify the header line.
pub const SRC_ADDR_COLUMN: &str = "IPV4 SRC ADDR";
pub const DST_ADDR_COLUMN: &str = "IPV4 DST ADDR";

/// One data line of the cache table, as `(column, cell)` pairs in source
/// column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTableRow<'a> {
    cells: Vec<(&'a str, &'a str)>,
}

impl<'a> RawTableRow<'a> {
    /// The cell under `column`, if the table has that column.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.cells
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, cell)| *cell)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.cells.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for RawTableRow<'a> {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

/// Lazy iterator over the data rows following the header.
///
/// Stops at the first blank line or end of input. Lines whose field count
/// differs from the header's are skipped and counted in [`malformed`].
///
/// [`malformed`]: CacheRows::malformed
pub struct CacheRows<'a> {
    columns: Vec<&'a str>,
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    header_line: usize,
    malformed: usize,
    finished: bool,
}

impl<'a> CacheRows<'a> {
    /// Header column names in source order.
    pub fn columns(&self) -> &[&'a str] {
        &self.columns
    }

    /// Number of data lines dropped so far for a field-count mismatch.
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

impl<'a> Iterator for CacheRows<'a> {
    type Item = RawTableRow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        for (idx, line) in self.lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            // The vendor underlines the header with a rule of `=` or `-`.
            if idx == self.header_line + 1 && is_rule_line(line) {
                continue;
            }
            let fields = split_columns(line);
            if fields.len() != self.columns.len() {
                debug!(
                    line = idx + 1,
                    expected = self.columns.len(),
                    found = fields.len(),
                    "Dropping malformed cache row"
                );
                self.malformed += 1;
                continue;
            }
            let cells = self.columns.iter().copied().zip(fields).collect();
            return Some(RawTableRow { cells });
        }
        self.finished = true;
        None
    }
}

/// Locate the cache table header in `output` and return an iterator over its
/// rows. `monitor` is only used to label the error.
pub fn parse_cache<'a>(output: &'a str, monitor: &str) -> Result<CacheRows<'a>, ParseError> {
    let mut lines = output.lines().enumerate();
    let (header_line, columns) = lines
        .by_ref()
        .find(|(_, line)| line.contains(SRC_ADDR_COLUMN) && line.contains(DST_ADDR_COLUMN))
        .map(|(idx, line)| (idx, split_columns(line)))
        .ok_or_else(|| ParseError::HeaderNotFound(monitor.to_string()))?;

    Ok(CacheRows {
        columns,
        lines,
        header_line,
        malformed: 0,
        finished: false,
    })
}

/// Split a line into fields on runs of two or more whitespace characters.
///
/// Leading and trailing whitespace is ignored; a single space is part of
/// the field.
pub fn split_columns(line: &str) -> Vec<&str> {
    let line = line.trim();
    let mut fields = Vec::new();
    if line.is_empty() {
        return fields;
    }

    let mut field_start = 0;
    let mut gap_start = 0;
    let mut gap_len = 0;
    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            if gap_len == 0 {
                gap_start = i;
            }
            gap_len += 1;
        } else {
            if gap_len >= 2 {
                fields.push(&line[field_start..gap_start]);
                field_start = i;
            }
            gap_len = 0;
        }
    }
    fields.push(&line[field_start..]);
    fields
}

fn is_rule_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c == '=' || c == '-' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "IPV4 SRC ADDR  IPV4 DST ADDR  TRNS SRC PORT  TRNS DST PORT  IP PROT  tcp flags  bytes long  pkts long";

    #[test]
    fn split_preserves_single_spaces() {
        assert_eq!(
            split_columns(HEADER),
            vec![
                "IPV4 SRC ADDR",
                "IPV4 DST ADDR",
                "TRNS SRC PORT",
                "TRNS DST PORT",
                "IP PROT",
                "tcp flags",
                "bytes long",
                "pkts long",
            ]
        );
    }

    #[test]
    fn split_handles_wide_gaps_tabs_and_padding() {
        assert_eq!(
            split_columns("   time first      time last\t\tAPP NAME   "),
            vec!["time first", "time last", "APP NAME"]
        );
        assert_eq!(split_columns("a b"), vec!["a b"]);
        assert_eq!(split_columns("a \tb"), vec!["a", "b"]);
        assert!(split_columns("   ").is_empty());
    }

    #[test]
    fn header_not_found() {
        let output = "Cache type:  Normal\nCache size:  4096\n";
        let err = parse_cache(output, "FLOW-MONITOR").err().unwrap();
        assert_eq!(err, ParseError::HeaderNotFound("FLOW-MONITOR".into()));
    }

    #[test]
    fn header_requires_both_address_labels() {
        let output = "IPV4 SRC ADDR  TRNS SRC PORT\n10.0.0.1  80\n";
        assert!(parse_cache(output, "m").is_err());
    }

    #[test]
    fn rows_follow_header_in_order() {
        let output = format!(
            "  Cache type:  Normal (Platform cache)\n\n{HEADER}\n\
             10.0.0.1  10.0.0.2  1234  80  6  0x18  1500  10\n\
             10.0.0.3  10.0.0.4  53  53000  17  0x00  120  1\n"
        );
        let rows: Vec<_> = parse_cache(&output, "m").unwrap().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("IPV4 SRC ADDR"), Some("10.0.0.1"));
        assert_eq!(rows[0].get("tcp flags"), Some("0x18"));
        assert_eq!(rows[1].get("IP PROT"), Some("17"));
        assert_eq!(rows[1].len(), 8);
        assert_eq!(rows[1].get("no such column"), None);
    }

    #[test]
    fn rule_line_under_header_is_skipped() {
        let output = "\
IPV4 SRC ADDR    IPV4 DST ADDR    bytes long
===============  ===============  ==========
10.0.0.1         10.0.0.2         1500
";
        let mut rows = parse_cache(output, "m").unwrap();
        let row = rows.next().unwrap();
        assert_eq!(row.get("bytes long"), Some("1500"));
        assert!(rows.next().is_none());
        assert_eq!(rows.malformed(), 0);
    }

    #[test]
    fn mismatched_rows_are_dropped_and_counted() {
        let output = format!(
            "{HEADER}\n\
             10.0.0.1  10.0.0.2  1234  80  6  0x18  1500  10\n\
             10.0.0.9  10.0.0.8  1234  80  6\n\
             10.0.0.3  10.0.0.4  1  2  6  0x02  60  1  extra\n\
             10.0.0.5  10.0.0.6  1  2  6  0x02  60  1\n"
        );
        let mut rows = parse_cache(&output, "m").unwrap();
        let kept: Vec<_> = rows.by_ref().map(|r| r.get("IPV4 SRC ADDR")).collect();
        assert_eq!(kept, vec![Some("10.0.0.1"), Some("10.0.0.5")]);
        assert_eq!(rows.malformed(), 2);
    }

    #[test]
    fn stops_at_first_blank_line() {
        let output = format!(
            "{HEADER}\n\
             10.0.0.1  10.0.0.2  1234  80  6  0x18  1500  10\n\
             \n\
             10.0.0.3  10.0.0.4  1234  80  6  0x18  1500  10\n"
        );
        let mut rows = parse_cache(&output, "m").unwrap();
        assert_eq!(rows.by_ref().count(), 1);
        assert!(rows.next().is_none());
    }

    #[test]
    fn header_only_yields_no_rows() {
        let rows = parse_cache(HEADER, "m").unwrap();
        assert_eq!(rows.columns().len(), 8);
        assert_eq!(rows.count(), 0);
    }
}
