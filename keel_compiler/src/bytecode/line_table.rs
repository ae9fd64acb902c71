//! Compressed mapping from bytecode offsets to source lines.
//!
//! The table is a first line number followed by `(byte delta, line delta)`
//! byte pairs. A pair is only recorded where the line strictly increases;
//! deltas larger than 127 are split across filler pairs, `(127, 0)` for
//! bytes and `(Δbyte, 127)` for lines.

/// Largest delta stored in a single pair.
const MAX_DELTA: u32 = 127;

/// An encoded line table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineTable {
    first_line: u32,
    table: Box<[u8]>,
}

/// One decoded row: code from `offset` onward belongs to `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    /// Starting byte offset.
    pub offset: u32,
    /// Source line.
    pub line: u32,
}

impl LineTable {
    /// Build a table from `(offset, line)` markers in code order.
    ///
    /// Markers that do not advance the line are ignored. With no markers the
    /// first line is 1.
    pub fn from_line_nos(markers: &[(u32, u32)]) -> Self {
        let mut iter = markers.iter().copied();
        let Some((_, first_line)) = iter.next() else {
            return Self {
                first_line: 1,
                table: Box::default(),
            };
        };

        let mut table = Vec::new();
        let (mut byte, mut line) = (0u32, first_line);
        for (next_byte, next_line) in iter {
            if next_line <= line {
                continue;
            }
            while byte + MAX_DELTA < next_byte {
                table.extend_from_slice(&[MAX_DELTA as u8, 0]);
                byte += MAX_DELTA;
            }
            while line + MAX_DELTA < next_line {
                table.extend_from_slice(&[(next_byte - byte) as u8, MAX_DELTA as u8]);
                byte = next_byte;
                line += MAX_DELTA;
            }
            if (byte, line) != (next_byte, next_line) {
                table.extend_from_slice(&[(next_byte - byte) as u8, (next_line - line) as u8]);
                byte = next_byte;
                line = next_line;
            }
        }

        Self {
            first_line,
            table: table.into_boxed_slice(),
        }
    }

    /// Line of the first marker (1 when there were none).
    #[inline]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Encoded delta pairs.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.table
    }

    /// Decode into rows, one per distinct starting offset.
    pub fn entries(&self) -> Vec<LineTableEntry> {
        let mut rows = vec![LineTableEntry {
            offset: 0,
            line: self.first_line,
        }];
        let (mut offset, mut line) = (0u32, self.first_line);
        for pair in self.table.chunks_exact(2) {
            offset += u32::from(pair[0]);
            line += u32::from(pair[1]);
            if pair[1] == 0 {
                continue;
            }
            match rows.last_mut() {
                Some(last) if last.offset == offset => last.line = line,
                _ => rows.push(LineTableEntry { offset, line }),
            }
        }
        rows
    }

    /// Source line for the instruction at `offset`.
    pub fn line_for_offset(&self, offset: u32) -> u32 {
        let (mut addr, mut line) = (0u32, self.first_line);
        for pair in self.table.chunks_exact(2) {
            addr += u32::from(pair[0]);
            if addr > offset {
                break;
            }
            line += u32::from(pair[1]);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_defaults_to_line_one() {
        let table = LineTable::from_line_nos(&[]);
        assert_eq!(table.first_line(), 1);
        assert!(table.as_bytes().is_empty());
    }

    #[test]
    fn test_repeated_line_is_skipped() {
        let table = LineTable::from_line_nos(&[(0, 10), (4, 10), (8, 12)]);
        assert_eq!(table.first_line(), 10);
        assert_eq!(table.as_bytes(), &[8, 2]);
    }

    #[test]
    fn test_backward_line_is_skipped() {
        let table = LineTable::from_line_nos(&[(0, 5), (4, 3), (8, 6)]);
        assert_eq!(table.as_bytes(), &[8, 1]);
    }

    #[test]
    fn test_large_byte_delta_uses_fillers() {
        let table = LineTable::from_line_nos(&[(0, 1), (300, 2)]);
        assert_eq!(table.as_bytes(), &[127, 0, 127, 0, 46, 1]);
        assert_eq!(table.line_for_offset(296), 1);
        assert_eq!(table.line_for_offset(300), 2);
    }

    #[test]
    fn test_large_line_delta_uses_fillers() {
        let table = LineTable::from_line_nos(&[(0, 1), (8, 300)]);
        assert_eq!(table.as_bytes(), &[8, 127, 0, 127, 0, 45]);
        assert_eq!(
            table.entries(),
            vec![
                LineTableEntry { offset: 0, line: 1 },
                LineTableEntry {
                    offset: 8,
                    line: 300
                },
            ]
        );
    }

    #[test]
    fn test_line_for_offset() {
        let table = LineTable::from_line_nos(&[(0, 1), (8, 2), (16, 4)]);
        assert_eq!(table.line_for_offset(0), 1);
        assert_eq!(table.line_for_offset(4), 1);
        assert_eq!(table.line_for_offset(8), 2);
        assert_eq!(table.line_for_offset(20), 4);
    }

    #[test]
    fn test_first_marker_not_at_zero() {
        let table = LineTable::from_line_nos(&[(4, 7), (8, 8)]);
        assert_eq!(table.first_line(), 7);
        assert_eq!(table.as_bytes(), &[8, 1]);
    }
}
