//! Decodes raw matrix partitions into typed cells.
//!
//! A partition is one input file named `<prefix>_<rows>_<cols>.<ext>`. The
//! prefix tells which operand the file holds and the two numbers give that
//! operand's shape. Lines are comma separated integers in one of three
//! layouts:
//!
//! ```text
//! row,col,value          role taken from the partition prefix
//! tag,row,col,value      tag is A/left or B/right
//! index,value            single-column right operand (a vector)
//! ```

use std::fmt;
use std::path::Path;

use crate::error::MatrixError;

/// Which side of the product a cell belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandTag {
    Left,
    Right,
}

impl OperandTag {
    /// Decodes the per-record tag column.
    pub fn from_record_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "a" | "left" => Some(OperandTag::Left),
            "b" | "right" => Some(OperandTag::Right),
            _ => None,
        }
    }

    /// Decodes the role encoded in a partition name prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "a" | "left" | "m" | "matrix" => Some(OperandTag::Left),
            "b" | "right" | "v" | "vec" | "vector" => Some(OperandTag::Right),
            _ => None,
        }
    }

    /// Single letter used in the intermediate encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperandTag::Left => "A",
            OperandTag::Right => "B",
        }
    }
}

impl fmt::Display for OperandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One non-zero (or explicitly stored) entry of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub tag: OperandTag,
    pub row: usize,
    pub col: usize,
    pub value: i64,
}

/// Static facts about a partition, derived once from its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    /// File name of the partition, used in error reports.
    pub name: String,
    pub prefix: String,
    /// Operand role from the prefix, if the prefix is a known one.
    pub role: Option<OperandTag>,
    pub rows: usize,
    pub cols: usize,
}

impl PartitionMeta {
    /// Derives the metadata from the last path component of `path`.
    pub fn from_path(path: &str) -> Result<Self, MatrixError> {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MatrixError::dimension(path, "path has no file name"))?;
        Self::from_name(name)
    }

    /// Derives the metadata from a bare partition name like `A_2_3.txt`.
    pub fn from_name(name: &str) -> Result<Self, MatrixError> {
        let stem = match name.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => name,
        };
        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() < 3 {
            return Err(MatrixError::dimension(
                name,
                "expected `<prefix>_<rows>_<cols>`",
            ));
        }
        let n = fields.len();
        let rows = parse_dimension(name, "rows", fields[n - 2])?;
        let cols = parse_dimension(name, "cols", fields[n - 1])?;
        let prefix = fields[..n - 2].join("_");

        Ok(PartitionMeta {
            name: name.to_string(),
            role: OperandTag::from_prefix(&prefix),
            prefix,
            rows,
            cols,
        })
    }

    /// Whether this partition holds a vector, i.e. a single-column right operand.
    pub fn is_vector(&self) -> bool {
        self.role == Some(OperandTag::Right) && self.cols == 1
    }

    /// Checks that a cell fits the declared shape of this partition.
    pub fn check_bounds(&self, cell: &Cell) -> Result<(), MatrixError> {
        if cell.row >= self.rows || cell.col >= self.cols {
            return Err(MatrixError::dimension(
                &self.name,
                format!(
                    "cell ({}, {}) outside the declared {}x{} shape",
                    cell.row, cell.col, self.rows, self.cols
                ),
            ));
        }
        Ok(())
    }
}

fn parse_dimension(name: &str, what: &str, field: &str) -> Result<usize, MatrixError> {
    match field.parse::<usize>() {
        Ok(0) => Err(MatrixError::dimension(name, format!("{what} must be positive"))),
        Ok(n) => Ok(n),
        Err(_) => Err(MatrixError::dimension(
            name,
            format!("{what} `{field}` is not a number"),
        )),
    }
}

/// Cells decoded from one partition, with the records that were dropped.
#[derive(Debug, Default)]
pub struct ParsedPartition {
    pub cells: Vec<Cell>,
    /// Malformed records, each already tagged with its 1-based line number.
    pub rejected: Vec<MatrixError>,
}

/// Decodes one line. Returns `Ok(None)` for blank lines and `#` comments.
///
/// `line_no` is 1-based and only used for error reports.
pub fn parse_line(
    line: &str,
    line_no: usize,
    meta: &PartitionMeta,
) -> Result<Option<Cell>, MatrixError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    let (tag, row, col, value) = match fields.as_slice() {
        [row, col, value] => {
            let tag = meta.role.ok_or_else(|| {
                MatrixError::record(
                    line_no,
                    format!("untagged record in partition `{}` with unknown role", meta.name),
                )
            })?;
            (tag, *row, *col, *value)
        }
        [tag, row, col, value] => {
            let tag = OperandTag::from_record_tag(tag).ok_or_else(|| {
                MatrixError::record(line_no, format!("unknown matrix tag `{tag}`"))
            })?;
            if let Some(role) = meta.role {
                if role != tag {
                    return Err(MatrixError::record(
                        line_no,
                        format!("record tagged {tag} in a {role} partition"),
                    ));
                }
            }
            (tag, *row, *col, *value)
        }
        [index, value] if meta.is_vector() => (OperandTag::Right, *index, "0", *value),
        _ => {
            return Err(MatrixError::record(
                line_no,
                format!("unexpected field count {}", fields.len()),
            ))
        }
    };

    Ok(Some(Cell {
        tag,
        row: parse_index(line_no, meta, "row", row)?,
        col: parse_index(line_no, meta, "col", col)?,
        value: value.parse().map_err(|_| {
            MatrixError::record(line_no, format!("value `{value}` is not an integer"))
        })?,
    }))
}

/// A negative index cannot belong to any shape, so it fails the partition
/// rather than the record.
fn parse_index(
    line_no: usize,
    meta: &PartitionMeta,
    what: &str,
    field: &str,
) -> Result<usize, MatrixError> {
    let index: i64 = field.parse().map_err(|_| {
        MatrixError::record(line_no, format!("{what} `{field}` is not an integer"))
    })?;
    usize::try_from(index).map_err(|_| {
        MatrixError::dimension(
            &meta.name,
            format!("negative {what} {index} on line {line_no}"),
        )
    })
}

/// Decodes a whole partition.
///
/// Malformed records are collected and skipped. A negative index, or a cell
/// outside the declared shape of a partition holding one operand, fails the
/// entire partition. A partition of tagged records from both operands
/// declares the product's shape instead, so its cells are bounded later
/// against the operand they belong to.
pub fn parse_partition(
    meta: &PartitionMeta,
    content: &str,
) -> Result<ParsedPartition, MatrixError> {
    let mut parsed = ParsedPartition::default();
    for (i, line) in content.lines().enumerate() {
        match parse_line(line, i + 1, meta) {
            Ok(Some(cell)) => {
                if meta.role.is_some() {
                    meta.check_bounds(&cell)?;
                }
                parsed.cells.push(cell);
            }
            Ok(None) => {}
            Err(e) if e.is_fatal_for_partition() => return Err(e),
            Err(e) => parsed.rejected.push(e),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> PartitionMeta {
        PartitionMeta::from_name(name).unwrap()
    }

    #[test]
    fn partition_name_gives_shape_and_role() {
        let m = meta("A_2_3.txt");
        assert_eq!(m.prefix, "A");
        assert_eq!(m.role, Some(OperandTag::Left));
        assert_eq!((m.rows, m.cols), (2, 3));

        let m = PartitionMeta::from_path("/data/in/right_3_4.csv").unwrap();
        assert_eq!(m.name, "right_3_4.csv");
        assert_eq!(m.role, Some(OperandTag::Right));
        assert_eq!((m.rows, m.cols), (3, 4));

        let m = meta("my_matrix_5_5");
        assert_eq!(m.prefix, "my_matrix");
        assert_eq!(m.role, None);
    }

    #[test]
    fn bad_partition_names_are_dimension_errors() {
        for name in ["A.txt", "A_2.txt", "A_x_2.txt", "A_2_0.txt", "A_-1_2.txt"] {
            let err = PartitionMeta::from_name(name).unwrap_err();
            assert!(err.is_fatal_for_partition(), "{name}: {err}");
        }
    }

    #[test]
    fn three_field_record_uses_partition_role() {
        let m = meta("left_2_2.txt");
        let cell = parse_line("1, 0, -4", 1, &m).unwrap().unwrap();
        assert_eq!(
            cell,
            Cell {
                tag: OperandTag::Left,
                row: 1,
                col: 0,
                value: -4
            }
        );
    }

    #[test]
    fn four_field_record_carries_its_tag() {
        let m = meta("input_2_2.txt");
        let cell = parse_line("B,0,1,6", 1, &m).unwrap().unwrap();
        assert_eq!(cell.tag, OperandTag::Right);
        assert_eq!((cell.row, cell.col, cell.value), (0, 1, 6));

        // tag contradicting the partition role is rejected
        let m = meta("A_2_2.txt");
        assert!(matches!(
            parse_line("B,0,1,6", 3, &m),
            Err(MatrixError::MalformedRecord { line: 3, .. })
        ));
    }

    #[test]
    fn untagged_record_needs_a_known_role() {
        let m = meta("input_2_2.txt");
        assert!(parse_line("0,0,1", 1, &m).is_err());
    }

    #[test]
    fn vector_records_accept_two_fields() {
        let m = meta("v_2_1.txt");
        let cell = parse_line("1,9", 1, &m).unwrap().unwrap();
        assert_eq!(
            cell,
            Cell {
                tag: OperandTag::Right,
                row: 1,
                col: 0,
                value: 9
            }
        );
        // two fields are not a valid matrix record
        assert!(parse_line("1,9", 1, &meta("A_2_2.txt")).is_err());
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let m = meta("A_2_2.txt");
        assert_eq!(parse_line("   ", 1, &m).unwrap(), None);
        assert_eq!(parse_line("# header", 2, &m).unwrap(), None);
    }

    #[test]
    fn malformed_line_is_dropped_and_reported() {
        let m = meta("A_2_2.txt");
        let parsed = parse_partition(&m, "0,0,1\nabc,def,ghi\n1,1,2\n").unwrap();
        assert_eq!(parsed.cells.len(), 2);
        assert_eq!(parsed.rejected.len(), 1);
        assert!(matches!(
            parsed.rejected[0],
            MatrixError::MalformedRecord { line: 2, .. }
        ));
    }

    #[test]
    fn out_of_shape_cell_fails_the_partition() {
        let m = meta("A_2_2.txt");
        let err = parse_partition(&m, "0,0,1\n2,0,5\n").unwrap_err();
        assert!(err.is_fatal_for_partition());
    }

    #[test]
    fn negative_index_fails_the_partition() {
        let m = meta("A_2_2.txt");
        let err = parse_partition(&m, "0,0,1\n-1,0,5\n").unwrap_err();
        assert!(matches!(err, MatrixError::DimensionMetadata { .. }));

        let err = parse_partition(&meta("input_2_2.txt"), "B,0,-3,5\n").unwrap_err();
        assert!(err.is_fatal_for_partition());

        // a non-numeric index is still only a bad record
        let parsed = parse_partition(&m, "x,0,5\n1,1,2\n").unwrap();
        assert_eq!(parsed.cells.len(), 1);
        assert_eq!(parsed.rejected.len(), 1);
    }

    #[test]
    fn tagged_partition_is_not_bounded_by_its_declared_shape() {
        // `input_1_1` declares a 1x1 product; the contraction index 2 is
        // checked later against the operand shapes
        let m = meta("input_1_1.txt");
        let parsed = parse_partition(&m, "A,0,2,3\nB,2,0,4\n").unwrap();
        assert_eq!(parsed.cells.len(), 2);
        assert!(parsed.rejected.is_empty());
    }
}
