//! A MapReduce-compatible implementation of sparse matrix multiplication.
//!
//! For an `M x N` left operand `A` and an `N x P` right operand `B`, every
//! left cell `A(i, k)` is replicated under the `P` output keys `(i, 0..P)`
//! and every right cell `B(k, j)` under the `M` output keys `(0..M, j)`,
//! each copy carrying its contraction index `k`. After the shuffle every
//! output key holds exactly the contributions it needs, and the join in
//! [`super::join`] pairs them up on `k`.
//!
//! Matrix-vector multiplication is the same computation with `P = 1`; only
//! the rendering of output keys differs.

use std::fmt;

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use clap::{Parser, ValueEnum};
use log::{debug, warn};

use super::record::{parse_partition, Cell, OperandTag, PartitionMeta};
use crate::error::MatrixError;
use crate::utils::string_from_bytes;
use crate::*;

/// Which product the job computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// `A (M x N) * B (N x P)`, output keys `row,col`.
    MatrixMatrix,
    /// `A (M x N) * v (N x 1)`, output keys `row`.
    MatrixVector,
}

impl Mode {
    /// Name of the registered workload computing this product.
    pub fn workload_name(&self) -> &'static str {
        match self {
            Mode::MatrixMatrix => "matmul",
            Mode::MatrixVector => "matvec",
        }
    }
}

/// Shape of the whole product: `rows x inner` times `inner x cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub rows: usize,
    pub inner: usize,
    pub cols: usize,
}

impl Shape {
    /// Declared shape of the given operand.
    pub fn operand(&self, tag: OperandTag) -> (usize, usize) {
        match tag {
            OperandTag::Left => (self.rows, self.inner),
            OperandTag::Right => (self.inner, self.cols),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} * {}x{}",
            self.rows, self.inner, self.inner, self.cols
        )
    }
}

/// Auxiliary arguments of the `matmul` and `matvec` workloads.
///
/// They travel through the engine as a JSON list of flags, e.g.
/// `["--rows", "2", "--inner", "2", "--cols", "1"]`.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(no_binary_name = true)]
pub struct MatMulArgs {
    /// Rows of the left operand.
    #[clap(long, value_parser)]
    pub rows: usize,

    /// Shared contraction dimension.
    #[clap(long, value_parser)]
    pub inner: usize,

    /// Columns of the right operand.
    #[clap(long, value_parser)]
    pub cols: usize,

    /// Reject duplicate contributions instead of folding them.
    #[clap(long)]
    pub strict: bool,

    /// Partition names to read as left operand whatever their prefix says.
    #[clap(long = "left-partition")]
    pub left_partitions: Vec<String>,

    /// Partition names to read as right operand whatever their prefix says.
    #[clap(long = "right-partition")]
    pub right_partitions: Vec<String>,
}

impl MatMulArgs {
    pub fn new(shape: Shape, strict: bool) -> Self {
        MatMulArgs {
            rows: shape.rows,
            inner: shape.inner,
            cols: shape.cols,
            strict,
            left_partitions: Vec::new(),
            right_partitions: Vec::new(),
        }
    }

    /// Records the operand of a partition whose prefix does not name one.
    pub fn assign(&mut self, partition: impl Into<String>, tag: OperandTag) {
        match tag {
            OperandTag::Left => self.left_partitions.push(partition.into()),
            OperandTag::Right => self.right_partitions.push(partition.into()),
        }
    }

    /// Operand assigned to the partition named `name`, if any.
    pub fn assigned(&self, name: &str) -> Option<OperandTag> {
        if self.left_partitions.iter().any(|p| p == name) {
            Some(OperandTag::Left)
        } else if self.right_partitions.iter().any(|p| p == name) {
            Some(OperandTag::Right)
        } else {
            None
        }
    }

    pub fn shape(&self) -> Shape {
        Shape {
            rows: self.rows,
            inner: self.inner,
            cols: self.cols,
        }
    }

    /// Flag list as it would be typed on a command line.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--rows".to_string(),
            self.rows.to_string(),
            "--inner".to_string(),
            self.inner.to_string(),
            "--cols".to_string(),
            self.cols.to_string(),
        ];
        if self.strict {
            flags.push("--strict".to_string());
        }
        for name in &self.left_partitions {
            flags.push("--left-partition".to_string());
            flags.push(name.clone());
        }
        for name in &self.right_partitions {
            flags.push("--right-partition".to_string());
            flags.push(name.clone());
        }
        flags
    }

    /// Serializes the arguments into the engine's aux buffer.
    pub fn to_aux(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_string(&self.to_flags())?))
    }

    pub fn from_aux(aux: &Bytes) -> Result<Self> {
        let args = Self::try_parse_from(serde_json::from_slice::<Vec<String>>(aux)?)?;
        if args.rows == 0 || args.inner == 0 || args.cols == 0 {
            bail!("degenerate product shape {}", args.shape());
        }
        Ok(args)
    }
}

/// Coordinate of one entry of the product; the shuffle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputKey {
    pub row: usize,
    pub col: usize,
}

impl OutputKey {
    /// Text form of the key: `row,col`, or just `row` for a product vector.
    pub fn render(&self, mode: Mode) -> String {
        match mode {
            Mode::MatrixMatrix => format!("{},{}", self.row, self.col),
            Mode::MatrixVector => format!("{}", self.row),
        }
    }

    /// Parses either text form; a lone row means column 0.
    pub fn parse(s: &str) -> Option<Self> {
        let (row, col) = match s.split_once(',') {
            Some((row, col)) => (row.trim().parse().ok()?, col.trim().parse().ok()?),
            None => (s.trim().parse().ok()?, 0),
        };
        Some(OutputKey { row, col })
    }
}

/// A cell re-keyed by the contraction index it will be joined on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialContribution {
    pub tag: OperandTag,
    pub index: usize,
    pub value: i64,
}

impl PartialContribution {
    /// Writes the `A,<index>,<value>` / `B,<index>,<value>` encoding.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put(format!("{},{},{}", self.tag, self.index, self.value).as_bytes());
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.put(&mut buf);
        buf.freeze()
    }

    /// Decodes an intermediate value received under `key`.
    pub fn decode(key: &str, raw: &[u8]) -> Result<Self, MatrixError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| MatrixError::contribution(key, "value is not valid UTF-8"))?;
        let fields: Vec<&str> = text.split(',').collect();
        let [tag, index, value] = fields.as_slice() else {
            return Err(MatrixError::contribution(
                key,
                format!("expected `tag,index,value`, got `{text}`"),
            ));
        };
        let tag = OperandTag::from_record_tag(tag)
            .ok_or_else(|| MatrixError::contribution(key, format!("unknown operand `{tag}`")))?;
        let index = index.parse().map_err(|_| {
            MatrixError::contribution(key, format!("index `{index}` is not an integer"))
        })?;
        let value = value.parse().map_err(|_| {
            MatrixError::contribution(key, format!("value `{value}` is not an integer"))
        })?;
        Ok(PartialContribution { tag, index, value })
    }
}

/// Replicates one cell under every output key it contributes to.
pub fn expand(cell: Cell, shape: Shape) -> impl Iterator<Item = (OutputKey, PartialContribution)> {
    let contribution = PartialContribution {
        tag: cell.tag,
        index: match cell.tag {
            OperandTag::Left => cell.col,
            OperandTag::Right => cell.row,
        },
        value: cell.value,
    };
    let span = match cell.tag {
        OperandTag::Left => shape.cols,
        OperandTag::Right => shape.rows,
    };
    (0..span).map(move |n| {
        let key = match cell.tag {
            OperandTag::Left => OutputKey { row: cell.row, col: n },
            OperandTag::Right => OutputKey { row: n, col: cell.col },
        };
        (key, contribution)
    })
}

/// Checks a partition's declared shape against the job's product shape.
///
/// A partition holding one operand declares that operand's shape. A
/// partition of tagged records from both operands declares the shape of the
/// result, `rows x cols`.
pub fn check_partition(meta: &PartitionMeta, shape: Shape) -> Result<(), MatrixError> {
    let (expected, what) = match meta.role {
        Some(role) => (shape.operand(role), format!("{role} operand")),
        None => ((shape.rows, shape.cols), "tagged partition".to_string()),
    };
    if (meta.rows, meta.cols) != expected {
        return Err(MatrixError::dimension(
            &meta.name,
            format!(
                "{what} declared {}x{} but the product is {shape}",
                meta.rows, meta.cols
            ),
        ));
    }
    Ok(())
}

/// Checks a cell against the shape of the operand it belongs to.
///
/// Partitions of tagged records declare the result's shape, so only this
/// check bounds their contraction indices.
pub fn check_cell(meta: &PartitionMeta, cell: &Cell, shape: Shape) -> Result<(), MatrixError> {
    let (rows, cols) = shape.operand(cell.tag);
    if cell.row >= rows || cell.col >= cols {
        return Err(MatrixError::dimension(
            &meta.name,
            format!(
                "{} cell ({}, {}) outside the {rows}x{cols} operand",
                cell.tag, cell.row, cell.col
            ),
        ));
    }
    Ok(())
}

fn map_partition(kv: KeyValue, aux: Bytes, mode: Mode) -> MapOutput {
    let args = MatMulArgs::from_aux(&aux)?;
    let shape = args.shape();
    if mode == Mode::MatrixVector && shape.cols != 1 {
        bail!("matrix-vector product needs a single-column right operand, got {shape}");
    }

    let path = string_from_bytes(kv.key)?;
    let mut meta = PartitionMeta::from_path(&path)?;
    if meta.role.is_none() {
        meta.role = args.assigned(&meta.name);
    }
    check_partition(&meta, shape)?;

    let content = string_from_bytes(kv.value)?;
    let parsed = parse_partition(&meta, &content)?;
    for err in &parsed.rejected {
        warn!("{}: skipping record: {}", meta.name, err);
    }
    for cell in &parsed.cells {
        check_cell(&meta, cell, shape)?;
    }
    debug!(
        "{}: {} cells, {} rejected records",
        meta.name,
        parsed.cells.len(),
        parsed.rejected.len()
    );

    let mut key_buf = BytesMut::new();
    let mut value_buf = BytesMut::new();

    let iter = parsed
        .cells
        .into_iter()
        .flat_map(move |cell| expand(cell, shape))
        .map(move |(key, contribution)| {
            key_buf.put(key.render(mode).as_bytes());
            contribution.put(&mut value_buf);

            let key = key_buf.split().freeze();
            let value = value_buf.split().freeze();

            Ok(KeyValue { key, value })
        });
    Ok(Box::new(iter))
}

/// Map function of the `matmul` workload.
pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    map_partition(kv, aux, Mode::MatrixMatrix)
}

/// Map function of the `matvec` workload.
pub fn map_vector(kv: KeyValue, aux: Bytes) -> MapOutput {
    map_partition(kv, aux, Mode::MatrixVector)
}
