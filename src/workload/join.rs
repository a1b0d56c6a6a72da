//! Reduce side of the matrix product: a join on the contraction index.
//!
//! All contributions for one output key arrive together, in no particular
//! order. Each contraction index keeps a running product of the values seen
//! for it and a count; an index enters the dot product only once both sides
//! have been seen, which the count detects without building explicit
//! per-operand sets.

use std::cell::RefCell;

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use fnv::FnvHashMap;

use super::matrix_mult::{MatMulArgs, PartialContribution};
use super::record::OperandTag;
use crate::error::MatrixError;
use crate::utils::string_from_bytes;

/// Contraction dimensions up to this size use a dense slot array.
pub const DENSE_LIMIT: usize = 4096;

/// How repeated contributions for the same index are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinPolicy {
    /// Repeated values fold into the product and every value counts
    /// towards the two needed to join.
    #[default]
    Fold,
    /// Exactly one value per operand; a repeat is a malformed contribution.
    Strict,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    product: i64,
    count: u32,
    left: u32,
    right: u32,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            product: 1,
            count: 0,
            left: 0,
            right: 0,
        }
    }
}

impl Slot {
    fn joined(&self, policy: JoinPolicy) -> bool {
        match policy {
            JoinPolicy::Fold => self.count >= 2,
            JoinPolicy::Strict => self.left == 1 && self.right == 1,
        }
    }
}

#[derive(Debug)]
enum Slots {
    Dense(Vec<Slot>),
    Sparse(FnvHashMap<usize, Slot>),
}

/// Per-key join state. Created for one output key and dropped after it.
#[derive(Debug)]
pub struct Accumulator {
    slots: Slots,
    inner: usize,
    policy: JoinPolicy,
}

impl Accumulator {
    pub fn new(inner: usize, policy: JoinPolicy) -> Self {
        let slots = if inner <= DENSE_LIMIT {
            Slots::Dense(vec![Slot::default(); inner])
        } else {
            Slots::Sparse(FnvHashMap::default())
        };
        Accumulator {
            slots,
            inner,
            policy,
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot {
        match &mut self.slots {
            Slots::Dense(slots) => &mut slots[index],
            Slots::Sparse(slots) => slots.entry(index).or_default(),
        }
    }

    /// Folds one contribution into the state for `key`.
    pub fn add(&mut self, key: &str, c: PartialContribution) -> Result<(), MatrixError> {
        if c.index >= self.inner {
            return Err(MatrixError::contribution(
                key,
                format!(
                    "contraction index {} outside dimension {}",
                    c.index, self.inner
                ),
            ));
        }
        let policy = self.policy;
        let slot = self.slot_mut(c.index);
        let side = match c.tag {
            OperandTag::Left => &mut slot.left,
            OperandTag::Right => &mut slot.right,
        };
        if policy == JoinPolicy::Strict && *side > 0 {
            return Err(MatrixError::contribution(
                key,
                format!("duplicate {} value for contraction index {}", c.tag, c.index),
            ));
        }
        *side += 1;
        slot.count += 1;
        slot.product = slot.product.checked_mul(c.value).ok_or_else(|| {
            MatrixError::contribution(key, format!("product overflow at index {}", c.index))
        })?;
        Ok(())
    }

    /// Dot product over the joined indices.
    pub fn sum(&self, key: &str) -> Result<i64, MatrixError> {
        let policy = self.policy;
        let joined: i128 = match &self.slots {
            Slots::Dense(slots) => slots
                .iter()
                .filter(|s| s.joined(policy))
                .map(|s| i128::from(s.product))
                .sum(),
            Slots::Sparse(slots) => slots
                .values()
                .filter(|s| s.joined(policy))
                .map(|s| i128::from(s.product))
                .sum(),
        };
        i64::try_from(joined)
            .map_err(|_| MatrixError::contribution(key, format!("sum {joined} overflows i64")))
    }
}

/// Joins the contributions of one output key.
///
/// Returns `None` when the sum is zero: absent keys are zero entries of the
/// product, so nothing is written for them.
pub fn join<I>(
    key: &str,
    values: I,
    inner: usize,
    policy: JoinPolicy,
) -> Result<Option<i64>, MatrixError>
where
    I: IntoIterator<Item = Bytes>,
{
    let mut acc = Accumulator::new(inner, policy);
    for raw in values {
        acc.add(key, PartialContribution::decode(key, &raw)?)?;
    }
    let sum = acc.sum(key)?;
    Ok((sum != 0).then_some(sum))
}

/// What the reducer needs from the aux arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinSettings {
    inner: usize,
    policy: JoinPolicy,
}

thread_local! {
    /// Settings decoded from the last aux buffer this thread reduced with.
    static SETTINGS: RefCell<Option<(Bytes, JoinSettings)>> = RefCell::new(None);
}

impl JoinSettings {
    fn from_aux(aux: &Bytes) -> Result<Self> {
        let args = MatMulArgs::from_aux(aux)?;
        let policy = if args.strict {
            JoinPolicy::Strict
        } else {
            JoinPolicy::Fold
        };
        Ok(JoinSettings {
            inner: args.inner,
            policy,
        })
    }

    /// Decodes `aux` once per thread for as long as it does not change.
    fn cached(aux: &Bytes) -> Result<Self> {
        SETTINGS.with(|cell| {
            let mut cache = cell.borrow_mut();
            if let Some((seen, settings)) = cache.as_ref() {
                if seen == aux {
                    return Ok(*settings);
                }
            }
            let settings = Self::from_aux(aux)?;
            *cache = Some((aux.clone(), settings));
            Ok(settings)
        })
    }
}

/// Reduce function of the `matmul` and `matvec` workloads.
///
/// Writes `<key>\t<sum>\n`, or nothing for a zero sum.
pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> Result<Bytes> {
    let settings = JoinSettings::cached(&aux)?;
    let key = string_from_bytes(key)?;

    let mut writer = BytesMut::new();
    if let Some(sum) = join(&key, values, settings.inner, settings.policy)? {
        writer.put(format!("{key}\t{sum}\n").as_bytes());
    }
    Ok(writer.freeze())
}
