//! Provides functionality for managing a client that owns device-resident
//! buffers, host transfer accounting, and the per-process random state.
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{ArrayTy, Data, ElementType, Error, Literal};

/// Represents a high-level client for a single device. Buffers allocated
/// through a client stay device-resident; the only host crossings are
/// [`Client::to_device`] and [`Client::to_host`], both of which are counted.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    to_device: AtomicUsize,
    from_device: AtomicUsize,
    rng: AtomicU64,
}

impl Client {
    /// Creates a new `Client` using the default CPU backend.
    pub fn cpu() -> Result<Self, Error> {
        Ok(Client {
            inner: Arc::new(ClientInner {
                to_device: AtomicUsize::new(0),
                from_device: AtomicUsize::new(0),
                rng: AtomicU64::new(0x9e37_79b9_7f4a_7c15),
            }),
        })
    }

    /// Copies a host literal into a device buffer. Counted as a
    /// host-to-device transfer.
    pub fn to_device(&self, literal: &Literal) -> Buffer {
        self.inner.to_device.fetch_add(1, Ordering::SeqCst);
        Buffer {
            ty: literal.ty().clone(),
            data: literal.data().clone(),
        }
    }

    /// Copies a device buffer back to the host. Counted as a
    /// device-to-host transfer.
    pub fn to_host(&self, buffer: &Buffer) -> Literal {
        self.inner.from_device.fetch_add(1, Ordering::SeqCst);
        Literal::from_parts(buffer.ty.clone(), buffer.data.clone())
    }

    /// Number of host-to-device transfers issued through this client.
    pub fn transfers_to_device(&self) -> usize {
        self.inner.to_device.load(Ordering::SeqCst)
    }

    /// Number of device-to-host transfers issued through this client.
    pub fn transfers_from_device(&self) -> usize {
        self.inner.from_device.load(Ordering::SeqCst)
    }

    /// Draws the next raw random word. Each draw advances the state, so two
    /// otherwise identical evaluations observe different values.
    pub(crate) fn next_seed(&self) -> u64 {
        splitmix64(self.inner.rng.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::SeqCst))
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// A device-resident array value.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub(crate) ty: ArrayTy,
    pub(crate) data: Data,
}

impl Buffer {
    pub fn ty(&self) -> &ArrayTy {
        &self.ty
    }

    pub fn element_type(&self) -> ElementType {
        self.ty.element_type
    }

    pub fn shape(&self) -> &[i64] {
        &self.ty.shape
    }

    pub(crate) fn from_parts(ty: ArrayTy, data: Data) -> Self {
        Buffer { ty, data }
    }

    /// Device-side fill; no host data is involved.
    pub fn full(ty: ArrayTy, value: f64) -> Self {
        let (ty, data) = Literal::full(ty, value).into_parts();
        Buffer { ty, data }
    }

    pub fn zeros(ty: ArrayTy) -> Self {
        Self::full(ty, 0.0)
    }

    /// Device-side row select along the leading dimension.
    pub fn index_leading(&self, index: i64) -> Result<Buffer, Error> {
        let (&len, rest) = self
            .ty
            .shape
            .split_first()
            .ok_or(Error::ScanArgRankZero)?;
        if index < 0 || index >= len {
            return Err(Error::ProgramArgMismatch("row index out of bounds".into()));
        }
        let row_ty = ArrayTy::new(self.ty.element_type, rest.iter().copied().collect());
        let row_len = row_ty.len();
        let start = index as usize * row_len;
        let values = self.data.to_f64_vec()[start..start + row_len].to_vec();
        Ok(Buffer {
            data: Data::from_f64_vec(row_ty.element_type, values),
            ty: row_ty,
        })
    }

    /// Device-side stack along a new leading dimension.
    pub fn stack(rows: &[Buffer]) -> Result<Buffer, Error> {
        let first = rows.first().ok_or(Error::ScanMissingArg)?;
        let mut values = Vec::with_capacity(first.ty.len() * rows.len());
        for row in rows {
            if row.ty != first.ty {
                return Err(Error::ProgramArgMismatch(
                    "stacked rows must share a type".into(),
                ));
            }
            values.extend(row.data.to_f64_vec());
        }
        let mut shape = smallvec::SmallVec::with_capacity(first.ty.shape.len() + 1);
        shape.push(rows.len() as i64);
        shape.extend_from_slice(&first.ty.shape);
        let ty = ArrayTy::new(first.ty.element_type, shape);
        Ok(Buffer {
            data: Data::from_f64_vec(ty.element_type, values),
            ty,
        })
    }
}

/// A device-resident tensor as seen by callers of `scan`: a buffer plus its
/// gradient-requiredness.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub buffer: Buffer,
    pub requires_grad: bool,
}

impl Tensor {
    pub fn new(buffer: Buffer, requires_grad: bool) -> Self {
        Tensor {
            buffer,
            requires_grad,
        }
    }

    /// Uploads a host literal and wraps it. The only host-to-device crossing
    /// in a scan call happens here, before the loop runs.
    pub fn from_literal(client: &Client, literal: &Literal, requires_grad: bool) -> Self {
        Tensor {
            buffer: client.to_device(literal),
            requires_grad,
        }
    }

    pub fn ty(&self) -> &ArrayTy {
        &self.buffer.ty
    }

    /// Structure/shape/dtype metadata only; never reads buffer contents.
    pub fn meta(&self) -> ArgMeta {
        ArgMeta {
            ty: self.buffer.ty.clone(),
            requires_grad: self.requires_grad,
        }
    }
}

/// Placeholder metadata for one traced argument leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgMeta {
    pub ty: ArrayTy,
    pub requires_grad: bool,
}
