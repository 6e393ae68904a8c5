//! Host-side values: element types, array types, and literal data.
use smallvec::SmallVec;

use crate::Error;

/// Array element type enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ElementType {
    F32,
    F64,
}

impl ElementType {
    /// The size for this element type in bytes.
    pub fn element_size_in_bytes(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Shape and element type of an array value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayTy {
    pub element_type: ElementType,
    pub shape: SmallVec<[i64; 4]>,
}

impl ArrayTy {
    pub fn new(element_type: ElementType, shape: SmallVec<[i64; 4]>) -> Self {
        Self {
            element_type,
            shape,
        }
    }

    pub fn scalar(element_type: ElementType) -> Self {
        Self {
            element_type,
            shape: SmallVec::new(),
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product::<i64>().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Type of one step of a stacked value: the same array with the leading
    /// dimension removed.
    pub fn drop_leading(&self) -> Result<ArrayTy, Error> {
        if self.shape.is_empty() {
            return Err(Error::ScanArgRankZero);
        }
        Ok(ArrayTy {
            element_type: self.element_type,
            shape: self.shape[1..].iter().copied().collect(),
        })
    }
}

/// Raw host data for a literal, tagged by element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Data {
    pub fn len(&self) -> usize {
        match self {
            Data::F32(v) => v.len(),
            Data::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Data::F32(_) => ElementType::F32,
            Data::F64(_) => ElementType::F64,
        }
    }

    /// Widens to f64 regardless of the stored element type.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Data::F32(v) => v.iter().map(|x| *x as f64).collect(),
            Data::F64(v) => v.clone(),
        }
    }

    /// Narrows an f64 buffer back into `ty`'s element type.
    pub fn from_f64_vec(ty: ElementType, v: Vec<f64>) -> Data {
        match ty {
            ElementType::F32 => Data::F32(v.into_iter().map(|x| x as f32).collect()),
            ElementType::F64 => Data::F64(v),
        }
    }
}

/// A host-resident array value.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    ty: ArrayTy,
    data: Data,
}

impl Literal {
    pub fn new(ty: ArrayTy, data: Data) -> Result<Self, Error> {
        if ty.element_type != data.element_type() || ty.len() != data.len() {
            return Err(Error::ProgramArgMismatch(
                "literal data does not match its type".into(),
            ));
        }
        Ok(Self { ty, data })
    }

    pub fn f32(shape: &[i64], values: Vec<f32>) -> Result<Self, Error> {
        Self::new(
            ArrayTy::new(ElementType::F32, shape.iter().copied().collect()),
            Data::F32(values),
        )
    }

    pub fn f64(shape: &[i64], values: Vec<f64>) -> Result<Self, Error> {
        Self::new(
            ArrayTy::new(ElementType::F64, shape.iter().copied().collect()),
            Data::F64(values),
        )
    }

    /// Pairs a type with data the caller already knows to be consistent.
    pub(crate) fn from_parts(ty: ArrayTy, data: Data) -> Self {
        Self { ty, data }
    }

    /// A literal with every element set to `value`.
    pub fn full(ty: ArrayTy, value: f64) -> Self {
        let data = Data::from_f64_vec(ty.element_type, vec![value; ty.len()]);
        Self { ty, data }
    }

    pub fn zeros(ty: ArrayTy) -> Self {
        Self::full(ty, 0.0)
    }

    pub fn ty(&self) -> &ArrayTy {
        &self.ty
    }

    pub fn element_type(&self) -> ElementType {
        self.ty.element_type
    }

    pub fn shape(&self) -> &[i64] {
        &self.ty.shape
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn into_parts(self) -> (ArrayTy, Data) {
        (self.ty, self.data)
    }
}
