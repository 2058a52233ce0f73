//! Registries of the variables exported by the real-time side.
//!
//! The tables are immutable once built: the descriptor list ships from the
//! real-time process at startup and never changes afterwards, so sessions
//! can hold borrows without any locking.

use hashbrown::HashMap;
use std::sync::Arc;

/// Data type tag of an exported variable. Dispatch over this tag replaces
/// any per-variable function table: every encoder/decoder matches on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    ComplexF64,
}

impl DataType {
    /// Byte size of one element.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
            DataType::ComplexF64 => 16,
        }
    }

    /// Stable tag used in registry listings.
    pub fn tag(self) -> &'static str {
        match self {
            DataType::U8 => "u8",
            DataType::I8 => "i8",
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::U32 => "u32",
            DataType::I32 => "i32",
            DataType::U64 => "u64",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::ComplexF64 => "complex-f64",
        }
    }
}

/// Immutable descriptor of one exported variable.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Stable identifier, equal to the position in the table.
    pub id: usize,
    pub path: String,
    pub name: String,
    pub alias: Option<String>,
    pub data_type: DataType,
    /// Dimension list; empty means scalar.
    pub dims: Vec<usize>,
    /// Byte offset into the producer's signal or parameter image.
    pub offset: usize,
    /// Index into the model's sample-time list.
    pub sample_time: usize,
}

impl Variable {
    /// Number of elements in one sample of this variable.
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product::<usize>().max(1)
    }

    /// Byte length of one sample.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.elem_count() * self.data_type.size()
    }

    /// Formats the dimension list for registry listings.
    pub fn dim_string(&self) -> String {
        if self.dims.is_empty() {
            "1".into()
        } else {
            let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
            dims.join("x")
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum RegistryError {
    DuplicatePath(String),
    OutOfBounds(String),
    ZeroDimension(String),
}

/// Name-ordered, path-indexed table of variables plus the byte length of
/// the image they live in.
pub struct VariableTable {
    vars: Vec<Variable>,
    by_path: HashMap<String, usize>,
    image_len: usize,
}

/// Signals exported by the real-time side (read-only to clients).
pub type SignalTable = VariableTable;

/// Tunable parameters (writeable with write access).
pub type ParameterTable = VariableTable;

impl VariableTable {
    /// Validates and freezes a descriptor list. Paths must be unique and
    /// every descriptor must fit inside the declared image.
    pub fn build(mut vars: Vec<Variable>, image_len: usize) -> Result<VariableTable, RegistryError> {
        let mut by_path = HashMap::with_capacity(vars.len());

        for (id, var) in vars.iter_mut().enumerate() {
            var.id = id;

            if var.dims.iter().any(|&d| d == 0) {
                return Err(RegistryError::ZeroDimension(var.path.clone()));
            }

            if var.offset + var.byte_len() > image_len {
                return Err(RegistryError::OutOfBounds(var.path.clone()));
            }

            if by_path.insert(var.path.clone(), id).is_some() {
                return Err(RegistryError::DuplicatePath(var.path.clone()));
            }
        }

        Ok(VariableTable {
            vars,
            by_path,
            image_len,
        })
    }

    pub fn empty() -> VariableTable {
        VariableTable {
            vars: Vec::new(),
            by_path: HashMap::new(),
            image_len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Byte length of the image the descriptors point into.
    #[inline]
    pub fn image_len(&self) -> usize {
        self.image_len
    }

    #[inline]
    pub fn lookup(&self, path: &str) -> Option<&Variable> {
        self.by_path.get(path).map(|&id| &self.vars[id])
    }

    #[inline]
    pub fn get(&self, id: usize) -> Option<&Variable> {
        self.vars.get(id)
    }

    /// Iterates in declaration order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }
}

/// The application shipped by the real-time side: a name plus the periods
/// (in seconds) of its sample-times.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub id: u32,
    pub sample_periods: Vec<f64>,
}

impl ModelInfo {
    pub fn sample_time_count(&self) -> usize {
        self.sample_periods.len()
    }
}

/// Everything the command layer needs to answer registry queries.
pub struct Registry {
    pub model: ModelInfo,
    pub signals: Arc<SignalTable>,
    pub parameters: Arc<ParameterTable>,
}
