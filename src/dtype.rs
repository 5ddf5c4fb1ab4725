//! Data-type registry and descriptors (spec §4.4).
//!
//! Basic types are pre-registered at init; composite descriptors (strided,
//! indexed, custom) are constructed on demand. Grounded on the teacher's
//! tagged-union-over-closed-variant-set style (spec §9 "Dynamic dispatch":
//! "use tagged unions with match/switch rather than virtual inheritance").

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DartError, Result};

/// Maximum number of elements moved by a single chunk transfer (spec §4.3,
/// §4.4): transfers larger than this are split by the RMA layer into
/// multiples of this chunk plus a remainder.
pub const MAX_CHUNK_ELEMENTS: u64 = i32::MAX as u64;

/// Pre-registered basic (non-composite) types (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Byte,
    Short,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    LongDouble,
}

impl BasicType {
    pub const ALL: [BasicType; 11] = [
        BasicType::Byte,
        BasicType::Short,
        BasicType::Int,
        BasicType::UInt,
        BasicType::Long,
        BasicType::ULong,
        BasicType::LongLong,
        BasicType::ULongLong,
        BasicType::Float,
        BasicType::Double,
        BasicType::LongDouble,
    ];

    /// Element size in bytes, as recorded in the registry.
    pub fn size(self) -> usize {
        match self {
            BasicType::Byte => 1,
            BasicType::Short => 2,
            BasicType::Int => 4,
            BasicType::UInt => 4,
            BasicType::Long => 8,
            BasicType::ULong => 8,
            BasicType::LongLong => 8,
            BasicType::ULongLong => 8,
            BasicType::Float => 4,
            BasicType::Double => 8,
            BasicType::LongDouble => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BasicType::Byte => "DART_TYPE_BYTE",
            BasicType::Short => "DART_TYPE_SHORT",
            BasicType::Int => "DART_TYPE_INT",
            BasicType::UInt => "DART_TYPE_UINT",
            BasicType::Long => "DART_TYPE_LONG",
            BasicType::ULong => "DART_TYPE_ULONG",
            BasicType::LongLong => "DART_TYPE_LONGLONG",
            BasicType::ULongLong => "DART_TYPE_ULONGLONG",
            BasicType::Float => "DART_TYPE_FLOAT",
            BasicType::Double => "DART_TYPE_DOUBLE",
            BasicType::LongDouble => "DART_TYPE_LONGDOUBLE",
        }
    }
}

/// A strided (regular) composite type: `nblocks` equally-sized blocks of
/// `blocklen` base elements, separated by `stride` base elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strided {
    pub base: BasicType,
    pub stride: i64,
    pub blocklen: u32,
}

/// An irregular gather/scatter composite type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed {
    pub base: BasicType,
    pub blocklens: Vec<u32>,
    pub offsets: Vec<i64>,
}

/// Tagged union over the four kinds of data-type descriptor (spec §3, §4.4).
/// The variant set is closed; new kinds are not added without a spec change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Basic(BasicType),
    Contiguous { base: BasicType, count: u64 },
    Strided(Strided),
    Indexed(Indexed),
    Custom { byte_count: u64 },
}

/// A registered/constructed type descriptor. Basic descriptors refuse
/// destruction; composite descriptors are destroyable (spec §4.4).
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub id: u64,
    pub kind: TypeKind,
    pub name: Option<String>,
}

impl TypeDescriptor {
    /// Element size of the descriptor's base type.
    pub fn elem_size(&self) -> usize {
        match &self.kind {
            TypeKind::Basic(b) => b.size(),
            TypeKind::Contiguous { base, .. } => base.size(),
            TypeKind::Strided(s) => s.base.size(),
            TypeKind::Indexed(i) => i.base.size(),
            TypeKind::Custom { .. } => 1,
        }
    }

    /// Total element count described, used to decide chunking (spec §4.3).
    pub fn element_count(&self) -> u64 {
        match &self.kind {
            TypeKind::Basic(_) => 1,
            TypeKind::Contiguous { count, .. } => *count,
            TypeKind::Strided(s) => s.blocklen as u64,
            TypeKind::Indexed(i) => i.blocklens.iter().map(|&b| b as u64).sum(),
            TypeKind::Custom { byte_count } => *byte_count,
        }
    }

    /// Whether this is a basic (non-composite) type, required at entry by
    /// atomic and accumulate operations (spec §4.3).
    pub fn is_basic(&self) -> bool {
        matches!(self.kind, TypeKind::Basic(_))
    }

    pub fn is_destroyable(&self) -> bool {
        !self.is_basic()
    }
}

/// Registers data types and caches per-type max-chunk descriptors.
///
/// Not internally synchronized beyond what `parking_lot::Mutex` in
/// [`crate::runtime::Runtime`] already provides around the whole registry —
/// composite-type construction is infrequent enough that a single lock is
/// appropriate, mirroring the segment table's "external mutual exclusion"
/// contract (spec §4.1).
pub struct TypeRegistry {
    next_id: AtomicU64,
    basics: Vec<TypeDescriptor>,
}

impl TypeRegistry {
    /// Pre-registers the eleven basic types (spec §4.4).
    pub fn new() -> Self {
        let basics = BasicType::ALL
            .iter()
            .enumerate()
            .map(|(i, &b)| TypeDescriptor {
                id: i as u64,
                kind: TypeKind::Basic(b),
                name: Some(b.name().to_string()),
            })
            .collect();
        TypeRegistry {
            next_id: AtomicU64::new(BasicType::ALL.len() as u64),
            basics,
        }
    }

    pub fn basic(&self, ty: BasicType) -> &TypeDescriptor {
        &self.basics[BasicType::ALL.iter().position(|&b| b == ty).unwrap()]
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `custom(byte_count)`: an opaque contiguous block, constructed eagerly.
    pub fn custom(&self, byte_count: u64) -> TypeDescriptor {
        TypeDescriptor {
            id: self.alloc_id(),
            kind: TypeKind::Custom { byte_count },
            name: None,
        }
    }

    /// `strided(base, stride, blocklen)`. The transport descriptor proper is
    /// built lazily per transfer (§4.4) since the number of blocks depends on
    /// the transfer's element count, which this call does not know yet.
    pub fn strided(&self, base: BasicType, stride: i64, blocklen: u32) -> Result<TypeDescriptor> {
        if blocklen == 0 {
            return Err(DartError::Inval("strided blocklen must be non-zero".into()));
        }
        Ok(TypeDescriptor {
            id: self.alloc_id(),
            kind: TypeKind::Strided(Strided {
                base,
                stride,
                blocklen,
            }),
            name: None,
        })
    }

    /// `indexed(base, blocklens, offsets)`: built eagerly and cached, since
    /// the irregular pattern cannot be derived from the transfer count alone.
    pub fn indexed(
        &self,
        base: BasicType,
        blocklens: Vec<u32>,
        offsets: Vec<i64>,
    ) -> Result<TypeDescriptor> {
        if blocklens.len() != offsets.len() {
            return Err(DartError::Inval(
                "indexed blocklens and offsets must have equal length".into(),
            ));
        }
        Ok(TypeDescriptor {
            id: self.alloc_id(),
            kind: TypeKind::Indexed(Indexed {
                base,
                blocklens,
                offsets,
            }),
            name: None,
        })
    }

    /// The max-chunk descriptor for `base`: `MAX_CHUNK_ELEMENTS` elements,
    /// constructed on demand (spec §4.4). Cheap enough that callers may
    /// request it per transfer rather than threading a cache through.
    pub fn max_chunk(&self, base: BasicType) -> TypeDescriptor {
        TypeDescriptor {
            id: u64::MAX,
            kind: TypeKind::Contiguous {
                base,
                count: MAX_CHUNK_ELEMENTS,
            },
            name: Some("max-chunk".to_string()),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a transfer of `total` elements into `(full_chunks, remainder)`
/// against [`MAX_CHUNK_ELEMENTS`] (spec §4.3, §8 boundary behaviors).
pub fn chunk_plan(total: u64) -> (u64, u64) {
    (total / MAX_CHUNK_ELEMENTS, total % MAX_CHUNK_ELEMENTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basics_cover_all_eleven_types() {
        let reg = TypeRegistry::new();
        for &b in &BasicType::ALL {
            assert!(reg.basic(b).is_basic());
            assert!(!reg.basic(b).is_destroyable());
        }
    }

    #[test]
    fn composite_types_are_destroyable() {
        let reg = TypeRegistry::new();
        let custom = reg.custom(128);
        assert!(custom.is_destroyable());
        let strided = reg.strided(BasicType::Int, 4, 2).unwrap();
        assert!(strided.is_destroyable());
    }

    #[test]
    fn strided_rejects_zero_blocklen() {
        let reg = TypeRegistry::new();
        assert!(reg.strided(BasicType::Int, 1, 0).is_err());
    }

    #[test]
    fn chunking_boundaries() {
        assert_eq!(chunk_plan(MAX_CHUNK_ELEMENTS - 1), (0, MAX_CHUNK_ELEMENTS - 1));
        assert_eq!(chunk_plan(MAX_CHUNK_ELEMENTS), (1, 0));
        assert_eq!(chunk_plan(MAX_CHUNK_ELEMENTS + 1), (1, 1));
    }
}
