//! Operation registration with a host runtime
//!
//! The host runtime owns an [`OpTable`]. [`initialize_copy_ops`] installs
//! the copy engine's operations into it and hands back a [`Registration`]
//! token; passing the token to [`OpTable::unregister`] removes them again
//! and shuts the engine down.

use crate::copy::{CopyEngine, CopyOptions};
use crate::error::{CopyError, Result, ShapeError};
use crate::runtime::CompletionHandle;
use crate::tensor::{TensorView, TensorViewMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Operations provided by the copy engine
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpId {
    /// Layout/broadcast copy between tensors of the same element type
    Copy,
    /// Copy with element type conversion
    Cast,
    /// Same-shape, same-type copy between placements
    ToDevice,
}

impl OpId {
    /// Every operation, in registration order
    pub const ALL: [OpId; 3] = [OpId::Copy, OpId::Cast, OpId::ToDevice];

    /// Operation name used in errors and logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Cast => "cast",
            Self::ToDevice => "to_device",
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An operation callable through an [`OpTable`]
pub trait CopyOp: Send + Sync {
    /// Which operation this is
    fn id(&self) -> OpId;

    /// Run the operation
    fn run(
        &self,
        src: &TensorView<'_>,
        dst: &mut TensorViewMut<'_>,
        options: &CopyOptions,
    ) -> Result<CompletionHandle>;
}

struct EngineOp {
    id: OpId,
    engine: Arc<CopyEngine>,
}

impl CopyOp for EngineOp {
    fn id(&self) -> OpId {
        self.id
    }

    fn run(
        &self,
        src: &TensorView<'_>,
        dst: &mut TensorViewMut<'_>,
        options: &CopyOptions,
    ) -> Result<CompletionHandle> {
        match self.id {
            OpId::Copy | OpId::ToDevice if src.dtype() != dst.dtype() => {
                return Err(CopyError::unsupported_cast(src.dtype(), dst.dtype()));
            }
            OpId::ToDevice if src.shape() != dst.shape() => {
                return Err(ShapeError::Incompatible {
                    src: src.shape().to_vec(),
                    dst: dst.shape().to_vec(),
                }
                .into());
            }
            _ => {}
        }
        self.engine.copy_with(src, dst, options)
    }
}

/// Proof that a set of operations was registered for an engine
#[must_use = "dropping a registration leaves its operations installed with no way to remove them"]
pub struct Registration {
    ops: Vec<OpId>,
    engine: Arc<CopyEngine>,
}

impl Registration {
    /// Operations covered by this registration
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    /// The engine behind the operations
    pub fn engine(&self) -> &Arc<CopyEngine> {
        &self.engine
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("ops", &self.ops).finish()
    }
}

/// Operation dispatch table owned by the host runtime
#[derive(Default)]
pub struct OpTable {
    ops: HashMap<OpId, Arc<dyn CopyOp>>,
}

impl OpTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install one operation
    pub fn register(&mut self, op: Arc<dyn CopyOp>) -> Result<()> {
        let id = op.id();
        if self.ops.contains_key(&id) {
            return Err(CopyError::AlreadyRegistered { op: id.name() });
        }
        self.ops.insert(id, op);
        Ok(())
    }

    /// Whether `id` has an implementation
    pub fn is_registered(&self, id: OpId) -> bool {
        self.ops.contains_key(&id)
    }

    /// Look up an operation
    pub fn get(&self, id: OpId) -> Result<&Arc<dyn CopyOp>> {
        self.ops
            .get(&id)
            .ok_or(CopyError::OpNotRegistered { op: id.name() })
    }

    /// Look up and run an operation
    pub fn invoke(
        &self,
        id: OpId,
        src: &TensorView<'_>,
        dst: &mut TensorViewMut<'_>,
        options: &CopyOptions,
    ) -> Result<CompletionHandle> {
        self.get(id)?.run(src, dst, options)
    }

    /// Remove the operations of `registration` and shut its engine down
    ///
    /// Work already enqueued keeps running; its handles stay valid.
    pub fn unregister(&mut self, registration: Registration) {
        for id in &registration.ops {
            self.ops.remove(id);
        }
        registration.engine.shutdown();
        debug!(ops = ?registration.ops, "copy ops unregistered");
    }
}

impl fmt::Debug for OpTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ops.keys()).finish()
    }
}

/// Install the copy, cast and to-device operations backed by `engine`
///
/// Fails without modifying the table if any of them is already registered.
pub fn initialize_copy_ops(table: &mut OpTable, engine: Arc<CopyEngine>) -> Result<Registration> {
    if let Some(taken) = OpId::ALL.iter().find(|id| table.is_registered(**id)) {
        return Err(CopyError::AlreadyRegistered { op: taken.name() });
    }
    for id in OpId::ALL {
        table.register(Arc::new(EngineOp {
            id,
            engine: Arc::clone(&engine),
        }))?;
    }
    debug!(ops = ?OpId::ALL, "copy ops registered");
    Ok(Registration {
        ops: OpId::ALL.to_vec(),
        engine,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::CopyConfig;

    #[test]
    fn test_register_twice_fails() {
        let engine = Arc::new(CopyEngine::host_only(CopyConfig::default()));
        let mut table = OpTable::new();
        let registration = initialize_copy_ops(&mut table, engine.clone()).unwrap();
        assert!(OpId::ALL.iter().all(|&id| table.is_registered(id)));
        let err = initialize_copy_ops(&mut table, engine).unwrap_err();
        assert_eq!(err, CopyError::AlreadyRegistered { op: "copy" });
        table.unregister(registration);
        assert!(!table.is_registered(OpId::Cast));
    }

    #[test]
    fn test_copy_op_rejects_dtype_change() {
        let engine = Arc::new(CopyEngine::host_only(CopyConfig::default()));
        let mut table = OpTable::new();
        let _registration = initialize_copy_ops(&mut table, engine).unwrap();
        let src = [1i32, 2];
        let mut dst = [0f32; 2];
        let src = TensorView::contiguous(&src, &[2]).unwrap();
        let mut dst = TensorViewMut::contiguous(&mut dst, &[2]).unwrap();
        let opts = CopyOptions::blocking();
        assert!(matches!(
            table.invoke(OpId::Copy, &src, &mut dst, &opts),
            Err(CopyError::UnsupportedCast { .. })
        ));
        assert!(table.invoke(OpId::Cast, &src, &mut dst, &opts).is_ok());
    }

    #[test]
    fn test_to_device_requires_same_shape() {
        let engine = Arc::new(CopyEngine::host_only(CopyConfig::default()));
        let mut table = OpTable::new();
        let _registration = initialize_copy_ops(&mut table, engine).unwrap();
        let src = [1u8; 4];
        let mut dst = [0u8; 8];
        let src = TensorView::contiguous(&src, &[4]).unwrap();
        let mut dst = TensorViewMut::contiguous(&mut dst, &[2, 4]).unwrap();
        let err = table
            .invoke(OpId::ToDevice, &src, &mut dst, &CopyOptions::blocking())
            .unwrap_err();
        assert!(matches!(err, CopyError::Shape(ShapeError::Incompatible { .. })));
    }

    #[test]
    fn test_missing_op() {
        let table = OpTable::new();
        assert!(matches!(
            table.get(OpId::ToDevice),
            Err(CopyError::OpNotRegistered { op: "to_device" })
        ));
    }
}
