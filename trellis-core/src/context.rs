//! Compute contexts.
//!
//! Every container carries the context it lives on and every kernel receives
//! one. Cross-context operations must copy explicitly; mixing contexts inside
//! a kernel is an error. Only a CPU context exists today; its bulk kernels
//! run on the rayon global pool.
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Cpu,
}

impl Context {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Context::Cpu)
    }

    pub fn same_context(&self, rhs: &Self, op: &'static str) -> Result<()> {
        if self != rhs {
            Err(Error::ContextMismatch {
                op,
                lhs: *self,
                rhs: *rhs,
            }
            .bt())
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::Cpu
    }
}
