//! Code-ownership leases
//!
//! Every component or system built from a loaded module carries a [`Lease`]
//! on the context that owns its code. The context can only be proven
//! unreachable once every lease pointing at it has been dropped.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Owner of the code backing a set of instances (one module generation).
pub trait CodeOwner: Send + Sync + 'static {
    /// Generation of the module this owner was loaded for.
    fn generation(&self) -> u64;

    /// Path of the artifact the code was loaded from.
    fn origin(&self) -> &Path;
}

/// Strong reference from an instance to the code that defines it.
#[derive(Clone)]
pub struct Lease {
    owner: Arc<dyn CodeOwner>,
}

impl Lease {
    pub fn new(owner: Arc<dyn CodeOwner>) -> Self {
        Self { owner }
    }

    pub fn generation(&self) -> u64 {
        self.owner.generation()
    }

    pub fn origin(&self) -> &Path {
        self.owner.origin()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.generation())
            .field("origin", &self.origin())
            .finish()
    }
}
