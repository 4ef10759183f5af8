//! LoRA overlay bookkeeping.
//!
//! An adapter is merged into the weights shared by every pipeline and stays there
//! after the request that asked for it. Unloading is too expensive to do per request,
//! so a later request without an adapter runs with an attention scale of zero instead.

use tracing::{debug, info};

use crate::pipeline::DiffusionBackend;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOverlay {
    merged: Option<String>,
}

impl AdapterOverlay {
    pub fn is_loaded(&self) -> bool {
        self.merged.is_some()
    }

    /// Identifier of the adapter currently merged into the shared weights.
    pub fn merged(&self) -> Option<&str> {
        self.merged.as_deref()
    }

    /// Bring the overlay in line with a request and return the attention scale its
    /// generation call must use.
    ///
    /// The bookkeeping is only updated once the backend reports a successful load.
    pub fn prepare<B: DiffusionBackend>(
        &mut self,
        backend: &mut B,
        reference: Option<&str>,
        scale: f64,
    ) -> anyhow::Result<Option<f64>> {
        match reference {
            Some(reference) => {
                if self.merged.as_deref() == Some(reference) {
                    debug!(adapter = reference, "adapter already merged");
                } else {
                    backend.load_adapter(reference)?;
                    info!(adapter = reference, replaced = ?self.merged, "merged adapter");
                    self.merged = Some(reference.to_string());
                }
                Ok(Some(scale))
            }
            None if self.is_loaded() => {
                debug!(adapter = ?self.merged, "neutralizing merged adapter");
                Ok(Some(0.0))
            }
            None => Ok(None),
        }
    }
}
