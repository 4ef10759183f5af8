use crate::{
    adapter::AdapterOverlay,
    mode::Mode,
    pipeline::DiffusionBackend,
    sampler::Integrator,
};

/// Everything a long-lived worker mutates between requests.
///
/// Built once at startup around an expensive-to-load backend. Not safe for concurrent
/// use: callers serialize access (the worker keeps it behind a mutex and runs one job
/// at a time).
pub struct ModelState<B> {
    backend: B,
    integrators: [Integrator; 3],
    adapter: AdapterOverlay,
    nsfw_filter_enabled: bool,
}

impl<B: DiffusionBackend> ModelState<B> {
    pub fn new(backend: B) -> Self {
        let base = backend.default_integrator();
        Self {
            backend,
            integrators: [base; 3],
            adapter: AdapterOverlay::default(),
            nsfw_filter_enabled: true,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The integrator the pipeline for `mode` currently runs with.
    pub fn integrator(&self, mode: Mode) -> &Integrator {
        &self.integrators[mode.index()]
    }

    pub fn set_integrator(&mut self, mode: Mode, integrator: Integrator) {
        self.integrators[mode.index()] = integrator;
    }

    pub fn adapter(&self) -> &AdapterOverlay {
        &self.adapter
    }

    pub fn adapter_loaded(&self) -> bool {
        self.adapter.is_loaded()
    }

    /// See [`AdapterOverlay::prepare`].
    pub fn prepare_adapter(
        &mut self,
        reference: Option<&str>,
        scale: f64,
    ) -> anyhow::Result<Option<f64>> {
        self.adapter.prepare(&mut self.backend, reference, scale)
    }

    pub fn nsfw_filter_enabled(&self) -> bool {
        self.nsfw_filter_enabled
    }

    pub fn set_nsfw_filter(&mut self, enabled: bool) {
        self.nsfw_filter_enabled = enabled;
    }
}
