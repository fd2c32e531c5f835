//! Engine configuration. A plain struct with a `Default` impl rather than a
//! builder or an external config-file format — there are only a handful of
//! knobs and every one of them is a tuning constant, not user input.

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Total value-stack slots (`frames_max * 256` in the reference
    /// implementation; kept as an independent knob here for tests that want
    /// a small stack to exercise overflow).
    pub stack_max: usize,
    /// Maximum simultaneous call frames.
    pub frames_max: usize,
    /// Multiplier applied to `bytesAllocated` after a sweep to compute the
    /// next collection threshold.
    pub gc_heap_grow_factor: usize,
    /// Initial `nextGC` threshold, in bytes, before the first collection.
    pub gc_initial_threshold: usize,
    /// When set, every allocation triggers a collection first. Used to
    /// shake out GC bugs in tests; far too slow for normal use.
    pub stress_gc: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_max: 64 * 256,
            frames_max: 64,
            gc_heap_grow_factor: 2,
            gc_initial_threshold: 1024 * 1024,
            stress_gc: false,
        }
    }
}

impl VmConfig {
    pub fn stress_gc() -> Self {
        Self { stress_gc: true, ..Self::default() }
    }
}
