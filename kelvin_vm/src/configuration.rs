//! VM configuration.

use crate::class_path::ClassPath;
use crate::error::Result;

/// Priority-to-timeslice multiplier: a thread runs
/// `priority * TIMESLICE_FACTOR` bytecodes per turn.
pub const TIMESLICE_FACTOR: u32 = 1000;

/// Usable stack cells in a freshly allocated stack chunk.
pub const STACK_CHUNK_CELLS: usize = 512;

/// Configuration for a [`crate::Vm`].
#[derive(Debug)]
pub struct Configuration {
    pub class_path: ClassPath,
    pub main_class: Option<String>,
    pub heap: kelvin_gc::Configuration,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            class_path: ClassPath::default(),
            main_class: None,
            heap: kelvin_gc::Configuration::default(),
        }
    }
}

/// Builder for [`Configuration`].
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    class_path: Option<ClassPath>,
    main_class: Option<String>,
    heap_cells: Option<usize>,
    collect_on_every_allocation: bool,
}

impl ConfigurationBuilder {
    #[must_use]
    pub fn new() -> Self {
        ConfigurationBuilder::default()
    }

    #[must_use]
    pub fn class_path(mut self, class_path: ClassPath) -> Self {
        self.class_path = Some(class_path);
        self
    }

    #[must_use]
    pub fn main_class<S: Into<String>>(mut self, main_class: S) -> Self {
        self.main_class = Some(main_class.into());
        self
    }

    #[must_use]
    pub fn heap_cells(mut self, heap_cells: usize) -> Self {
        self.heap_cells = Some(heap_cells);
        self
    }

    /// Debug stress mode: collect before every allocation.
    #[must_use]
    pub fn collect_on_every_allocation(mut self, enabled: bool) -> Self {
        self.collect_on_every_allocation = enabled;
        self
    }

    /// Finish the configuration.
    ///
    /// # Errors
    /// Reserved for validation of future options.
    pub fn build(self) -> Result<Configuration> {
        let mut heap = kelvin_gc::Configuration::default();
        if let Some(heap_cells) = self.heap_cells {
            heap = heap.with_heap_cells(heap_cells);
        }
        heap = heap.with_collect_on_every_allocation(self.collect_on_every_allocation);
        Ok(Configuration {
            class_path: self.class_path.unwrap_or_default(),
            main_class: self.main_class,
            heap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() -> Result<()> {
        let configuration = ConfigurationBuilder::new().main_class("Main").build()?;
        assert_eq!(configuration.main_class.as_deref(), Some("Main"));
        assert!(!configuration.heap.collect_on_every_allocation);
        Ok(())
    }

    #[test]
    fn test_builder_heap_cells() -> Result<()> {
        let configuration = ConfigurationBuilder::new().heap_cells(4096).build()?;
        assert_eq!(configuration.heap.heap_cells, 4096);
        Ok(())
    }
}
