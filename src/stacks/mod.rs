//! Stack builders: one module per kind of stack declared in `ecsforge.yaml`.

pub mod app;
pub mod cluster;
pub mod pipeline;

use crate::core::error::SynthError;
use crate::resources::image::{PipelineImage, Placeholder};
use indexmap::IndexMap;
use std::rc::Rc;

/// Pipeline images by `(pipeline stack, image key)`, shared between the
/// pipeline stack that builds them and the app stacks that run them.
#[derive(Debug, Default)]
pub struct ImageCatalog {
    images: IndexMap<(String, String), Rc<PipelineImage>>,
}

impl ImageCatalog {
    pub fn register(&mut self, stack: &str, image: &str, built: Rc<PipelineImage>) {
        self.images
            .insert((stack.to_string(), image.to_string()), built);
    }

    pub fn get(&self, stack: &str, image: &str) -> Result<Rc<PipelineImage>, SynthError> {
        self.images
            .get(&(stack.to_string(), image.to_string()))
            .cloned()
            .ok_or_else(|| SynthError::UnknownImage {
                stack: stack.to_string(),
                image: image.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Every placeholder parameter allocated so far, grouped by image.
    pub fn placeholders(&self) -> Vec<Placeholder> {
        self.images
            .values()
            .flat_map(|image| image.placeholders())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::Stack;
    use crate::core::types::Environment;
    use crate::resources::ecr::Repository;

    #[test]
    fn test_catalog_lookup() {
        let stack = Stack::new("DevPipelineStack", &Environment::default());
        let image = Rc::new(PipelineImage::new(Rc::new(Repository::from_name(
            &stack,
            "devpipelinestack-app",
        ))));
        let mut catalog = ImageCatalog::default();
        assert!(catalog.is_empty());
        catalog.register("DevPipelineStack", "app", Rc::clone(&image));
        assert_eq!(catalog.len(), 1);
        assert!(Rc::ptr_eq(&catalog.get("DevPipelineStack", "app").unwrap(), &image));
        assert!(matches!(
            catalog.get("DevPipelineStack", "nginx").unwrap_err(),
            SynthError::UnknownImage { .. }
        ));
        assert!(catalog.placeholders().is_empty());
    }
}
