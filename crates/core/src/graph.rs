//! Per-frame pass graph.
//!
//! Each upscale invocation records its stages as passes over a shared
//! resource arena, then executes them in dependency order. Dependencies are
//! derived from declared reads and writes: a pass reading a resource runs
//! after the last pass that wrote it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use tracing::trace;

use crate::types::{TensorBuf, TensorDtype, Texture, TextureDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

enum Resource {
    Texture(Arc<Texture>),
    Tensor(TensorBuf),
}

/// Arena of frame-lifetime textures and tensors, addressed by [`ResourceId`].
#[derive(Default)]
pub struct FrameResources {
    slots: Vec<Option<Resource>>,
}

impl FrameResources {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, resource: Resource) -> ResourceId {
        self.slots.push(Some(resource));
        ResourceId(self.slots.len() - 1)
    }

    /// Registers an externally produced texture.
    pub fn import_texture(&mut self, texture: Arc<Texture>) -> ResourceId {
        self.push(Resource::Texture(texture))
    }

    /// Declares a zero-initialized transient texture.
    pub fn declare_texture(&mut self, desc: TextureDesc) -> ResourceId {
        self.push(Resource::Texture(Arc::new(Texture::new(
            desc.extent,
            desc.format,
        ))))
    }

    /// Declares a zero-initialized transient tensor.
    pub fn declare_tensor(&mut self, dtype: TensorDtype, shape: [usize; 4]) -> ResourceId {
        self.push(Resource::Tensor(TensorBuf::zeroed(dtype, shape)))
    }

    fn slot(&self, id: ResourceId) -> Result<&Resource> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("resource {} is absent or currently taken", id.0))
    }

    pub fn texture(&self, id: ResourceId) -> Result<&Arc<Texture>> {
        match self.slot(id)? {
            Resource::Texture(texture) => Ok(texture),
            Resource::Tensor(_) => bail!("resource {} is a tensor, expected a texture", id.0),
        }
    }

    pub fn tensor(&self, id: ResourceId) -> Result<&TensorBuf> {
        match self.slot(id)? {
            Resource::Tensor(tensor) => Ok(tensor),
            Resource::Texture(_) => bail!("resource {} is a texture, expected a tensor", id.0),
        }
    }

    /// Removes a texture for in-place mutation; pair with [`put_texture`].
    /// Unwraps the shared handle, cloning only if it is still aliased.
    ///
    /// [`put_texture`]: FrameResources::put_texture
    pub fn take_texture(&mut self, id: ResourceId) -> Result<Texture> {
        match self.slots.get_mut(id.0).and_then(Option::take) {
            Some(Resource::Texture(texture)) => {
                Ok(Arc::try_unwrap(texture).unwrap_or_else(|shared| (*shared).clone()))
            }
            Some(resource) => {
                self.slots[id.0] = Some(resource);
                bail!("resource {} is a tensor, expected a texture", id.0)
            }
            None => bail!("resource {} is absent or currently taken", id.0),
        }
    }

    pub fn put_texture(&mut self, id: ResourceId, texture: Texture) {
        self.replace_texture(id, Arc::new(texture));
    }

    pub fn replace_texture(&mut self, id: ResourceId, texture: Arc<Texture>) {
        self.slots[id.0] = Some(Resource::Texture(texture));
    }

    pub fn take_tensor(&mut self, id: ResourceId) -> Result<TensorBuf> {
        match self.slots.get_mut(id.0).and_then(Option::take) {
            Some(Resource::Tensor(tensor)) => Ok(tensor),
            Some(resource) => {
                self.slots[id.0] = Some(resource);
                bail!("resource {} is a texture, expected a tensor", id.0)
            }
            None => bail!("resource {} is absent or currently taken", id.0),
        }
    }

    pub fn put_tensor(&mut self, id: ResourceId, tensor: TensorBuf) {
        self.slots[id.0] = Some(Resource::Tensor(tensor));
    }
}

type PassFn<'a> = Box<dyn FnOnce(&mut FrameResources) -> Result<()> + 'a>;

struct Pass<'a> {
    name: &'static str,
    run: Option<PassFn<'a>>,
}

/// Recorded passes for one frame. Consumed by [`execute`].
///
/// [`execute`]: FrameGraph::execute
#[derive(Default)]
pub struct FrameGraph<'a> {
    graph: StableDiGraph<Pass<'a>, ResourceId>,
    last_writer: HashMap<ResourceId, NodeIndex>,
}

impl<'a> FrameGraph<'a> {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            last_writer: HashMap::new(),
        }
    }

    pub fn add_pass(
        &mut self,
        name: &'static str,
        reads: &[ResourceId],
        writes: &[ResourceId],
        run: impl FnOnce(&mut FrameResources) -> Result<()> + 'a,
    ) -> NodeIndex {
        let index = self.graph.add_node(Pass {
            name,
            run: Some(Box::new(run)),
        });
        for read in reads {
            if let Some(writer) = self.last_writer.get(read) {
                if *writer != index && self.graph.find_edge(*writer, index).is_none() {
                    self.graph.add_edge(*writer, index, *read);
                }
            }
        }
        for write in writes {
            self.last_writer.insert(*write, index);
        }
        index
    }

    pub fn pass_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn execution_order(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|_| anyhow!("cycle detected in frame graph"))
    }

    /// Runs every pass in dependency order against `resources`.
    pub fn execute(mut self, resources: &mut FrameResources) -> Result<()> {
        let order = self.execution_order()?;
        for index in order {
            let pass = self
                .graph
                .node_weight_mut(index)
                .ok_or_else(|| anyhow!("pass index invalidated during execution"))?;
            let name = pass.name;
            let run = pass
                .run
                .take()
                .ok_or_else(|| anyhow!("pass '{name}' already executed"))?;
            trace!(pass = name, "executing pass");
            run(resources).with_context(|| format!("pass '{name}' failed"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Extent, TextureFormat};
    use std::cell::RefCell;

    fn r32f(extent: Extent) -> TextureDesc {
        TextureDesc {
            extent,
            format: TextureFormat::R32F,
        }
    }

    #[test]
    fn test_passes_run_in_dependency_order() {
        let mut resources = FrameResources::new();
        let a = resources.declare_texture(r32f(Extent::new(2, 2)));
        let b = resources.declare_texture(r32f(Extent::new(2, 2)));

        let log = RefCell::new(Vec::new());
        let mut graph = FrameGraph::new();
        graph.add_pass("produce", &[], &[a], |res| {
            log.borrow_mut().push("produce");
            let mut texture = res.take_texture(a)?;
            texture.texel_mut(0, 0)[0] = 5.0;
            res.put_texture(a, texture);
            Ok(())
        });
        graph.add_pass("transform", &[a], &[b], |res| {
            log.borrow_mut().push("transform");
            let value = res.texture(a)?.texel(0, 0)[0];
            let mut texture = res.take_texture(b)?;
            texture.texel_mut(0, 0)[0] = value * 2.0;
            res.put_texture(b, texture);
            Ok(())
        });
        graph.add_pass("consume", &[b], &[], |res| {
            log.borrow_mut().push("consume");
            assert_eq!(res.texture(b)?.texel(0, 0)[0], 10.0);
            Ok(())
        });

        graph.execute(&mut resources).expect("graph execution");
        assert_eq!(*log.borrow(), vec!["produce", "transform", "consume"]);
    }

    #[test]
    fn test_pass_with_multiple_reads_waits_for_every_writer() {
        let mut resources = FrameResources::new();
        let a = resources.declare_texture(r32f(Extent::new(1, 1)));
        let b = resources.declare_texture(r32f(Extent::new(1, 1)));

        let mut graph = FrameGraph::new();
        let write_a = graph.add_pass("write_a", &[], &[a], |_| Ok(()));
        let write_b = graph.add_pass("write_b", &[], &[b], |_| Ok(()));
        let join = graph.add_pass("join", &[a, b], &[], |_| Ok(()));

        let order = graph.execution_order().expect("order");
        let pos = |n| order.iter().position(|i| *i == n).expect("scheduled");
        assert!(pos(write_a) < pos(join));
        assert!(pos(write_b) < pos(join));
    }

    #[test]
    fn test_failing_pass_reports_its_name() {
        let mut resources = FrameResources::new();
        let mut graph = FrameGraph::new();
        graph.add_pass("exploding", &[], &[], |_| anyhow::bail!("boom"));

        let error = graph
            .execute(&mut resources)
            .expect_err("failing pass should propagate");
        let message = format!("{error:#}");
        assert!(message.contains("pass 'exploding' failed"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_taken_resource_is_unreadable_until_put_back() {
        let mut resources = FrameResources::new();
        let id = resources.declare_texture(r32f(Extent::new(1, 1)));
        let texture = resources.take_texture(id).expect("take texture");
        assert!(resources.texture(id).is_err());
        resources.put_texture(id, texture);
        assert!(resources.texture(id).is_ok());
    }

    #[test]
    fn test_resource_kind_mismatch_is_an_error() {
        let mut resources = FrameResources::new();
        let texture = resources.declare_texture(r32f(Extent::new(1, 1)));
        let tensor = resources.declare_tensor(TensorDtype::F32, [1, 1, 1, 4]);
        assert!(resources.tensor(texture).is_err());
        assert!(resources.texture(tensor).is_err());
        // A failed typed take must not consume the slot.
        assert!(resources.take_tensor(texture).is_err());
        assert!(resources.texture(texture).is_ok());
    }

    #[test]
    fn test_read_without_writer_adds_no_edge() {
        let mut resources = FrameResources::new();
        let imported = resources.import_texture(Arc::new(Texture::new(
            Extent::new(1, 1),
            TextureFormat::R32F,
        )));

        let mut graph = FrameGraph::new();
        graph.add_pass("reader", &[imported], &[], |_| Ok(()));
        assert_eq!(graph.execution_order().expect("order").len(), 1);
    }
}
