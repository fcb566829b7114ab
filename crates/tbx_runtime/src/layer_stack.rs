//! The ordered set of layers an app updates each frame.

use std::sync::Arc;
use tbx_core::{Layer, Uid};
use tracing::debug;

/// Identifies a layer on a [`LayerStack`].
pub type LayerId = Uid;

/// Normal layers followed by overlays, each group in push order.
///
/// Pushing calls the layer's `on_attach` before returning; popping calls
/// `on_detach`.
#[derive(Default)]
pub struct LayerStack {
    layers: Vec<(LayerId, Arc<dyn Layer>)>,
    overlay_start: usize,
}

impl std::fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|(id, layer)| (id, layer.name())))
            .finish()
    }
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a normal layer after the other normal layers.
    pub fn push_layer(&mut self, layer: Arc<dyn Layer>) -> LayerId {
        let id = LayerId::new();
        layer.on_attach();
        debug!("Attached layer {}", layer.name());
        self.layers.insert(self.overlay_start, (id, layer));
        self.overlay_start += 1;
        id
    }

    /// Adds an overlay after every other layer.
    pub fn push_overlay(&mut self, layer: Arc<dyn Layer>) -> LayerId {
        let id = LayerId::new();
        layer.on_attach();
        debug!("Attached overlay {}", layer.name());
        self.layers.push((id, layer));
        id
    }

    /// Pushes as a layer or an overlay, as the layer asks.
    pub fn push(&mut self, layer: Arc<dyn Layer>) -> LayerId {
        if layer.is_overlay() {
            self.push_overlay(layer)
        } else {
            self.push_layer(layer)
        }
    }

    /// Detaches and removes the layer `id`.
    pub fn pop_layer(&mut self, id: LayerId) -> Option<Arc<dyn Layer>> {
        let index = self.layers.iter().position(|(layer_id, _)| *layer_id == id)?;
        if index < self.overlay_start {
            self.overlay_start -= 1;
        }
        let (_, layer) = self.layers.remove(index);
        layer.on_detach();
        debug!("Detached layer {}", layer.name());
        Some(layer)
    }

    /// Detaches every layer, last pushed overlay first.
    pub fn clear(&mut self) {
        while let Some((_, layer)) = self.layers.pop() {
            layer.on_detach();
            debug!("Detached layer {}", layer.name());
        }
        self.overlay_start = 0;
    }

    /// Layers in update order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<dyn Layer>> + '_ {
        self.layers.iter().map(|(_, layer)| layer)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn overlay_count(&self) -> usize {
        self.layers.len() - self.overlay_start
    }
}
