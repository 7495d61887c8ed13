use crate::{
    autograd::Variable4,
    model::{Forward, LayerKind, Network},
};
use anyhow::Result;
use std::collections::BTreeMap;

/// Layer selector: which layer instances contribute activations.
///
/// Maps a layer kind to the 0-based occurrence indices of that kind, eg
/// `{ReLU: [0, 2, 4]}` selects the first, third and fifth ReLU in traversal
/// order.
pub type LayerSelector = BTreeMap<LayerKind, Vec<usize>>;

/// Invalid layer selector.
///
/// Selectors are rejected before any forward pass.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    /// The selector names no layers.
    #[error("a layer selector must name at least one layer")]
    Empty,
    /// The selected kind does not occur in the network.
    #[error("{kind} not found in this network")]
    UnknownLayer {
        /// The missing kind.
        kind: LayerKind,
    },
    /// An occurrence index exceeds the instance count.
    #[error("{kind} index {index} out of range, network has {count} instance(s)")]
    IndexOutOfRange {
        /// The selected kind.
        kind: LayerKind,
        /// The offending index.
        index: usize,
        /// Instances of `kind` in the network.
        count: usize,
    },
}

/// Validates `selector` against `network`.
///
/// **Errors**
///
/// See [`SelectorError`].
pub fn validate_selector(network: &Network, selector: &LayerSelector) -> Result<(), SelectorError> {
    if selector.is_empty() || selector.values().all(|indices| indices.is_empty()) {
        return Err(SelectorError::Empty);
    }
    let counts = network.kind_counts();
    for (kind, indices) in selector.iter() {
        let count = counts
            .get(kind)
            .copied()
            .ok_or(SelectorError::UnknownLayer { kind: *kind })?;
        if let Some(&index) = indices.iter().find(|index| **index >= count) {
            return Err(SelectorError::IndexOutOfRange {
                kind: *kind,
                index,
                count,
            });
        }
    }
    Ok(())
}

/// Feature extractor.
///
/// Wraps a [`Network`] and a validated [`LayerSelector`]; each call to
/// [`.extract()`](Self::extract) runs a forward pass and returns the selected
/// activations in traversal order as an explicit return value. Activations
/// from a previous pass are simply dropped with the variables that held them.
#[derive(Debug)]
pub struct FeatureExtractor {
    network: Network,
    selected: Vec<usize>,
}

impl FeatureExtractor {
    /// Creates an extractor for `network` and `selector`.
    ///
    /// **Errors**
    ///
    /// Fails fast with [`SelectorError`] if the selector does not fit the
    /// network; no forward pass is performed.
    pub fn new(network: Network, selector: &LayerSelector) -> Result<Self, SelectorError> {
        validate_selector(&network, selector)?;
        let mut occurrences: BTreeMap<LayerKind, usize> = BTreeMap::new();
        let mut selected = Vec::new();
        for (i, layer) in network.layers().iter().enumerate() {
            let kind = layer.kind();
            let occurrence = occurrences.entry(kind).or_insert(0);
            if selector
                .get(&kind)
                .map(|indices| indices.contains(occurrence))
                .unwrap_or(false)
            {
                selected.push(i);
            }
            *occurrence += 1;
        }
        Ok(Self { network, selected })
    }
    /// The underlying network.
    pub fn network(&self) -> &Network {
        &self.network
    }
    /// The number of selected layers.
    pub fn selected_len(&self) -> usize {
        self.selected.len()
    }
    /// Runs a forward pass and returns the selected activations.
    ///
    /// The pass stops after the last selected layer; deeper layers cannot
    /// contribute to the loss.
    ///
    /// **Errors**
    ///
    /// Returns an error if the input shape is incompatible with the network.
    pub fn extract(&self, input: &Variable4) -> Result<Vec<Variable4>> {
        let last = self.selected.last().copied().unwrap_or(0);
        let mut activations = Vec::with_capacity(self.selected.len());
        let mut output = input.clone();
        for (i, layer) in self.network.layers().iter().enumerate().take(last + 1) {
            output = layer.forward(output)?;
            if self.selected.contains(&i) {
                activations.push(output.clone());
            }
        }
        Ok(activations)
    }
}
