// kv_cache.rs
// Per-layer key/value cache of one generation call. Each forward returns a new
// cache whose entries are the old keys/values with the current step appended
// along the sequence axis.

#![forbid(unsafe_code)]

use ndarray::Array2;

#[derive(Clone, Debug)]
pub struct LayerKv {
    pub keys: Array2<f32>,   // [len, hidden]
    pub values: Array2<f32>, // [len, hidden]
}

impl LayerKv {
    pub fn len(&self) -> usize {
        self.keys.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.nrows() == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct KvCache {
    layers: Vec<LayerKv>,
}

impl KvCache {
    pub fn with_layers(layers: Vec<LayerKv>) -> Self {
        Self { layers }
    }

    /// Number of cached positions (identical across layers).
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, LayerKv::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, i_layer: usize) -> Option<&LayerKv> {
        self.layers.get(i_layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_has_no_positions() {
        let cache = KvCache::default();
        assert!(cache.is_empty());
        assert_eq!(cache.num_layers(), 0);
        assert!(cache.layer(0).is_none());
    }

    #[test]
    fn length_comes_from_first_layer() {
        let kv = LayerKv {
            keys: Array2::zeros((3, 4)),
            values: Array2::zeros((3, 4)),
        };
        let cache = KvCache::with_layers(vec![kv.clone(), kv]);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.num_layers(), 2);
    }
}
