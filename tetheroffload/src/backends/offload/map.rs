// Kernel map access used by the map-based backend

use anyhow::Result;
use tetheroffload_common::{
    Tether4Key, Tether4Value, Tether6Value, TetherDownstream6Key, TetherLimitKey,
    TetherLimitValue, TetherStatsKey, TetherStatsValue, TetherUpstream6Key,
};

/// One fixed-layout kernel hash map
pub trait OffloadMap<K, V>: Send {
    /// Look up a key, `None` when absent
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Create an entry, failing if the key already exists
    fn insert(&mut self, key: K, value: V) -> Result<()>;

    /// Create or replace an entry
    fn update(&mut self, key: K, value: V) -> Result<()>;

    /// Delete an entry, `false` when it did not exist
    fn delete(&mut self, key: &K) -> Result<bool>;

    /// Visit every entry
    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) -> Result<()>;

    /// Delete every entry
    fn clear(&mut self) -> Result<()>;
}

pub type BoxedMap<K, V> = Box<dyn OffloadMap<K, V>>;

/// Result of probing the six tethering maps. A `None` entry could not be opened.
#[derive(Default)]
pub struct OffloadMaps {
    pub downstream4: Option<BoxedMap<Tether4Key, Tether4Value>>,
    pub upstream4: Option<BoxedMap<Tether4Key, Tether4Value>>,
    pub downstream6: Option<BoxedMap<TetherDownstream6Key, Tether6Value>>,
    pub upstream6: Option<BoxedMap<TetherUpstream6Key, Tether6Value>>,
    pub stats: Option<BoxedMap<TetherStatsKey, TetherStatsValue>>,
    pub limit: Option<BoxedMap<TetherLimitKey, TetherLimitValue>>,
}

/// All six maps, every one present
pub struct MapSet {
    pub downstream4: BoxedMap<Tether4Key, Tether4Value>,
    pub upstream4: BoxedMap<Tether4Key, Tether4Value>,
    pub downstream6: BoxedMap<TetherDownstream6Key, Tether6Value>,
    pub upstream6: BoxedMap<TetherUpstream6Key, Tether6Value>,
    pub stats: BoxedMap<TetherStatsKey, TetherStatsValue>,
    pub limit: BoxedMap<TetherLimitKey, TetherLimitValue>,
}

impl OffloadMaps {
    /// (label, opened) of every map
    pub fn availability(&self) -> [(&'static str, bool); 6] {
        [
            ("downstream4", self.downstream4.is_some()),
            ("upstream4", self.upstream4.is_some()),
            ("downstream6", self.downstream6.is_some()),
            ("upstream6", self.upstream6.is_some()),
            ("stats", self.stats.is_some()),
            ("limit", self.limit.is_some()),
        ]
    }

    /// Labels of the maps that could not be opened
    pub fn missing(&self) -> Vec<&'static str> {
        self.availability()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }

    /// Every map, or the labels of the missing ones
    pub fn complete(self) -> std::result::Result<MapSet, Vec<&'static str>> {
        let missing = self.missing();
        match self {
            OffloadMaps {
                downstream4: Some(downstream4),
                upstream4: Some(upstream4),
                downstream6: Some(downstream6),
                upstream6: Some(upstream6),
                stats: Some(stats),
                limit: Some(limit),
            } => Ok(MapSet {
                downstream4,
                upstream4,
                downstream6,
                upstream6,
                stats,
                limit,
            }),
            _ => Err(missing),
        }
    }
}

#[cfg(feature = "offload-ebpf")]
pub use aya_map::open_pinned_maps;

#[cfg(not(feature = "offload-ebpf"))]
pub fn open_pinned_maps(_config: &crate::config::Config) -> OffloadMaps {
    log::warn!("Kernel map support not compiled in (enable the offload-ebpf feature)");
    OffloadMaps::default()
}

#[cfg(feature = "offload-ebpf")]
mod aya_map {
    use super::{OffloadMap, OffloadMaps};
    use crate::config::Config;
    use anyhow::{Result, anyhow};
    use aya::Pod;
    use aya::maps::{HashMap as BpfHashMap, Map, MapData, MapError};
    use std::path::Path;

    const BPF_ANY: u64 = 0;
    const BPF_NOEXIST: u64 = 1;

    /// Pinned BPF hash map
    pub struct AyaMap<K: Pod, V: Pod> {
        name: String,
        map: BpfHashMap<MapData, K, V>,
    }

    impl<K: Pod, V: Pod> AyaMap<K, V> {
        pub fn open(path: &Path) -> Result<Self> {
            let map_data = MapData::from_pin(path)
                .map_err(|e| anyhow!("failed to open pinned map {:?}: {}", path, e))?;
            let map = Map::from_map_data(map_data)
                .map_err(|e| anyhow!("invalid map type for {:?}: {}", path, e))?;
            let map = BpfHashMap::<_, K, V>::try_from(map)
                .map_err(|e| anyhow!("failed to convert {:?} to HashMap: {}", path, e))?;
            Ok(Self {
                name: path.display().to_string(),
                map,
            })
        }
    }

    impl<K: Pod + Send, V: Pod + Send> OffloadMap<K, V> for AyaMap<K, V> {
        fn get(&self, key: &K) -> Result<Option<V>> {
            match self.map.get(key, 0) {
                Ok(value) => Ok(Some(value)),
                Err(MapError::KeyNotFound) => Ok(None),
                Err(e) => Err(anyhow!("{}: lookup failed: {}", self.name, e)),
            }
        }

        fn insert(&mut self, key: K, value: V) -> Result<()> {
            self.map
                .insert(key, value, BPF_NOEXIST)
                .map_err(|e| anyhow!("{}: insert failed: {}", self.name, e))
        }

        fn update(&mut self, key: K, value: V) -> Result<()> {
            self.map
                .insert(key, value, BPF_ANY)
                .map_err(|e| anyhow!("{}: update failed: {}", self.name, e))
        }

        fn delete(&mut self, key: &K) -> Result<bool> {
            if self.get(key)?.is_none() {
                return Ok(false);
            }
            self.map
                .remove(key)
                .map_err(|e| anyhow!("{}: delete failed: {}", self.name, e))?;
            Ok(true)
        }

        fn for_each(&self, f: &mut dyn FnMut(&K, &V)) -> Result<()> {
            for item in self.map.iter() {
                let (key, value) = item.map_err(|e| anyhow!("{}: iter error: {}", self.name, e))?;
                f(&key, &value);
            }
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            let keys = self
                .map
                .keys()
                .collect::<std::result::Result<Vec<K>, MapError>>()
                .map_err(|e| anyhow!("{}: iter error: {}", self.name, e))?;
            for key in keys {
                self.map
                    .remove(&key)
                    .map_err(|e| anyhow!("{}: delete failed: {}", self.name, e))?;
            }
            Ok(())
        }
    }

    fn open_boxed<K, V>(config: &Config, name: &str) -> Option<Box<dyn OffloadMap<K, V>>>
    where
        K: Pod + Send + 'static,
        V: Pod + Send + 'static,
    {
        let path = config.map_path(name);
        match AyaMap::<K, V>::open(&path) {
            Ok(map) => {
                log::debug!("Opened pinned map {:?}", path);
                Some(Box::new(map))
            }
            Err(e) => {
                log::warn!("⚠️  {:#}", e);
                None
            }
        }
    }

    /// Open the six pinned maps named in the configuration
    pub fn open_pinned_maps(config: &Config) -> OffloadMaps {
        let names = &config.map_names;
        OffloadMaps {
            downstream4: open_boxed(config, &names.downstream4),
            upstream4: open_boxed(config, &names.upstream4),
            downstream6: open_boxed(config, &names.downstream6),
            upstream6: open_boxed(config, &names.upstream6),
            stats: open_boxed(config, &names.stats),
            limit: open_boxed(config, &names.limit),
        }
    }
}
