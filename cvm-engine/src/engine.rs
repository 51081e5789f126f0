use std::sync::{Arc, PoisonError, RwLock};

use crate::cache::MethodCache;
use crate::config::EngineConfig;
use crate::converter::{CctorManager, InternalCalls, MethodCode, ModuleList, Thunk};
use crate::exception::{EngineError, EngineResult};
use crate::format::Word;
use crate::heap::Heap;
use crate::image::{Image, MethodId};
use crate::interp::Thread;
use crate::unroll;

pub struct Engine {
    image: Image,
    config: EngineConfig,
    heap: Heap,
    cache: Option<MethodCache>,
    internals: InternalCalls,
    modules: ModuleList,
    thunks: RwLock<Vec<Arc<Thunk>>>,
    cctors: CctorManager,
}

impl Engine {
    pub fn new(image: Image, config: EngineConfig) -> Self {
        Self::with_internals(image, config, InternalCalls::runtime())
    }

    pub fn with_internals(image: Image, config: EngineConfig, internals: InternalCalls) -> Self {
        unroll::init();
        let cache = if config.unroll.enabled {
            match MethodCache::new(config.unroll.cache_size) {
                Ok(cache) => Some(cache),
                Err(err) => {
                    tracing::warn!("unrolling disabled: {err}");
                    None
                }
            }
        } else {
            None
        };
        tracing::debug!(
            image = %image.name,
            encoding = config.encoding.name(),
            unroll = cache.is_some(),
            "engine started"
        );
        Self {
            image,
            config,
            heap: Heap::default(),
            cache,
            internals,
            modules: ModuleList::new(),
            thunks: RwLock::new(Vec::new()),
            cctors: CctorManager::new(),
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn cache(&self) -> Option<&MethodCache> {
        self.cache.as_ref()
    }

    pub fn internals(&self) -> &InternalCalls {
        &self.internals
    }

    pub fn modules(&self) -> &ModuleList {
        &self.modules
    }

    pub fn cctors(&self) -> &CctorManager {
        &self.cctors
    }

    pub fn unrolling(&self) -> bool {
        self.cache.is_some()
    }

    pub(crate) fn add_thunk(&self, thunk: Thunk) -> u32 {
        let mut thunks = self.thunks.write().unwrap_or_else(PoisonError::into_inner);
        thunks.push(Arc::new(thunk));
        thunks.len() as u32 - 1
    }

    pub fn thunk(&self, index: u32) -> Option<Arc<Thunk>> {
        self.thunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index as usize)
            .cloned()
    }

    pub fn thunk_count(&self) -> usize {
        self.thunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn converted(&self, id: MethodId) -> Option<Arc<MethodCode>> {
        self.image.method(id).and_then(|method| method.entry().cloned())
    }

    pub fn thread(&self) -> Thread<'_> {
        Thread::new(self)
    }

    pub fn run(&self, name: &str, args: &[Word]) -> EngineResult<Vec<Word>> {
        let id = self
            .image
            .find_method(name)
            .ok_or_else(|| EngineError::InvalidImage(format!("no method named '{name}'")))?;
        self.thread().invoke(id, args)
    }

    pub fn run_main(&self) -> EngineResult<Vec<Word>> {
        self.run("main", &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnrollConfig;

    fn assert_sync<T: Send + Sync>() {}

    #[test]
    fn engine_is_shared_between_threads() {
        assert_sync::<Engine>();
    }

    #[test]
    fn disabled_unrolling_allocates_no_cache() {
        let config = EngineConfig {
            unroll: UnrollConfig {
                enabled: false,
                ..UnrollConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = Engine::new(Image::new("empty"), config);
        assert!(engine.cache().is_none());
        assert!(!engine.unrolling());
    }

    #[test]
    fn unknown_entry_point_is_an_image_error() {
        let engine = Engine::new(Image::new("empty"), EngineConfig::default());
        assert!(matches!(
            engine.run("main", &[]),
            Err(EngineError::InvalidImage(_))
        ));
    }
}
