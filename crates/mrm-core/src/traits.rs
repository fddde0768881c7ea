//! Contracts with the external model-loading code
//!
//! The manager never touches model libraries directly. Each model type
//! registers a loader that performs the actual load/unload and reports the
//! footprint it ended up occupying.

use crate::{DeviceRef, ModelType, Result, Variant};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Trait for loading and unloading the model behind one model-type slot
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load the requested variant. May return the footprint actually occupied
    /// when it differs from the catalog estimate.
    async fn load(&self, request: &LoadRequest) -> Result<Option<Footprint>>;

    /// Unload whatever this loader holds for the model type
    async fn unload(&self, model_type: &ModelType, model_id: &str) -> Result<()>;
}

/// Everything a loader needs to bring a model up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_type: ModelType,
    pub model_id: String,
    pub device: DeviceRef,
    pub variant: Variant,
}

/// Memory a loaded model occupies, as confirmed by its loader
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Footprint {
    pub vram_gb: f64,
    pub ram_gb: f64,
}

impl Footprint {
    pub fn new(vram_gb: f64, ram_gb: f64) -> Self {
        Self { vram_gb, ram_gb }
    }
}

/// One recorded call against a [`MockModelLoader`]
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderCall {
    Load(ModelType, Variant),
    Unload(ModelType),
}

/// Mock loader that records calls and can be told to fail or stall
#[derive(Clone, Default)]
pub struct MockModelLoader {
    inner: Arc<MockLoaderInner>,
}

#[derive(Default)]
struct MockLoaderInner {
    calls: RwLock<Vec<LoaderCall>>,
    loaded: RwLock<HashMap<ModelType, String>>,
    behavior: RwLock<MockLoaderBehavior>,
}

/// Tunable behaviour of the mock loader
#[derive(Debug, Clone, Default)]
pub struct MockLoaderBehavior {
    /// Simulated load time
    pub load_delay: Duration,

    /// Simulated unload time
    pub unload_delay: Duration,

    /// Model types whose loads fail
    pub fail_loads: Vec<ModelType>,

    /// Model types whose unloads fail
    pub fail_unloads: Vec<ModelType>,

    /// Footprints reported back instead of the catalog estimate
    pub reported_footprints: HashMap<ModelType, Footprint>,
}

impl MockModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockLoaderBehavior) -> Self {
        Self {
            inner: Arc::new(MockLoaderInner {
                behavior: RwLock::new(behavior),
                ..Default::default()
            }),
        }
    }

    /// Replace the current behaviour
    pub async fn set_behavior(&self, behavior: MockLoaderBehavior) {
        *self.inner.behavior.write().await = behavior;
    }

    /// All calls received so far, in order
    pub async fn calls(&self) -> Vec<LoaderCall> {
        self.inner.calls.read().await.clone()
    }

    /// Model types unloaded so far, in order
    pub async fn unloaded(&self) -> Vec<ModelType> {
        self.inner
            .calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                LoaderCall::Unload(model_type) => Some(model_type.clone()),
                LoaderCall::Load(..) => None,
            })
            .collect()
    }

    /// Whether the mock currently holds the model type
    pub async fn is_loaded(&self, model_type: &ModelType) -> bool {
        self.inner.loaded.read().await.contains_key(model_type)
    }
}

#[async_trait]
impl ModelLoader for MockModelLoader {
    async fn load(&self, request: &LoadRequest) -> Result<Option<Footprint>> {
        let behavior = self.inner.behavior.read().await.clone();
        self.inner
            .calls
            .write()
            .await
            .push(LoaderCall::Load(request.model_type.clone(), request.variant.clone()));

        // Simulate loading time
        if !behavior.load_delay.is_zero() {
            tokio::time::sleep(behavior.load_delay).await;
        }

        if behavior.fail_loads.contains(&request.model_type) {
            return Err(crate::Error::loader(format!(
                "simulated load failure for {}",
                request.model_type
            )));
        }

        self.inner
            .loaded
            .write()
            .await
            .insert(request.model_type.clone(), request.model_id.clone());

        Ok(behavior.reported_footprints.get(&request.model_type).copied())
    }

    async fn unload(&self, model_type: &ModelType, _model_id: &str) -> Result<()> {
        let behavior = self.inner.behavior.read().await.clone();
        self.inner
            .calls
            .write()
            .await
            .push(LoaderCall::Unload(model_type.clone()));

        if !behavior.unload_delay.is_zero() {
            tokio::time::sleep(behavior.unload_delay).await;
        }

        if behavior.fail_unloads.contains(model_type) {
            return Err(crate::Error::loader(format!(
                "simulated unload failure for {}",
                model_type
            )));
        }

        self.inner.loaded.write().await.remove(model_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Precision;

    fn request(model_type: ModelType) -> LoadRequest {
        LoadRequest {
            model_type,
            model_id: "test-model".to_string(),
            device: DeviceRef::cuda(0),
            variant: Variant::accelerator(Precision::Fp16, 2.0, 0.5),
        }
    }

    #[tokio::test]
    async fn test_mock_loader_roundtrip() {
        let loader = MockModelLoader::new();

        assert!(!loader.is_loaded(&ModelType::Tts).await);
        let footprint = loader.load(&request(ModelType::Tts)).await.unwrap();
        assert!(footprint.is_none());
        assert!(loader.is_loaded(&ModelType::Tts).await);

        loader.unload(&ModelType::Tts, "test-model").await.unwrap();
        assert!(!loader.is_loaded(&ModelType::Tts).await);
        assert_eq!(loader.unloaded().await, vec![ModelType::Tts]);
        assert_eq!(loader.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_loader_failures() {
        let loader = MockModelLoader::with_behavior(MockLoaderBehavior {
            fail_loads: vec![ModelType::ImageGen],
            fail_unloads: vec![ModelType::Llm],
            ..Default::default()
        });

        let err = loader.load(&request(ModelType::ImageGen)).await.unwrap_err();
        assert_eq!(err.category(), "loader");
        assert!(!loader.is_loaded(&ModelType::ImageGen).await);

        loader.load(&request(ModelType::Llm)).await.unwrap();
        assert!(loader.unload(&ModelType::Llm, "test-model").await.is_err());
        assert!(loader.is_loaded(&ModelType::Llm).await);
    }

    #[tokio::test]
    async fn test_mock_loader_reports_footprint() {
        let mut reported = HashMap::new();
        reported.insert(ModelType::Stt, Footprint::new(1.5, 0.25));
        let loader = MockModelLoader::with_behavior(MockLoaderBehavior {
            reported_footprints: reported,
            ..Default::default()
        });

        let footprint = loader.load(&request(ModelType::Stt)).await.unwrap();
        assert_eq!(footprint, Some(Footprint::new(1.5, 0.25)));
    }
}
