//! Shared fixtures for pipeline-level unit tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::automation::AnalysisClient;
use crate::background::Background;
use crate::gateway::GatewayClient;
use crate::media::LocalBlobStore;
use crate::store::memory::MemoryStore;
use crate::types::{
    AppState, GatewayCredentials, Instance, InstanceSecrets, InstanceStatus, ProviderKind,
};

pub const CREDS_INSTANCE: &str = "sales";

pub fn instance() -> Instance {
    Instance {
        id: "i1".into(),
        name: "Sales".into(),
        instance_name: CREDS_INSTANCE.into(),
        instance_id_external: Some("ext-uuid-1".into()),
        provider: ProviderKind::SelfHosted,
        status: InstanceStatus::Disconnected,
    }
}

/// State over a seeded [`MemoryStore`] with analysis requests disabled. The
/// returned [`TempDir`] backs the media directory and must outlive the state.
pub async fn test_state(
    gateway_url: &str,
) -> (AppState, Arc<MemoryStore>, GatewayCredentials, TempDir) {
    test_state_with(gateway_url, None).await
}

pub async fn test_state_with(
    gateway_url: &str,
    analysis_url: Option<String>,
) -> (AppState, Arc<MemoryStore>, GatewayCredentials, TempDir) {
    let store = Arc::new(MemoryStore::new());
    let secrets = InstanceSecrets {
        api_url: gateway_url.to_string(),
        api_key: "gw-key".into(),
    };
    store.add_instance(instance());
    store.add_secrets("i1", secrets.clone());

    let media = tempfile::tempdir().unwrap();
    let media_dir = media.path().to_path_buf();
    let state = AppState {
        store: store.clone(),
        gateway: GatewayClient::new().unwrap(),
        blobs: Arc::new(LocalBlobStore::new(&media_dir, "http://localhost:4000")),
        analysis: AnalysisClient::new(analysis_url, "analysis-key".into()).unwrap(),
        background: Background::new(4),
        automation_threshold: 5,
        media_storage_dir: media_dir,
    };
    let creds = GatewayCredentials::new(&instance(), secrets);
    (state, store, creds, media)
}
