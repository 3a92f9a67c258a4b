#![deny(missing_docs)]
//! Ties the content-addressed object store together with the peer-group mesh coordinator into
//! a single `Replica`, and carries the process-wide tracing setup a binary embedding this crate
//! would install once at startup.
mod demo;

pub use meshgraph_core::{
    ClassRegistry, Context, Hash, HashedObject, Identity, Literal, Resources, Store, StoreConfig,
};
pub use meshgraph_mesh::{
    sim, AgentState, Config as MeshConfig, Endpoint, MeshEvent, MeshStatsSnapshot, NetworkAgent,
    PeerGroupAgent, PeerInfo, PeerSource, SecureNetworkAgent,
};
pub use meshgraph_stream::AsyncStreamSource;

use anyhow::Result;
use meshgraph_core::store::memory::MemoryBackend;
use meshgraph_mesh::sim::{SimNetwork, SimPeerSource, SimSecureNetwork};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// One replica in the mesh: its local hashed-object store plus the peer group agent that
/// maintains its connections for a named group.
pub struct Replica<N, S, P> {
    identity: Arc<Identity>,
    store: Arc<Store>,
    mesh: Arc<PeerGroupAgent<N, S, P>>,
}

impl<N, S, P> Replica<N, S, P>
where
    N: NetworkAgent,
    S: SecureNetworkAgent,
    P: PeerSource,
{
    /// Builds a replica over an already-constructed store, registry, and peer group agent.
    /// Installs process-wide tracing exactly once, the way a binary embedding this crate would
    /// at startup.
    pub fn new(
        identity: Arc<Identity>,
        backend: Arc<dyn meshgraph_core::Backend>,
        registry: Arc<ClassRegistry>,
        store_config: StoreConfig,
        peer_group_id: impl Into<String>,
        local: PeerInfo,
        mesh_config: MeshConfig,
        network: Arc<N>,
        secure: Arc<S>,
        peer_source: Arc<P>,
    ) -> Result<Self> {
        install_tracing();
        let store = Store::new(backend, registry, store_config);
        let mesh = PeerGroupAgent::new(peer_group_id, local, mesh_config, network, secure, peer_source);
        Ok(Self { identity, store, mesh })
    }

    /// This replica's identity.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The local hashed-object store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The peer group agent maintaining this replica's mesh connections.
    pub fn mesh(&self) -> &Arc<PeerGroupAgent<N, S, P>> {
        &self.mesh
    }

    /// Starts listening and begins accepting tick cycles. Callers are expected to invoke
    /// `mesh().tick()` on their own schedule (e.g. an interval timer at `mesh_config.tick_interval`).
    pub async fn start(&self) -> Result<()> {
        self.mesh.start().await?;
        Ok(())
    }

    /// Tears down the mesh connections and marks the replica as shut down.
    pub async fn shutdown(&self) {
        self.mesh.shutdown().await;
    }
}

impl Replica<SimNetwork, SimSecureNetwork, SimPeerSource> {
    /// An in-memory replica for tests and demos: a `MemoryBackend`-backed store and a
    /// simulated transport trio, analogous to the teacher's own `memory()` constructors.
    pub fn memory(peer_group_id: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        install_tracing();
        let identity = Arc::new(Identity::generate("replica"));
        let backend = MemoryBackend::new("memory");
        let registry = Arc::new(ClassRegistry::new());
        let store = Store::new(backend, registry, StoreConfig::default());

        let endpoint = endpoint.into();
        let identity_hash = identity.hash()?;
        let local = PeerInfo::new(endpoint, identity_hash);
        let mesh = PeerGroupAgent::new(
            peer_group_id,
            local,
            MeshConfig::default(),
            Arc::new(SimNetwork::new()),
            Arc::new(SimSecureNetwork::new()),
            Arc::new(SimPeerSource::new()),
        );
        Ok(Self { identity, store, mesh })
    }
}

fn install_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn memory_replica_starts_with_no_peers() -> Result<()> {
        let replica = Replica::memory("lobby", "mem://a")?;
        replica.start().await?;
        assert!(replica.mesh().get_peers().is_empty());
        replica.shutdown().await;
        Ok(())
    }

    #[async_std::test]
    async fn memory_replica_can_save_and_load_an_object() -> Result<()> {
        let replica = Replica::memory("lobby", "mem://b")?;
        let note = crate::demo::Note::new("hello");
        let hash = replica.store().save(Box::new(note))?;
        let loaded = replica.store().load(hash)?;
        assert!(loaded.is_some());
        Ok(())
    }
}
