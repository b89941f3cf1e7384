//! Resolution of chaincode definitions. Implemented outside this crate.

use crate::ccprovider::ChaincodeContainerInfo;

/// A committed chaincode definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeDefinition {
    pub name: String,
    pub version: String,
    pub hash: Vec<u8>,
    pub endorsement_plugin: String,
    pub validation_plugin: String,
}

/// Read access to world state, used to look definitions up.
pub trait QueryExecutor: Send + Sync {
    fn get_state(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    async fn chaincode_definition(
        &self,
        name: &str,
        query_executor: &dyn QueryExecutor,
    ) -> anyhow::Result<ChaincodeDefinition>;

    /// Container info of the chaincode instantiated as `name` on `channel_id`.
    async fn chaincode_container_info(
        &self,
        channel_id: &str,
        name: &str,
    ) -> anyhow::Result<ChaincodeContainerInfo>;
}
