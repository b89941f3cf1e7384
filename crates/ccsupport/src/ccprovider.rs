//! Descriptors of chaincodes and of the invocations made against them.

use std::collections::BTreeMap;
use std::fmt;

use ccwire::ChaincodeId;
use ccwire::ChaincodeInput;

/// Key under which a chaincode is registered: `name:version`.
///
/// The channel does not participate; one running chaincode serves every
/// channel it is instantiated on.
pub fn canonical_name(name: &str, version: &str) -> String {
    if version.is_empty() {
        name.to_string()
    } else {
        format!("{}:{}", name, version)
    }
}

/// Where a chaincode executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExecutionEnvironment {
    #[default]
    Docker,
    /// In-process system chaincode; no code package.
    System,
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("DOCKER"),
            Self::System => f.write_str("SYSTEM"),
        }
    }
}

/// Language of a chaincode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChaincodeType {
    #[default]
    Undefined,
    Golang,
    Node,
    Car,
    Java,
}

impl fmt::Display for ChaincodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "UNDEFINED",
            Self::Golang => "GOLANG",
            Self::Node => "NODE",
            Self::Car => "CAR",
            Self::Java => "JAVA",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeSpec {
    pub chaincode_type: ChaincodeType,
    pub chaincode_id: ChaincodeId,
    pub input: ChaincodeInput,
}

impl ChaincodeSpec {
    pub fn name(&self) -> &str {
        &self.chaincode_id.name
    }
}

/// What is being deployed, as submitted with an instantiate/upgrade proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeDeploymentSpec {
    pub chaincode_spec: Option<ChaincodeSpec>,
    pub exec_env: ExecutionEnvironment,
}

impl ChaincodeDeploymentSpec {
    /// Builds container info straight from the deployment, without asking
    /// the lifecycle (the definition may not be committed yet).
    pub fn container_info(&self) -> Option<ChaincodeContainerInfo> {
        let spec = self.chaincode_spec.as_ref()?;
        Some(ChaincodeContainerInfo {
            name: spec.chaincode_id.name.clone(),
            version: spec.chaincode_id.version.clone(),
            path: spec.chaincode_id.path.clone(),
            chaincode_type: spec.chaincode_type,
            container_type: self.exec_env,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeInvocationSpec {
    pub chaincode_spec: Option<ChaincodeSpec>,
}

/// Everything needed to start a chaincode. Produced by the lifecycle, or from
/// a deployment spec on the init path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeContainerInfo {
    pub name: String,
    pub version: String,
    pub path: String,
    pub chaincode_type: ChaincodeType,
    pub container_type: ExecutionEnvironment,
}

impl ChaincodeContainerInfo {
    pub fn canonical_name(&self) -> String {
        canonical_name(&self.name, &self.version)
    }

    pub fn chaincode_id(&self) -> ChaincodeId {
        ChaincodeId {
            name: self.name.clone(),
            version: self.version.clone(),
            path: self.path.clone(),
        }
    }
}

/// Context of one invocation. Created by the caller and never mutated here;
/// `txid` correlates the request with its response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CCContext {
    pub chain_id: String,
    pub name: String,
    pub version: String,
    pub txid: String,
    pub syscc: bool,
    pub proposal_decorations: BTreeMap<String, Vec<u8>>,
}

impl CCContext {
    pub fn new(
        chain_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        txid: impl Into<String>,
        syscc: bool,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            name: name.into(),
            version: version.into(),
            txid: txid.into(),
            syscc,
            proposal_decorations: BTreeMap::new(),
        }
    }

    pub fn with_decorations(mut self, decorations: BTreeMap<String, Vec<u8>>) -> Self {
        self.proposal_decorations = decorations;
        self
    }

    pub fn canonical_name(&self) -> String {
        canonical_name(&self.name, &self.version)
    }
}

impl fmt::Display for CCContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain={},chaincode={},version={},txid={},syscc={}",
            self.chain_id, self.name, self.version, self.txid, self.syscc
        )
    }
}
