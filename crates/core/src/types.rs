use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Environment a distribution is deployed into (e.g. "dev", "prod")
    Environment
);

string_id!(
    /// Name of a deployable distribution
    DistributionName
);

string_id!(
    /// Logical deployment target, `"{environment}-{distribution}"`
    DeploymentName
);

string_id!(
    /// Content-addressed identity of a deployed artifact
    ObjectIdentifier
);

string_id!(
    /// Opaque, globally unique identifier of one workflow execution
    ExecutionId
);

string_id!(
    /// Identifier of a workflow definition (state machine)
    WorkflowId
);

string_id!(
    /// Stable key for a logical attempt, derived from an execution id
    AttemptKey
);

impl DeploymentName {
    /// Derive the deployment target name for an environment and distribution
    pub fn for_target(environment: &Environment, distribution: &DistributionName) -> Self {
        Self(format!("{}-{}", environment, distribution))
    }
}

impl ObjectIdentifier {
    /// Identity of an artifact computed from its bytes (SHA-256, hex encoded)
    pub fn from_artifact(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Self(hex::encode(Sha256::digest(data)))
    }
}

impl AttemptKey {
    /// Derive the attempt key from an execution id.
    ///
    /// The trailing `:`-separated segment is the invocation-unique part and is
    /// dropped; the segment before it becomes the key. For
    /// `arn:aws:states:eu-west-1:111:execution:deploy-plan:4f1c` the key is
    /// `deploy-plan`. An id without any `:` is used whole.
    pub fn from_execution(execution: &ExecutionId) -> Self {
        let id = execution.as_str();
        let Some((without_suffix, _)) = id.rsplit_once(':') else {
            return Self(id.to_string());
        };
        let key = without_suffix
            .rsplit_once(':')
            .map(|(_, last)| last)
            .unwrap_or(without_suffix);
        Self(key.to_string())
    }
}

/// Deploy time reserved for the template/default row of a deployment target
pub const TEMPLATE_DEPLOY_TIME: u64 = 0;

/// Primary key of a deployment record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub deployment_name: DeploymentName,
    pub deploy_time: u64,
}

impl RecordKey {
    pub fn new(deployment_name: DeploymentName, deploy_time: u64) -> Self {
        Self {
            deployment_name,
            deploy_time,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.deployment_name, self.deploy_time)
    }
}

/// One deploy attempt of a deployment target.
///
/// Rows are created by origin registration and afterwards only mutated through
/// targeted attribute updates, never replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub deployment_name: DeploymentName,
    /// Epoch millis; `0` marks the template row
    #[serde(rename = "deploymentTime")]
    pub deploy_time: u64,
    pub object_identifier: ObjectIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_name: Option<DistributionName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_id: Option<String>,
    #[serde(default)]
    pub execution_arns: BTreeMap<AttemptKey, ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub distribution_tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub stack_name: String,
    #[serde(default)]
    pub sam_packaged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_plan_status: Option<String>,
}

impl DeploymentRecord {
    /// Minimal record for a deploy attempt; optional attributes start empty
    pub fn new(
        deployment_name: DeploymentName,
        deploy_time: u64,
        object_identifier: ObjectIdentifier,
        stack_name: impl Into<String>,
    ) -> Self {
        Self {
            deployment_name,
            deploy_time,
            object_identifier,
            environment: None,
            distribution_name: None,
            distribution_id: None,
            execution_arns: BTreeMap::new(),
            error_message: None,
            error_code: None,
            distribution_tags: BTreeMap::new(),
            version: None,
            stack_name: stack_name.into(),
            sam_packaged: false,
            deployment_plan_status: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.deployment_name.clone(), self.deploy_time)
    }

    pub fn is_template(&self) -> bool {
        self.deploy_time == TEMPLATE_DEPLOY_TIME
    }

    pub fn deployed_at(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.deploy_time)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }

    pub fn records_execution(&self, execution: &ExecutionId) -> bool {
        self.execution_arns.values().any(|arn| arn == execution)
    }
}
