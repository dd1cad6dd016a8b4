//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler,
//! including the Kubernetes client, event recorder, management server
//! connector and health state.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};

use crate::controller::error::Error;
use crate::crd::NdbCluster;
use crate::health::HealthState;
use crate::mgmapi::client::MgmTcpConnector;
use crate::mgmapi::MgmConnector;
use crate::resources::secret::ROOT_PASSWORD_KEY;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "ndb-operator";

/// Event reasons published by the controller.
pub const REASON_SYNC_SUCCESS: &str = "SyncSuccess";
pub const REASON_IN_SYNC: &str = "InSync";
pub const REASON_RESOURCE_EXISTS: &str = "ResourceExists";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Factory for management server sessions
    pub mgm_connector: Arc<dyn MgmConnector>,
    /// Whether the operator runs inside the Kubernetes cluster it manages.
    /// Decides how management server connectstrings are formed.
    pub running_inside_k8s: bool,
}

impl Context {
    /// Create a new context with the default TCP management connector.
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            mgm_connector: Arc::new(MgmTcpConnector),
            running_inside_k8s: std::env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        }
    }

    /// Replace the management connector, used by tests to avoid real
    /// network connections.
    pub fn with_mgm_connector(mut self, connector: Arc<dyn MgmConnector>) -> Self {
        self.mgm_connector = connector;
        self
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for an NdbCluster resource
    pub async fn publish_normal_event(
        &self,
        resource: &NdbCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a warning event for an NdbCluster resource
    pub async fn publish_warning_event(
        &self,
        resource: &NdbCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish warning event");
        }
    }

    /// Read the root password out of the given Secret.
    pub async fn extract_password(&self, namespace: &str, secret_name: &str) -> Result<String, Error> {
        let secret_api: Api<k8s_openapi::api::core::v1::Secret> =
            Api::namespaced(self.client.clone(), namespace);

        let secret = secret_api.get(secret_name).await?;
        let password_bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(ROOT_PASSWORD_KEY))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "secret {secret_name} has no {ROOT_PASSWORD_KEY:?} key"
                ))
            })?;

        String::from_utf8(password_bytes.0.clone())
            .map_err(|e| Error::Validation(format!("invalid password encoding: {e}")))
    }
}
